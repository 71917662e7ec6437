//! `toJson` / `fromJson`. Serialization walks an explicit ancestor stack
//! instead of recursing, and charges every appended segment so a large
//! result fails mid-flight instead of after materializing.

use std::rc::Rc;

use crate::budget::{string_bytes, utf16_len};
use crate::eval::{EvaluationError, Evaluator, FunctionResult};
use crate::value::{number_to_string, ArrayCompat, ObjectCompat, Value};

pub(crate) fn to_json_fn(
    ev: &mut Evaluator<'_>,
    args: &[Value],
) -> Result<FunctionResult, EvaluationError> {
    let mut out = String::new();
    write_json(ev, &mut out, &args[0])?;
    let bytes = string_bytes(&out);
    Ok(FunctionResult {
        value: Value::string(out),
        bytes: Some(bytes),
        is_total: true,
    })
}

pub(crate) fn from_json_fn(
    _ev: &mut Evaluator<'_>,
    args: &[Value],
) -> Result<FunctionResult, EvaluationError> {
    let source = match &args[0] {
        Value::String(s) => s.to_string(),
        primitive if primitive.is_primitive() => primitive.to_display_string(),
        _ => {
            return Err(EvaluationError::FromJson(
                "The value must be a string".to_string(),
            ))
        }
    };
    let parsed: serde_json::Value =
        serde_json::from_str(&source).map_err(|e| EvaluationError::FromJson(e.to_string()))?;
    let (value, bytes) = Value::from_json_counted(&parsed);
    Ok(FunctionResult {
        value,
        bytes: Some(bytes),
        is_total: true,
    })
}

enum Frame {
    Array {
        arr: Rc<dyn ArrayCompat>,
        next: usize,
    },
    Object {
        obj: Rc<dyn ObjectCompat>,
        keys: Vec<Rc<str>>,
        next: usize,
    },
}

enum Step {
    CloseArray,
    CloseObject,
    Item(Value, bool),
    Pair(Rc<str>, Value, bool),
}

fn write_json(ev: &mut Evaluator<'_>, out: &mut String, root: &Value) -> Result<(), EvaluationError> {
    let mut stack: Vec<Frame> = Vec::new();
    emit(ev, out, root.clone(), &mut stack)?;

    loop {
        let step = match stack.last_mut() {
            None => break,
            Some(Frame::Array { arr, next }) => {
                if *next >= arr.len() {
                    Step::CloseArray
                } else {
                    let first = *next == 0;
                    let item = arr.item(*next).unwrap_or(Value::Null);
                    *next += 1;
                    Step::Item(item, first)
                }
            }
            Some(Frame::Object { obj, keys, next }) => {
                if *next >= keys.len() {
                    Step::CloseObject
                } else {
                    let first = *next == 0;
                    let key = keys[*next].clone();
                    let value = obj.item(&key).unwrap_or(Value::Null);
                    *next += 1;
                    Step::Pair(key, value, first)
                }
            }
        };

        match step {
            Step::CloseArray => {
                let indent = "  ".repeat(stack.len() - 1);
                append(ev, out, &format!("\n{indent}]"))?;
                stack.pop();
            }
            Step::CloseObject => {
                let indent = "  ".repeat(stack.len() - 1);
                append(ev, out, &format!("\n{indent}}}"))?;
                stack.pop();
            }
            Step::Item(item, first) => {
                let separator = if first { "\n" } else { ",\n" };
                let indent = "  ".repeat(stack.len());
                append(ev, out, &format!("{separator}{indent}"))?;
                emit(ev, out, item, &mut stack)?;
            }
            Step::Pair(key, value, first) => {
                let separator = if first { "\n" } else { ",\n" };
                let indent = "  ".repeat(stack.len());
                let encoded = serde_json::Value::String(key.to_string()).to_string();
                append(ev, out, &format!("{separator}{indent}{encoded}: "))?;
                emit(ev, out, value, &mut stack)?;
            }
        }
    }
    Ok(())
}

// Append a scalar's literal form, or open a collection and push its frame.
// Empty collections close inline.
fn emit(
    ev: &mut Evaluator<'_>,
    out: &mut String,
    value: Value,
    stack: &mut Vec<Frame>,
) -> Result<(), EvaluationError> {
    match value {
        Value::Null => append(ev, out, "null"),
        Value::Boolean(b) => append(ev, out, if b { "true" } else { "false" }),
        Value::Number(n) => append(ev, out, &number_to_string(n)),
        Value::String(s) => {
            let encoded = serde_json::Value::String(s.to_string()).to_string();
            append(ev, out, &encoded)
        }
        Value::Array(arr) => {
            if arr.len() == 0 {
                append(ev, out, "[]")
            } else {
                append(ev, out, "[")?;
                stack.push(Frame::Array { arr, next: 0 });
                Ok(())
            }
        }
        Value::Object(obj) => {
            if obj.len() == 0 {
                append(ev, out, "{}")
            } else {
                append(ev, out, "{")?;
                let keys = obj.keys();
                stack.push(Frame::Object { obj, keys, next: 0 });
                Ok(())
            }
        }
    }
}

fn append(ev: &mut Evaluator<'_>, out: &mut String, segment: &str) -> Result<(), EvaluationError> {
    ev.charge_child(2 * utf16_len(segment))?;
    out.push_str(segment);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::test::eval_str;
    use crate::value::Value;

    fn eval_to_string(expression: &str) -> String {
        match eval_str(expression) {
            Value::String(s) => s.to_string(),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn scalars_serialize_literally() {
        assert_eq!(eval_to_string("toJson(null)"), "null");
        assert_eq!(eval_to_string("toJson(true)"), "true");
        assert_eq!(eval_to_string("toJson(3.5)"), "3.5");
        assert_eq!(eval_to_string("toJson('a \"b\"')"), "\"a \\\"b\\\"\"");
    }

    #[test]
    fn nested_collections_indent_two_spaces() {
        let out = eval_to_string("toJson(fromJson('{\"a\": 1, \"b\": [true, null]}'))");
        let expected = "{\n  \"a\": 1,\n  \"b\": [\n    true,\n    null\n  ]\n}";
        assert_eq!(out, expected);
    }

    #[test]
    fn empty_collections_close_inline() {
        assert_eq!(eval_to_string("toJson(fromJson('[]'))"), "[]");
        assert_eq!(eval_to_string("toJson(fromJson('{}'))"), "{}");
    }

    #[test]
    fn round_trip_preserves_json_equality() {
        let out = eval_to_string("toJson(fromJson('{\"a\":1,\"b\":[true,null]}'))");
        let reparsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        let original: serde_json::Value =
            serde_json::from_str("{\"a\":1,\"b\":[true,null]}").unwrap();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn invalid_json_errors() {
        use crate::eval::{evaluate, EvaluationError, EvaluationOptions, NamedValues};
        use crate::parser::{parse, ParseContext};
        use crate::trace::NoopTraceWriter;

        let expr = parse("fromJson('{oops')", &ParseContext::default()).unwrap();
        let mut trace = NoopTraceWriter;
        let err = evaluate(
            &expr,
            &mut trace,
            &NamedValues::new(),
            &[],
            None,
            &EvaluationOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EvaluationError::FromJson(_)));
    }
}
