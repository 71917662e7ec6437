//! The built-in function catalog: `contains`, `endsWith`, `startsWith`,
//! `format`, `join`, `toJson`, `fromJson`. Dispatch is case-insensitive.

mod format;
mod json;

pub use format::format_message;

use crate::compare;
use crate::eval::{EvaluationError, Evaluator, FunctionResult, Handler};
use crate::budget::string_bytes;
use crate::value::Value;

/// Declared arities of the built-ins: (name, min, max).
pub const WELL_KNOWN: &[(&str, usize, usize)] = &[
    ("contains", 2, 2),
    ("endsWith", 2, 2),
    ("format", 1, usize::MAX),
    ("fromJson", 1, 1),
    ("join", 1, 2),
    ("startsWith", 2, 2),
    ("toJson", 1, 1),
];

pub(crate) fn builtin(name: &str) -> Option<Handler> {
    let handler: Handler = if name.eq_ignore_ascii_case("contains") {
        contains_fn
    } else if name.eq_ignore_ascii_case("endsWith") {
        ends_with_fn
    } else if name.eq_ignore_ascii_case("startsWith") {
        starts_with_fn
    } else if name.eq_ignore_ascii_case("format") {
        format::format_fn
    } else if name.eq_ignore_ascii_case("join") {
        join_fn
    } else if name.eq_ignore_ascii_case("toJson") {
        json::to_json_fn
    } else if name.eq_ignore_ascii_case("fromJson") {
        json::from_json_fn
    } else {
        return None;
    };
    Some(handler)
}

// contains(a, b): upper-cased substring search when |a| is primitive,
// abstract-equality membership when |a| is an array, false otherwise.
fn contains_fn(
    _ev: &mut Evaluator<'_>,
    args: &[Value],
) -> Result<FunctionResult, EvaluationError> {
    let left = &args[0];
    let right = &args[1];
    let result = if left.is_primitive() {
        let haystack = left.to_display_string().to_uppercase();
        let needle = right.to_display_string().to_uppercase();
        haystack.contains(&needle)
    } else if let Value::Array(arr) = left {
        (0..arr.len()).any(|i| {
            arr.item(i)
                .map(|item| compare::equals(&item, right))
                .unwrap_or(false)
        })
    } else {
        false
    };
    Ok(Value::Boolean(result).into())
}

fn starts_with_fn(
    _ev: &mut Evaluator<'_>,
    args: &[Value],
) -> Result<FunctionResult, EvaluationError> {
    let left = args[0].to_display_string().to_uppercase();
    let right = args[1].to_display_string().to_uppercase();
    Ok(Value::Boolean(left.starts_with(&right)).into())
}

fn ends_with_fn(
    _ev: &mut Evaluator<'_>,
    args: &[Value],
) -> Result<FunctionResult, EvaluationError> {
    let left = args[0].to_display_string().to_uppercase();
    let right = args[1].to_display_string().to_uppercase();
    Ok(Value::Boolean(left.ends_with(&right)).into())
}

// join(items, sep = ','): stringified array items joined by the separator;
// a primitive passes through as its string form; objects yield "".
fn join_fn(_ev: &mut Evaluator<'_>, args: &[Value]) -> Result<FunctionResult, EvaluationError> {
    let separator = match args.get(1) {
        Some(sep) if sep.is_primitive() => sep.to_display_string(),
        _ => ",".to_string(),
    };
    let result = match &args[0] {
        Value::Array(arr) => (0..arr.len())
            .map(|i| arr.item(i).unwrap_or(Value::Null).to_display_string())
            .collect::<Vec<_>>()
            .join(&separator),
        primitive if primitive.is_primitive() => primitive.to_display_string(),
        _ => String::new(),
    };
    let bytes = string_bytes(&result);
    Ok(FunctionResult {
        value: Value::string(result),
        bytes: Some(bytes),
        is_total: true,
    })
}
