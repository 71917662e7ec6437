//! Recursive expression evaluation over canonical values, with abstract
//! comparison semantics, per-node tracing and bytes-by-depth memory
//! accounting.

use std::any::Any;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::budget::{BudgetError, ByteCounter, EvaluationMemory};
use crate::compare;
use crate::funcs;
use crate::lexer::Literal;
use crate::parser::{CompareOp, Expr, FunctionInfo};
use crate::trace::TraceWriter;
use crate::value::{number_to_string, FilteredArray, Value};

/// Budget for cached realized-expression strings per evaluation.
pub const TRACE_MEMORY_BYTES: usize = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum EvaluationError {
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error("The format string is invalid: {0}")]
    InvalidFormatString(String),
    #[error("The format string references more arguments than were supplied: {0}")]
    InvalidFormatArgIndex(String),
    #[error("Format specifiers are not supported: '{0}'")]
    FormatSpecifiersNotSupported(String),
    #[error("Error parsing JSON when evaluating function 'fromJson'. {0}")]
    FromJson(String),
    #[error("Unrecognized function: '{0}'")]
    UnrecognizedFunction(String),
}

impl EvaluationError {
    pub fn code(&self) -> &'static str {
        match self {
            EvaluationError::Budget(BudgetError::MaxMemoryExceeded) => "maxMemoryExceeded",
            EvaluationError::Budget(BudgetError::MaxDepthExceeded) => "maxDepthExceeded",
            EvaluationError::InvalidFormatString(_) => "invalidFormatString",
            EvaluationError::InvalidFormatArgIndex(_) => "invalidFormatArgIndex",
            EvaluationError::FormatSpecifiersNotSupported(_) => "formatSpecifiersNotSupported",
            EvaluationError::FromJson(_) => "invalidJson",
            EvaluationError::UnrecognizedFunction(_) => "unrecognizedFunction",
        }
    }
}

/// NamedValues binds named contexts (case-insensitively) to the values a
/// host supplies for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct NamedValues {
    map: FxHashMap<String, Value>,
}

impl NamedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.map.insert(name.to_uppercase(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.map.get(&name.to_uppercase()).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

/// The value and optional memory hint a function produces. When a hint is
/// absent, the evaluator charges the value's head cost. `is_total` marks the
/// byte count as covering the whole result subtree, which lets the ledger
/// release the columns of completed children.
#[derive(Debug)]
pub struct FunctionResult {
    pub value: Value,
    pub bytes: Option<usize>,
    pub is_total: bool,
}

impl From<Value> for FunctionResult {
    fn from(value: Value) -> Self {
        Self {
            value,
            bytes: None,
            is_total: false,
        }
    }
}

pub type Handler = fn(&mut Evaluator<'_>, &[Value]) -> Result<FunctionResult, EvaluationError>;

/// An extension function a host registers alongside the built-ins.
#[derive(Debug, Clone)]
pub struct ExtensionFunction {
    pub info: FunctionInfo,
    pub handler: Handler,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    /// Maximum bytes one evaluation may hold live; zero selects the default.
    pub max_memory: usize,
}

#[derive(Debug)]
pub struct EvaluationResult {
    pub value: Value,
}

#[derive(Debug, Default)]
struct MemoryHint {
    bytes: Option<usize>,
    is_total: bool,
}

/// evaluate walks |expr| and returns its value. |state| is an opaque host
/// value surfaced to extension functions via [`Evaluator::state`].
pub fn evaluate(
    expr: &Expr,
    trace: &mut dyn TraceWriter,
    named_values: &NamedValues,
    extensions: &[ExtensionFunction],
    state: Option<&dyn Any>,
    options: &EvaluationOptions,
) -> Result<EvaluationResult, EvaluationError> {
    let mut evaluator = Evaluator {
        trace,
        state,
        named_values,
        extensions,
        memory: EvaluationMemory::new(options.max_memory),
        trace_memory: ByteCounter::new(TRACE_MEMORY_BYTES),
        level: 0,
        realized: FxHashMap::default(),
    };

    let source = expr.to_expression_string();
    evaluator.trace.info(&format!("Evaluating: {source}"));
    let value = evaluator.eval(expr)?;

    let realized = evaluator.realized_string(expr);
    if realized != source {
        evaluator.trace.info(&format!("Expanded: {realized}"));
    }
    let rendered = serde_json::to_string(&value.to_json()).unwrap_or_default();
    evaluator.trace.info(&format!("Result: {rendered}"));

    Ok(EvaluationResult { value })
}

pub struct Evaluator<'a> {
    trace: &'a mut dyn TraceWriter,
    state: Option<&'a dyn Any>,
    named_values: &'a NamedValues,
    extensions: &'a [ExtensionFunction],
    memory: EvaluationMemory,
    trace_memory: ByteCounter,
    level: usize,
    realized: FxHashMap<usize, String>,
}

impl<'a> Evaluator<'a> {
    /// The opaque host state passed to [`evaluate`].
    pub fn state(&self) -> Option<&dyn Any> {
        self.state
    }

    /// Charge bytes one level below the node being evaluated; a subsequent
    /// `is_total` result at the node's own level releases these again.
    pub(crate) fn charge_child(&mut self, bytes: usize) -> Result<(), EvaluationError> {
        self.memory
            .add_amount(self.level + 1, bytes, false)
            .map_err(Into::into)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, EvaluationError> {
        self.level += 1;
        self.trace.verbose(&format!(
            "{}Evaluating {}:",
            "  ".repeat(self.level - 1),
            node_name(expr)
        ));

        let result = self.eval_core(expr).and_then(|(value, hint)| {
            let bytes = hint.bytes.unwrap_or_else(|| value.shallow_bytes());
            self.memory.add_amount(self.level, bytes, hint.is_total)?;
            if matches!(expr, Expr::Call { .. }) {
                self.cache_realized(expr, &value);
            }
            Ok(value)
        });
        self.level -= 1;
        result
    }

    fn eval_core(&mut self, expr: &Expr) -> Result<(Value, MemoryHint), EvaluationError> {
        match expr {
            Expr::Literal(literal) => Ok((literal_value(literal), MemoryHint::default())),
            Expr::NamedContext(name) => {
                let value = self.named_values.get(name).unwrap_or(Value::Null);
                Ok((value, MemoryHint::default()))
            }
            // A wildcard only appears as the index of an Index node, where
            // it is consumed without evaluation.
            Expr::Wildcard => Ok((Value::Null, MemoryHint::default())),
            Expr::Not(operand) => {
                let value = self.eval(operand)?;
                Ok((Value::Boolean(!value.is_truthy()), MemoryHint::default()))
            }
            Expr::And(operands) => {
                let mut last = Value::Boolean(true);
                for operand in operands {
                    let value = self.eval(operand)?;
                    if !value.is_truthy() {
                        return Ok((value, MemoryHint::default()));
                    }
                    last = value;
                }
                Ok((last, MemoryHint::default()))
            }
            Expr::Or(operands) => {
                let mut last = Value::Boolean(false);
                for operand in operands {
                    let value = self.eval(operand)?;
                    if value.is_truthy() {
                        return Ok((value, MemoryHint::default()));
                    }
                    last = value;
                }
                Ok((last, MemoryHint::default()))
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                let result = match op {
                    CompareOp::Equal => compare::equals(&left, &right),
                    CompareOp::NotEqual => !compare::equals(&left, &right),
                    CompareOp::LessThan => compare::less_than(&left, &right),
                    CompareOp::LessOrEqual => compare::less_or_equal(&left, &right),
                    CompareOp::GreaterThan => compare::greater_than(&left, &right),
                    CompareOp::GreaterOrEqual => compare::greater_or_equal(&left, &right),
                };
                Ok((Value::Boolean(result), MemoryHint::default()))
            }
            Expr::Index { left, index } => {
                let container = self.eval(left)?;
                if matches!(index.as_ref(), Expr::Wildcard) {
                    let filtered = wildcard_of(&container);
                    return Ok((
                        Value::Array(Rc::new(filtered)),
                        MemoryHint::default(),
                    ));
                }
                let key = self.eval(index)?;
                // An index applied to a filtered array cascades over its
                // items rather than indexing the wrapper itself.
                if let Value::Array(arr) = &container {
                    if let Some(filtered) = arr.as_filtered() {
                        let mut out = FilteredArray::new();
                        for item in filtered.values() {
                            if let Some(found) = index_into(item, &key) {
                                if !matches!(found, Value::Null) {
                                    out.push(found);
                                }
                            }
                        }
                        return Ok((Value::Array(Rc::new(out)), MemoryHint::default()));
                    }
                }
                let value = index_into(&container, &key).unwrap_or(Value::Null);
                Ok((value, MemoryHint::default()))
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                let handler = funcs::builtin(name).or_else(|| {
                    self.extensions
                        .iter()
                        .find(|e| e.info.name.eq_ignore_ascii_case(name))
                        .map(|e| e.handler)
                });
                let Some(handler) = handler else {
                    return Err(EvaluationError::UnrecognizedFunction(name.clone()));
                };
                let result = handler(self, &values)?;
                Ok((
                    result.value,
                    MemoryHint {
                        bytes: result.bytes,
                        is_total: result.is_total,
                    },
                ))
            }
        }
    }

    fn cache_realized(&mut self, expr: &Expr, value: &Value) {
        let formatted = trace_value(value);
        if self.trace_memory.add_string(&formatted).is_ok() {
            self.realized.insert(expr_key(expr), formatted);
        }
    }

    /// The expression's source form with fully realized sub-results
    /// substituted where they were captured during evaluation.
    fn realized_string(&self, expr: &Expr) -> String {
        if let Some(cached) = self.realized.get(&expr_key(expr)) {
            return cached.clone();
        }
        match expr {
            Expr::Index { left, index } => match index.as_ref() {
                Expr::Wildcard => format!("{}.*", self.realized_string(left)),
                Expr::Literal(Literal::String(name)) if !name.is_empty() => {
                    format!("{}.{}", self.realized_string(left), name)
                }
                other => format!(
                    "{}[{}]",
                    self.realized_string(left),
                    self.realized_string(other)
                ),
            },
            Expr::Not(operand) => format!("!{}", self.realized_grouped(operand)),
            Expr::And(operands) => operands
                .iter()
                .map(|o| self.realized_grouped(o))
                .collect::<Vec<_>>()
                .join(" && "),
            Expr::Or(operands) => operands
                .iter()
                .map(|o| self.realized_grouped(o))
                .collect::<Vec<_>>()
                .join(" || "),
            Expr::Compare { op, left, right } => format!(
                "{} {} {}",
                self.realized_grouped(left),
                match op {
                    CompareOp::Equal => "==",
                    CompareOp::NotEqual => "!=",
                    CompareOp::LessThan => "<",
                    CompareOp::LessOrEqual => "<=",
                    CompareOp::GreaterThan => ">",
                    CompareOp::GreaterOrEqual => ">=",
                },
                self.realized_grouped(right)
            ),
            Expr::Call { name, args } => format!(
                "{}({})",
                name,
                args.iter()
                    .map(|a| self.realized_string(a))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            other => other.to_expression_string(),
        }
    }

    fn realized_grouped(&self, expr: &Expr) -> String {
        match expr {
            Expr::And(_) | Expr::Or(_) | Expr::Compare { .. }
                if !self.realized.contains_key(&expr_key(expr)) =>
            {
                format!("({})", self.realized_string(expr))
            }
            _ => self.realized_string(expr),
        }
    }
}

fn expr_key(expr: &Expr) -> usize {
    expr as *const Expr as usize
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Boolean(b) => Value::Boolean(*b),
        Literal::Number(n) => Value::Number(*n),
        Literal::String(s) => Value::string(s),
    }
}

fn node_name(expr: &Expr) -> String {
    match expr {
        Expr::Literal(_) => "Literal".to_string(),
        Expr::NamedContext(name) => format!("NamedContext '{name}'"),
        Expr::Wildcard => "Wildcard".to_string(),
        Expr::Index { .. } => "Index".to_string(),
        Expr::Not(_) => "Not".to_string(),
        Expr::And(_) => "And".to_string(),
        Expr::Or(_) => "Or".to_string(),
        Expr::Compare { op, .. } => format!("Compare '{}'", match op {
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
            CompareOp::LessThan => "<",
            CompareOp::LessOrEqual => "<=",
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterOrEqual => ">=",
        }),
        Expr::Call { name, .. } => format!("Function '{name}'"),
    }
}

fn trace_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => number_to_string(*n),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(_) => "Array".to_string(),
        Value::Object(_) => "Object".to_string(),
    }
}

// The filtered array a wildcard produces: children of a real collection,
// flattened grandchildren of an existing filtered array, empty for scalars.
fn wildcard_of(value: &Value) -> FilteredArray {
    let mut out = FilteredArray::new();
    match value {
        Value::Array(arr) => {
            if let Some(filtered) = arr.as_filtered() {
                for item in filtered.values() {
                    push_children(&mut out, item);
                }
            } else {
                for i in 0..arr.len() {
                    if let Some(item) = arr.item(i) {
                        out.push(item);
                    }
                }
            }
        }
        Value::Object(_) => push_children(&mut out, value),
        _ => {}
    }
    out
}

fn push_children(out: &mut FilteredArray, value: &Value) {
    match value {
        Value::Array(arr) => {
            for i in 0..arr.len() {
                if let Some(item) = arr.item(i) {
                    out.push(item);
                }
            }
        }
        Value::Object(obj) => {
            for key in obj.keys() {
                if let Some(item) = obj.item(&key) {
                    out.push(item);
                }
            }
        }
        _ => {}
    }
}

// Index resolution over one container. Objects take string keys (numbers
// convert to their display form); arrays take integer indexes, floored and
// bounded to [0, 2^31).
fn index_into(container: &Value, index: &Value) -> Option<Value> {
    match container {
        Value::Object(obj) => {
            let key = match index {
                Value::String(s) => s.to_string(),
                Value::Number(n) => number_to_string(*n),
                _ => return None,
            };
            obj.item(&key)
        }
        Value::Array(arr) => {
            let n = match index {
                Value::Number(n) => *n,
                Value::String(s) => crate::value::parse_number(s),
                _ => return None,
            };
            if n.is_nan() {
                return None;
            }
            let n = n.floor();
            if n < 0.0 || n >= 2_147_483_648.0 {
                return None;
            }
            arr.item(n as usize)
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::{parse, ParseContext};
    use crate::trace::NoopTraceWriter;
    use crate::value::{ArrayData, ObjectData};

    fn eval_with(expression: &str, named: &NamedValues) -> Result<Value, EvaluationError> {
        let context = ParseContext {
            allow_unknown: true,
            ..Default::default()
        };
        let expr = parse(expression, &context).unwrap();
        let mut trace = NoopTraceWriter;
        evaluate(
            &expr,
            &mut trace,
            named,
            &[],
            None,
            &EvaluationOptions::default(),
        )
        .map(|r| r.value)
    }

    fn eval_str(expression: &str) -> Value {
        eval_with(expression, &NamedValues::new()).unwrap()
    }

    fn sample_values() -> NamedValues {
        let mut steps = ArrayData::new();
        for name in ["build", "test"] {
            let mut step = ObjectData::new();
            step.insert("script", Value::string(name));
            steps.push(Value::Object(Rc::new(step)));
        }
        let mut parameters = ObjectData::new();
        parameters.insert("steps", Value::Array(Rc::new(steps)));
        parameters.insert("count", Value::Number(2.0));

        let mut named = NamedValues::new();
        named.set("parameters", Value::Object(Rc::new(parameters)));
        named
    }

    #[test]
    fn abstract_equality_coerces() {
        assert!(matches!(eval_str("1 == '1'"), Value::Boolean(true)));
        assert!(matches!(eval_str("null == 0"), Value::Boolean(true)));
        assert!(matches!(eval_str("true == '1'"), Value::Boolean(true)));
        assert!(matches!(eval_str("NaN == NaN"), Value::Boolean(false)));
        assert!(matches!(eval_str("'abc' == 'ABC'"), Value::Boolean(true)));
    }

    #[test]
    fn and_or_return_operands() {
        assert!(matches!(eval_str("1 && 2"), Value::Number(n) if n == 2.0));
        assert!(matches!(eval_str("0 && 2"), Value::Number(n) if n == 0.0));
        assert!(matches!(eval_str("'' || 'fallback'"), Value::String(s) if &*s == "fallback"));
        assert!(matches!(eval_str("'x' || 'y'"), Value::String(s) if &*s == "x"));
    }

    #[test]
    fn short_circuit_skips_unknown_function() {
        // badFunc would fail evaluation, but || never reaches it.
        assert!(matches!(
            eval_str("true || badFunc()"),
            Value::Boolean(true)
        ));
        let err = eval_str_err("false || badFunc()");
        assert!(matches!(err, EvaluationError::UnrecognizedFunction(_)));
    }

    fn eval_str_err(expression: &str) -> EvaluationError {
        eval_with(expression, &NamedValues::new()).unwrap_err()
    }

    #[test]
    fn not_negates_truthiness() {
        assert!(matches!(eval_str("!''"), Value::Boolean(true)));
        assert!(matches!(eval_str("!'x'"), Value::Boolean(false)));
        assert!(matches!(eval_str("!0"), Value::Boolean(true)));
    }

    #[test]
    fn index_resolves_named_context_data() {
        let named = sample_values();
        let value = eval_with("parameters.count", &named).unwrap();
        assert!(matches!(value, Value::Number(n) if n == 2.0));

        let value = eval_with("parameters['Count']", &named).unwrap();
        assert!(matches!(value, Value::Number(n) if n == 2.0));

        let value = eval_with("parameters.steps[1].script", &named).unwrap();
        assert!(matches!(value, Value::String(s) if &*s == "test"));

        assert!(matches!(
            eval_with("parameters.steps[5]", &named).unwrap(),
            Value::Null
        ));
        assert!(matches!(
            eval_with("parameters.missing", &named).unwrap(),
            Value::Null
        ));
    }

    #[test]
    fn wildcard_collects_and_cascades() {
        let named = sample_values();
        let value = eval_with("parameters.steps.*.script", &named).unwrap();
        let Value::Array(arr) = value else {
            panic!("expected a filtered array");
        };
        assert_eq!(arr.len(), 2);
        assert!(matches!(arr.item(0), Some(Value::String(s)) if &*s == "build"));
        assert!(matches!(arr.item(1), Some(Value::String(s)) if &*s == "test"));
    }

    #[test]
    fn wildcard_on_scalar_degrades_to_empty() {
        let named = sample_values();
        let value = eval_with("parameters.count.*.x", &named).unwrap();
        let Value::Array(arr) = value else {
            panic!("expected a filtered array");
        };
        assert_eq!(arr.len(), 0);
    }

    #[test]
    fn unknown_named_context_is_null() {
        assert!(matches!(eval_str("missing"), Value::Null));
    }

    #[test]
    fn memory_limit_aborts_evaluation() {
        let expr = parse(
            "format('{0}{0}{0}{0}', 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx')",
            &ParseContext::default(),
        )
        .unwrap();
        let mut trace = NoopTraceWriter;
        let err = evaluate(
            &expr,
            &mut trace,
            &NamedValues::new(),
            &[],
            None,
            &EvaluationOptions { max_memory: 150 },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::Budget(BudgetError::MaxMemoryExceeded)
        ));
    }

    #[test]
    fn extension_functions_dispatch() {
        fn always_true(
            _ev: &mut Evaluator<'_>,
            _args: &[Value],
        ) -> Result<FunctionResult, EvaluationError> {
            Ok(Value::Boolean(true).into())
        }
        let extensions = vec![ExtensionFunction {
            info: FunctionInfo::new("alwaysTrue", 0, 0),
            handler: always_true,
        }];
        let context = ParseContext {
            functions: vec![FunctionInfo::new("alwaysTrue", 0, 0)],
            ..Default::default()
        };
        let expr = parse("alwaysTrue()", &context).unwrap();
        let mut trace = NoopTraceWriter;
        let result = evaluate(
            &expr,
            &mut trace,
            &NamedValues::new(),
            &extensions,
            None,
            &EvaluationOptions::default(),
        )
        .unwrap();
        assert!(matches!(result.value, Value::Boolean(true)));
    }
}
