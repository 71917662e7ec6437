//! An expression language for workflow templates: a lexer and shunting-yard
//! parser over `${{ … }}` expression text, and a recursive evaluator with
//! canonicalized values, JavaScript-like abstract comparison, a catalog of
//! built-in functions, and byte/depth accounting that keeps evaluation cost
//! bounded on untrusted input.

pub mod budget;
pub mod compare;
pub mod eval;
pub mod funcs;
pub mod lexer;
pub mod parser;
pub mod trace;
pub mod value;

pub use budget::{BudgetError, ByteCounter, DepthGuard, EvaluationMemory, MIN_OBJECT_SIZE};
pub use eval::{
    evaluate, EvaluationError, EvaluationOptions, EvaluationResult, Evaluator, ExtensionFunction,
    FunctionResult, NamedValues,
};
pub use funcs::format_message;
pub use parser::{parse, Expr, FunctionInfo, ParseContext, ParseError, ParseErrorKind};
pub use trace::{CollectingTraceWriter, NoopTraceWriter, TraceWriter, TracingTraceWriter};
pub use value::{ArrayCompat, ArrayData, FilteredArray, Kind, ObjectCompat, ObjectData, Value};
