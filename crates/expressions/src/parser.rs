//! Shunting-yard expression parser producing a closed tree of operator,
//! function, literal, named-context and wildcard nodes.

use std::fmt;

use crate::funcs;
use crate::lexer::{Lexer, Literal, Token, TokenKind};
use crate::value::number_to_string;

/// Maximum expression source length, in characters.
pub const MAX_LENGTH: usize = 21_000;

/// Maximum depth of a parsed expression tree.
pub const MAX_DEPTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
            CompareOp::LessThan => "<",
            CompareOp::LessOrEqual => "<=",
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterOrEqual => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    NamedContext(String),
    Wildcard,
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn depth(&self) -> usize {
        let children = match self {
            Expr::Literal(_) | Expr::NamedContext(_) | Expr::Wildcard => return 1,
            Expr::Index { left, index } => vec![left.as_ref(), index.as_ref()],
            Expr::Not(operand) => vec![operand.as_ref()],
            Expr::And(operands) | Expr::Or(operands) => operands.iter().collect(),
            Expr::Compare { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::Call { args, .. } => args.iter().collect(),
        };
        1 + children.iter().map(|c| c.depth()).max().unwrap_or(0)
    }

    /// Reconstructs a source form of the expression, used in traces.
    pub fn to_expression_string(&self) -> String {
        match self {
            Expr::Literal(Literal::Null) => "null".to_string(),
            Expr::Literal(Literal::Boolean(b)) => b.to_string(),
            Expr::Literal(Literal::Number(n)) => number_to_string(*n),
            Expr::Literal(Literal::String(s)) => format!("'{}'", s.replace('\'', "''")),
            Expr::NamedContext(name) => name.clone(),
            Expr::Wildcard => "*".to_string(),
            Expr::Index { left, index } => match index.as_ref() {
                Expr::Literal(Literal::String(name)) if is_identifier(name) => {
                    format!("{}.{}", left.to_expression_string(), name)
                }
                Expr::Wildcard => format!("{}.*", left.to_expression_string()),
                other => format!(
                    "{}[{}]",
                    left.to_expression_string(),
                    other.to_expression_string()
                ),
            },
            Expr::Not(operand) => format!("!{}", operand.to_grouped_string()),
            Expr::And(operands) => operands
                .iter()
                .map(Expr::to_grouped_string)
                .collect::<Vec<_>>()
                .join(" && "),
            Expr::Or(operands) => operands
                .iter()
                .map(Expr::to_grouped_string)
                .collect::<Vec<_>>()
                .join(" || "),
            Expr::Compare { op, left, right } => format!(
                "{} {} {}",
                left.to_grouped_string(),
                op.symbol(),
                right.to_grouped_string()
            ),
            Expr::Call { name, args } => format!(
                "{}({})",
                name,
                args.iter()
                    .map(Expr::to_expression_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    fn to_grouped_string(&self) -> String {
        match self {
            Expr::And(_) | Expr::Or(_) | Expr::Compare { .. } => {
                format!("({})", self.to_expression_string())
            }
            _ => self.to_expression_string(),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Declared arity of a function available to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub min_args: usize,
    pub max_args: usize,
}

impl FunctionInfo {
    pub fn new(name: impl Into<String>, min_args: usize, max_args: usize) -> Self {
        Self {
            name: name.into(),
            min_args,
            max_args,
        }
    }
}

/// What the parser knows about the expression's surroundings: which named
/// contexts and extension functions may be referenced. `allow_unknown`
/// switches on syntax-only mode, in which unrecognized identifiers parse
/// instead of erroring.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    pub named_contexts: Vec<String>,
    pub functions: Vec<FunctionInfo>,
    pub allow_unknown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnexpectedSymbol,
    UnexpectedEndOfExpression,
    UnrecognizedNamedContext,
    UnrecognizedFunction,
    TooFewParameters,
    TooManyParameters,
    ExceededMaxDepth,
    ExceededMaxLength,
}

impl ParseErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ParseErrorKind::UnexpectedSymbol => "unexpectedSymbol",
            ParseErrorKind::UnexpectedEndOfExpression => "unexpectedEndOfExpression",
            ParseErrorKind::UnrecognizedNamedContext => "unrecognizedNamedValue",
            ParseErrorKind::UnrecognizedFunction => "unrecognizedFunction",
            ParseErrorKind::TooFewParameters => "tooFewParameters",
            ParseErrorKind::TooManyParameters => "tooManyParameters",
            ParseErrorKind::ExceededMaxDepth => "exceededMaxDepth",
            ParseErrorKind::ExceededMaxLength => "exceededMaxLength",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub raw: String,
    /// One-based character position within the expression.
    pub position: usize,
    pub expression: String,
}

impl std::error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self.kind {
            ParseErrorKind::UnexpectedSymbol => format!("Unexpected symbol: '{}'", self.raw),
            ParseErrorKind::UnexpectedEndOfExpression => "Unexpected end of expression".to_string(),
            ParseErrorKind::UnrecognizedNamedContext => {
                format!("Unrecognized named-value: '{}'", self.raw)
            }
            ParseErrorKind::UnrecognizedFunction => {
                format!("Unrecognized function: '{}'", self.raw)
            }
            ParseErrorKind::TooFewParameters => "Too few parameters supplied".to_string(),
            ParseErrorKind::TooManyParameters => "Too many parameters supplied".to_string(),
            ParseErrorKind::ExceededMaxDepth => {
                format!("Exceeded max expression depth {MAX_DEPTH}")
            }
            ParseErrorKind::ExceededMaxLength => {
                format!("Exceeded max expression length {MAX_LENGTH}")
            }
        };
        write!(
            f,
            "{description}. Located at position {} within expression: {}",
            self.position, self.expression
        )
    }
}

/// parse turns an expression string into a tree, validating identifiers and
/// arity against |context|.
pub fn parse(expression: &str, context: &ParseContext) -> Result<Expr, ParseError> {
    Parser::new(expression, context)?.run()
}

struct Parser<'c> {
    expression: String,
    context: &'c ParseContext,
    operands: Vec<Expr>,
    // Pending operator tokens, including open-group markers and function
    // names awaiting their closing parenthesis.
    operators: Vec<Token>,
    // Separator counts for each open function call.
    call_separators: Vec<usize>,
    prev_kind: Option<TokenKind>,
    char_len: usize,
}

impl<'c> Parser<'c> {
    fn new(expression: &str, context: &'c ParseContext) -> Result<Self, ParseError> {
        let char_len = expression.chars().count();
        if char_len > MAX_LENGTH {
            return Err(ParseError {
                kind: ParseErrorKind::ExceededMaxLength,
                raw: String::new(),
                position: 1,
                expression: expression.to_string(),
            });
        }
        Ok(Self {
            expression: expression.to_string(),
            context,
            operands: Vec::new(),
            operators: Vec::new(),
            call_separators: Vec::new(),
            prev_kind: None,
            char_len,
        })
    }

    fn run(mut self) -> Result<Expr, ParseError> {
        let mut lexer = Lexer::new(&self.expression);
        while let Some(token) = lexer.next_token() {
            self.accept(token)?;
        }

        while let Some(top) = self.operators.pop() {
            match top.kind {
                TokenKind::Dereference | TokenKind::LogicalOperator => self.apply(&top)?,
                _ => return Err(self.end_of_expression()),
            }
        }
        let root = match (self.operands.pop(), self.operands.is_empty()) {
            (Some(root), true) => root,
            _ => return Err(self.end_of_expression()),
        };

        if root.depth() > MAX_DEPTH {
            return Err(ParseError {
                kind: ParseErrorKind::ExceededMaxDepth,
                raw: String::new(),
                position: 1,
                expression: self.expression,
            });
        }
        Ok(root)
    }

    fn accept(&mut self, token: Token) -> Result<(), ParseError> {
        match token.kind {
            TokenKind::Unexpected => {
                return Err(self.error(ParseErrorKind::UnexpectedSymbol, &token))
            }
            TokenKind::Null | TokenKind::Boolean | TokenKind::Number | TokenKind::String => {
                let literal = token.literal.clone().expect("literal token carries a value");
                self.operands.push(Expr::Literal(literal));
            }
            TokenKind::PropertyName => {
                self.operands
                    .push(Expr::Literal(Literal::String(token.raw.clone())));
            }
            TokenKind::Wildcard => self.operands.push(Expr::Wildcard),
            TokenKind::NamedContext => {
                let known = self
                    .context
                    .named_contexts
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(&token.raw));
                if !known && !self.context.allow_unknown {
                    return Err(self.error(ParseErrorKind::UnrecognizedNamedContext, &token));
                }
                self.operands.push(Expr::NamedContext(token.raw.clone()));
            }
            TokenKind::Function => {
                if self.function_info(&token.raw).is_none() && !self.context.allow_unknown {
                    return Err(self.error(ParseErrorKind::UnrecognizedFunction, &token));
                }
                self.operators.push(token.clone());
            }
            TokenKind::StartGroup | TokenKind::StartIndex => self.operators.push(token.clone()),
            TokenKind::StartParameters => {
                self.operators.push(token.clone());
                self.call_separators.push(0);
            }
            TokenKind::Separator => {
                self.flush_until(TokenKind::StartParameters, &token)?;
                match self.call_separators.last_mut() {
                    Some(count) => *count += 1,
                    None => return Err(self.error(ParseErrorKind::UnexpectedSymbol, &token)),
                }
            }
            TokenKind::Dereference => {
                self.flush_binary(19)?;
                self.operators.push(token.clone());
            }
            TokenKind::LogicalOperator => {
                if token.raw == "!" {
                    // Right-associative: only strictly higher precedence flushes.
                    self.flush_while(|p| p > 16)?;
                } else {
                    self.flush_binary(binary_precedence(&token.raw))?;
                }
                self.operators.push(token.clone());
            }
            TokenKind::EndGroup => {
                self.flush_until(TokenKind::StartGroup, &token)?;
                self.operators.pop();
            }
            TokenKind::EndIndex => {
                self.flush_until(TokenKind::StartIndex, &token)?;
                self.operators.pop();
                let index = self.pop_operand(&token)?;
                let left = self.pop_operand(&token)?;
                self.operands.push(Expr::Index {
                    left: Box::new(left),
                    index: Box::new(index),
                });
            }
            TokenKind::EndParameters => {
                self.flush_until(TokenKind::StartParameters, &token)?;
                self.operators.pop();
                let function = match self.operators.pop() {
                    Some(t) if t.kind == TokenKind::Function => t,
                    _ => return Err(self.error(ParseErrorKind::UnexpectedSymbol, &token)),
                };
                let separators = self.call_separators.pop().unwrap_or(0);
                let count = if self.prev_kind == Some(TokenKind::StartParameters) {
                    0
                } else {
                    separators + 1
                };

                let (min_args, max_args) = self
                    .function_info(&function.raw)
                    .unwrap_or((0, usize::MAX));
                if count < min_args {
                    return Err(self.error(ParseErrorKind::TooFewParameters, &function));
                }
                if count > max_args {
                    return Err(self.error(ParseErrorKind::TooManyParameters, &function));
                }

                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(self.pop_operand(&token)?);
                }
                args.reverse();
                self.operands.push(Expr::Call {
                    name: function.raw.clone(),
                    args,
                });
            }
        }
        self.prev_kind = Some(token.kind);
        Ok(())
    }

    fn function_info(&self, name: &str) -> Option<(usize, usize)> {
        if let Some(&(_, min, max)) = funcs::WELL_KNOWN
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
        {
            return Some((min, max));
        }
        self.context
            .functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| (f.min_args, f.max_args))
    }

    // Flush stacked operators with precedence >= |precedence| (left
    // associativity), stopping at any open marker.
    fn flush_binary(&mut self, precedence: u8) -> Result<(), ParseError> {
        self.flush_while(|p| p >= precedence)
    }

    fn flush_while(&mut self, should_flush: impl Fn(u8) -> bool) -> Result<(), ParseError> {
        while let Some(top) = self.operators.last() {
            let top_precedence = match top.kind {
                TokenKind::Dereference => 19,
                TokenKind::LogicalOperator if top.raw == "!" => 16,
                TokenKind::LogicalOperator => binary_precedence(&top.raw),
                _ => break,
            };
            if !should_flush(top_precedence) {
                break;
            }
            let top = self.operators.pop().expect("operator stack is non-empty");
            self.apply(&top)?;
        }
        Ok(())
    }

    fn flush_until(&mut self, open: TokenKind, at: &Token) -> Result<(), ParseError> {
        loop {
            match self.operators.last() {
                None => return Err(self.error(ParseErrorKind::UnexpectedSymbol, at)),
                Some(top) if top.kind == open => return Ok(()),
                Some(top)
                    if matches!(
                        top.kind,
                        TokenKind::StartGroup
                            | TokenKind::StartIndex
                            | TokenKind::StartParameters
                            | TokenKind::Function
                    ) =>
                {
                    return Err(self.error(ParseErrorKind::UnexpectedSymbol, at))
                }
                Some(_) => {
                    let top = self.operators.pop().expect("operator stack is non-empty");
                    self.apply(&top)?;
                }
            }
        }
    }

    fn apply(&mut self, operator: &Token) -> Result<(), ParseError> {
        match operator.kind {
            TokenKind::Dereference => {
                let index = self.pop_operand(operator)?;
                let left = self.pop_operand(operator)?;
                self.operands.push(Expr::Index {
                    left: Box::new(left),
                    index: Box::new(index),
                });
            }
            TokenKind::LogicalOperator => match operator.raw.as_str() {
                "!" => {
                    let operand = self.pop_operand(operator)?;
                    self.operands.push(Expr::Not(Box::new(operand)));
                }
                "&&" => {
                    let right = self.pop_operand(operator)?;
                    let left = self.pop_operand(operator)?;
                    self.operands.push(Expr::And(flatten_and(left, right)));
                }
                "||" => {
                    let right = self.pop_operand(operator)?;
                    let left = self.pop_operand(operator)?;
                    self.operands.push(Expr::Or(flatten_or(left, right)));
                }
                symbol => {
                    let op = match symbol {
                        "==" => CompareOp::Equal,
                        "!=" => CompareOp::NotEqual,
                        "<" => CompareOp::LessThan,
                        "<=" => CompareOp::LessOrEqual,
                        ">" => CompareOp::GreaterThan,
                        ">=" => CompareOp::GreaterOrEqual,
                        _ => return Err(self.error(ParseErrorKind::UnexpectedSymbol, operator)),
                    };
                    let right = self.pop_operand(operator)?;
                    let left = self.pop_operand(operator)?;
                    self.operands.push(Expr::Compare {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    });
                }
            },
            _ => return Err(self.error(ParseErrorKind::UnexpectedSymbol, operator)),
        }
        Ok(())
    }

    fn pop_operand(&mut self, at: &Token) -> Result<Expr, ParseError> {
        self.operands
            .pop()
            .ok_or_else(|| self.error(ParseErrorKind::UnexpectedEndOfExpression, at))
    }

    fn error(&self, kind: ParseErrorKind, token: &Token) -> ParseError {
        ParseError {
            kind,
            raw: token.raw.clone(),
            position: token.index + 1,
            expression: self.expression.clone(),
        }
    }

    fn end_of_expression(&self) -> ParseError {
        ParseError {
            kind: ParseErrorKind::UnexpectedEndOfExpression,
            raw: String::new(),
            position: self.char_len.max(1),
            expression: self.expression.clone(),
        }
    }
}

fn binary_precedence(raw: &str) -> u8 {
    match raw {
        "<" | "<=" | ">" | ">=" => 11,
        "==" | "!=" => 10,
        "&&" => 6,
        "||" => 5,
        _ => 0,
    }
}

// Splicing nested operands of the same operator enables short-circuit over
// N-ary chains.
fn flatten_and(left: Expr, right: Expr) -> Vec<Expr> {
    let mut operands = match left {
        Expr::And(children) => children,
        other => vec![other],
    };
    match right {
        Expr::And(children) => operands.extend(children),
        other => operands.push(other),
    }
    operands
}

fn flatten_or(left: Expr, right: Expr) -> Vec<Expr> {
    let mut operands = match left {
        Expr::Or(children) => children,
        other => vec![other],
    };
    match right {
        Expr::Or(children) => operands.extend(children),
        other => operands.push(other),
    }
    operands
}

#[cfg(test)]
mod test {
    use super::*;

    fn syntax(expression: &str) -> Result<Expr, ParseError> {
        parse(
            expression,
            &ParseContext {
                allow_unknown: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn parses_dereference_chain() {
        let expr = syntax("github.event.name").unwrap();
        assert_eq!(expr.to_expression_string(), "github.event.name");
    }

    #[test]
    fn parses_index_and_wildcard() {
        let expr = syntax("a['b c'].*").unwrap();
        assert_eq!(expr.to_expression_string(), "a['b c'].*");
    }

    #[test]
    fn and_chains_flatten() {
        let expr = syntax("true && false && true").unwrap();
        match expr {
            Expr::And(operands) => assert_eq!(operands.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn groups_bound_flattening() {
        // Grouped operands still splice: short-circuit semantics are
        // unchanged by associativity.
        let expr = syntax("(true && false) && true").unwrap();
        match expr {
            Expr::And(operands) => assert_eq!(operands.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn precedence_not_binds_tighter_than_compare() {
        let expr = syntax("!true == false").unwrap();
        match expr {
            Expr::Compare {
                op: CompareOp::Equal,
                left,
                ..
            } => assert!(matches!(*left, Expr::Not(_))),
            other => panic!("expected Compare, got {other:?}"),
        }
    }

    #[test]
    fn function_arity_is_checked() {
        let err = syntax("contains('a')").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooFewParameters);
        let err = syntax("contains('a', 'b', 'c')").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooManyParameters);
        syntax("contains('a', 'b')").unwrap();
        syntax("join('a')").unwrap();
    }

    #[test]
    fn empty_call_parses() {
        let expr = syntax("alwaysTrue()").unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "alwaysTrue");
                assert!(args.is_empty());
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn unknown_identifiers_error_outside_syntax_mode() {
        let err = parse("foo.bar", &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnrecognizedNamedContext);
        assert_eq!(err.position, 1);

        let err = parse("foo(1)", &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnrecognizedFunction);

        let context = ParseContext {
            named_contexts: vec!["foo".to_string()],
            ..Default::default()
        };
        parse("FOO.bar", &context).unwrap();
    }

    #[test]
    fn unexpected_symbol_has_position() {
        let err = syntax("1 @ 2").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedSymbol);
        assert_eq!(err.position, 3);
        assert!(err.to_string().contains("position 3"));
    }

    #[test]
    fn unclosed_group_is_end_of_expression() {
        let err = syntax("(1").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEndOfExpression);
    }

    #[test]
    fn empty_expression_errors() {
        let err = syntax("").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEndOfExpression);
        let err = syntax("   ").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEndOfExpression);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut expression = String::new();
        for _ in 0..60 {
            expression.push_str("!(");
        }
        expression.push_str("true");
        for _ in 0..60 {
            expression.push(')');
        }
        let err = syntax(&expression).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::ExceededMaxDepth);
    }

    #[test]
    fn over_long_expression_is_rejected() {
        let expression = format!("'{}'", "x".repeat(MAX_LENGTH + 1));
        let err = syntax(&expression).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::ExceededMaxLength);
    }
}
