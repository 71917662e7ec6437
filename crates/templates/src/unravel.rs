//! The just-in-time template unraveler: a cursor over a token tree that
//! lazily expands `${{ … }}` expressions and `${{ insert }}` directives as
//! the caller walks it. Each scope entered charges bytes and depth; each
//! scope removed releases them (plus the bytes of any substitution product
//! it carried), so the live charge always corresponds to the cursor's
//! current path.

use std::collections::VecDeque;

use expressions::eval::{evaluate, EvaluationError, EvaluationOptions};
use expressions::parser::ParseContext;
use expressions::Value;

use crate::context::TemplateContext;
use crate::errors::TemplateError;
use crate::token::{TemplateToken, TokenMeta};

enum Frame {
    Literal {
        token: TemplateToken,
        bytes: usize,
        extra: usize,
        key_checked: bool,
    },
    Sequence {
        meta: TokenMeta,
        remaining: VecDeque<TemplateToken>,
        entered: bool,
        at_end: bool,
        bytes: usize,
        extra: usize,
    },
    Mapping {
        meta: TokenMeta,
        remaining: VecDeque<(TemplateToken, TemplateToken)>,
        /// The value of the pair whose key is currently on top of us.
        pending_value: Option<TemplateToken>,
        /// The frame on top of us is the current pair's value.
        in_value: bool,
        /// Upper-cased keys already surfaced from this mapping.
        seen: Vec<String>,
        entered: bool,
        at_end: bool,
        bytes: usize,
        extra: usize,
    },
    BasicExpression {
        meta: TokenMeta,
        text: String,
        bytes: usize,
    },
    InsertExpression {
        meta: TokenMeta,
        bytes: usize,
    },
}

impl Frame {
    fn charge(&self) -> usize {
        match self {
            Frame::Literal { bytes, extra, .. }
            | Frame::Sequence { bytes, extra, .. }
            | Frame::Mapping { bytes, extra, .. } => bytes + extra,
            Frame::BasicExpression { bytes, .. } | Frame::InsertExpression { bytes, .. } => *bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Root,
    SequenceItem,
    MappingKey,
    MappingValue,
}

pub struct Unraveler<'c> {
    ctx: &'c mut TemplateContext,
    stack: Vec<Frame>,
}

impl<'c> Unraveler<'c> {
    pub fn new(ctx: &'c mut TemplateContext, token: TemplateToken) -> Result<Self, TemplateError> {
        let mut unraveler = Self {
            ctx,
            stack: Vec::new(),
        };
        unraveler.push_token(token, 0)?;
        Ok(unraveler)
    }

    /// Consume a scalar at the cursor. With `expand`, expressions at the
    /// position have already been replaced by `unravel`; without it, they
    /// surface as-is.
    pub fn allow_scalar(&mut self, expand: bool) -> Result<Option<TemplateToken>, TemplateError> {
        self.unravel(expand)?;
        if !matches!(
            self.stack.last(),
            Some(
                Frame::Literal { .. }
                    | Frame::BasicExpression { .. }
                    | Frame::InsertExpression { .. }
            )
        ) {
            return Ok(None);
        }
        let Some(frame) = self.release_top() else {
            return Err(TemplateError::UnexpectedState);
        };
        let token = match frame {
            Frame::Literal { token, .. } => token,
            Frame::BasicExpression { meta, text, .. } => TemplateToken::BasicExpression(meta, text),
            Frame::InsertExpression { meta, .. } => TemplateToken::InsertExpression(meta),
            _ => return Err(TemplateError::UnexpectedState),
        };
        self.advance()?;
        Ok(Some(token))
    }

    pub fn allow_sequence_start(
        &mut self,
        expand: bool,
    ) -> Result<Option<TokenMeta>, TemplateError> {
        self.unravel(expand)?;
        let meta = match self.stack.last_mut() {
            Some(Frame::Sequence { meta, entered, .. }) if !*entered => {
                *entered = true;
                meta.clone()
            }
            _ => return Ok(None),
        };
        self.advance()?;
        Ok(Some(meta))
    }

    pub fn allow_sequence_end(&mut self, expand: bool) -> Result<bool, TemplateError> {
        self.unravel(expand)?;
        match self.stack.last() {
            Some(Frame::Sequence {
                entered: true,
                at_end: true,
                ..
            }) => {
                self.release_top();
                self.advance()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn allow_mapping_start(
        &mut self,
        expand: bool,
    ) -> Result<Option<TokenMeta>, TemplateError> {
        self.unravel(expand)?;
        let meta = match self.stack.last_mut() {
            Some(Frame::Mapping { meta, entered, .. }) if !*entered => {
                *entered = true;
                meta.clone()
            }
            _ => return Ok(None),
        };
        self.advance()?;
        Ok(Some(meta))
    }

    pub fn allow_mapping_end(&mut self, expand: bool) -> Result<bool, TemplateError> {
        self.unravel(expand)?;
        match self.stack.last() {
            Some(Frame::Mapping {
                entered: true,
                at_end: true,
                ..
            }) => {
                self.release_top();
                self.advance()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Assert the cursor is at a mapping's end and consume it.
    pub fn read_mapping_end(&mut self) -> Result<(), TemplateError> {
        if self.allow_mapping_end(false)? {
            Ok(())
        } else {
            Err(TemplateError::UnexpectedState)
        }
    }

    /// Assert the traversal is complete.
    pub fn read_end(&mut self) -> Result<(), TemplateError> {
        if self.stack.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::ExpectedEnd)
        }
    }

    /// Discard the sequence item at the cursor, without expanding it.
    pub fn skip_sequence_item(&mut self) -> Result<(), TemplateError> {
        if self.position() != Position::SequenceItem {
            return Err(TemplateError::UnexpectedState);
        }
        self.release_top();
        self.advance()
    }

    /// Discard the mapping key at the cursor; the cursor moves to its value.
    pub fn skip_mapping_key(&mut self) -> Result<(), TemplateError> {
        if self.position() != Position::MappingKey {
            return Err(TemplateError::UnexpectedState);
        }
        self.release_top();
        self.advance()
    }

    /// Discard the mapping value at the cursor.
    pub fn skip_mapping_value(&mut self) -> Result<(), TemplateError> {
        if self.position() != Position::MappingValue {
            return Err(TemplateError::UnexpectedState);
        }
        self.release_top();
        self.advance()
    }

    fn position(&self) -> Position {
        if self.stack.len() < 2 {
            return Position::Root;
        }
        match &self.stack[self.stack.len() - 2] {
            Frame::Sequence { .. } => Position::SequenceItem,
            Frame::Mapping {
                in_value,
                pending_value,
                ..
            } => {
                if *in_value {
                    Position::MappingValue
                } else if pending_value.is_some() {
                    Position::MappingKey
                } else {
                    Position::MappingValue
                }
            }
            _ => Position::Root,
        }
    }

    fn push_token(&mut self, token: TemplateToken, extra: usize) -> Result<(), TemplateError> {
        self.ctx.memory.depth.push()?;
        let bytes = token.shallow_bytes();
        self.ctx.memory.bytes.add(bytes)?;
        let frame = match token {
            TemplateToken::Sequence(meta, items) => Frame::Sequence {
                meta,
                remaining: items.into(),
                entered: false,
                at_end: false,
                bytes,
                extra,
            },
            TemplateToken::Mapping(meta, pairs) => Frame::Mapping {
                meta,
                remaining: pairs.into(),
                pending_value: None,
                in_value: false,
                seen: Vec::new(),
                entered: false,
                at_end: false,
                bytes,
                extra,
            },
            TemplateToken::BasicExpression(meta, text) => {
                // Substitution bytes stay owned by the producing scope.
                debug_assert_eq!(extra, 0);
                Frame::BasicExpression { meta, text, bytes }
            }
            TemplateToken::InsertExpression(meta) => Frame::InsertExpression { meta, bytes },
            literal => Frame::Literal {
                token: literal,
                bytes,
                extra,
                key_checked: false,
            },
        };
        self.stack.push(frame);
        Ok(())
    }

    fn release_top(&mut self) -> Option<Frame> {
        let frame = self.stack.pop()?;
        self.ctx.memory.depth.pop();
        self.ctx.memory.bytes.subtract(frame.charge());
        Some(frame)
    }

    // Move the container now on top of the stack to its next position,
    // pushing a frame for the next child when one exists.
    fn advance(&mut self) -> Result<(), TemplateError> {
        enum Next {
            Done,
            Push(TemplateToken),
        }
        let next = match self.stack.last_mut() {
            None => Next::Done,
            Some(Frame::Sequence {
                remaining, at_end, ..
            }) => match remaining.pop_front() {
                Some(item) => Next::Push(item),
                None => {
                    *at_end = true;
                    Next::Done
                }
            },
            Some(Frame::Mapping {
                remaining,
                pending_value,
                in_value,
                at_end,
                ..
            }) => {
                if *in_value {
                    *in_value = false;
                    match remaining.pop_front() {
                        Some((key, value)) => {
                            *pending_value = Some(value);
                            Next::Push(key)
                        }
                        None => {
                            *at_end = true;
                            Next::Done
                        }
                    }
                } else if let Some(value) = pending_value.take() {
                    *in_value = true;
                    Next::Push(value)
                } else {
                    match remaining.pop_front() {
                        Some((key, value)) => {
                            *pending_value = Some(value);
                            Next::Push(key)
                        }
                        None => {
                            *at_end = true;
                            Next::Done
                        }
                    }
                }
            }
            Some(_) => Next::Done,
        };
        match next {
            Next::Push(token) => self.push_token(token, 0),
            Next::Done => Ok(()),
        }
    }

    // The core loop: rewrite the cursor position until a plain token (or an
    // unexpanded expression when !expand) is on top.
    fn unravel(&mut self, expand: bool) -> Result<(), TemplateError> {
        loop {
            enum Action {
                Stop,
                Expression(Position, TokenMeta, String),
                Insert(Position, TokenMeta),
                CheckKey(String, TokenMeta),
            }

            let action = match self.stack.last() {
                Some(Frame::BasicExpression { meta, text, .. }) if expand => {
                    Action::Expression(self.position(), meta.clone(), text.clone())
                }
                Some(Frame::InsertExpression { meta, .. }) if expand => {
                    Action::Insert(self.position(), meta.clone())
                }
                Some(Frame::Literal {
                    token, key_checked, ..
                }) if !*key_checked && self.position() == Position::MappingKey => {
                    Action::CheckKey(token.to_display_string(), token.meta().clone())
                }
                _ => Action::Stop,
            };

            match action {
                Action::Stop => return Ok(()),
                Action::Expression(position, meta, text) => {
                    self.expand_expression(position, meta, text)?;
                }
                Action::Insert(position, meta) => {
                    self.expand_insert(position, meta)?;
                }
                Action::CheckKey(key, meta) => {
                    let upper = key.to_uppercase();
                    let duplicate = match self.parent_mapping() {
                        Some(Frame::Mapping { seen, .. }) => {
                            if seen.contains(&upper) {
                                true
                            } else {
                                seen.push(upper);
                                false
                            }
                        }
                        _ => false,
                    };
                    if duplicate {
                        self.ctx
                            .error(&meta, &format!("'{key}' is already defined"));
                        self.drop_pair()?;
                        continue;
                    }
                    if let Some(Frame::Literal { key_checked, .. }) = self.stack.last_mut() {
                        *key_checked = true;
                    }
                }
            }
        }
    }

    fn parent_mapping(&mut self) -> Option<&mut Frame> {
        let at = self.stack.len().checked_sub(2)?;
        match &self.stack[at] {
            Frame::Mapping { .. } => self.stack.get_mut(at),
            _ => None,
        }
    }

    fn expand_expression(
        &mut self,
        position: Position,
        meta: TokenMeta,
        text: String,
    ) -> Result<(), TemplateError> {
        let outcome = self.evaluate(&text)?;
        match position {
            Position::Root | Position::MappingValue => {
                self.release_top();
                let token = match outcome {
                    Ok(value) => TemplateToken::from_value(&value, &meta),
                    Err(message) => {
                        self.ctx.error(&meta, &message);
                        TemplateToken::String(meta.clone(), String::new())
                    }
                };
                self.substitute(token)
            }
            Position::SequenceItem => match outcome {
                Ok(Value::Null) => {
                    // An undefined item vanishes from the sequence.
                    self.release_top();
                    self.advance()
                }
                Ok(Value::Array(arr)) => {
                    self.release_top();
                    let mut extra = 0;
                    let items: Vec<TemplateToken> = (0..arr.len())
                        .map(|i| {
                            let item =
                                TemplateToken::from_value(&arr.item(i).unwrap_or(Value::Null), &meta);
                            extra += item.deep_bytes();
                            item
                        })
                        .collect();
                    self.splice_sequence(items, extra)?;
                    self.advance()
                }
                Ok(value) => {
                    self.release_top();
                    self.substitute(TemplateToken::from_value(&value, &meta))
                }
                Err(message) => {
                    self.ctx.error(&meta, &message);
                    self.release_top();
                    self.substitute(TemplateToken::String(meta.clone(), String::new()))
                }
            },
            Position::MappingKey => match outcome {
                Ok(value) if value.is_primitive() => {
                    self.release_top();
                    self.substitute(TemplateToken::String(
                        meta.clone(),
                        value.to_display_string(),
                    ))
                }
                Ok(value) => {
                    self.ctx.error(
                        &meta,
                        &format!("Unexpected value '{}'", value.to_display_string()),
                    );
                    self.drop_pair()
                }
                Err(message) => {
                    self.ctx.error(&meta, &message);
                    self.drop_pair()
                }
            },
        }
    }

    fn expand_insert(&mut self, position: Position, meta: TokenMeta) -> Result<(), TemplateError> {
        if position != Position::MappingKey {
            self.ctx
                .error(&meta, "The directive 'insert' is not allowed in this context");
            self.release_top();
            return self.substitute(TemplateToken::String(meta.clone(), String::new()));
        }

        // Peek at the pair's value; it must be a mapping, or an expression
        // producing one.
        let value_token = match self.parent_mapping() {
            Some(Frame::Mapping { pending_value, .. }) => pending_value.take(),
            _ => None,
        };
        let Some(value_token) = value_token else {
            return Err(TemplateError::UnexpectedState);
        };

        let (pairs, extra) = match value_token {
            TemplateToken::Mapping(_, pairs) => (Some(pairs), 0),
            TemplateToken::BasicExpression(expr_meta, text) => match self.evaluate(&text)? {
                Ok(Value::Object(object)) => {
                    let mut extra = 0;
                    let pairs: Vec<(TemplateToken, TemplateToken)> = object
                        .keys()
                        .into_iter()
                        .map(|key| {
                            let value = object.item(&key).unwrap_or(Value::Null);
                            let key_token =
                                TemplateToken::String(expr_meta.clone(), key.to_string());
                            let value_token = TemplateToken::from_value(&value, &expr_meta);
                            extra += key_token.deep_bytes() + value_token.deep_bytes();
                            (key_token, value_token)
                        })
                        .collect();
                    (Some(pairs), extra)
                }
                Ok(value) => {
                    self.ctx.error(
                        &expr_meta,
                        &format!(
                            "The directive 'insert' requires a mapping value, found '{}'",
                            value.to_display_string()
                        ),
                    );
                    (None, 0)
                }
                Err(message) => {
                    self.ctx.error(&expr_meta, &message);
                    (None, 0)
                }
            },
            other => {
                self.ctx.error(
                    other.meta(),
                    &format!(
                        "The directive 'insert' requires a mapping value, found '{}'",
                        other.to_display_string()
                    ),
                );
                (None, 0)
            }
        };

        // Remove the directive key; on failure the whole pair is omitted.
        self.release_top();
        if let Some(pairs) = pairs {
            self.splice_mapping(pairs, extra)?;
        }
        self.advance()
    }

    // Replace the just-released cursor position with a substituted token.
    // The product's full size is charged to the new frame and released with
    // it. Expression results never contain expression tokens, so the new
    // frame cannot re-expand.
    fn substitute(&mut self, token: TemplateToken) -> Result<(), TemplateError> {
        let extra = token.deep_bytes();
        self.ctx.memory.bytes.add(extra)?;
        self.push_token(token, extra)
    }

    // Inline items at the cursor's position in the enclosing sequence.
    fn splice_sequence(
        &mut self,
        items: Vec<TemplateToken>,
        extra: usize,
    ) -> Result<(), TemplateError> {
        self.ctx.memory.bytes.add(extra)?;
        match self.stack.last_mut() {
            Some(Frame::Sequence {
                remaining,
                extra: frame_extra,
                ..
            }) => {
                *frame_extra += extra;
                for item in items.into_iter().rev() {
                    remaining.push_front(item);
                }
                Ok(())
            }
            _ => Err(TemplateError::UnexpectedState),
        }
    }

    // Inline pairs at the cursor's position in the enclosing mapping.
    fn splice_mapping(
        &mut self,
        pairs: Vec<(TemplateToken, TemplateToken)>,
        extra: usize,
    ) -> Result<(), TemplateError> {
        self.ctx.memory.bytes.add(extra)?;
        match self.stack.last_mut() {
            Some(Frame::Mapping {
                remaining,
                extra: frame_extra,
                ..
            }) => {
                *frame_extra += extra;
                for pair in pairs.into_iter().rev() {
                    remaining.push_front(pair);
                }
                Ok(())
            }
            _ => Err(TemplateError::UnexpectedState),
        }
    }

    // Drop the pair whose key frame is at the cursor: the undelivered value
    // is discarded first, while the enclosing mapping is still the parent.
    fn drop_pair(&mut self) -> Result<(), TemplateError> {
        if let Some(Frame::Mapping { pending_value, .. }) = self.parent_mapping() {
            pending_value.take();
        }
        self.release_top();
        self.advance()
    }

    // Evaluate one embedded expression. Budget exhaustion is fatal; every
    // other failure is recoverable and reported as a message.
    fn evaluate(&mut self, text: &str) -> Result<Result<Value, String>, TemplateError> {
        let parse_context = ParseContext {
            named_contexts: self
                .ctx
                .named_values
                .names()
                .map(str::to_string)
                .collect(),
            functions: Vec::new(),
            allow_unknown: true,
        };
        let expr = match expressions::parse(text, &parse_context) {
            Ok(expr) => expr,
            Err(err) => return Ok(Err(err.to_string())),
        };
        let options = EvaluationOptions {
            max_memory: self.ctx.memory.bytes.remaining(),
        };
        let (trace, named_values) = self.ctx.trace_and_values();
        match evaluate(&expr, trace, named_values, &[], None, &options) {
            Ok(result) => Ok(Ok(result.value)),
            Err(EvaluationError::Budget(b)) => Err(TemplateError::Budget(b)),
            Err(err) => Ok(Err(err.to_string())),
        }
    }
}

impl Drop for Unraveler<'_> {
    fn drop(&mut self) {
        while self.release_top().is_some() {}
    }
}

/// evaluate_template drives the cursor to completion with expansion on,
/// returning the fully expanded tree.
pub fn evaluate_template(
    ctx: &mut TemplateContext,
    token: TemplateToken,
) -> Result<TemplateToken, TemplateError> {
    let mut unraveler = Unraveler::new(ctx, token)?;
    let expanded = read_expanded(&mut unraveler)?;
    unraveler.read_end()?;
    Ok(expanded)
}

fn read_expanded(unraveler: &mut Unraveler<'_>) -> Result<TemplateToken, TemplateError> {
    if let Some(scalar) = unraveler.allow_scalar(true)? {
        return Ok(scalar);
    }
    if let Some(meta) = unraveler.allow_sequence_start(true)? {
        let mut items = Vec::new();
        while !unraveler.allow_sequence_end(true)? {
            items.push(read_expanded(unraveler)?);
        }
        return Ok(TemplateToken::Sequence(meta, items));
    }
    if let Some(meta) = unraveler.allow_mapping_start(true)? {
        let mut pairs = Vec::new();
        while !unraveler.allow_mapping_end(true)? {
            let key = unraveler
                .allow_scalar(true)?
                .ok_or(TemplateError::UnexpectedState)?;
            let value = read_expanded(unraveler)?;
            pairs.push((key, value));
        }
        return Ok(TemplateToken::Mapping(meta, pairs));
    }
    Err(TemplateError::UnexpectedState)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::TemplateContext;
    use crate::schema::internal_schema;
    use crate::token::TemplateToken;
    use expressions::budget::BudgetError;
    use expressions::value::{ArrayData, ObjectData};
    use std::rc::Rc;

    fn meta() -> TokenMeta {
        TokenMeta::default()
    }

    fn string(s: &str) -> TemplateToken {
        TemplateToken::String(meta(), s.to_string())
    }

    fn expression(text: &str) -> TemplateToken {
        TemplateToken::BasicExpression(meta(), text.to_string())
    }

    fn script_step(name: &str) -> Value {
        let mut step = ObjectData::new();
        step.insert("script", Value::string(name));
        Value::Object(Rc::new(step))
    }

    fn ctx_with_parameters() -> TemplateContext {
        // parameters.extra: [ {script: lint}, {script: package} ]
        // parameters.vars:  { c: 3, a: 9 }
        // parameters.name:  "Deploy"
        let mut extra = ArrayData::new();
        extra.push(script_step("lint"));
        extra.push(script_step("package"));

        let mut vars = ObjectData::new();
        vars.insert("c", Value::Number(3.0));
        vars.insert("a", Value::Number(9.0));

        let mut parameters = ObjectData::new();
        parameters.insert("extra", Value::Array(Rc::new(extra)));
        parameters.insert("vars", Value::Object(Rc::new(vars)));
        parameters.insert("name", Value::string("Deploy"));

        let mut ctx = TemplateContext::new(internal_schema());
        ctx.named_values
            .set("parameters", Value::Object(Rc::new(parameters)));
        ctx
    }

    fn expand(ctx: &mut TemplateContext, token: TemplateToken) -> TemplateToken {
        let before_bytes = ctx.memory.bytes.current();
        let before_depth = ctx.memory.depth.current();
        let out = evaluate_template(ctx, token).unwrap();
        assert_eq!(ctx.memory.bytes.current(), before_bytes);
        assert_eq!(ctx.memory.depth.current(), before_depth);
        out
    }

    #[test]
    fn scalar_expression_expands_in_place() {
        let mut ctx = ctx_with_parameters();
        let out = expand(&mut ctx, expression("format('run {0}', parameters.name)"));
        assert_eq!(out, string("run Deploy"));
        assert!(ctx.errors.is_empty());
    }

    #[test]
    fn sequence_expression_splices_items_in_place() {
        let mut ctx = ctx_with_parameters();
        let steps = TemplateToken::Sequence(
            meta(),
            vec![
                TemplateToken::Mapping(meta(), vec![(string("script"), string("build"))]),
                expression("parameters.extra"),
                TemplateToken::Mapping(meta(), vec![(string("script"), string("test"))]),
            ],
        );
        let out = expand(&mut ctx, steps);
        assert!(ctx.errors.is_empty(), "{:?}", ctx.errors.messages());

        let TemplateToken::Sequence(_, items) = out else {
            panic!("expected a sequence");
        };
        let scripts: Vec<String> = items
            .iter()
            .map(|item| {
                let TemplateToken::Mapping(_, pairs) = item else {
                    panic!("expected mapping items");
                };
                pairs[0].1.to_display_string()
            })
            .collect();
        assert_eq!(scripts, vec!["build", "lint", "package", "test"]);
    }

    #[test]
    fn undefined_sequence_item_is_skipped() {
        let mut ctx = ctx_with_parameters();
        let steps = TemplateToken::Sequence(
            meta(),
            vec![string("keep"), expression("parameters.missing"), string("also")],
        );
        let out = expand(&mut ctx, steps);
        let TemplateToken::Sequence(_, items) = out else {
            panic!("expected a sequence");
        };
        assert_eq!(items.len(), 2);
        assert!(ctx.errors.is_empty());
    }

    #[test]
    fn insert_merges_mapping_preserving_order_and_first_wins() {
        let mut ctx = ctx_with_parameters();
        let variables = TemplateToken::Mapping(
            meta(),
            vec![
                (string("a"), TemplateToken::Number(meta(), 1.0)),
                (
                    TemplateToken::InsertExpression(meta()),
                    expression("parameters.vars"),
                ),
                (string("b"), TemplateToken::Number(meta(), 2.0)),
            ],
        );
        let out = expand(&mut ctx, variables);
        let TemplateToken::Mapping(_, pairs) = out else {
            panic!("expected a mapping");
        };
        let entries: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_display_string(), v.to_display_string()))
            .collect();
        // Existing `a` wins; `c` lands between `a` and `b`; duplicate `a`
        // from the insertion is dropped with a diagnostic.
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "1".to_string()),
                ("c".to_string(), "3".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
        let messages = ctx.errors.messages();
        assert!(
            messages.iter().any(|m| m.contains("'a' is already defined")),
            "{messages:?}"
        );
    }

    #[test]
    fn insert_of_non_mapping_is_omitted_with_diagnostic() {
        let mut ctx = ctx_with_parameters();
        let variables = TemplateToken::Mapping(
            meta(),
            vec![
                (string("a"), TemplateToken::Number(meta(), 1.0)),
                (
                    TemplateToken::InsertExpression(meta()),
                    expression("parameters.name"),
                ),
            ],
        );
        let out = expand(&mut ctx, variables);
        let TemplateToken::Mapping(_, pairs) = out else {
            panic!("expected a mapping");
        };
        assert_eq!(pairs.len(), 1);
        let messages = ctx.errors.messages();
        assert!(
            messages
                .iter()
                .any(|m| m.contains("The directive 'insert' requires a mapping value")),
            "{messages:?}"
        );
    }

    #[test]
    fn failed_expression_substitutes_empty_string_in_values() {
        let mut ctx = ctx_with_parameters();
        let mapping = TemplateToken::Mapping(
            meta(),
            vec![(string("a"), expression("fromJson('nope')"))],
        );
        let out = expand(&mut ctx, mapping);
        let TemplateToken::Mapping(_, pairs) = out else {
            panic!("expected a mapping");
        };
        assert_eq!(pairs[0].1, string(""));
        assert_eq!(ctx.errors.count(), 1);
    }

    #[test]
    fn failed_key_expression_drops_the_pair() {
        let mut ctx = ctx_with_parameters();
        let mapping = TemplateToken::Mapping(
            meta(),
            vec![
                (expression("fromJson('nope')"), string("dropped")),
                (string("kept"), string("value")),
            ],
        );
        let out = expand(&mut ctx, mapping);
        let TemplateToken::Mapping(_, pairs) = out else {
            panic!("expected a mapping");
        };
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, string("kept"));
        assert_eq!(ctx.errors.count(), 1);
    }

    #[test]
    fn key_expression_expands_to_string() {
        let mut ctx = ctx_with_parameters();
        let mapping = TemplateToken::Mapping(
            meta(),
            vec![(expression("parameters.name"), string("value"))],
        );
        let out = expand(&mut ctx, mapping);
        let TemplateToken::Mapping(_, pairs) = out else {
            panic!("expected a mapping");
        };
        assert_eq!(pairs[0].0, string("Deploy"));
        assert!(ctx.errors.is_empty());
    }

    #[test]
    fn without_expand_expressions_surface_as_is() {
        let mut ctx = ctx_with_parameters();
        let token = expression("parameters.name");
        let mut unraveler = Unraveler::new(&mut ctx, token.clone()).unwrap();
        let out = unraveler.allow_scalar(false).unwrap().unwrap();
        unraveler.read_end().unwrap();
        drop(unraveler);
        assert_eq!(out, token);
    }

    #[test]
    fn skips_discard_subtrees_and_release_memory() {
        let mut ctx = ctx_with_parameters();
        let before = ctx.memory.bytes.current();
        let steps = TemplateToken::Sequence(
            meta(),
            vec![
                TemplateToken::Mapping(meta(), vec![(string("big"), string("subtree"))]),
                string("kept"),
            ],
        );
        {
            let mut unraveler = Unraveler::new(&mut ctx, steps).unwrap();
            assert!(unraveler.allow_sequence_start(false).unwrap().is_some());
            unraveler.skip_sequence_item().unwrap();
            let kept = unraveler.allow_scalar(false).unwrap().unwrap();
            assert_eq!(kept.to_display_string(), "kept");
            assert!(unraveler.allow_sequence_end(false).unwrap());
            unraveler.read_end().unwrap();
        }
        assert_eq!(ctx.memory.bytes.current(), before);
        assert_eq!(ctx.memory.depth.current(), 0);
    }

    #[test]
    fn depth_limit_terminates_traversal() {
        let mut deep = string("leaf");
        for _ in 0..60 {
            deep = TemplateToken::Sequence(meta(), vec![deep]);
        }
        let mut ctx = ctx_with_parameters();
        let err = evaluate_template(&mut ctx, deep).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Budget(BudgetError::MaxDepthExceeded)
        ));
        // The failed traversal released everything it had charged.
        assert_eq!(ctx.memory.depth.current(), 0);
    }
}
