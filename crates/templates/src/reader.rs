//! The event-driven, schema-validating template reader. It consumes an
//! object-event source, recognizes `${{ … }}` expressions and the
//! `${{ insert }}` directive inside scalars, and builds the token tree
//! while charging every created token against the context's budget.
//!
//! Validation mismatches are recoverable: a diagnostic is recorded and the
//! offending subtree is skipped. Resource exhaustion is not.

use expressions::budget::MIN_OBJECT_SIZE;
use expressions::lexer::Literal;
use expressions::parser::ParseContext;
use expressions::Expr;

use crate::context::TemplateContext;
use crate::errors::TemplateError;
use crate::events::{ObjectSource, SourceError};
use crate::schema::{
    match_property_and_filter, split_context, Definition, DefinitionKind, DefinitionType,
    SchemaError, TemplateSchema, ANY,
};
use crate::token::{TemplateToken, TokenMeta};

/// A definition resolved at a template position, together with the
/// expression context accumulated from the enclosing definitions.
#[derive(Debug, Clone)]
pub(crate) struct DefinitionInfo {
    pub definition: Definition,
    pub allowed_context: Vec<String>,
}

impl DefinitionInfo {
    pub fn root(schema: &TemplateSchema, name: &str) -> Result<Self, SchemaError> {
        let definition = schema.get(name)?.clone();
        Ok(Self {
            allowed_context: definition.reader_context.clone(),
            definition,
        })
    }

    // Nested positions inherit the parent's context and extend it with
    // whatever the nested definition declares.
    pub fn nested(
        schema: &TemplateSchema,
        parent: &DefinitionInfo,
        name: &str,
    ) -> Result<Self, SchemaError> {
        let definition = schema.get(name)?.clone();
        let mut allowed = parent.allowed_context.clone();
        for entry in &definition.reader_context {
            if !allowed.iter().any(|e| e.eq_ignore_ascii_case(entry)) {
                allowed.push(entry.clone());
            }
        }
        Ok(Self {
            definition,
            allowed_context: allowed,
        })
    }
}

/// read_template reads one document from |source| against the named root
/// definition, returning the token tree. Recoverable problems are recorded
/// on `ctx.errors`; only resource and source-contract failures return Err.
pub fn read_template(
    ctx: &mut TemplateContext,
    type_name: &str,
    source: &mut dyn ObjectSource,
    file: Option<u32>,
) -> Result<TemplateToken, TemplateError> {
    source.validate_start()?;
    let schema = ctx.schema.clone();
    let root = DefinitionInfo::root(&schema, type_name)?;
    let token = read_value(ctx, source, &root, file)?;
    source.validate_end()?;
    Ok(token)
}

fn read_value(
    ctx: &mut TemplateContext,
    source: &mut dyn ObjectSource,
    info: &DefinitionInfo,
    file: Option<u32>,
) -> Result<TemplateToken, TemplateError> {
    if let Some(literal) = source.allow_literal()? {
        let token = parse_scalar(ctx, with_file(literal, file), &info.allowed_context, false);
        validate_scalar(ctx, &token, info);
        ctx.memory.add_token(&token, false)?;
        return Ok(token);
    }

    if let Some(meta) = source.allow_sequence_start()? {
        let meta = stamp(meta, file);
        ctx.memory.depth.push()?;
        let token = read_sequence(ctx, source, info, meta, file)?;
        ctx.memory.depth.pop();
        return Ok(token);
    }

    if let Some(meta) = source.allow_mapping_start()? {
        let meta = stamp(meta, file);
        ctx.memory.depth.push()?;
        let token = read_mapping(ctx, source, info, meta, file)?;
        ctx.memory.depth.pop();
        return Ok(token);
    }

    Err(SourceError::UnexpectedState.into())
}

fn read_sequence(
    ctx: &mut TemplateContext,
    source: &mut dyn ObjectSource,
    info: &DefinitionInfo,
    meta: TokenMeta,
    file: Option<u32>,
) -> Result<TemplateToken, TemplateError> {
    let schema = ctx.schema.clone();
    let item_type = schema
        .definitions_of_type(&info.definition, DefinitionType::Sequence)
        .first()
        .and_then(|d| match &d.kind {
            DefinitionKind::Sequence(s) => Some(s.item_type.clone()),
            _ => None,
        });

    let Some(item_type) = item_type else {
        ctx.error(&meta, "A sequence was not expected");
        while !source.allow_sequence_end() {
            skip_value(ctx, source)?;
        }
        return Ok(TemplateToken::Null(meta));
    };

    ctx.memory.bytes.add(MIN_OBJECT_SIZE)?;
    let item_info = DefinitionInfo::nested(&schema, info, &item_type)?;
    let mut items = Vec::new();
    while !source.allow_sequence_end() {
        items.push(read_value(ctx, source, &item_info, file)?);
    }
    Ok(TemplateToken::Sequence(meta, items))
}

fn read_mapping(
    ctx: &mut TemplateContext,
    source: &mut dyn ObjectSource,
    info: &DefinitionInfo,
    meta: TokenMeta,
    file: Option<u32>,
) -> Result<TemplateToken, TemplateError> {
    let schema = ctx.schema.clone();
    let mut candidates = schema.definitions_of_type(&info.definition, DefinitionType::Mapping);
    if candidates.is_empty() {
        ctx.error(&meta, "A mapping was not expected");
        while !source.allow_mapping_end() {
            skip_value(ctx, source)?;
            skip_value(ctx, source)?;
        }
        return Ok(TemplateToken::Null(meta));
    }

    ctx.memory.bytes.add(MIN_OBJECT_SIZE)?;
    let any_info = DefinitionInfo::nested(&schema, info, ANY)?;
    let loose_only = candidates.len() == 1
        && candidates[0]
            .as_mapping()
            .map(|m| m.properties.is_empty())
            .unwrap_or(false);

    let mut pairs = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut expression_key = false;

    while !source.allow_mapping_end() {
        let Some(raw_key) = source.allow_literal()? else {
            return Err(SourceError::UnexpectedState.into());
        };
        let key = parse_scalar(ctx, with_file(raw_key, file), &info.allowed_context, true);

        if key.is_expression() {
            // An expression key cannot be matched against declared
            // properties; its value is read unconstrained.
            expression_key = true;
            ctx.memory.add_token(&key, false)?;
            let value = read_value(ctx, source, &any_info, file)?;
            pairs.push((key, value));
            continue;
        }

        let key_text = key.to_display_string();
        let upper = key_text.to_uppercase();
        if seen.contains(&upper) {
            ctx.error(key.meta(), &format!("'{key_text}' is already defined"));
            skip_value(ctx, source)?;
            continue;
        }
        seen.push(upper);
        let key_token = TemplateToken::String(key.meta().clone(), key_text.clone());
        ctx.memory.add_token(&key_token, false)?;

        if loose_only {
            let loose = candidates[0]
                .as_mapping()
                .and_then(|m| m.loose_key_type.as_ref().zip(m.loose_value_type.as_ref()));
            let Some((loose_key, loose_value)) = loose else {
                return Err(TemplateError::UnexpectedState);
            };
            let key_info = DefinitionInfo::nested(&schema, info, loose_key)?;
            validate_scalar(ctx, &key_token, &key_info);
            let value_info = DefinitionInfo::nested(&schema, info, loose_value)?;
            let value = read_value(ctx, source, &value_info, file)?;
            pairs.push((key_token, value));
            continue;
        }

        match match_property_and_filter(&mut candidates, &key_text) {
            Some(property) => {
                let value_info = DefinitionInfo::nested(&schema, info, &property.type_name)?;
                let value = read_value(ctx, source, &value_info, file)?;
                pairs.push((key_token, value));
            }
            None => {
                let loose = candidates.iter().find_map(|c| {
                    c.as_mapping()
                        .and_then(|m| m.loose_key_type.as_ref().zip(m.loose_value_type.as_ref()))
                });
                if let Some((loose_key, loose_value)) = loose {
                    let key_info = DefinitionInfo::nested(&schema, info, loose_key)?;
                    validate_scalar(ctx, &key_token, &key_info);
                    let value_info = DefinitionInfo::nested(&schema, info, loose_value)?;
                    let value = read_value(ctx, source, &value_info, file)?;
                    pairs.push((key_token, value));
                } else {
                    ctx.error(key_token.meta(), &format!("Unexpected value '{key_text}'"));
                    skip_value(ctx, source)?;
                }
            }
        }
    }

    if !loose_only && !expression_key {
        if candidates.len() > 1 {
            let mut hints = non_shared_properties(&candidates);
            hints.sort();
            ctx.error(
                &meta,
                &format!(
                    "There's not enough info to determine what you meant. Add one of these properties: {}",
                    hints.join(", ")
                ),
            );
        } else if let Some(mapping) = candidates[0].as_mapping() {
            for (property, p) in &mapping.properties {
                if p.required && !seen.contains(&property.to_uppercase()) {
                    ctx.error(&meta, &format!("Required property is missing: {property}"));
                }
            }
        }
    }

    Ok(TemplateToken::Mapping(meta, pairs))
}

// Property names that would disambiguate the surviving candidates: those
// not shared by all of them.
fn non_shared_properties(candidates: &[&Definition]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for candidate in candidates {
        let Some(mapping) = candidate.as_mapping() else {
            continue;
        };
        for (name, _) in &mapping.properties {
            let shared = candidates.iter().all(|c| {
                c.as_mapping()
                    .map(|m| m.property(name).is_some())
                    .unwrap_or(false)
            });
            if !shared && !out.iter().any(|e| e.eq_ignore_ascii_case(name)) {
                out.push(name.clone());
            }
        }
    }
    out
}

/// skip_value consumes one complete value from the source, mirroring its
/// structure so end events stay balanced.
pub(crate) fn skip_value(
    ctx: &mut TemplateContext,
    source: &mut dyn ObjectSource,
) -> Result<(), TemplateError> {
    if source.allow_literal()?.is_some() {
        return Ok(());
    }
    if source.allow_sequence_start()?.is_some() {
        ctx.memory.depth.push()?;
        while !source.allow_sequence_end() {
            skip_value(ctx, source)?;
        }
        ctx.memory.depth.pop();
        return Ok(());
    }
    if source.allow_mapping_start()?.is_some() {
        ctx.memory.depth.push()?;
        while !source.allow_mapping_end() {
            skip_value(ctx, source)?;
            skip_value(ctx, source)?;
        }
        ctx.memory.depth.pop();
        return Ok(());
    }
    Err(SourceError::UnexpectedState.into())
}

fn validate_scalar(ctx: &mut TemplateContext, token: &TemplateToken, info: &DefinitionInfo) {
    if token.is_expression() {
        return;
    }
    let schema = ctx.schema.clone();
    let matched = schema
        .scalar_definitions(&info.definition)
        .iter()
        .any(|d| literal_matches(token, d));
    if !matched {
        ctx.error(
            token.meta(),
            &format!("Unexpected value '{}'", token.to_display_string()),
        );
    }
}

fn literal_matches(token: &TemplateToken, definition: &Definition) -> bool {
    match (&definition.kind, token) {
        (DefinitionKind::Null, TemplateToken::Null(_)) => true,
        (DefinitionKind::Boolean, TemplateToken::Boolean(..)) => true,
        (DefinitionKind::Number, TemplateToken::Number(..)) => true,
        (DefinitionKind::String(constraints), TemplateToken::String(_, s)) => {
            if let Some(constant) = &constraints.constant {
                if constraints.ignore_case {
                    constant.eq_ignore_ascii_case(s)
                } else {
                    constant == s
                }
            } else if constraints.require_non_empty {
                !s.is_empty()
            } else {
                true
            }
        }
        _ => false,
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Expression(String),
}

/// parse_scalar splits a string into literal and `${{ … }}` segments,
/// validates expression syntax against the allowed context, recognizes the
/// `insert` directive, collapses `${{ 'literal' }}` to a plain string, and
/// rewrites multi-segment values into a single `format(…)` expression.
pub(crate) fn parse_scalar(
    ctx: &mut TemplateContext,
    token: TemplateToken,
    allowed_context: &[String],
    allow_directives: bool,
) -> TemplateToken {
    let TemplateToken::String(meta, text) = token else {
        return token;
    };
    let segments = match split_segments(&text) {
        Ok(segments) => segments,
        Err(message) => {
            ctx.error(&meta, &message);
            return TemplateToken::String(meta, text);
        }
    };
    if !segments
        .iter()
        .any(|s| matches!(s, Segment::Expression(_)))
    {
        return TemplateToken::String(meta, text);
    }

    if segments
        .iter()
        .any(|s| matches!(s, Segment::Expression(e) if e == "insert"))
    {
        // A directive must be the entire value.
        if segments.len() == 1 && allow_directives && !allowed_context.is_empty() {
            return TemplateToken::InsertExpression(meta);
        }
        ctx.error(&meta, "The directive 'insert' is not allowed in this context");
        return TemplateToken::String(meta, text);
    }

    if allowed_context.is_empty() {
        ctx.error(&meta, "A template expression is not allowed in this context");
        return TemplateToken::String(meta, text);
    }

    let (named_contexts, functions) = split_context(allowed_context);
    let parse_context = ParseContext {
        named_contexts,
        functions,
        allow_unknown: false,
    };

    let mut parsed = Vec::new();
    for segment in &segments {
        if let Segment::Expression(expression) = segment {
            match expressions::parse(expression, &parse_context) {
                Ok(expr) => parsed.push(expr),
                Err(err) => {
                    ctx.error(&meta, &err.to_string());
                    return TemplateToken::String(meta, text);
                }
            }
        }
    }

    if let [Segment::Expression(expression)] = &segments[..] {
        // A whole-value quoted literal collapses to a plain string.
        if let Some(Expr::Literal(Literal::String(s))) = parsed.first() {
            return TemplateToken::String(meta, s.clone());
        }
        return TemplateToken::BasicExpression(meta, expression.clone());
    }

    let mut format = String::new();
    let mut args = Vec::new();
    for segment in &segments {
        match segment {
            Segment::Literal(literal) => format.push_str(
                &literal
                    .replace('\'', "''")
                    .replace('{', "{{")
                    .replace('}', "}}"),
            ),
            Segment::Expression(expression) => {
                format.push_str(&format!("{{{}}}", args.len()));
                args.push(expression.clone());
            }
        }
    }
    TemplateToken::BasicExpression(meta, format!("format('{format}', {})", args.join(", ")))
}

// Split on ${{ … }} markers. Single-quoted strings inside an expression are
// honored so a '}' within quotes does not close it.
fn split_segments(text: &str) -> Result<Vec<Segment>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') && chars.get(i + 2) == Some(&'{') {
            let mut j = i + 3;
            let mut in_string = false;
            loop {
                match chars.get(j) {
                    None => {
                        return Err(format!(
                            "The expression is not closed. An ending '}}}}' was expected: {text}"
                        ))
                    }
                    Some('\'') => {
                        in_string = !in_string;
                        j += 1;
                    }
                    Some('}') if !in_string && chars.get(j + 1) == Some(&'}') => break,
                    Some(_) => j += 1,
                }
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let expression: String = chars[i + 3..j].iter().collect();
            segments.push(Segment::Expression(expression.trim().to_string()));
            i = j + 2;
        } else {
            literal.push(chars[i]);
            i += 1;
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn stamp(meta: TokenMeta, file: Option<u32>) -> TokenMeta {
    TokenMeta {
        file: meta.file.or(file),
        ..meta
    }
}

fn with_file(mut token: TemplateToken, file: Option<u32>) -> TemplateToken {
    if file.is_some() && token.meta().file.is_none() {
        token.meta_mut().file = file;
    }
    token
}
