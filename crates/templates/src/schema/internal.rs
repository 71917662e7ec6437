//! The self-describing internal schema: a hard-coded schema for schemas,
//! built programmatically once per process and used to read user schemas
//! through the ordinary template reader.

use std::sync::Arc;

use crate::context::TemplateContext;
use crate::events::ObjectSource;
use crate::reader::read_template;
use crate::token::TemplateToken;

use super::{
    Definition, DefinitionKind, MappingDefinition, OneOfDefinition, PropertyDefinition,
    SchemaError, SequenceDefinition, StringDefinition, TemplateSchema,
};

lazy_static::lazy_static! {
    static ref INTERNAL: Arc<TemplateSchema> = Arc::new(build_internal());
}

/// The process-wide internal schema. Immutable after first use.
pub fn internal_schema() -> Arc<TemplateSchema> {
    INTERNAL.clone()
}

/// Read a user schema from an event source, validating it against the
/// internal schema, and construct the definition objects. Malformed schemas
/// raise immediately.
pub fn load_schema(source: &mut dyn ObjectSource) -> Result<TemplateSchema, SchemaError> {
    let mut ctx = TemplateContext::new(internal_schema());
    let token = read_template(&mut ctx, "template-schema", source, None)
        .map_err(|e| SchemaError::Malformed(e.to_string()))?;
    if !ctx.errors.is_empty() {
        return Err(SchemaError::Malformed(ctx.errors.messages().join(",")));
    }
    load_schema_from_token(&token)
}

/// Construct a schema from an already-read token tree and validate it.
pub fn load_schema_from_token(token: &TemplateToken) -> Result<TemplateSchema, SchemaError> {
    let TemplateToken::Mapping(_, pairs) = token else {
        return Err(SchemaError::Malformed(
            "the schema root must be a mapping".to_string(),
        ));
    };
    let mut schema = TemplateSchema::new();
    for (key, value) in pairs {
        let key = key.to_display_string();
        if key.eq_ignore_ascii_case("version") {
            schema.version = Some(expect_string(value)?);
        } else if key.eq_ignore_ascii_case("definitions") {
            let TemplateToken::Mapping(_, definitions) = value else {
                return Err(SchemaError::Malformed(
                    "'definitions' must be a mapping".to_string(),
                ));
            };
            for (name, definition) in definitions {
                schema.add_definition(
                    name.to_display_string(),
                    convert_definition(&name.to_display_string(), definition)?,
                )?;
            }
        }
    }
    tracing::debug!(
        definitions = schema.definition_names().count(),
        "loaded template schema"
    );
    schema.validate()?;
    Ok(schema)
}

fn convert_definition(name: &str, token: &TemplateToken) -> Result<Definition, SchemaError> {
    let malformed = |reason: String| SchemaError::Malformed(format!("definition '{name}': {reason}"));
    let TemplateToken::Mapping(_, pairs) = token else {
        return Err(malformed("a definition must be a mapping".to_string()));
    };

    let mut context = Vec::new();
    let mut kind: Option<DefinitionKind> = None;
    for (key, value) in pairs {
        let key = key.to_display_string();
        let lower = key.to_lowercase();
        match lower.as_str() {
            "context" => context = expect_string_sequence(value)?,
            "null" => kind = Some(DefinitionKind::Null),
            "boolean" => kind = Some(DefinitionKind::Boolean),
            "number" => kind = Some(DefinitionKind::Number),
            "string" => kind = Some(DefinitionKind::String(convert_string_definition(value)?)),
            "sequence" => {
                kind = Some(DefinitionKind::Sequence(convert_sequence_definition(
                    name, value,
                )?))
            }
            "mapping" => {
                kind = Some(DefinitionKind::Mapping(convert_mapping_definition(value)?))
            }
            "one-of" => {
                kind = Some(DefinitionKind::OneOf(OneOfDefinition {
                    names: expect_string_sequence(value)?,
                }))
            }
            _ => {}
        }
    }

    let kind = kind.ok_or_else(|| malformed("a definition must declare its type".to_string()))?;
    Ok(Definition {
        reader_context: context.clone(),
        evaluator_context: context,
        kind,
    })
}

fn convert_string_definition(token: &TemplateToken) -> Result<StringDefinition, SchemaError> {
    let TemplateToken::Mapping(_, pairs) = token else {
        // A bare `string:` with no properties.
        return Ok(StringDefinition::default());
    };
    let mut out = StringDefinition::default();
    for (key, value) in pairs {
        let key = key.to_display_string().to_lowercase();
        match key.as_str() {
            "constant" => out.constant = Some(expect_string(value)?),
            "ignore-case" => out.ignore_case = expect_bool(value)?,
            "require-non-empty" => out.require_non_empty = expect_bool(value)?,
            _ => {}
        }
    }
    Ok(out)
}

fn convert_sequence_definition(
    name: &str,
    token: &TemplateToken,
) -> Result<SequenceDefinition, SchemaError> {
    let TemplateToken::Mapping(_, pairs) = token else {
        return Err(SchemaError::Malformed(format!(
            "definition '{name}': 'sequence' must be a mapping"
        )));
    };
    for (key, value) in pairs {
        if key.to_display_string().eq_ignore_ascii_case("item-type") {
            return Ok(SequenceDefinition {
                item_type: expect_string(value)?,
            });
        }
    }
    Err(SchemaError::Malformed(format!(
        "definition '{name}': 'sequence' requires 'item-type'"
    )))
}

fn convert_mapping_definition(token: &TemplateToken) -> Result<MappingDefinition, SchemaError> {
    let TemplateToken::Mapping(_, pairs) = token else {
        return Ok(MappingDefinition::default());
    };
    let mut out = MappingDefinition::default();
    for (key, value) in pairs {
        let key = key.to_display_string().to_lowercase();
        match key.as_str() {
            "properties" => {
                let TemplateToken::Mapping(_, properties) = value else {
                    return Err(SchemaError::Malformed(
                        "'properties' must be a mapping".to_string(),
                    ));
                };
                for (property, spec) in properties {
                    out.properties
                        .push((property.to_display_string(), convert_property(spec)?));
                }
            }
            "loose-key-type" => out.loose_key_type = Some(expect_string(value)?),
            "loose-value-type" => out.loose_value_type = Some(expect_string(value)?),
            _ => {}
        }
    }
    Ok(out)
}

fn convert_property(token: &TemplateToken) -> Result<PropertyDefinition, SchemaError> {
    match token {
        TemplateToken::String(_, type_name) => Ok(PropertyDefinition {
            type_name: type_name.clone(),
            required: false,
        }),
        TemplateToken::Mapping(_, pairs) => {
            let mut out = PropertyDefinition::default();
            for (key, value) in pairs {
                let key = key.to_display_string().to_lowercase();
                match key.as_str() {
                    "type" => out.type_name = expect_string(value)?,
                    "required" => out.required = expect_bool(value)?,
                    _ => {}
                }
            }
            if out.type_name.is_empty() {
                return Err(SchemaError::Malformed(
                    "a property requires a 'type'".to_string(),
                ));
            }
            Ok(out)
        }
        other => Err(SchemaError::Malformed(format!(
            "unexpected property value '{}'",
            other.to_display_string()
        ))),
    }
}

fn expect_string(token: &TemplateToken) -> Result<String, SchemaError> {
    match token {
        TemplateToken::String(_, s) => Ok(s.clone()),
        other => Err(SchemaError::Malformed(format!(
            "expected a string, found '{}'",
            other.to_display_string()
        ))),
    }
}

fn expect_bool(token: &TemplateToken) -> Result<bool, SchemaError> {
    match token {
        TemplateToken::Boolean(_, b) => Ok(*b),
        other => Err(SchemaError::Malformed(format!(
            "expected a boolean, found '{}'",
            other.to_display_string()
        ))),
    }
}

fn expect_string_sequence(token: &TemplateToken) -> Result<Vec<String>, SchemaError> {
    let TemplateToken::Sequence(_, items) = token else {
        return Err(SchemaError::Malformed(format!(
            "expected a sequence of strings, found '{}'",
            token.to_display_string()
        )));
    };
    items.iter().map(expect_string).collect()
}

// The internal schema's definitions. Property tuples are
// (name, type, required).
fn build_internal() -> TemplateSchema {
    let mut schema = TemplateSchema::default();
    schema.version = Some("internal-schema".to_string());

    let defs: Vec<(&str, DefinitionKind)> = vec![
        (
            "template-schema",
            mapping(&[
                ("version", "non-empty-string", false),
                ("definitions", "definitions", false),
            ]),
        ),
        (
            "definitions",
            loose_mapping("non-empty-string", "definition"),
        ),
        (
            "definition",
            one_of(&[
                "null-definition",
                "boolean-definition",
                "number-definition",
                "string-definition",
                "sequence-definition",
                "mapping-definition",
                "one-of-definition",
            ]),
        ),
        (
            "null-definition",
            mapping(&[
                ("context", "sequence-of-non-empty-string", false),
                ("null", "definition-properties", true),
            ]),
        ),
        (
            "boolean-definition",
            mapping(&[
                ("context", "sequence-of-non-empty-string", false),
                ("boolean", "definition-properties", true),
            ]),
        ),
        (
            "number-definition",
            mapping(&[
                ("context", "sequence-of-non-empty-string", false),
                ("number", "definition-properties", true),
            ]),
        ),
        (
            "string-definition",
            mapping(&[
                ("context", "sequence-of-non-empty-string", false),
                ("string", "string-definition-properties", true),
            ]),
        ),
        (
            "string-definition-properties",
            mapping(&[
                ("constant", "non-empty-string", false),
                ("ignore-case", "boolean", false),
                ("require-non-empty", "boolean", false),
                ("description", "string", false),
            ]),
        ),
        (
            "definition-properties",
            mapping(&[("description", "string", false)]),
        ),
        (
            "sequence-definition",
            mapping(&[
                ("context", "sequence-of-non-empty-string", false),
                ("sequence", "sequence-definition-properties", true),
            ]),
        ),
        (
            "sequence-definition-properties",
            mapping(&[
                ("item-type", "non-empty-string", true),
                ("description", "string", false),
            ]),
        ),
        (
            "mapping-definition",
            mapping(&[
                ("context", "sequence-of-non-empty-string", false),
                ("mapping", "mapping-definition-properties", true),
            ]),
        ),
        (
            "mapping-definition-properties",
            mapping(&[
                ("properties", "properties", false),
                ("loose-key-type", "non-empty-string", false),
                ("loose-value-type", "non-empty-string", false),
                ("description", "string", false),
            ]),
        ),
        ("properties", loose_mapping("non-empty-string", "property-value")),
        (
            "property-value",
            one_of(&["non-empty-string", "property-value-mapping"]),
        ),
        (
            "property-value-mapping",
            mapping(&[
                ("type", "non-empty-string", true),
                ("required", "boolean", false),
            ]),
        ),
        (
            "one-of-definition",
            mapping(&[
                ("context", "sequence-of-non-empty-string", false),
                ("one-of", "sequence-of-non-empty-string", true),
            ]),
        ),
        (
            "sequence-of-non-empty-string",
            DefinitionKind::Sequence(SequenceDefinition {
                item_type: "non-empty-string".to_string(),
            }),
        ),
        (
            "non-empty-string",
            DefinitionKind::String(StringDefinition {
                constant: None,
                ignore_case: false,
                require_non_empty: true,
            }),
        ),
    ];

    for (name, kind) in defs {
        schema
            .add_definition(name, Definition::new(kind))
            .expect("internal definitions are distinct");
    }
    // The well-known basics ("string", "boolean", "any", …) that internal
    // definitions reference.
    schema.ensure_well_known();

    // The internal schema must satisfy its own validation rules.
    schema
        .validate()
        .expect("the internal schema validates against its own rules");
    schema
}

fn mapping(properties: &[(&str, &str, bool)]) -> DefinitionKind {
    DefinitionKind::Mapping(MappingDefinition {
        properties: properties
            .iter()
            .map(|(name, type_name, required)| {
                (
                    name.to_string(),
                    PropertyDefinition {
                        type_name: type_name.to_string(),
                        required: *required,
                    },
                )
            })
            .collect(),
        loose_key_type: None,
        loose_value_type: None,
    })
}

fn loose_mapping(key: &str, value: &str) -> DefinitionKind {
    DefinitionKind::Mapping(MappingDefinition {
        properties: Vec::new(),
        loose_key_type: Some(key.to_string()),
        loose_value_type: Some(value.to_string()),
    })
}

fn one_of(names: &[&str]) -> DefinitionKind {
    DefinitionKind::OneOf(OneOfDefinition {
        names: names.iter().map(|n| n.to_string()).collect(),
    })
}
