//! Schema definitions: the sum-typed description of what a template may
//! contain at each position, plus the resolution helpers the reader uses to
//! disambiguate one-of mappings.

mod internal;

pub use internal::{internal_schema, load_schema, load_schema_from_token};

use std::collections::BTreeMap;

use expressions::FunctionInfo;

/// The definition name every schema resolves for unconstrained positions.
pub const ANY: &str = "any";

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("Schema definition '{0}' was not found")]
    NotFound(String),
    #[error("Schema definition '{name}' is not valid: {reason}")]
    Invalid { name: String, reason: String },
    #[error("The schema is not valid. {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringDefinition {
    pub constant: Option<String>,
    pub ignore_case: bool,
    pub require_non_empty: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDefinition {
    pub item_type: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDefinition {
    pub type_name: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingDefinition {
    /// Declared properties, in declaration order.
    pub properties: Vec<(String, PropertyDefinition)>,
    pub loose_key_type: Option<String>,
    pub loose_value_type: Option<String>,
}

impl MappingDefinition {
    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, p)| p)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneOfDefinition {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionKind {
    Null,
    Boolean,
    Number,
    String(StringDefinition),
    Sequence(SequenceDefinition),
    Mapping(MappingDefinition),
    OneOf(OneOfDefinition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionType {
    Null,
    Boolean,
    Number,
    String,
    Sequence,
    Mapping,
    OneOf,
}

/// One named definition: its shape plus the named contexts and function
/// signatures embedded expressions may reference at this position, for the
/// reader and the evaluator respectively.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub reader_context: Vec<String>,
    pub evaluator_context: Vec<String>,
    pub kind: DefinitionKind,
}

impl Definition {
    pub fn new(kind: DefinitionKind) -> Self {
        Self {
            reader_context: Vec::new(),
            evaluator_context: Vec::new(),
            kind,
        }
    }

    pub fn with_context(kind: DefinitionKind, context: &[&str]) -> Self {
        Self {
            reader_context: context.iter().map(|c| c.to_string()).collect(),
            evaluator_context: context.iter().map(|c| c.to_string()).collect(),
            kind,
        }
    }

    pub fn definition_type(&self) -> DefinitionType {
        match &self.kind {
            DefinitionKind::Null => DefinitionType::Null,
            DefinitionKind::Boolean => DefinitionType::Boolean,
            DefinitionKind::Number => DefinitionType::Number,
            DefinitionKind::String(_) => DefinitionType::String,
            DefinitionKind::Sequence(_) => DefinitionType::Sequence,
            DefinitionKind::Mapping(_) => DefinitionType::Mapping,
            DefinitionKind::OneOf(_) => DefinitionType::OneOf,
        }
    }

    pub fn as_mapping(&self) -> Option<&MappingDefinition> {
        match &self.kind {
            DefinitionKind::Mapping(m) => Some(m),
            _ => None,
        }
    }
}

/// A validated set of named definitions. Immutable once validated; shared
/// across evaluations.
#[derive(Debug, Default)]
pub struct TemplateSchema {
    pub version: Option<String>,
    definitions: BTreeMap<String, Definition>,
}

impl TemplateSchema {
    /// An empty schema pre-populated with the well-known definitions every
    /// schema may reference: `any` and the unconstrained scalar/sequence/
    /// mapping shapes.
    pub fn new() -> Self {
        let mut schema = Self::default();
        schema.ensure_well_known();
        schema
    }

    fn ensure_well_known(&mut self) {
        let well_known: &[(&str, DefinitionKind)] = &[
            ("null", DefinitionKind::Null),
            ("boolean", DefinitionKind::Boolean),
            ("number", DefinitionKind::Number),
            ("string", DefinitionKind::String(StringDefinition::default())),
            (
                "sequence",
                DefinitionKind::Sequence(SequenceDefinition {
                    item_type: ANY.to_string(),
                }),
            ),
            (
                "mapping",
                DefinitionKind::Mapping(MappingDefinition {
                    properties: Vec::new(),
                    loose_key_type: Some("string".to_string()),
                    loose_value_type: Some(ANY.to_string()),
                }),
            ),
            (
                ANY,
                DefinitionKind::OneOf(OneOfDefinition {
                    names: vec![
                        "null".to_string(),
                        "boolean".to_string(),
                        "number".to_string(),
                        "string".to_string(),
                        "sequence".to_string(),
                        "mapping".to_string(),
                    ],
                }),
            ),
        ];
        for (name, kind) in well_known {
            if !self.definitions.contains_key(*name) {
                self.definitions
                    .insert(name.to_string(), Definition::new(kind.clone()));
            }
        }
    }

    pub fn add_definition(
        &mut self,
        name: impl Into<String>,
        definition: Definition,
    ) -> Result<(), SchemaError> {
        let name = name.into();
        // A user definition may redeclare a well-known name on purpose.
        self.definitions.insert(name, definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Definition, SchemaError> {
        self.definitions
            .get(name)
            .ok_or_else(|| SchemaError::NotFound(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn definition_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    /// The scalar definitions |definition| permits, expanding a one-of one
    /// level deep.
    pub fn scalar_definitions<'s>(&'s self, definition: &'s Definition) -> Vec<&'s Definition> {
        self.expand(definition)
            .into_iter()
            .filter(|d| {
                matches!(
                    d.definition_type(),
                    DefinitionType::Null
                        | DefinitionType::Boolean
                        | DefinitionType::Number
                        | DefinitionType::String
                )
            })
            .collect()
    }

    /// The definitions of |wanted| type that |definition| permits,
    /// expanding a one-of one level deep.
    pub fn definitions_of_type<'s>(
        &'s self,
        definition: &'s Definition,
        wanted: DefinitionType,
    ) -> Vec<&'s Definition> {
        self.expand(definition)
            .into_iter()
            .filter(|d| d.definition_type() == wanted)
            .collect()
    }

    fn expand<'s>(&'s self, definition: &'s Definition) -> Vec<&'s Definition> {
        match &definition.kind {
            DefinitionKind::OneOf(one_of) => one_of
                .names
                .iter()
                .filter_map(|name| self.definitions.get(name))
                .collect(),
            _ => vec![definition],
        }
    }

    /// Validate every definition: reference existence, scalar predicates,
    /// loose pairing, and the one-of disambiguation constraints.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (name, definition) in &self.definitions {
            self.validate_definition(name, definition)?;
        }
        Ok(())
    }

    fn validate_definition(&self, name: &str, definition: &Definition) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::Invalid {
            name: name.to_string(),
            reason,
        };
        for entry in &definition.reader_context {
            if parse_context_entry(entry).is_none() {
                return Err(invalid(format!("context entry '{entry}' is not valid")));
            }
        }
        match &definition.kind {
            DefinitionKind::Null | DefinitionKind::Boolean | DefinitionKind::Number => Ok(()),
            DefinitionKind::String(s) => {
                if s.constant.is_some() && s.require_non_empty {
                    return Err(invalid(
                        "'constant' and 'require-non-empty' are mutually exclusive".to_string(),
                    ));
                }
                Ok(())
            }
            DefinitionKind::Sequence(s) => {
                if !self.has(&s.item_type) {
                    return Err(invalid(format!(
                        "item type '{}' was not found",
                        s.item_type
                    )));
                }
                Ok(())
            }
            DefinitionKind::Mapping(m) => {
                if m.properties.is_empty()
                    && (m.loose_key_type.is_none() || m.loose_value_type.is_none())
                {
                    return Err(invalid(
                        "a mapping requires properties or a loose key and value type".to_string(),
                    ));
                }
                if m.loose_key_type.is_some() != m.loose_value_type.is_some() {
                    return Err(invalid(
                        "'loose-key-type' and 'loose-value-type' must be defined together"
                            .to_string(),
                    ));
                }
                for (property, p) in &m.properties {
                    if !self.has(&p.type_name) {
                        return Err(invalid(format!(
                            "type '{}' of property '{property}' was not found",
                            p.type_name
                        )));
                    }
                }
                for loose in [&m.loose_key_type, &m.loose_value_type].into_iter().flatten() {
                    if !self.has(loose) {
                        return Err(invalid(format!("loose type '{loose}' was not found")));
                    }
                }
                Ok(())
            }
            DefinitionKind::OneOf(one_of) => self.validate_one_of(name, one_of),
        }
    }

    fn validate_one_of(&self, name: &str, one_of: &OneOfDefinition) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::Invalid {
            name: name.to_string(),
            reason,
        };

        let mut nulls = 0;
        let mut booleans = 0;
        let mut numbers = 0;
        let mut sequences = 0;
        let mut unconstrained_strings = 0;
        let mut mappings = Vec::new();
        for (at, referenced) in one_of.names.iter().enumerate() {
            if one_of.names[..at]
                .iter()
                .any(|n| n.eq_ignore_ascii_case(referenced))
            {
                return Err(invalid(format!("'{referenced}' is referenced twice")));
            }
            let definition = self
                .definitions
                .get(referenced)
                .ok_or_else(|| SchemaError::NotFound(referenced.clone()))?;
            if !definition.reader_context.is_empty() {
                return Err(invalid(format!(
                    "'{referenced}' may not define context within a one-of"
                )));
            }
            match &definition.kind {
                DefinitionKind::Null => nulls += 1,
                DefinitionKind::Boolean => booleans += 1,
                DefinitionKind::Number => numbers += 1,
                DefinitionKind::String(s) => {
                    if s.constant.is_none() {
                        unconstrained_strings += 1;
                    }
                }
                DefinitionKind::Sequence(_) => sequences += 1,
                DefinitionKind::Mapping(m) => mappings.push((referenced, m)),
                DefinitionKind::OneOf(_) => {
                    return Err(invalid(format!(
                        "'{referenced}' is a one-of, which may not nest"
                    )))
                }
            }
        }

        for (count, kind) in [
            (nulls, "null"),
            (booleans, "boolean"),
            (numbers, "number"),
            (sequences, "sequence"),
            (unconstrained_strings, "unconstrained string"),
        ] {
            if count > 1 {
                return Err(invalid(format!(
                    "at most one {kind} definition is allowed"
                )));
            }
        }

        if mappings.len() > 1 {
            for (referenced, m) in &mappings {
                if m.loose_key_type.is_some() {
                    return Err(invalid(format!(
                        "mapping '{referenced}' may not declare loose keys alongside other mappings"
                    )));
                }
                if m.properties.is_empty() {
                    return Err(invalid(format!(
                        "mapping '{referenced}' cannot be disambiguated without properties"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// match_property_and_filter resolves an encountered mapping property
/// against the surviving candidate definitions. When any candidate declares
/// the property, candidates that do not declare it are removed and the
/// property's definition is returned.
pub fn match_property_and_filter(
    candidates: &mut Vec<&Definition>,
    property: &str,
) -> Option<PropertyDefinition> {
    let matched = candidates.iter().find_map(|candidate| {
        candidate
            .as_mapping()
            .and_then(|m| m.property(property))
            .cloned()
    })?;
    candidates.retain(|candidate| {
        candidate
            .as_mapping()
            .map(|m| m.property(property).is_some())
            .unwrap_or(false)
    });
    Some(matched)
}

/// A context entry is a named context (`parameters`) or a function
/// signature (`always(0,0)`). Returns the parsed form, or None when the
/// entry is malformed.
pub fn parse_context_entry(entry: &str) -> Option<ContextEntry> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    let Some(open) = entry.find('(') else {
        return Some(ContextEntry::Named(entry.to_string()));
    };
    let name = entry[..open].trim();
    let rest = entry[open + 1..].trim_end();
    let args = rest.strip_suffix(')')?;
    let (min, max) = args.split_once(',')?;
    let min: usize = min.trim().parse().ok()?;
    let max: usize = max.trim().parse().ok()?;
    if name.is_empty() || max < min {
        return None;
    }
    Some(ContextEntry::Function(FunctionInfo::new(name, min, max)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContextEntry {
    Named(String),
    Function(FunctionInfo),
}

/// Split context entries into the named contexts and function signatures a
/// parser needs; malformed entries are skipped (validation reports them).
pub fn split_context(entries: &[String]) -> (Vec<String>, Vec<FunctionInfo>) {
    let mut named = Vec::new();
    let mut functions = Vec::new();
    for entry in entries {
        match parse_context_entry(entry) {
            Some(ContextEntry::Named(name)) => named.push(name),
            Some(ContextEntry::Function(info)) => functions.push(info),
            None => {}
        }
    }
    (named, functions)
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema_with(defs: Vec<(&str, Definition)>) -> TemplateSchema {
        let mut schema = TemplateSchema::new();
        for (name, d) in defs {
            schema.add_definition(name, d).unwrap();
        }
        schema
    }

    #[test]
    fn well_known_definitions_exist() {
        let schema = TemplateSchema::new();
        schema.validate().unwrap();
        for name in ["any", "null", "boolean", "number", "string", "sequence", "mapping"] {
            assert!(schema.has(name), "missing '{name}'");
        }
    }

    #[test]
    fn sequence_item_type_must_exist() {
        let schema = schema_with(vec![(
            "steps",
            Definition::new(DefinitionKind::Sequence(SequenceDefinition {
                item_type: "step".to_string(),
            })),
        )]);
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::Invalid { name, .. }) if name == "steps"
        ));
    }

    #[test]
    fn string_constant_excludes_non_empty() {
        let schema = schema_with(vec![(
            "flag",
            Definition::new(DefinitionKind::String(StringDefinition {
                constant: Some("on".to_string()),
                ignore_case: false,
                require_non_empty: true,
            })),
        )]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn loose_key_and_value_pair_up() {
        let schema = schema_with(vec![(
            "vars",
            Definition::new(DefinitionKind::Mapping(MappingDefinition {
                properties: Vec::new(),
                loose_key_type: Some("string".to_string()),
                loose_value_type: None,
            })),
        )]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn one_of_rejects_ambiguous_members() {
        let schema = schema_with(vec![
            ("a", Definition::new(DefinitionKind::Boolean)),
            ("b", Definition::new(DefinitionKind::Boolean)),
            (
                "either",
                Definition::new(DefinitionKind::OneOf(OneOfDefinition {
                    names: vec!["a".to_string(), "b".to_string()],
                })),
            ),
        ]);
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::Invalid { name, .. }) if name == "either"
        ));
    }

    #[test]
    fn match_property_filters_candidates() {
        let script = Definition::new(DefinitionKind::Mapping(MappingDefinition {
            properties: vec![(
                "script".to_string(),
                PropertyDefinition {
                    type_name: "string".to_string(),
                    required: true,
                },
            )],
            ..Default::default()
        }));
        let task = Definition::new(DefinitionKind::Mapping(MappingDefinition {
            properties: vec![(
                "task".to_string(),
                PropertyDefinition {
                    type_name: "string".to_string(),
                    required: true,
                },
            )],
            ..Default::default()
        }));
        let mut candidates = vec![&script, &task];
        let matched = match_property_and_filter(&mut candidates, "SCRIPT").unwrap();
        assert_eq!(matched.type_name, "string");
        assert_eq!(candidates.len(), 1);

        let mut candidates = vec![&script, &task];
        assert!(match_property_and_filter(&mut candidates, "other").is_none());
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn context_entries_parse() {
        assert_eq!(
            parse_context_entry("parameters"),
            Some(ContextEntry::Named("parameters".to_string()))
        );
        assert_eq!(
            parse_context_entry("always(0, 2)"),
            Some(ContextEntry::Function(FunctionInfo::new("always", 0, 2)))
        );
        assert_eq!(parse_context_entry("bad("), None);
        assert_eq!(parse_context_entry(""), None);
    }
}
