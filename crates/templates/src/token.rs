//! The template token tree: the typed form a template takes between reading
//! and unraveling. Tokens are tree-shaped (no sharing, no cycles), carry
//! optional source provenance, and serialize to a compact integer-tagged
//! JSON layout.

use std::rc::Rc;

use expressions::budget::{string_bytes, MIN_OBJECT_SIZE};
use expressions::value::{number_to_string, ArrayData, ObjectData, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const STRING_TYPE: u64 = 0;
pub const SEQUENCE_TYPE: u64 = 1;
pub const MAPPING_TYPE: u64 = 2;
pub const BASIC_EXPRESSION_TYPE: u64 = 3;
pub const INSERT_EXPRESSION_TYPE: u64 = 4;
pub const BOOLEAN_TYPE: u64 = 5;
pub const NUMBER_TYPE: u64 = 6;
pub const NULL_TYPE: u64 = 7;

/// Source provenance: which file (by table id) and position a token came
/// from. Any of the three parts may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMeta {
    pub file: Option<u32>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl TokenMeta {
    pub fn new(file: Option<u32>, line: Option<u32>, column: Option<u32>) -> Self {
        Self { file, line, column }
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.line.is_none() && self.column.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateToken {
    Null(TokenMeta),
    Boolean(TokenMeta, bool),
    Number(TokenMeta, f64),
    String(TokenMeta, String),
    Sequence(TokenMeta, Vec<TemplateToken>),
    Mapping(TokenMeta, Vec<(TemplateToken, TemplateToken)>),
    /// The raw text between `${{` and `}}`.
    BasicExpression(TokenMeta, String),
    /// The `${{ insert }}` directive, valid only as a mapping key.
    InsertExpression(TokenMeta),
}

impl TemplateToken {
    pub fn meta(&self) -> &TokenMeta {
        match self {
            TemplateToken::Null(m)
            | TemplateToken::Boolean(m, _)
            | TemplateToken::Number(m, _)
            | TemplateToken::String(m, _)
            | TemplateToken::Sequence(m, _)
            | TemplateToken::Mapping(m, _)
            | TemplateToken::BasicExpression(m, _)
            | TemplateToken::InsertExpression(m) => m,
        }
    }

    pub fn meta_mut(&mut self) -> &mut TokenMeta {
        match self {
            TemplateToken::Null(m)
            | TemplateToken::Boolean(m, _)
            | TemplateToken::Number(m, _)
            | TemplateToken::String(m, _)
            | TemplateToken::Sequence(m, _)
            | TemplateToken::Mapping(m, _)
            | TemplateToken::BasicExpression(m, _)
            | TemplateToken::InsertExpression(m) => m,
        }
    }

    pub fn type_code(&self) -> u64 {
        match self {
            TemplateToken::Null(_) => NULL_TYPE,
            TemplateToken::Boolean(..) => BOOLEAN_TYPE,
            TemplateToken::Number(..) => NUMBER_TYPE,
            TemplateToken::String(..) => STRING_TYPE,
            TemplateToken::Sequence(..) => SEQUENCE_TYPE,
            TemplateToken::Mapping(..) => MAPPING_TYPE,
            TemplateToken::BasicExpression(..) => BASIC_EXPRESSION_TYPE,
            TemplateToken::InsertExpression(_) => INSERT_EXPRESSION_TYPE,
        }
    }

    /// Literal and expression leaves; everything that is not a sequence or
    /// mapping.
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            TemplateToken::Sequence(..) | TemplateToken::Mapping(..)
        )
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            TemplateToken::Null(_)
                | TemplateToken::Boolean(..)
                | TemplateToken::Number(..)
                | TemplateToken::String(..)
        )
    }

    pub fn is_expression(&self) -> bool {
        matches!(
            self,
            TemplateToken::BasicExpression(..) | TemplateToken::InsertExpression(_)
        )
    }

    /// The user-facing form used in diagnostics.
    pub fn to_display_string(&self) -> String {
        match self {
            TemplateToken::Null(_) => String::new(),
            TemplateToken::Boolean(_, b) => b.to_string(),
            TemplateToken::Number(_, n) => number_to_string(*n),
            TemplateToken::String(_, s) => s.clone(),
            TemplateToken::Sequence(..) => "Sequence".to_string(),
            TemplateToken::Mapping(..) => "Mapping".to_string(),
            TemplateToken::BasicExpression(_, expr) => format!("${{{{ {expr} }}}}"),
            TemplateToken::InsertExpression(_) => "${{ insert }}".to_string(),
        }
    }

    /// Head cost: the string approximation for text-bearing leaves, the
    /// flat aggregate cost for everything else.
    pub fn shallow_bytes(&self) -> usize {
        match self {
            TemplateToken::String(_, s) | TemplateToken::BasicExpression(_, s) => string_bytes(s),
            _ => MIN_OBJECT_SIZE,
        }
    }

    /// Full cost of the token and everything beneath it.
    pub fn deep_bytes(&self) -> usize {
        match self {
            TemplateToken::Sequence(_, items) => {
                MIN_OBJECT_SIZE + items.iter().map(TemplateToken::deep_bytes).sum::<usize>()
            }
            TemplateToken::Mapping(_, pairs) => {
                MIN_OBJECT_SIZE
                    + pairs
                        .iter()
                        .map(|(k, v)| k.deep_bytes() + v.deep_bytes())
                        .sum::<usize>()
            }
            other => other.shallow_bytes(),
        }
    }

    /// Deep conversion into the evaluator's canonical value form. Mapping
    /// keys and unexpanded expressions convert via their display strings.
    pub fn to_value(&self) -> Value {
        match self {
            TemplateToken::Null(_) => Value::Null,
            TemplateToken::Boolean(_, b) => Value::Boolean(*b),
            TemplateToken::Number(_, n) => Value::Number(*n),
            TemplateToken::String(_, s) => Value::string(s),
            TemplateToken::Sequence(_, items) => {
                let mut array = ArrayData::new();
                for item in items {
                    array.push(item.to_value());
                }
                Value::Array(Rc::new(array))
            }
            TemplateToken::Mapping(_, pairs) => {
                let mut object = ObjectData::new();
                for (key, value) in pairs {
                    object.insert(&key.to_display_string(), value.to_value());
                }
                Value::Object(Rc::new(object))
            }
            TemplateToken::BasicExpression(..) | TemplateToken::InsertExpression(_) => {
                Value::string(self.to_display_string())
            }
        }
    }

    /// Deep conversion of an expression result re-entering the tree. The
    /// expression's provenance is stamped onto every produced token.
    pub fn from_value(value: &Value, meta: &TokenMeta) -> TemplateToken {
        match value {
            Value::Null => TemplateToken::Null(meta.clone()),
            Value::Boolean(b) => TemplateToken::Boolean(meta.clone(), *b),
            Value::Number(n) => TemplateToken::Number(meta.clone(), *n),
            Value::String(s) => TemplateToken::String(meta.clone(), s.to_string()),
            Value::Array(arr) => {
                let items = (0..arr.len())
                    .map(|i| Self::from_value(&arr.item(i).unwrap_or(Value::Null), meta))
                    .collect();
                TemplateToken::Sequence(meta.clone(), items)
            }
            Value::Object(obj) => {
                let pairs = obj
                    .keys()
                    .into_iter()
                    .map(|key| {
                        let value = obj.item(&key).unwrap_or(Value::Null);
                        (
                            TemplateToken::String(meta.clone(), key.to_string()),
                            Self::from_value(&value, meta),
                        )
                    })
                    .collect();
                TemplateToken::Mapping(meta.clone(), pairs)
            }
        }
    }

    /// The persisted JSON form: scalars without provenance are bare JSON
    /// primitives; everything else is an object with an integer `type`,
    /// optional `file`/`line`/`col`, and a payload field.
    pub fn to_serialized(&self) -> serde_json::Value {
        let meta = self.meta();
        if meta.is_empty() {
            match self {
                TemplateToken::Null(_) => return serde_json::Value::Null,
                TemplateToken::Boolean(_, b) => return serde_json::Value::Bool(*b),
                TemplateToken::Number(_, n) => {
                    return serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
                TemplateToken::String(_, s) => return serde_json::Value::String(s.clone()),
                _ => {}
            }
        }

        let mut map = serde_json::Map::new();
        map.insert("type".to_string(), self.type_code().into());
        if let Some(file) = meta.file {
            map.insert("file".to_string(), file.into());
        }
        if let Some(line) = meta.line {
            map.insert("line".to_string(), line.into());
        }
        if let Some(column) = meta.column {
            map.insert("col".to_string(), column.into());
        }
        match self {
            TemplateToken::Null(_) | TemplateToken::InsertExpression(_) => {}
            TemplateToken::Boolean(_, b) => {
                map.insert("bool".to_string(), (*b).into());
            }
            TemplateToken::Number(_, n) => {
                map.insert(
                    "num".to_string(),
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null),
                );
            }
            TemplateToken::String(_, s) => {
                map.insert("lit".to_string(), s.clone().into());
            }
            TemplateToken::Sequence(_, items) => {
                let items: Vec<serde_json::Value> =
                    items.iter().map(TemplateToken::to_serialized).collect();
                map.insert("seq".to_string(), items.into());
            }
            TemplateToken::Mapping(_, pairs) => {
                let pairs: Vec<serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| {
                        let mut pair = serde_json::Map::new();
                        pair.insert("key".to_string(), k.to_serialized());
                        pair.insert("value".to_string(), v.to_serialized());
                        serde_json::Value::Object(pair)
                    })
                    .collect();
                map.insert("map".to_string(), pairs.into());
            }
            TemplateToken::BasicExpression(_, expr) => {
                map.insert("expr".to_string(), expr.clone().into());
            }
        }
        serde_json::Value::Object(map)
    }

    /// Parse the persisted JSON form back into a token.
    pub fn from_serialized(json: &serde_json::Value) -> Result<TemplateToken, String> {
        let map = match json {
            serde_json::Value::Null => return Ok(TemplateToken::Null(TokenMeta::default())),
            serde_json::Value::Bool(b) => {
                return Ok(TemplateToken::Boolean(TokenMeta::default(), *b))
            }
            serde_json::Value::Number(n) => {
                return Ok(TemplateToken::Number(
                    TokenMeta::default(),
                    n.as_f64().unwrap_or(f64::NAN),
                ))
            }
            serde_json::Value::String(s) => {
                return Ok(TemplateToken::String(TokenMeta::default(), s.clone()))
            }
            serde_json::Value::Object(map) => map,
            serde_json::Value::Array(_) => {
                return Err("a serialized token cannot be a bare array".to_string())
            }
        };

        let type_code = map
            .get("type")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| "a serialized token requires an integer 'type'".to_string())?;
        let meta = TokenMeta::new(
            map.get("file").and_then(serde_json::Value::as_u64).map(|v| v as u32),
            map.get("line").and_then(serde_json::Value::as_u64).map(|v| v as u32),
            map.get("col").and_then(serde_json::Value::as_u64).map(|v| v as u32),
        );

        match type_code {
            NULL_TYPE => Ok(TemplateToken::Null(meta)),
            BOOLEAN_TYPE => {
                let b = map
                    .get("bool")
                    .and_then(serde_json::Value::as_bool)
                    .ok_or_else(|| "a boolean token requires 'bool'".to_string())?;
                Ok(TemplateToken::Boolean(meta, b))
            }
            NUMBER_TYPE => {
                let n = map
                    .get("num")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(f64::NAN);
                Ok(TemplateToken::Number(meta, n))
            }
            STRING_TYPE => {
                let s = map
                    .get("lit")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "a string token requires 'lit'".to_string())?;
                Ok(TemplateToken::String(meta, s.to_string()))
            }
            SEQUENCE_TYPE => {
                let items = map
                    .get("seq")
                    .and_then(serde_json::Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                    .iter()
                    .map(TemplateToken::from_serialized)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TemplateToken::Sequence(meta, items))
            }
            MAPPING_TYPE => {
                let mut pairs = Vec::new();
                for entry in map
                    .get("map")
                    .and_then(serde_json::Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                {
                    let entry = entry
                        .as_object()
                        .ok_or_else(|| "a mapping entry must be an object".to_string())?;
                    let key = entry
                        .get("key")
                        .ok_or_else(|| "a mapping entry requires 'key'".to_string())?;
                    let value = entry
                        .get("value")
                        .ok_or_else(|| "a mapping entry requires 'value'".to_string())?;
                    pairs.push((
                        TemplateToken::from_serialized(key)?,
                        TemplateToken::from_serialized(value)?,
                    ));
                }
                Ok(TemplateToken::Mapping(meta, pairs))
            }
            BASIC_EXPRESSION_TYPE => {
                let expr = map
                    .get("expr")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "an expression token requires 'expr'".to_string())?;
                Ok(TemplateToken::BasicExpression(meta, expr.to_string()))
            }
            INSERT_EXPRESSION_TYPE => Ok(TemplateToken::InsertExpression(meta)),
            other => Err(format!("unknown token type {other}")),
        }
    }
}

impl Serialize for TemplateToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_serialized().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TemplateToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        TemplateToken::from_serialized(&json).map_err(serde::de::Error::custom)
    }
}
