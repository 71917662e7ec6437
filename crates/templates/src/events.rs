//! The object-event source contract consumed by the template reader, with
//! reference sources over host JSON and YAML trees. Sources are strictly
//! single-pass: each `allow_*` call either matches-and-advances or leaves
//! the source untouched.

use crate::token::{TemplateToken, TokenMeta};

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("Expected the start of the document")]
    ExpectedStart,
    #[error("Expected the end of the document")]
    ExpectedEnd,
    #[error("The object reader is in an unexpected state")]
    UnexpectedState,
    #[error("The document is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("The document is not valid YAML: {0}")]
    InvalidYaml(String),
    #[error("Anchors and aliases are not allowed (Line: {line}, Col: {column})")]
    YamlAnchorNotAllowed { line: usize, column: usize },
}

/// An event source over one document. `validate_start` must be called once
/// first and `validate_end` once last; in between, the reader probes with
/// the `allow_*` operations.
pub trait ObjectSource {
    fn validate_start(&mut self) -> Result<(), SourceError>;
    fn allow_literal(&mut self) -> Result<Option<TemplateToken>, SourceError>;
    fn allow_sequence_start(&mut self) -> Result<Option<TokenMeta>, SourceError>;
    fn allow_sequence_end(&mut self) -> bool;
    fn allow_mapping_start(&mut self) -> Result<Option<TokenMeta>, SourceError>;
    fn allow_mapping_end(&mut self) -> bool;
    fn validate_end(&mut self) -> Result<(), SourceError>;
}

#[derive(Debug)]
enum Cursor {
    Value(serde_json::Value),
    Key(String),
}

#[derive(Debug)]
enum Frame {
    Seq(std::vec::IntoIter<serde_json::Value>),
    Map {
        iter: serde_json::map::IntoIter,
        pending: Option<serde_json::Value>,
    },
}

/// JsonObjectSource drives events from a host JSON tree.
#[derive(Debug)]
pub struct JsonObjectSource {
    file: Option<u32>,
    current: Option<Cursor>,
    stack: Vec<Frame>,
    started: bool,
}

impl JsonObjectSource {
    pub fn new(root: serde_json::Value, file: Option<u32>) -> Self {
        Self {
            file,
            current: Some(Cursor::Value(root)),
            stack: Vec::new(),
            started: false,
        }
    }

    pub fn from_str(text: &str, file: Option<u32>) -> Result<Self, SourceError> {
        let root: serde_json::Value =
            serde_json::from_str(text).map_err(|e| SourceError::InvalidJson(e.to_string()))?;
        Ok(Self::new(root, file))
    }

    fn meta(&self) -> TokenMeta {
        TokenMeta::new(self.file, None, None)
    }

    // Pull the next event position from the innermost open scope. A `None`
    // current with an open scope means the scope's end event is available.
    fn advance(&mut self) {
        self.current = match self.stack.last_mut() {
            None => None,
            Some(Frame::Seq(iter)) => iter.next().map(Cursor::Value),
            Some(Frame::Map { iter, pending }) => {
                if let Some(value) = pending.take() {
                    Some(Cursor::Value(value))
                } else {
                    match iter.next() {
                        Some((key, value)) => {
                            *pending = Some(value);
                            Some(Cursor::Key(key))
                        }
                        None => None,
                    }
                }
            }
        };
    }
}

impl ObjectSource for JsonObjectSource {
    fn validate_start(&mut self) -> Result<(), SourceError> {
        if self.started {
            return Err(SourceError::ExpectedStart);
        }
        self.started = true;
        Ok(())
    }

    fn allow_literal(&mut self) -> Result<Option<TemplateToken>, SourceError> {
        let matched = matches!(
            self.current,
            Some(Cursor::Key(_))
                | Some(Cursor::Value(
                    serde_json::Value::Null
                        | serde_json::Value::Bool(_)
                        | serde_json::Value::Number(_)
                        | serde_json::Value::String(_)
                ))
        );
        if !matched {
            return Ok(None);
        }
        let meta = self.meta();
        let token = match self.current.take() {
            Some(Cursor::Key(key)) => TemplateToken::String(meta, key),
            Some(Cursor::Value(serde_json::Value::Null)) => TemplateToken::Null(meta),
            Some(Cursor::Value(serde_json::Value::Bool(b))) => TemplateToken::Boolean(meta, b),
            Some(Cursor::Value(serde_json::Value::Number(n))) => {
                TemplateToken::Number(meta, n.as_f64().unwrap_or(f64::NAN))
            }
            Some(Cursor::Value(serde_json::Value::String(s))) => TemplateToken::String(meta, s),
            _ => return Err(SourceError::UnexpectedState),
        };
        self.advance();
        Ok(Some(token))
    }

    fn allow_sequence_start(&mut self) -> Result<Option<TokenMeta>, SourceError> {
        if !matches!(
            self.current,
            Some(Cursor::Value(serde_json::Value::Array(_)))
        ) {
            return Ok(None);
        }
        let Some(Cursor::Value(serde_json::Value::Array(items))) = self.current.take() else {
            return Err(SourceError::UnexpectedState);
        };
        self.stack.push(Frame::Seq(items.into_iter()));
        self.advance();
        Ok(Some(self.meta()))
    }

    fn allow_sequence_end(&mut self) -> bool {
        if self.current.is_none() && matches!(self.stack.last(), Some(Frame::Seq(_))) {
            self.stack.pop();
            self.advance();
            return true;
        }
        false
    }

    fn allow_mapping_start(&mut self) -> Result<Option<TokenMeta>, SourceError> {
        if !matches!(
            self.current,
            Some(Cursor::Value(serde_json::Value::Object(_)))
        ) {
            return Ok(None);
        }
        let Some(Cursor::Value(serde_json::Value::Object(map))) = self.current.take() else {
            return Err(SourceError::UnexpectedState);
        };
        self.stack.push(Frame::Map {
            iter: map.into_iter(),
            pending: None,
        });
        self.advance();
        Ok(Some(self.meta()))
    }

    fn allow_mapping_end(&mut self) -> bool {
        if self.current.is_none() && matches!(self.stack.last(), Some(Frame::Map { .. })) {
            self.stack.pop();
            self.advance();
            return true;
        }
        false
    }

    fn validate_end(&mut self) -> Result<(), SourceError> {
        if self.started && self.stack.is_empty() && self.current.is_none() {
            Ok(())
        } else {
            Err(SourceError::ExpectedEnd)
        }
    }
}

/// YamlObjectSource drives events from a host YAML document. Anchors and
/// aliases are rejected before any value tree is built: alias resolution
/// happens inside the YAML parser, outside the byte budget, so a small
/// document with chained anchors could otherwise expand exponentially with
/// zero accounting.
#[derive(Debug)]
pub struct YamlObjectSource {
    inner: JsonObjectSource,
}

impl YamlObjectSource {
    pub fn from_str(text: &str, file: Option<u32>) -> Result<Self, SourceError> {
        reject_anchors(text)?;
        let root: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| SourceError::InvalidYaml(e.to_string()))?;
        Ok(Self {
            inner: JsonObjectSource::new(yaml_to_json(&root), file),
        })
    }
}

// Walk the raw parse events, which carry aliases and anchor ids unresolved,
// and fail on the first one. The scan is linear in the document text, so it
// completes before any expansion could occur.
fn reject_anchors(text: &str) -> Result<(), SourceError> {
    use yaml_rust::parser::{Event, Parser};

    let mut parser = Parser::new(text.chars());
    loop {
        let (event, marker) = parser
            .next()
            .map_err(|e| SourceError::InvalidYaml(e.to_string()))?;
        match event {
            Event::StreamEnd => return Ok(()),
            Event::Alias(_) => {
                return Err(SourceError::YamlAnchorNotAllowed {
                    line: marker.line(),
                    column: marker.col() + 1,
                })
            }
            // Anchor id zero means the node declares no anchor.
            Event::Scalar(_, _, anchor, _)
            | Event::SequenceStart(anchor)
            | Event::MappingStart(anchor)
                if anchor != 0 =>
            {
                return Err(SourceError::YamlAnchorNotAllowed {
                    line: marker.line(),
                    column: marker.col() + 1,
                })
            }
            _ => {}
        }
    }
}

impl ObjectSource for YamlObjectSource {
    fn validate_start(&mut self) -> Result<(), SourceError> {
        self.inner.validate_start()
    }

    fn allow_literal(&mut self) -> Result<Option<TemplateToken>, SourceError> {
        self.inner.allow_literal()
    }

    fn allow_sequence_start(&mut self) -> Result<Option<TokenMeta>, SourceError> {
        self.inner.allow_sequence_start()
    }

    fn allow_sequence_end(&mut self) -> bool {
        self.inner.allow_sequence_end()
    }

    fn allow_mapping_start(&mut self) -> Result<Option<TokenMeta>, SourceError> {
        self.inner.allow_mapping_start()
    }

    fn allow_mapping_end(&mut self) -> bool {
        self.inner.allow_mapping_end()
    }

    fn validate_end(&mut self) -> Result<(), SourceError> {
        self.inner.validate_end()
    }
}

fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if let Some(u) = n.as_u64() {
                u.into()
            } else {
                serde_json::Number::from_f64(n.as_f64().unwrap_or(f64::NAN))
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml::Value::Sequence(items) => {
            serde_json::Value::Array(items.iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                out.insert(yaml_key(key), yaml_to_json(value));
            }
            serde_json::Value::Object(out)
        }
    }
}

// Mapping keys coerce to strings; the reader validates them against the
// schema's key definitions afterwards.
fn yaml_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => {
            expressions::value::number_to_string(n.as_f64().unwrap_or(f64::NAN))
        }
        serde_yaml::Value::String(s) => s.clone(),
        other => yaml_to_json(other).to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(source: &mut dyn ObjectSource) -> Vec<String> {
        let mut events = Vec::new();
        source.validate_start().unwrap();
        loop {
            if let Some(token) = source.allow_literal().unwrap() {
                events.push(format!("lit:{}", token.to_display_string()));
            } else if source.allow_sequence_start().unwrap().is_some() {
                events.push("seq[".to_string());
            } else if source.allow_mapping_start().unwrap().is_some() {
                events.push("map{".to_string());
            } else if source.allow_sequence_end() {
                events.push("]".to_string());
            } else if source.allow_mapping_end() {
                events.push("}".to_string());
            } else {
                break;
            }
        }
        source.validate_end().unwrap();
        events
    }

    #[test]
    fn json_events_in_document_order() {
        let mut source =
            JsonObjectSource::from_str(r#"{"a": [1, true], "b": null}"#, Some(0)).unwrap();
        let events = drain(&mut source);
        assert_eq!(
            events,
            vec!["map{", "lit:a", "seq[", "lit:1", "lit:true", "]", "lit:b", "lit:", "}"]
        );
    }

    #[test]
    fn scalar_root_document() {
        let mut source = JsonObjectSource::from_str("42", None).unwrap();
        source.validate_start().unwrap();
        let token = source.allow_literal().unwrap().unwrap();
        assert_eq!(token.to_display_string(), "42");
        source.validate_end().unwrap();
    }

    #[test]
    fn premature_end_is_rejected() {
        let mut source = JsonObjectSource::from_str("[1]", None).unwrap();
        source.validate_start().unwrap();
        assert!(source.allow_sequence_start().unwrap().is_some());
        assert!(source.validate_end().is_err());
    }

    #[test]
    fn yaml_maps_and_sequences() {
        let text = "steps:\n  - script: build\n  - script: test\ncount: 2\n";
        let mut source = YamlObjectSource::from_str(text, Some(1)).unwrap();
        let events = drain(&mut source);
        assert_eq!(
            events,
            vec![
                "map{", "lit:steps", "seq[", "map{", "lit:script", "lit:build", "}", "map{",
                "lit:script", "lit:test", "}", "]", "lit:count", "lit:2", "}"
            ]
        );
    }

    #[test]
    fn yaml_scalar_keys_coerce_to_strings() {
        let mut source = YamlObjectSource::from_str("1: a\ntrue: b\n", None).unwrap();
        let events = drain(&mut source);
        assert_eq!(events, vec!["map{", "lit:1", "lit:a", "lit:true", "lit:b", "}"]);
    }

    #[test]
    fn yaml_aliases_are_rejected() {
        let err = YamlObjectSource::from_str("a: &shared [1, 2]\nb: *shared\n", None).unwrap_err();
        assert!(matches!(err, SourceError::YamlAnchorNotAllowed { .. }), "{err}");
    }

    #[test]
    fn yaml_anchors_are_rejected_even_unreferenced() {
        let err = YamlObjectSource::from_str("a: &unused 1\n", None).unwrap_err();
        assert!(
            matches!(err, SourceError::YamlAnchorNotAllowed { line: 1, .. }),
            "{err}"
        );

        let err = YamlObjectSource::from_str("a: &m\n  b: 1\n", None).unwrap_err();
        assert!(matches!(err, SourceError::YamlAnchorNotAllowed { .. }), "{err}");
    }

    #[test]
    fn billion_laughs_fails_fast() {
        // Chained anchors would expand to 10^7 nodes if resolved; the scan
        // fails on the first anchor without building anything.
        let mut text = String::from("a: &a [0, 0, 0, 0, 0, 0, 0, 0, 0, 0]\n");
        for (name, prev) in [("b", "a"), ("c", "b"), ("d", "c"), ("e", "d"), ("f", "e"), ("g", "f")]
        {
            text.push_str(&format!(
                "{name}: &{name} [*{prev}, *{prev}, *{prev}, *{prev}, *{prev}, *{prev}, *{prev}, *{prev}, *{prev}, *{prev}]\n"
            ));
        }
        let err = YamlObjectSource::from_str(&text, None).unwrap_err();
        assert!(matches!(err, SourceError::YamlAnchorNotAllowed { .. }), "{err}");
    }

    #[test]
    fn mismatched_end_probes_return_false() {
        let mut source = JsonObjectSource::from_str(r#"{"a": 1}"#, None).unwrap();
        source.validate_start().unwrap();
        assert!(source.allow_mapping_start().unwrap().is_some());
        assert!(!source.allow_sequence_end());
        assert!(!source.allow_mapping_end());
        assert!(source.allow_literal().unwrap().is_some());
    }
}
