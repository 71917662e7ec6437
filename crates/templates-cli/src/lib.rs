//! Shared plumbing for the framed stdin/stdout binaries: requests are JSON
//! documents separated by `^---` lines; each response is one JSON object
//! followed by a `---` line.

use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use expressions::{
    evaluate, parse, CollectingTraceWriter, EvaluationOptions, NamedValues, ParseContext,
    TraceWriter, Value,
};
use templates::{
    evaluate_template, load_schema, read_template, TemplateContext, TemplateSchema,
    YamlObjectSource,
};

pub const REQUEST_DELIMITER: &str = "^---";
pub const RESPONSE_DELIMITER: &str = "---";

/// Read framed request documents from |input|, handing each to |handle| and
/// writing its responses to |output|.
pub fn process_stream(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    pretty: bool,
    mut handle: impl FnMut(&str) -> Vec<serde_json::Value>,
) -> std::io::Result<()> {
    let mut document = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        let read = input.read_line(&mut line)?;
        let at_end = read == 0;
        let at_delimiter = line.trim_end_matches(['\r', '\n']) == REQUEST_DELIMITER;
        if at_end || at_delimiter {
            if !document.trim().is_empty() {
                for response in handle(&document) {
                    let rendered = if pretty {
                        serde_json::to_string_pretty(&response)
                    } else {
                        serde_json::to_string(&response)
                    }
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                    writeln!(output, "{rendered}")?;
                    writeln!(output, "{RESPONSE_DELIMITER}")?;
                }
                output.flush()?;
            }
            document.clear();
            if at_end {
                return Ok(());
            }
        } else {
            document.push_str(&line);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionsRequest {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub expressions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub sequence: usize,
    pub log: Vec<String>,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Evaluate each expression of one request against the request's context.
pub fn run_expressions(request: &ExpressionsRequest) -> Vec<ExpressionsResponse> {
    let mut named = NamedValues::new();
    for (name, value) in &request.context {
        named.set(name, Value::from_json(value));
    }
    let parse_context = ParseContext {
        named_contexts: request.context.keys().cloned().collect(),
        functions: Vec::new(),
        allow_unknown: false,
    };

    request
        .expressions
        .iter()
        .enumerate()
        .map(|(sequence, text)| {
            let mut trace = CollectingTraceWriter::new();
            let outcome = parse(text, &parse_context).map_err(|e| {
                (e.to_string(), e.kind.code().to_string())
            });
            let outcome = outcome.and_then(|expr| {
                evaluate(
                    &expr,
                    &mut trace,
                    &named,
                    &[],
                    None,
                    &EvaluationOptions::default(),
                )
                .map(|r| r.value.to_json())
                .map_err(|e| (e.to_string(), e.code().to_string()))
            });
            match outcome {
                Ok(result) => ExpressionsResponse {
                    batch_id: request.batch_id.clone(),
                    sequence,
                    log: trace.lines,
                    result,
                    error_message: None,
                    error_code: None,
                },
                Err((message, code)) => ExpressionsResponse {
                    batch_id: request.batch_id.clone(),
                    sequence,
                    log: trace.lines,
                    result: serde_json::Value::Null,
                    error_message: Some(message),
                    error_code: Some(code),
                },
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatesRequest {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub schema: String,
    #[serde(default)]
    pub templates: Vec<TemplateInput>,
}

#[derive(Debug, Deserialize)]
pub struct TemplateInput {
    #[serde(rename = "type")]
    pub type_name: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatesResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub sequence: usize,
    pub log: Vec<String>,
    pub result: serde_json::Value,
    pub errors: Vec<String>,
}

// A trace writer whose buffer outlives the context that owns it.
#[derive(Debug, Default)]
struct SharedTraceWriter(Rc<RefCell<Vec<String>>>);

impl TraceWriter for SharedTraceWriter {
    fn info(&mut self, message: &str) {
        self.0.borrow_mut().push(message.to_string());
    }

    fn verbose(&mut self, _message: &str) {}

    fn error(&mut self, message: &str) {
        self.0.borrow_mut().push(format!("ERROR: {message}"));
    }
}

/// Read and fully expand each template of one request against the
/// request's schema.
pub fn run_templates(request: &TemplatesRequest) -> Vec<TemplatesResponse> {
    let schema = YamlObjectSource::from_str(&request.schema, None)
        .map_err(|e| e.to_string())
        .and_then(|mut source| load_schema(&mut source).map_err(|e| e.to_string()))
        .map(Arc::new);

    request
        .templates
        .iter()
        .enumerate()
        .map(|(sequence, template)| match &schema {
            Err(schema_error) => TemplatesResponse {
                batch_id: request.batch_id.clone(),
                sequence,
                log: Vec::new(),
                result: serde_json::Value::Null,
                errors: vec![schema_error.clone()],
            },
            Ok(schema) => run_template(request, sequence, template, schema.clone()),
        })
        .collect()
}

fn run_template(
    request: &TemplatesRequest,
    sequence: usize,
    template: &TemplateInput,
    schema: Arc<TemplateSchema>,
) -> TemplatesResponse {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut ctx = TemplateContext::new(schema);
    ctx.trace = Box::new(SharedTraceWriter(log.clone()));
    let file = ctx.add_file(&template.type_name);

    let outcome = match YamlObjectSource::from_str(&template.content, Some(file)) {
        Err(e) => Err(e.to_string()),
        Ok(mut source) => {
            match read_template(&mut ctx, &template.type_name, &mut source, Some(file)) {
                Err(e) => Err(e.to_string()),
                Ok(token) => evaluate_template(&mut ctx, token).map_err(|e| e.to_string()),
            }
        }
    };

    let mut errors = ctx.errors.messages();
    let result = match outcome {
        Ok(expanded) => serde_json::to_value(&expanded).unwrap_or(serde_json::Value::Null),
        Err(fatal) => {
            errors.push(fatal);
            serde_json::Value::Null
        }
    };
    TemplatesResponse {
        batch_id: request.batch_id.clone(),
        sequence,
        log: log.take(),
        result,
        errors,
    }
}

/// Handler adapters used by the binaries: one request document in, JSON
/// response objects out. A malformed request yields a single error object.
pub fn handle_expressions_document(document: &str) -> Vec<serde_json::Value> {
    match serde_json::from_str::<ExpressionsRequest>(document) {
        Ok(request) => run_expressions(&request)
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null))
            .collect(),
        Err(e) => vec![serde_json::json!({
            "errorMessage": format!("The request is not valid: {e}"),
            "errorCode": "invalidRequest",
        })],
    }
}

pub fn handle_templates_document(document: &str) -> Vec<serde_json::Value> {
    match serde_json::from_str::<TemplatesRequest>(document) {
        Ok(request) => run_templates(&request)
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null))
            .collect(),
        Err(e) => vec![serde_json::json!({
            "errorMessage": format!("The request is not valid: {e}"),
            "errorCode": "invalidRequest",
        })],
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn expressions_request(json: serde_json::Value) -> ExpressionsRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn evaluates_each_expression_in_sequence() {
        let request = expressions_request(json!({
            "batchId": "b1",
            "context": {"parameters": {"count": 2}},
            "expressions": ["parameters.count == 2", "format('n={0}', parameters.count)"],
        }));
        let responses = run_expressions(&request);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].batch_id.as_deref(), Some("b1"));
        assert_eq!(responses[0].sequence, 0);
        assert_eq!(responses[0].result, json!(true));
        assert_eq!(responses[1].result, json!("n=2"));
        assert!(responses[0].log.iter().any(|l| l.starts_with("Evaluating:")));
    }

    #[test]
    fn reports_error_codes() {
        let request = expressions_request(json!({
            "context": {},
            "expressions": ["nope.thing"],
        }));
        let responses = run_expressions(&request);
        assert_eq!(responses[0].error_code.as_deref(), Some("unrecognizedNamedValue"));
        assert!(responses[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("Unrecognized named-value: 'nope'"));
    }

    #[test]
    fn templates_request_round_trips() {
        let schema = "definitions:\n  config:\n    mapping:\n      loose-key-type: string\n      loose-value-type: any\n";
        let request: TemplatesRequest = serde_json::from_value(json!({
            "schema": schema,
            "templates": [{"type": "config", "content": "a: 1\nb: two\n"}],
        }))
        .unwrap();
        let responses = run_templates(&request);
        assert_eq!(responses.len(), 1);
        assert!(responses[0].errors.is_empty(), "{:?}", responses[0].errors);
        assert_eq!(responses[0].result["map"][0]["key"]["lit"], json!("a"));
    }

    #[test]
    fn bad_schema_fails_every_template() {
        let request: TemplatesRequest = serde_json::from_value(json!({
            "schema": "definitions:\n  broken:\n    sequence:\n      item-type: missing\n",
            "templates": [
                {"type": "broken", "content": "[]"},
                {"type": "broken", "content": "[]"},
            ],
        }))
        .unwrap();
        let responses = run_templates(&request);
        assert_eq!(responses.len(), 2);
        assert!(!responses[0].errors.is_empty());
        assert_eq!(responses[0].errors, responses[1].errors);
    }

    #[test]
    fn framing_splits_requests_and_frames_responses() {
        let input = "{\"expressions\": [\"1 == 1\"]}\n^---\n{\"expressions\": [\"2 == 2\"]}\n";
        let mut reader = std::io::Cursor::new(input);
        let mut out = Vec::new();
        process_stream(&mut reader, &mut out, false, handle_expressions_document).unwrap();
        let text = String::from_utf8(out).unwrap();
        let frames: Vec<&str> = text.lines().collect();
        // Each response is one line followed by the delimiter.
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1], "---");
        assert_eq!(frames[3], "---");
        let first: serde_json::Value = serde_json::from_str(frames[0]).unwrap();
        assert_eq!(first["result"], json!(true));
    }

    #[test]
    fn malformed_request_reports_invalid_request() {
        let responses = handle_expressions_document("{not json");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["errorCode"], json!("invalidRequest"));
    }
}
