//! End-to-end: read a YAML template against a schema, then unravel it with
//! supplied parameters.

use std::rc::Rc;
use std::sync::Arc;

use expressions::value::{ArrayData, ObjectData, Value};
use pretty_assertions::assert_eq;
use templates::{
    evaluate_template, load_schema, read_template, TemplateContext, TemplateSchema, TemplateToken,
    YamlObjectSource,
};

const SCHEMA: &str = r#"
version: pipeline-templates-v1
definitions:
  pipeline:
    mapping:
      properties:
        steps: steps
        variables: variables
  steps:
    context: [parameters]
    sequence:
      item-type: step
  step:
    mapping:
      properties:
        script:
          type: non-empty-string
          required: true
  variables:
    context: [parameters]
    mapping:
      loose-key-type: non-empty-string
      loose-value-type: any
  non-empty-string:
    string:
      require-non-empty: true
"#;

fn schema() -> Arc<TemplateSchema> {
    let mut source = YamlObjectSource::from_str(SCHEMA, None).unwrap();
    Arc::new(load_schema(&mut source).unwrap())
}

fn context() -> TemplateContext {
    let mut extra_steps = ArrayData::new();
    for script in ["lint", "package"] {
        let mut step = ObjectData::new();
        step.insert("script", Value::string(script));
        extra_steps.push(Value::Object(Rc::new(step)));
    }

    let mut extra_vars = ObjectData::new();
    extra_vars.insert("c", Value::Number(3.0));
    extra_vars.insert("a", Value::Number(9.0));

    let mut parameters = ObjectData::new();
    parameters.insert("extra", Value::Array(Rc::new(extra_steps)));
    parameters.insert("vars", Value::Object(Rc::new(extra_vars)));

    let mut ctx = TemplateContext::new(schema());
    ctx.named_values
        .set("parameters", Value::Object(Rc::new(parameters)));
    ctx
}

fn read_and_expand(template: &str) -> (TemplateContext, TemplateToken) {
    let mut ctx = context();
    let file = ctx.add_file("pipeline.yml");
    let mut source = YamlObjectSource::from_str(template, Some(file)).unwrap();
    let token = read_template(&mut ctx, "pipeline", &mut source, Some(file)).unwrap();
    let expanded = evaluate_template(&mut ctx, token).unwrap();
    (ctx, expanded)
}

fn serialized(token: &TemplateToken) -> serde_json::Value {
    // Strip provenance for comparison by round-tripping through the
    // persisted form of an equivalent meta-less tree.
    fn strip(token: &TemplateToken) -> serde_json::Value {
        match token {
            TemplateToken::Null(_) => serde_json::Value::Null,
            TemplateToken::Boolean(_, b) => serde_json::Value::Bool(*b),
            TemplateToken::Number(_, n) => serde_json::json!(n),
            TemplateToken::String(_, s) => serde_json::Value::String(s.clone()),
            TemplateToken::Sequence(_, items) => {
                serde_json::Value::Array(items.iter().map(strip).collect())
            }
            TemplateToken::Mapping(_, pairs) => {
                let mut map = serde_json::Map::new();
                for (key, value) in pairs {
                    map.insert(key.to_display_string(), strip(value));
                }
                serde_json::Value::Object(map)
            }
            other => serde_json::Value::String(other.to_display_string()),
        }
    }
    strip(token)
}

#[test]
fn sequence_insertion_inlines_parameter_steps() {
    let template = "steps:\n  - script: build\n  - ${{ parameters.extra }}\n  - script: test\n";
    let (ctx, expanded) = read_and_expand(template);
    assert!(ctx.errors.is_empty(), "{:?}", ctx.errors.messages());
    assert_eq!(
        serialized(&expanded),
        serde_json::json!({
            "steps": [
                {"script": "build"},
                {"script": "lint"},
                {"script": "package"},
                {"script": "test"},
            ]
        })
    );
}

#[test]
fn mapping_insertion_merges_in_place() {
    let template = "variables:\n  a: 1\n  ${{ insert }}: ${{ parameters.vars }}\n  b: 2\n";
    let (ctx, expanded) = read_and_expand(template);
    assert_eq!(
        serialized(&expanded),
        serde_json::json!({
            "variables": {"a": 1.0, "c": 3.0, "b": 2.0}
        })
    );
    // The duplicate `a` produced by the insertion is reported.
    let messages = ctx.errors.messages();
    assert!(
        messages.iter().any(|m| m.contains("'a' is already defined")),
        "{messages:?}"
    );
}

#[test]
fn full_traversal_restores_the_budget() {
    let template = "steps:\n  - script: build\n  - ${{ parameters.extra }}\n";
    let mut ctx = context();
    let file = ctx.add_file("pipeline.yml");
    let mut source = YamlObjectSource::from_str(template, Some(file)).unwrap();
    let token = read_template(&mut ctx, "pipeline", &mut source, Some(file)).unwrap();

    let bytes_after_read = ctx.memory.bytes.current();
    assert!(bytes_after_read > 0);
    let _ = evaluate_template(&mut ctx, token).unwrap();
    assert_eq!(ctx.memory.bytes.current(), bytes_after_read);
    assert_eq!(ctx.memory.depth.current(), 0);
}

#[test]
fn expanded_tree_serializes_to_persisted_form() {
    let template = "steps:\n  - script: build\n";
    let (_, expanded) = read_and_expand(template);
    let text = serde_json::to_string(&expanded).unwrap();
    let reparsed: TemplateToken = serde_json::from_str(&text).unwrap();
    assert_eq!(serialized(&reparsed), serialized(&expanded));
}
