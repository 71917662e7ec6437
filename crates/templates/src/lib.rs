//! Schema-validated workflow templates: an event-driven reader that parses
//! `${{ … }}` expressions into a typed token tree while validating against
//! a user-defined schema, and a cursor-driven unraveler that lazily expands
//! expressions and `${{ insert }}` directives as the tree is walked. All
//! construction and traversal is charged against a shared byte and depth
//! budget so untrusted templates cannot amplify.

pub mod context;
pub mod errors;
pub mod events;
pub mod reader;
pub mod schema;
pub mod token;
pub mod unravel;

pub use context::{TemplateContext, TemplateMemory};
pub use errors::{TemplateError, TemplateValidationError, TemplateValidationErrors};
pub use events::{JsonObjectSource, ObjectSource, SourceError, YamlObjectSource};
pub use reader::read_template;
pub use schema::{internal_schema, load_schema, SchemaError, TemplateSchema};
pub use token::{TemplateToken, TokenMeta};
pub use unravel::{evaluate_template, Unraveler};
