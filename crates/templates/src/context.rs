//! TemplateContext: everything one read/unravel operation carries — the
//! schema, the validation-error collector, the shared byte/depth budget,
//! named values for expression expansion, a trace writer, and the file
//! table used to prefix diagnostics.

use std::sync::Arc;

use expressions::budget::BudgetError;
use expressions::{ByteCounter, DepthGuard, NamedValues, NoopTraceWriter, TraceWriter};

use crate::errors::TemplateValidationErrors;
use crate::schema::TemplateSchema;
use crate::token::{TemplateToken, TokenMeta};

/// The single byte/depth budget shared by the reader, the evaluator and the
/// unraveler. Double-accounting is avoided by charging a token deeply only
/// when a new subtree enters the system (an expression result), and
/// shallowly when walking into an already-accounted token.
#[derive(Debug)]
pub struct TemplateMemory {
    pub bytes: ByteCounter,
    pub depth: DepthGuard,
}

impl TemplateMemory {
    pub fn new(max_bytes: usize, max_depth: usize) -> Self {
        Self {
            bytes: ByteCounter::new(max_bytes),
            depth: DepthGuard::new(max_depth),
        }
    }

    pub fn add_token(&mut self, token: &TemplateToken, deep: bool) -> Result<(), BudgetError> {
        self.bytes.add(if deep {
            token.deep_bytes()
        } else {
            token.shallow_bytes()
        })
    }

    pub fn subtract_token(&mut self, token: &TemplateToken, deep: bool) {
        self.bytes.subtract(if deep {
            token.deep_bytes()
        } else {
            token.shallow_bytes()
        });
    }
}

pub struct TemplateContext {
    pub schema: Arc<TemplateSchema>,
    pub errors: TemplateValidationErrors,
    pub memory: TemplateMemory,
    /// Named contexts available to `${{ … }}` expressions during unravel.
    pub named_values: NamedValues,
    pub trace: Box<dyn TraceWriter>,
    files: Vec<String>,
}

impl TemplateContext {
    pub fn new(schema: Arc<TemplateSchema>) -> Self {
        Self {
            schema,
            errors: TemplateValidationErrors::new(),
            memory: TemplateMemory::new(0, 0),
            named_values: NamedValues::new(),
            trace: Box::new(NoopTraceWriter),
            files: Vec::new(),
        }
    }

    /// Register a file name, returning its table id. Re-registering the
    /// same name (case-insensitively) returns the existing id.
    pub fn add_file(&mut self, name: &str) -> u32 {
        if let Some(at) = self
            .files
            .iter()
            .position(|f| f.eq_ignore_ascii_case(name))
        {
            return at as u32;
        }
        self.files.push(name.to_string());
        (self.files.len() - 1) as u32
    }

    pub fn file_name(&self, id: u32) -> Option<&str> {
        self.files.get(id as usize).map(String::as_str)
    }

    /// Record a recoverable diagnostic, prefixed with source provenance
    /// when the token carries it.
    pub fn error(&mut self, meta: &TokenMeta, message: &str) {
        let prefixed = self.prefix(meta, message);
        self.errors.add(prefixed);
    }

    /// Split access to the trace writer and named values, as expression
    /// evaluation borrows both at once.
    pub fn trace_and_values(&mut self) -> (&mut dyn TraceWriter, &NamedValues) {
        (self.trace.as_mut(), &self.named_values)
    }

    fn prefix(&self, meta: &TokenMeta, message: &str) -> String {
        let Some(file) = meta.file.and_then(|id| self.file_name(id)) else {
            return message.to_string();
        };
        match (meta.line, meta.column) {
            (Some(line), Some(column)) => {
                format!("{file} (Line: {line}, Col: {column}) {message}")
            }
            _ => format!("{file}: {message}"),
        }
    }
}
