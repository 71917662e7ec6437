//! Validation-error collection. Recoverable template problems accumulate on
//! the context (bounded in count and message size); fatal resource errors
//! terminate the whole operation.

use std::fmt;

use expressions::BudgetError;

use crate::events::SourceError;
use crate::schema::SchemaError;

/// Most errors retained per operation; further errors are dropped.
pub const MAX_ERRORS: usize = 10;

/// Longest retained message, in characters; longer messages are truncated.
pub const MAX_MESSAGE_LENGTH: usize = 500;

const TRUNCATION_SUFFIX: &str = "[...]";

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("The template is not valid. {0}")]
    Validation(String),
    #[error("Expected the end of the template")]
    ExpectedEnd,
    #[error("The template unraveler is in an unexpected state")]
    UnexpectedState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValidationError {
    pub message: String,
}

impl fmt::Display for TemplateValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// TemplateValidationErrors collects recoverable diagnostics, capping both
/// how many are kept and how long each may be.
#[derive(Debug, Default)]
pub struct TemplateValidationErrors {
    errors: Vec<TemplateValidationError>,
}

impl TemplateValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: impl Into<String>) {
        if self.errors.len() >= MAX_ERRORS {
            return;
        }
        let mut message: String = message.into();
        if message.chars().count() > MAX_MESSAGE_LENGTH {
            message = message
                .chars()
                .take(MAX_MESSAGE_LENGTH - TRUNCATION_SUFFIX.chars().count())
                .collect();
            message.push_str(TRUNCATION_SUFFIX);
        }
        self.errors.push(TemplateValidationError { message });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn count(&self) -> usize {
        self.errors.len()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &TemplateValidationError> {
        self.errors.iter()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }

    /// Raise a combined error if any diagnostics were collected.
    pub fn check(&self) -> Result<(), TemplateError> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(TemplateError::Validation(self.messages().join(",")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn caps_error_count() {
        let mut errors = TemplateValidationErrors::new();
        for i in 0..20 {
            errors.add(format!("error {i}"));
        }
        assert_eq!(errors.count(), MAX_ERRORS);
    }

    #[test]
    fn truncates_long_messages() {
        let mut errors = TemplateValidationErrors::new();
        errors.add("x".repeat(2 * MAX_MESSAGE_LENGTH));
        let message = &errors.messages()[0];
        assert_eq!(message.chars().count(), MAX_MESSAGE_LENGTH);
        assert!(message.ends_with("[...]"));
    }

    #[test]
    fn check_combines_messages() {
        let mut errors = TemplateValidationErrors::new();
        assert!(errors.check().is_ok());
        errors.add("first");
        errors.add("second");
        let err = errors.check().unwrap_err();
        assert_eq!(
            err.to_string(),
            "The template is not valid. first,second"
        );
    }
}
