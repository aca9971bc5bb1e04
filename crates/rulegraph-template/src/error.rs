//! Error types for placeholder rendering

use thiserror::Error;

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    /// Malformed placeholder or block
    #[error("invalid template syntax: {message}")]
    SyntaxError { message: String },

    /// Lookup did not resolve and no default was given
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },

    /// Anything else rendering rejected, such as an unknown filter
    #[error("failed to render template: {message}")]
    RenderError { message: String },
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        match err.kind() {
            minijinja::ErrorKind::SyntaxError => TemplateError::SyntaxError {
                message: err.to_string(),
            },
            minijinja::ErrorKind::UndefinedError => TemplateError::UndefinedVariable {
                name: err.to_string(),
            },
            _ => TemplateError::RenderError {
                message: err.to_string(),
            },
        }
    }
}
