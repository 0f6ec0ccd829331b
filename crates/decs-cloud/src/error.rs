//! Attribute bag conversion errors

use thiserror::Error;

/// Errors raised while moving between generic attribute bags and typed specs
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Missing attribute: {0}")]
    MissingAttribute(String),

    #[error("Invalid attribute {key}: {reason}")]
    InvalidAttribute { key: String, reason: String },

    #[error("Unsupported resource type: {0}")]
    UnsupportedResourceType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CloudError::InvalidAttribute {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
