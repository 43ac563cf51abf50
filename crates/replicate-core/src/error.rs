//! Error taxonomy for the Replicate CLI core.
//!
//! Every variant is terminal for the invocation: nothing in the core retries.
//! Messages carry the key, value, path or remote cause needed to self-correct.

use std::path::PathBuf;

/// Errors produced while resolving, coercing and executing a job.
#[derive(Debug, thiserror::Error)]
pub enum ReplicateError {
    #[error("invalid model identifier: {0} (expected owner/name or owner/name:version)")]
    InvalidIdentifier(String),

    #[error("invalid input {arg:?}: {reason}")]
    MalformedArgument { arg: String, reason: String },

    #[error("failed to resolve template path '{path}': {reason}")]
    TemplateResolution { path: String, reason: String },

    #[error("failed to upload {}: {reason}", .path.display())]
    Upload { path: PathBuf, reason: String },

    #[error("unknown property {0}")]
    UnknownProperty(String),

    #[error("failed to coerce {value:?} to type {kind} for property {key}: {reason}")]
    TypeCoercion {
        key: String,
        value: String,
        kind: String,
        reason: String,
    },

    #[error("invalid model schema: {0}")]
    Schema(String),

    #[error("failed to create job: {0}")]
    Submission(String),

    #[error("streaming error: {0}")]
    Streaming(String),

    #[error("failed to save output: {0}")]
    Persistence(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplicateError {
    /// Shorthand for a [`ReplicateError::MalformedArgument`].
    pub fn malformed(arg: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedArgument {
            arg: arg.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ReplicateError::TemplateResolution`].
    pub fn template(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TemplateResolution {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for ReplicateError {
    fn from(err: reqwest::Error) -> Self {
        ReplicateError::Api(err.to_string())
    }
}

/// Result type for Replicate core operations.
pub type Result<T> = std::result::Result<T, ReplicateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coercion_error_names_key_and_value() {
        let err = ReplicateError::TypeCoercion {
            key: "steps".to_string(),
            value: "1.5".to_string(),
            kind: "integer".to_string(),
            reason: "not a base-10 integer".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("steps"));
        assert!(msg.contains("\"1.5\""));
        assert!(msg.contains("integer"));
    }

    #[test]
    fn test_upload_error_shows_path() {
        let err = ReplicateError::Upload {
            path: PathBuf::from("/tmp/input.png"),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to upload /tmp/input.png: connection refused"
        );
    }

    #[test]
    fn test_template_error_names_path() {
        let err = ReplicateError::template("$.file", "no value at path");
        assert!(err.to_string().contains("'$.file'"));
    }
}
