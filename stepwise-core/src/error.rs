//! Error types for Stepwise operations

use crate::schema::{Direction, ValidationIssue};

/// Result type for Stepwise operations
pub type Result<T> = std::result::Result<T, StepwiseError>;

/// Error types for the Stepwise runtime and evaluation harness
#[derive(Debug, thiserror::Error)]
pub enum StepwiseError {
    /// A value failed its declared schema at a step, tool or generation boundary
    #[error("Validation error ({direction}): {}", summarize_issues(.issues))]
    Validation {
        direction: Direction,
        issues: Vec<ValidationIssue>,
    },

    /// Tool lookup failed
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool body returned an error
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// Generation backend failure, message preserved from the backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// A schema document could not be compiled
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Two judges reported the same metric for one case
    #[error("Metric '{metric}' from judge '{judge}' collides with an earlier judge in case '{case_id}'")]
    MetricCollision {
        case_id: String,
        metric: String,
        judge: String,
    },

    /// A dataset case failed to execute; the cause is the error source
    #[error("Case '{case_id}' failed")]
    CaseFailed {
        case_id: String,
        source: Box<StepwiseError>,
    },

    /// Trace sink error
    #[error("Trace error: {0}")]
    Trace(String),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dataset loading error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StepwiseError {
    /// Build a validation error for the given direction
    pub fn validation(direction: Direction, issues: Vec<ValidationIssue>) -> Self {
        StepwiseError::Validation { direction, issues }
    }

    /// Whether this is a schema validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, StepwiseError::Validation { .. })
    }

    /// Validation direction, if this is a validation failure
    pub fn validation_direction(&self) -> Option<Direction> {
        match self {
            StepwiseError::Validation { direction, .. } => Some(*direction),
            _ => None,
        }
    }
}

fn summarize_issues(issues: &[ValidationIssue]) -> String {
    if issues.is_empty() {
        return "no details".to_string();
    }
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<String> for StepwiseError {
    fn from(s: String) -> Self {
        StepwiseError::Other(s)
    }
}

impl From<&str> for StepwiseError {
    fn from(s: &str) -> Self {
        StepwiseError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for StepwiseError {
    fn from(err: anyhow::Error) -> Self {
        StepwiseError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_issues() {
        let err = StepwiseError::validation(
            Direction::Input,
            vec![
                ValidationIssue::new("/text", "\"\" is shorter than 1 character"),
                ValidationIssue::new("", "\"lang\" is a required property"),
            ],
        );
        let msg = err.to_string();
        assert!(msg.starts_with("Validation error (input)"));
        assert!(msg.contains("/text"));
        assert!(msg.contains("required property"));
        assert_eq!(err.validation_direction(), Some(Direction::Input));
    }

    #[test]
    fn case_failure_keeps_source() {
        let err = StepwiseError::CaseFailed {
            case_id: "c1".to_string(),
            source: Box::new(StepwiseError::Backend("rate limited".to_string())),
        };
        assert_eq!(err.to_string(), "Case 'c1' failed");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Backend error: rate limited"));
        assert_eq!(
            format!("{:#}", anyhow::Error::new(err)),
            "Case 'c1' failed: Backend error: rate limited"
        );
    }
}
