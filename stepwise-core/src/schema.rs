//! JSON Schema boundaries
//!
//! A [`Schema`] is a compiled JSON Schema document plus a stable identity
//! (the digest of its canonical form). Steps, workflows, tools and
//! structured generation calls validate values against schemas and report
//! failures as a list of [`ValidationIssue`]s.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::canonical;
use crate::error::{Result, StepwiseError};

/// Which side of a boundary a validation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON pointer to the offending value ("" for the root)
    pub path: String,
    /// Human-readable description of the violation
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Compiled JSON Schema with a content-derived identity
#[derive(Clone)]
pub struct Schema {
    document: Arc<Value>,
    // None accepts every value
    validator: Option<Arc<jsonschema::Validator>>,
    id: String,
}

impl Schema {
    /// Compile a schema document.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::InvalidSchema`] if the document is not a valid
    /// JSON Schema.
    pub fn new(document: Value) -> Result<Self> {
        let validator = jsonschema::Validator::new(&document)
            .map_err(|e| StepwiseError::InvalidSchema(e.to_string()))?;
        let id = canonical::digest(&document);
        Ok(Self {
            document: Arc::new(document),
            validator: Some(Arc::new(validator)),
            id,
        })
    }

    /// Schema that accepts any JSON value.
    pub fn any() -> Self {
        let document = Value::Object(Default::default());
        let id = canonical::digest(&document);
        Self {
            document: Arc::new(document),
            validator: None,
            id,
        }
    }

    /// Shorthand for a non-empty string schema.
    pub fn non_empty_string() -> Result<Self> {
        Self::new(serde_json::json!({"type": "string", "minLength": 1}))
    }

    /// SHA-256 of the canonical schema document
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw schema document
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Validate a value, collecting every violation.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), Vec<ValidationIssue>> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        if validator.is_valid(value) {
            return Ok(());
        }
        let issues: Vec<ValidationIssue> = validator
            .iter_errors(value)
            .map(|e| ValidationIssue::new(e.instance_path.to_string(), e.to_string()))
            .collect();
        Err(issues)
    }

    /// Validate a value and convert failures into a [`StepwiseError::Validation`].
    pub fn check(&self, direction: Direction, value: &Value) -> Result<()> {
        self.validate(value)
            .map_err(|issues| StepwiseError::validation(direction, issues))
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("id", &self.id)
            .field("document", &self.document)
            .finish()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.document.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let document = Value::deserialize(deserializer)?;
        Schema::new(document).map_err(serde::de::Error::custom)
    }
}
