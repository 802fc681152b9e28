//! Datasets of labeled cases
//!
//! Datasets load from JSON (`{"name": ..., "cases": [...]}` or a bare array
//! of cases) or JSON Lines (one case per line). Cases without an id get
//! `case-<index>`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::{Result, StepwiseError};

/// One labeled input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub id: String,

    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Free-form grading notes for judges that want them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Case {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
            expected: None,
            tags: Vec::new(),
            rubric: None,
            metadata: None,
        }
    }

    pub fn with_expected(mut self, expected: Value) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A named, ordered collection of cases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub cases: Vec<Case>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Named {
        #[serde(default)]
        name: Option<String>,
        cases: Vec<Case>,
    },
    Bare(Vec<Case>),
}

impl Dataset {
    /// Build a dataset, filling in missing case ids
    pub fn new(name: impl Into<String>, cases: Vec<Case>) -> Self {
        let cases = cases
            .into_iter()
            .enumerate()
            .map(|(index, mut case)| {
                if case.id.is_empty() {
                    case.id = format!("case-{}", index);
                }
                case
            })
            .collect();
        Self {
            name: name.into(),
            cases,
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Load a dataset file; `.jsonl` is read line by line, anything else as JSON.
    ///
    /// The file stem names the dataset unless the JSON document carries a name.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if the file cannot be read or a case is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StepwiseError::Dataset(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset")
            .to_string();

        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") | Some("ndjson") => Self::from_jsonl(stem, &content)
                .map_err(|e| StepwiseError::Dataset(format!("{}: {}", path.display(), e))),
            _ => Self::from_json(stem, &content)
                .map_err(|e| StepwiseError::Dataset(format!("{}: {}", path.display(), e))),
        }
    }

    /// Parse a JSON dataset document
    pub fn from_json(default_name: impl Into<String>, content: &str) -> Result<Self> {
        let file: DatasetFile = serde_json::from_str(content)
            .map_err(|e| StepwiseError::Dataset(format!("invalid dataset: {}", e)))?;
        Ok(match file {
            DatasetFile::Named { name, cases } => {
                Self::new(name.unwrap_or_else(|| default_name.into()), cases)
            }
            DatasetFile::Bare(cases) => Self::new(default_name, cases),
        })
    }

    /// Parse JSON Lines, one case per non-blank line
    pub fn from_jsonl(name: impl Into<String>, content: &str) -> Result<Self> {
        let mut cases = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let case: Case = serde_json::from_str(line).map_err(|e| {
                StepwiseError::Dataset(format!("line {}: {}", index + 1, e))
            })?;
            cases.push(case);
        }
        Ok(Self::new(name, cases))
    }
}
