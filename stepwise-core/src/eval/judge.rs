//! Judges score one case's output
//!
//! A judge is a pure function of `(input, output, expected)` that returns
//! named metrics. Built-in judges are looked up by name through
//! [`JudgeRegistry`]; custom ones are written as a [`Judge`] impl or wrapped
//! from a closure with [`FnJudge`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::canonical::canonical_json;
use crate::error::{Result, StepwiseError};

/// What a judge sees for one case
#[derive(Debug, Clone, Copy)]
pub struct JudgeInput<'a> {
    pub input: &'a Value,
    pub output: &'a Value,
    pub expected: Option<&'a Value>,
}

/// Metrics produced by one judge for one case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub metrics: BTreeMap<String, f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
}

impl Score {
    pub fn new() -> Self {
        Self::default()
    }

    /// A score with a single metric
    pub fn metric(name: impl Into<String>, value: f64) -> Self {
        Self::new().with_metric(name, value)
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: Value) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

/// Scores a case
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, input: &JudgeInput<'_>) -> Result<Score>;
}

/// `exact_match`: 1.0 when the output equals the expected value
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl Judge for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn score(&self, input: &JudgeInput<'_>) -> Result<Score> {
        let Some(expected) = input.expected else {
            return Ok(Score::new().with_notes("no expected value"));
        };
        let hit = input.output == expected;
        Ok(Score::metric("exact_match", if hit { 1.0 } else { 0.0 }))
    }
}

/// `key_terms`: fraction of the expected terms present in the output text.
///
/// The expected value is an array of terms or a whitespace-separated string.
/// Matching is case-insensitive substring search over the output, taken as
/// is when it is a string and as compact JSON otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyTerms;

impl KeyTerms {
    fn terms(expected: &Value) -> Vec<String> {
        match expected {
            Value::String(s) => s.split_whitespace().map(|t| t.to_lowercase()).collect(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.to_lowercase(),
                    other => other.to_string().to_lowercase(),
                })
                .filter(|t| !t.is_empty())
                .collect(),
            other => vec![other.to_string().to_lowercase()],
        }
    }
}

impl Judge for KeyTerms {
    fn name(&self) -> &str {
        "key_terms"
    }

    fn score(&self, input: &JudgeInput<'_>) -> Result<Score> {
        let terms = input.expected.map(Self::terms).unwrap_or_default();
        if terms.is_empty() {
            return Ok(Score::new().with_notes("no expected terms"));
        }
        let text = match input.output {
            Value::String(s) => s.to_lowercase(),
            other => canonical_json(other).to_lowercase(),
        };
        let missing: Vec<&String> = terms.iter().filter(|t| !text.contains(t.as_str())).collect();
        let found = terms.len() - missing.len();
        let mut score = Score::metric("key_terms", found as f64 / terms.len() as f64);
        if !missing.is_empty() {
            score = score.with_artifacts(serde_json::json!({ "missing": missing }));
        }
        Ok(score)
    }
}

type JudgeFn = dyn Fn(&JudgeInput<'_>) -> Result<Score> + Send + Sync;

/// A judge backed by a closure
pub struct FnJudge {
    name: String,
    f: Box<JudgeFn>,
}

impl FnJudge {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&JudgeInput<'_>) -> Result<Score> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl std::fmt::Debug for FnJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnJudge").field("name", &self.name).finish()
    }
}

impl Judge for FnJudge {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, input: &JudgeInput<'_>) -> Result<Score> {
        (self.f)(input)
    }
}

/// Judges by name
#[derive(Clone, Default)]
pub struct JudgeRegistry {
    judges: HashMap<String, Arc<dyn Judge>>,
}

impl std::fmt::Debug for JudgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeRegistry")
            .field("judges", &self.names())
            .finish()
    }
}

impl JudgeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `exact_match` and `key_terms`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExactMatch));
        registry.register(Arc::new(KeyTerms));
        registry
    }

    pub fn register(&mut self, judge: Arc<dyn Judge>) -> Option<Arc<dyn Judge>> {
        self.judges.insert(judge.name().to_string(), judge)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Judge>> {
        self.judges.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.judges.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Look up every name, failing on the first unknown one
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn Judge>>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.get(name).ok_or_else(|| {
                    StepwiseError::Configuration(format!(
                        "Unknown judge '{}' (available: {})",
                        name,
                        self.names().join(", ")
                    ))
                })
            })
            .collect()
    }
}
