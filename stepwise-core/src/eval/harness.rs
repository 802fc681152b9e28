//! Evaluation runs
//!
//! The harness coordinates:
//! - Running each dataset case through the runtime, in order
//! - Scoring each output with every judge
//! - Aggregating per-metric means and checking thresholds

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::dataset::Dataset;
use super::judge::{Judge, JudgeInput, JudgeRegistry};
use crate::error::{Result, StepwiseError};
use crate::runtime::Runtime;
use crate::trace::RunId;
use crate::workflow::Target;

/// What to do when two judges report the same metric for one case
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Fail the evaluation with a metric collision error
    #[default]
    Reject,
    /// Prefix every metric with `<judge>.`
    Namespace,
}

/// Judges, thresholds and collision policy for one evaluation
#[derive(Clone)]
pub struct EvalSpec {
    pub name: String,
    pub judges: Vec<Arc<dyn Judge>>,
    pub thresholds: BTreeMap<String, f64>,
    pub collisions: CollisionPolicy,
}

impl std::fmt::Debug for EvalSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let judges: Vec<&str> = self.judges.iter().map(|j| j.name()).collect();
        f.debug_struct("EvalSpec")
            .field("name", &self.name)
            .field("judges", &judges)
            .field("thresholds", &self.thresholds)
            .field("collisions", &self.collisions)
            .finish()
    }
}

impl EvalSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            judges: Vec::new(),
            thresholds: BTreeMap::new(),
            collisions: CollisionPolicy::default(),
        }
    }

    pub fn judge(mut self, judge: impl Judge + 'static) -> Self {
        self.judges.push(Arc::new(judge));
        self
    }

    pub fn judge_arc(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judges.push(judge);
        self
    }

    pub fn threshold(mut self, metric: impl Into<String>, minimum: f64) -> Self {
        self.thresholds.insert(metric.into(), minimum);
        self
    }

    pub fn collisions(mut self, policy: CollisionPolicy) -> Self {
        self.collisions = policy;
        self
    }
}

/// An evaluation as written in a JSON or TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalDefinition {
    pub name: String,

    /// Registered target to evaluate
    pub target: String,

    /// Dataset file, relative to the definition file
    pub dataset: PathBuf,

    /// Judge names, resolved against a [`JudgeRegistry`]
    #[serde(default)]
    pub judges: Vec<String>,

    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,

    #[serde(default)]
    pub collisions: CollisionPolicy,
}

impl EvalDefinition {
    /// Load a definition; `.json` files as JSON, anything else as TOML.
    ///
    /// A relative dataset path is rebased onto the definition's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Json, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(StepwiseError::Configuration(format!(
                "Eval definition not found: {}",
                path.display()
            )));
        }
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Figment::new().merge(Json::file(path)),
            _ => Figment::new().merge(Toml::file(path)),
        };
        let mut definition: EvalDefinition = figment.extract().map_err(|e| {
            StepwiseError::Configuration(format!("Failed to load eval definition: {}", e))
        })?;

        if definition.dataset.is_relative() {
            if let Some(parent) = path.parent() {
                definition.dataset = parent.join(&definition.dataset);
            }
        }
        Ok(definition)
    }

    /// Resolve judge names into a runnable spec
    pub fn to_spec(&self, judges: &JudgeRegistry) -> Result<EvalSpec> {
        Ok(EvalSpec {
            name: self.name.clone(),
            judges: judges.resolve(&self.judges[..])?,
            thresholds: self.thresholds.clone(),
            collisions: self.collisions,
        })
    }
}

/// Scores for one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub id: String,
    pub run_id: RunId,
    pub output: Value,
    pub metrics: BTreeMap<String, f64>,
    /// Judge notes keyed by judge name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: BTreeMap<String, String>,
    /// Judge artifacts keyed by judge name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Value>,
}

/// Outcome of an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRunResult {
    pub name: String,
    pub dataset: String,
    pub cases: Vec<CaseResult>,
    pub aggregates: BTreeMap<String, f64>,
    pub thresholds: BTreeMap<String, f64>,
    pub passed: bool,
}

impl EvalRunResult {
    /// Threshold metrics whose aggregate is missing or below the minimum
    pub fn failed_thresholds(&self) -> Vec<&str> {
        self.thresholds
            .iter()
            .filter(|(metric, minimum)| !meets(self.aggregates.get(*metric), **minimum))
            .map(|(metric, _)| metric.as_str())
            .collect()
    }
}

fn meets(aggregate: Option<&f64>, minimum: f64) -> bool {
    aggregate.is_some_and(|value| *value >= minimum)
}

/// Arithmetic mean per metric over the recorded values
pub fn aggregate(values: &BTreeMap<String, Vec<f64>>) -> BTreeMap<String, f64> {
    values
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(metric, v)| (metric.clone(), v.iter().sum::<f64>() / v.len() as f64))
        .collect()
}

/// Every threshold metric has a defined aggregate at or above its minimum
pub fn passes(aggregates: &BTreeMap<String, f64>, thresholds: &BTreeMap<String, f64>) -> bool {
    thresholds
        .iter()
        .all(|(metric, minimum)| meets(aggregates.get(metric), *minimum))
}

/// Run every case of `dataset` through `target` and score it.
///
/// Cases run strictly in order. The first case that fails to execute or
/// score aborts the evaluation with a case failure carrying its id.
pub async fn run_eval(
    runtime: &Runtime,
    target: &dyn Target,
    dataset: &Dataset,
    spec: &EvalSpec,
) -> Result<EvalRunResult> {
    info!(
        eval = %spec.name,
        dataset = %dataset.name,
        cases = dataset.len(),
        target = %target.name(),
        "evaluation started"
    );

    let mut cases = Vec::with_capacity(dataset.len());
    let mut values: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for case in &dataset.cases {
        let outcome = runtime
            .run(target, case.input.clone())
            .await
            .map_err(|e| StepwiseError::CaseFailed {
                case_id: case.id.clone(),
                source: Box::new(e.into_inner()),
            })?;

        let judge_input = JudgeInput {
            input: &case.input,
            output: &outcome.output,
            expected: case.expected.as_ref(),
        };

        let mut metrics = BTreeMap::new();
        let mut notes = BTreeMap::new();
        let mut artifacts = BTreeMap::new();
        for judge in &spec.judges {
            let score = judge
                .score(&judge_input)
                .map_err(|e| StepwiseError::CaseFailed {
                    case_id: case.id.clone(),
                    source: Box::new(e),
                })?;
            for (metric, value) in score.metrics {
                let key = match spec.collisions {
                    CollisionPolicy::Namespace => format!("{}.{}", judge.name(), metric),
                    CollisionPolicy::Reject => metric,
                };
                if metrics.contains_key(&key) {
                    return Err(StepwiseError::MetricCollision {
                        case_id: case.id.clone(),
                        metric: key,
                        judge: judge.name().to_string(),
                    });
                }
                metrics.insert(key, value);
            }
            if let Some(n) = score.notes {
                notes.insert(judge.name().to_string(), n);
            }
            if let Some(a) = score.artifacts {
                artifacts.insert(judge.name().to_string(), a);
            }
        }

        for (metric, value) in &metrics {
            values.entry(metric.clone()).or_default().push(*value);
        }
        debug!(case = %case.id, run_id = %outcome.record.run_id, ?metrics, "case scored");

        cases.push(CaseResult {
            id: case.id.clone(),
            run_id: outcome.record.run_id,
            output: outcome.output,
            metrics,
            notes,
            artifacts,
        });
    }

    let aggregates = aggregate(&values);
    let passed = passes(&aggregates, &spec.thresholds);
    info!(eval = %spec.name, passed, ?aggregates, "evaluation finished");

    Ok(EvalRunResult {
        name: spec.name.clone(),
        dataset: dataset.name.clone(),
        cases,
        aggregates,
        thresholds: spec.thresholds.clone(),
        passed,
    })
}
