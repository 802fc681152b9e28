//! Dataset evaluation
//!
//! Runs a target over a dataset of labeled cases, scores each output with
//! judges, and compares per-metric means against thresholds:
//!
//! - Each case runs as its own top-level run, strictly in order
//! - A metric's aggregate is the mean of the values actually recorded for
//!   it; cases that did not report it do not count as zero
//! - The evaluation passes when every threshold metric has an aggregate at
//!   or above its minimum
//!
//! # Example
//!
//! ```rust,ignore
//! use stepwise_core::eval::{run_eval, Dataset, EvalSpec, KeyTerms};
//!
//! let dataset = Dataset::load("datasets/summaries.jsonl")?;
//! let spec = EvalSpec::new("summaries")
//!     .judge(KeyTerms)
//!     .threshold("key_terms", 0.75);
//!
//! let result = run_eval(&runtime, &summarize, &dataset, &spec).await?;
//! assert!(result.passed);
//! ```

mod dataset;
mod harness;
mod judge;

pub use dataset::{Case, Dataset};
pub use harness::{
    aggregate, passes, run_eval, CaseResult, CollisionPolicy, EvalDefinition, EvalRunResult,
    EvalSpec,
};
pub use judge::{ExactMatch, FnJudge, Judge, JudgeInput, JudgeRegistry, KeyTerms, Score};

#[cfg(test)]
mod tests;
