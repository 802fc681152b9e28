//! Tests for datasets, judges and the evaluation harness

use super::*;
use crate::error::StepwiseError;
use crate::runtime::Runtime;
use crate::trace::MemorySinkFactory;
use crate::workflow::Step;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn echo() -> Step {
    Step::builder("echo").handler(|_ctx, input| async move { Ok(input) })
}

fn two_cases() -> Dataset {
    Dataset::new(
        "terms",
        vec![
            Case::new("half", json!("alpha only")).with_expected(json!(["alpha", "beta"])),
            Case::new("full", json!("Alpha and BETA")).with_expected(json!(["alpha", "beta"])),
        ],
    )
}

#[tokio::test]
async fn key_terms_mean_drives_threshold() {
    let runtime = Runtime::builder().build();
    let dataset = two_cases();

    let spec = EvalSpec::new("terms").judge(KeyTerms).threshold("key_terms", 0.75);
    let result = run_eval(&runtime, &echo(), &dataset, &spec).await.unwrap();
    assert_eq!(result.cases[0].metrics["key_terms"], 0.5);
    assert_eq!(result.cases[1].metrics["key_terms"], 1.0);
    assert_eq!(result.aggregates["key_terms"], 0.75);
    assert!(result.passed);
    assert!(result.failed_thresholds().is_empty());

    let strict = EvalSpec::new("terms").judge(KeyTerms).threshold("key_terms", 0.8);
    let result = run_eval(&runtime, &echo(), &dataset, &strict).await.unwrap();
    assert!(!result.passed);
    assert_eq!(result.failed_thresholds(), vec!["key_terms"]);
}

#[tokio::test]
async fn each_case_is_its_own_run() {
    let sinks = MemorySinkFactory::new();
    let runtime = Runtime::builder()
        .sink_factory(Arc::new(sinks.clone()))
        .build();

    let result = run_eval(&runtime, &echo(), &two_cases(), &EvalSpec::new("runs"))
        .await
        .unwrap();
    assert_ne!(result.cases[0].run_id, result.cases[1].run_id);
    assert_eq!(sinks.run_ids().len(), 2);
    assert!(sinks.is_closed(&result.cases[0].run_id));
    assert_eq!(result.cases[1].output, json!("Alpha and BETA"));
}

#[tokio::test]
async fn missing_threshold_metric_fails() {
    let runtime = Runtime::builder().build();
    let spec = EvalSpec::new("missing")
        .judge(KeyTerms)
        .threshold("faithfulness", 0.1);

    let result = run_eval(&runtime, &echo(), &two_cases(), &spec).await.unwrap();
    assert!(!result.aggregates.contains_key("faithfulness"));
    assert!(!result.passed);
}

#[tokio::test]
async fn empty_thresholds_pass() {
    let runtime = Runtime::builder().build();
    let spec = EvalSpec::new("lenient").judge(ExactMatch);
    let result = run_eval(&runtime, &echo(), &two_cases(), &spec).await.unwrap();
    assert_eq!(result.aggregates["exact_match"], 0.0);
    assert!(result.passed);
}

#[tokio::test]
async fn absent_metric_is_not_zero() {
    let dataset = Dataset::new(
        "sparse",
        vec![
            Case::new("a", json!("x")).with_expected(json!("x")),
            Case::new("b", json!("y")),
        ],
    );
    let runtime = Runtime::builder().build();
    let spec = EvalSpec::new("sparse").judge(ExactMatch).threshold("exact_match", 1.0);

    let result = run_eval(&runtime, &echo(), &dataset, &spec).await.unwrap();
    assert!(result.cases[1].metrics.is_empty());
    assert_eq!(result.cases[1].notes["exact_match"], "no expected value");
    assert_eq!(result.aggregates["exact_match"], 1.0);
    assert!(result.passed);
}

fn constant(name: &str, metric: &'static str, value: f64) -> FnJudge {
    FnJudge::new(name, move |_input| Ok(Score::metric(metric, value)))
}

#[tokio::test]
async fn metric_collision_rejected_by_default() {
    let runtime = Runtime::builder().build();
    let spec = EvalSpec::new("clash")
        .judge(constant("first", "quality", 1.0))
        .judge(constant("second", "quality", 0.0));

    let err = run_eval(&runtime, &echo(), &two_cases(), &spec)
        .await
        .unwrap_err();
    match err {
        StepwiseError::MetricCollision { case_id, metric, judge } => {
            assert_eq!(case_id, "half");
            assert_eq!(metric, "quality");
            assert_eq!(judge, "second");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn metric_collision_namespaced() {
    let runtime = Runtime::builder().build();
    let spec = EvalSpec::new("clash")
        .judge(constant("first", "quality", 1.0))
        .judge(constant("second", "quality", 0.0))
        .collisions(CollisionPolicy::Namespace)
        .threshold("first.quality", 1.0);

    let result = run_eval(&runtime, &echo(), &two_cases(), &spec).await.unwrap();
    let names: Vec<&String> = result.aggregates.keys().collect();
    assert_eq!(names, vec!["first.quality", "second.quality"]);
    assert!(result.passed);
}

#[tokio::test]
async fn failing_case_fails_the_evaluation() {
    let picky = Step::builder("picky").handler(|_ctx, input: Value| async move {
        if input == json!("boom") {
            Err(StepwiseError::Other("cannot handle boom".to_string()))
        } else {
            Ok(input)
        }
    });
    let dataset = Dataset::new(
        "mixed",
        vec![Case::new("ok", json!("fine")), Case::new("bad", json!("boom"))],
    );
    let runtime = Runtime::builder().build();

    let err = run_eval(&runtime, &picky, &dataset, &EvalSpec::new("mixed"))
        .await
        .unwrap_err();
    match err {
        StepwiseError::CaseFailed { case_id, source } => {
            assert_eq!(case_id, "bad");
            assert_eq!(source.to_string(), "cannot handle boom");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn aggregate_is_the_exact_mean() {
    let mut values = BTreeMap::new();
    values.insert("m".to_string(), vec![0.2, 0.4, 0.9]);
    let aggregates = aggregate(&values);
    assert_eq!(aggregates["m"], (0.2 + 0.4 + 0.9) / 3.0);
    assert!(passes(&aggregates, &BTreeMap::new()));
}

#[test]
fn key_terms_accepts_string_and_structured_output() {
    let judge = KeyTerms;
    let expected = json!("paris france");
    let output = json!({"city": "Paris"});
    let score = judge
        .score(&JudgeInput {
            input: &Value::Null,
            output: &output,
            expected: Some(&expected),
        })
        .unwrap();
    assert_eq!(score.metrics["key_terms"], 0.5);
    assert_eq!(score.artifacts, Some(json!({"missing": ["france"]})));
}

#[test]
fn registry_resolves_builtins() {
    let registry = JudgeRegistry::with_builtins();
    assert_eq!(registry.names(), vec!["exact_match", "key_terms"]);
    assert_eq!(registry.resolve(&["key_terms"]).unwrap().len(), 1);
    assert!(matches!(
        registry.resolve(&["vibes"]),
        Err(StepwiseError::Configuration(_))
    ));
}

#[test]
fn dataset_defaults_case_ids() {
    let dataset = Dataset::from_json(
        "fallback",
        r#"{"cases": [{"input": 1}, {"id": "named", "input": 2, "expected": 2}]}"#,
    )
    .unwrap();
    assert_eq!(dataset.name, "fallback");
    assert_eq!(dataset.cases[0].id, "case-0");
    assert_eq!(dataset.cases[1].id, "named");
    assert_eq!(dataset.cases[1].expected, Some(json!(2)));
}

#[test]
fn dataset_loads_jsonl_named_after_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("smoke.jsonl");
    std::fs::write(
        &path,
        "{\"input\": \"a\", \"tags\": [\"easy\"]}\n\n{\"input\": \"b\"}\n",
    )
    .unwrap();

    let dataset = Dataset::load(&path).unwrap();
    assert_eq!(dataset.name, "smoke");
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.cases[1].id, "case-1");
    assert_eq!(dataset.cases[0].tags, vec!["easy".to_string()]);

    std::fs::write(&path, "{\"input\": \"a\"}\nnot json\n").unwrap();
    let err = Dataset::load(&path).unwrap_err();
    assert!(err.to_string().contains("line 2"));
}

#[test]
fn definition_rebases_dataset_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eval.toml");
    std::fs::write(
        &path,
        r#"
name = "smoke"
target = "echo"
dataset = "cases.jsonl"
judges = ["exact_match"]
collisions = "namespace"

[thresholds]
exact_match = 0.9
"#,
    )
    .unwrap();

    let definition = EvalDefinition::load(&path).unwrap();
    assert_eq!(definition.dataset, dir.path().join("cases.jsonl"));
    assert_eq!(definition.collisions, CollisionPolicy::Namespace);

    let spec = definition.to_spec(&JudgeRegistry::with_builtins()).unwrap();
    assert_eq!(spec.judges.len(), 1);
    assert_eq!(spec.thresholds["exact_match"], 0.9);
}
