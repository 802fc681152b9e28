//! Stepwise CLI - run targets, evaluate datasets and inspect traces
//!
//! Results are printed to stdout as JSON; logs go to stderr.

mod demos;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use stepwise_core::config::StepwiseConfig;
use stepwise_core::eval::{run_eval, Dataset, EvalDefinition, EvalRunResult, JudgeRegistry};
use stepwise_core::runtime::{RunRecord, Runtime};
use stepwise_core::trace::{read_trace, SpanTree, TraceSummary, TreeIssue};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Run, evaluate and inspect Stepwise targets", long_about = None)]
#[command(version)]
struct Cli {
    /// Extra configuration file (TOML, JSON or YAML)
    #[arg(short, long, global = true, env = "STEPWISE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a target once and print {output, record}
    Run {
        /// Target name
        target: String,

        /// JSON file holding the input
        #[arg(short, long, conflicts_with = "json")]
        input: Option<PathBuf>,

        /// Inline JSON input
        #[arg(long)]
        json: Option<String>,
    },
    /// Evaluate a target against a dataset
    Eval {
        /// Eval definition file (JSON or TOML)
        spec: PathBuf,
    },
    /// Check a JSONL trace and print its summary
    Trace {
        /// Trace file
        file: PathBuf,
    },
    /// List the available targets
    Targets,
    /// Version information
    Version,
}

#[derive(Serialize)]
struct RunReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<&'a Value>,
    record: &'a RunRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct EvalFailure<'a> {
    name: &'a str,
    passed: bool,
    error: String,
}

#[derive(Serialize)]
struct TraceReport<'a> {
    well_formed: bool,
    summary: &'a TraceSummary,
    issues: &'a [TreeIssue],
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match StepwiseConfig::load_with(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    init_logging(&config, cli.verbose);

    match execute(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(config: &StepwiseConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(command: Commands, config: &StepwiseConfig) -> Result<ExitCode> {
    match command {
        Commands::Run {
            target,
            input,
            json,
        } => {
            let input = read_input(input.as_deref(), json.as_deref())?;
            run_target(config, &target, input).await
        }
        Commands::Eval { spec } => evaluate(config, &spec).await,
        Commands::Trace { file } => inspect_trace(&file),
        Commands::Targets => {
            let targets = demos::targets()?;
            let listing: Vec<Value> = targets
                .names()
                .into_iter()
                .filter_map(|name| targets.get(name))
                .map(|t| serde_json::json!({"name": t.name(), "kind": t.kind()}))
                .collect();
            print_json(&listing)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => {
            println!("stepwise {}", env!("CARGO_PKG_VERSION"));
            println!("stepwise-core {}", stepwise_core::VERSION);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_input(file: Option<&Path>, inline: Option<&str>) -> Result<Value> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file {}", path.display()))?;
        return serde_json::from_str(&content)
            .with_context(|| format!("Input file {} is not valid JSON", path.display()));
    }
    match inline {
        Some(text) => serde_json::from_str(text).context("--json is not valid JSON"),
        None => Ok(Value::Null),
    }
}

fn build_runtime(config: &StepwiseConfig) -> Result<Runtime> {
    Ok(Runtime::from_config(config)
        .context("Failed to configure runtime")?
        .tools(demos::tools()?)
        .build())
}

async fn run_target(config: &StepwiseConfig, name: &str, input: Value) -> Result<ExitCode> {
    let targets = demos::targets()?;
    let target = targets.get(name).with_context(|| {
        format!(
            "Unknown target '{}' (available: {})",
            name,
            targets.names().join(", ")
        )
    })?;
    let runtime = build_runtime(config)?;

    match runtime.run(target.as_ref(), input).await {
        Ok(outcome) => {
            print_json(&RunReport {
                output: Some(&outcome.output),
                record: &outcome.record,
                error: None,
            })?;
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            print_json(&RunReport {
                output: None,
                record: &failure.record,
                error: Some(failure.source.to_string()),
            })?;
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn evaluate(config: &StepwiseConfig, spec_path: &Path) -> Result<ExitCode> {
    let definition = EvalDefinition::load(spec_path)?;
    let spec = definition.to_spec(&JudgeRegistry::with_builtins())?;
    let dataset = Dataset::load(&definition.dataset)?;

    let targets = demos::targets()?;
    let target = targets
        .get(&definition.target)
        .with_context(|| format!("Unknown target '{}'", definition.target))?;
    let runtime = build_runtime(config)?;

    // A case that fails to run fails the evaluation; only setup errors exit 2.
    let result: EvalRunResult = match run_eval(&runtime, target.as_ref(), &dataset, &spec).await {
        Ok(result) => result,
        Err(e) => {
            let message = format!("{:#}", anyhow::Error::new(e));
            error!(eval = %definition.name, error = %message, "evaluation aborted");
            print_json(&EvalFailure {
                name: &definition.name,
                passed: false,
                error: message,
            })?;
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(eval = %result.name, passed = result.passed, "evaluation complete");
    print_json(&result)?;

    Ok(if result.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn inspect_trace(path: &Path) -> Result<ExitCode> {
    let records = read_trace(path)?;
    let tree = SpanTree::build(&records);
    let summary = TraceSummary::from_records(&records);
    let well_formed = tree.is_well_formed();

    print_json(&TraceReport {
        well_formed,
        summary: &summary,
        issues: &tree.issues,
    })?;
    Ok(if well_formed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_input_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, r#"{"text": "hi"}"#).unwrap();

        assert_eq!(read_input(Some(path.as_path()), None).unwrap()["text"], "hi");
        assert_eq!(read_input(None, Some("[1, 2]")).unwrap(), serde_json::json!([1, 2]));
        assert_eq!(read_input(None, None).unwrap(), Value::Null);
        assert!(read_input(None, Some("{not json")).is_err());
    }

    #[tokio::test]
    async fn test_eval_exit_code_follows_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cases.jsonl"),
            "{\"input\": \"alpha\", \"expected\": [\"alpha\", \"beta\"]}\n\
             {\"input\": \"alpha beta\", \"expected\": [\"alpha\", \"beta\"]}\n",
        )
        .unwrap();
        let spec = dir.path().join("eval.json");
        let config = StepwiseConfig {
            trace: stepwise_core::config::TraceConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };

        std::fs::write(
            &spec,
            r#"{"name": "terms", "target": "echo", "dataset": "cases.jsonl",
                "judges": ["key_terms"], "thresholds": {"key_terms": 0.75}}"#,
        )
        .unwrap();
        assert_eq!(evaluate(&config, &spec).await.unwrap(), ExitCode::SUCCESS);

        std::fs::write(
            &spec,
            r#"{"name": "terms", "target": "echo", "dataset": "cases.jsonl",
                "judges": ["key_terms"], "thresholds": {"key_terms": 0.8}}"#,
        )
        .unwrap();
        assert_eq!(evaluate(&config, &spec).await.unwrap(), ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn test_eval_case_failure_exits_one() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cases.jsonl"),
            "{\"input\": \"Rust is a systems language.\"}\n",
        )
        .unwrap();
        let spec = dir.path().join("eval.toml");
        std::fs::write(
            &spec,
            "name = \"s\"\ntarget = \"summarize\"\ndataset = \"cases.jsonl\"\njudges = [\"exact_match\"]\n",
        )
        .unwrap();
        let config = StepwiseConfig {
            trace: stepwise_core::config::TraceConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };

        // Default config uses the stub backend, so the draft step fails.
        assert_eq!(evaluate(&config, &spec).await.unwrap(), ExitCode::FAILURE);

        std::fs::write(
            &spec,
            "name = \"s\"\ntarget = \"missing\"\ndataset = \"cases.jsonl\"\n",
        )
        .unwrap();
        assert!(evaluate(&config, &spec).await.is_err());
    }

    #[test]
    fn test_trace_exit_code_flags_malformed_traces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        std::fs::write(
            &path,
            r#"{"seq":0,"timestamp":"2024-01-01T00:00:00Z","run_id":"r","span_id":"s","type":"span_start","name":"root"}"#,
        )
        .unwrap();
        assert_eq!(inspect_trace(&path).unwrap(), ExitCode::FAILURE);
    }
}
