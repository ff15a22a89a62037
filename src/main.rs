//! Similia CLI: run one case analysis against a saved case file.
//!
//! Usage:
//!   similia analyze --case case.json [--provider openai|gemini] [--store results.jsonl]
//!   similia compare --case case.json --remedy Pulsatilla --remedy Sepia

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;

use similia::analysis::{AnalysisError, AnalysisStore, CaseAnalyzer, JsonLinesStore, MemoryStore};
use similia::case::CaseFields;
use similia::config::{AnalysisConfig, ConfigError, ProviderKind, APP_NAME, APP_VERSION};

/// Environment variable holding the provider API key.
const API_KEY_ENV: &str = "SIMILIA_API_KEY";

#[derive(Parser, Debug)]
#[command(name = "similia", version, about = "AI-assisted homeopathic case analysis")]
struct Cli {
    #[command(subcommand)]
    task: Task,

    /// Case file: a JSON object of case fields
    #[arg(long, global = true)]
    case: Option<PathBuf>,

    /// AI provider (openai or gemini); overrides SIMILIA_PROVIDER
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model name override
    #[arg(long, global = true)]
    model: Option<String>,

    /// Append persisted results to this JSON-lines file
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Print request and token counters to stderr when done
    #[arg(long, global = true)]
    usage: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Task {
    /// Themes and portrait from the case narrative
    Narrative,
    /// Strange, rare and peculiar symptoms
    Peculiar,
    /// Full case analysis with remedy suggestions
    Analyze,
    /// Contrast two or more remedies
    Compare {
        /// Remedy to compare (repeat for each)
        #[arg(long = "remedy", required = true)]
        remedies: Vec<String>,
    },
    /// Follow-up questions for the next consultation
    FollowUp {
        /// Candidate remedy (repeat for each)
        #[arg(long = "remedy")]
        remedies: Vec<String>,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("--case <file> is required")]
    MissingCase,

    #[error("Cannot read case file {path}: {source}")]
    ReadCase {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Case file {path} is not a JSON object: {message}")]
    ParseCase { path: PathBuf, message: String },

    #[error("SIMILIA_API_KEY is not set")]
    MissingApiKey,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("Cannot render result: {0}")]
    Render(#[from] serde_json::Error),
}

/// Load a case file into case fields.
fn load_case(path: &Path) -> Result<CaseFields, CliError> {
    let content = std::fs::read_to_string(path).map_err(|source| CliError::ReadCase {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| CliError::ParseCase {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Environment first, then command-line flags on top.
fn build_config(cli: &Cli) -> Result<AnalysisConfig, CliError> {
    build_config_with(cli, |key| std::env::var(key).ok())
}

/// `--provider` picks the provider defaults that the other `SIMILIA_*`
/// variables then overlay; `SIMILIA_PROVIDER` is ignored when it is given.
fn build_config_with<F>(cli: &Cli, lookup: F) -> Result<AnalysisConfig, CliError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match cli.provider.as_deref() {
        Some(name) => {
            let provider = ProviderKind::parse(name)?;
            AnalysisConfig::for_provider(provider).with_overrides(|key| match key {
                "SIMILIA_PROVIDER" => None,
                _ => lookup(key),
            })?
        }
        None => AnalysisConfig::default().with_overrides(lookup)?,
    };
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    config.validate()?;
    Ok(config)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(value)?)
}

async fn run(cli: Cli) -> Result<String, CliError> {
    let case_path = cli.case.as_deref().ok_or(CliError::MissingCase)?;
    let case = load_case(case_path)?;
    let config = build_config(&cli)?;
    let api_key = std::env::var(API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or(CliError::MissingApiKey)?;

    let store: Arc<dyn AnalysisStore> = match &cli.store {
        Some(path) => Arc::new(JsonLinesStore::new(path.clone())),
        None => Arc::new(MemoryStore::new()),
    };
    let analyzer = CaseAnalyzer::from_config(&config, &api_key, store)?;

    tracing::info!(
        provider = config.provider.as_str(),
        model = %config.model,
        task = ?cli.task,
        "Running analysis"
    );

    let output = match &cli.task {
        Task::Narrative => to_json(&analyzer.analyze_narrative(&case).await?),
        Task::Peculiar => to_json(&analyzer.highlight_peculiar_symptoms(&case).await?),
        Task::Analyze => to_json(&analyzer.analyze_case(&case).await?),
        Task::Compare { remedies } => to_json(&analyzer.compare_remedies(&case, remedies).await?),
        Task::FollowUp { remedies } => {
            to_json(&analyzer.suggest_follow_up_questions(&case, remedies).await?)
        }
    }?;

    if cli.usage {
        let usage = analyzer.usage().await;
        eprintln!("{}", to_json(&usage)?);
    }

    Ok(output)
}

#[tokio::main]
async fn main() -> ExitCode {
    similia::init_tracing();
    tracing::debug!("{APP_NAME} v{APP_VERSION}");

    match run(Cli::parse()).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(CliError::Analysis(e)) => {
            eprintln!("Error: {e}");
            if let Some(hint) = e.remediation() {
                eprintln!("{hint}");
            }
            if e.allows_manual_continuation() {
                eprintln!("The case is unchanged; you can continue it without AI assistance.");
            }
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
