//! `latio` command line: guarded agentic review of a codebase.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

use latio::agents::ReviewAgents;
use latio::guardrails::{GuardrailEngine, ScanLabels};
use latio::llm::ChatCompletionsClient;
use latio::moderation::ModerationClient;
use latio::runner::{RunConfig, RunContext, RunOutcome, Runner};
use latio::tools::{ListWorkspaceFiles, Tool, ToolContext};
use latio::Config;

const HEALTH_FOCUS: &str = "Focus on code health and optimization rather than security.\n\n";

#[derive(Parser)]
#[command(
    name = "latio",
    version,
    about = "Security and health review of code by moderated agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Model name (overrides LATIO_MODEL).
    #[arg(long, global = true)]
    model: Option<String>,

    /// Maximum number of handoffs per run (overrides LATIO_MAX_HOPS).
    #[arg(long, global = true)]
    max_hops: Option<usize>,

    /// Focus on health and optimization instead of security.
    #[arg(long, global = true)]
    health: bool,

    /// User id reported to the moderation service.
    #[arg(long, global = true, default_value = "cli")]
    user_id: String,
}

#[derive(Subcommand)]
enum Command {
    /// Review a set of changed files.
    Partial {
        directory: PathBuf,

        /// Changed file, relative to the directory. Repeatable.
        #[arg(short, long = "file", required = true)]
        files: Vec<String>,

        /// Unified diff of the changes.
        #[arg(long)]
        diff: Option<PathBuf>,
    },
    /// Review every file in a directory.
    Full { directory: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let directory = match &cli.command {
        Command::Partial { directory, .. } | Command::Full { directory } => directory,
    };
    let workspace_root = directory
        .canonicalize()
        .with_context(|| format!("cannot open {}", directory.display()))?;

    let mut config = Config::from_env(workspace_root)?;
    if let Some(model) = cli.model.clone() {
        config.moderation.model = model.clone();
        config.model = model;
    }
    if let Some(max_hops) = cli.max_hops {
        config.max_hops = max_hops;
    }

    let runner = build_runner(&config)?;
    let agents = ReviewAgents::build()?;
    let ctx = RunContext::new(cli.user_id.clone(), Uuid::new_v4().to_string());

    let (entry, mut prompt) = match &cli.command {
        Command::Partial { files, diff, .. } => (
            agents.partial_scan_entry(&runner)?,
            partial_prompt(files, diff.as_deref())?,
        ),
        Command::Full { .. } => (
            agents.full_scan_entry(&runner)?,
            full_prompt(&config.workspace_root, &ctx).await?,
        ),
    };
    if cli.health {
        prompt.insert_str(0, HEALTH_FOCUS);
    }

    tracing::info!(agent = entry.name(), model = %config.model, "Starting review");
    let result = runner.run(&entry, prompt, ctx).await?;

    match result.outcome {
        RunOutcome::Completed { output } => {
            println!("{}", output);
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Blocked(tripwire) => {
            eprintln!("Review stopped by guardrail: {}", tripwire.reason());
            Ok(ExitCode::from(2))
        }
    }
}

fn build_runner(config: &Config) -> Result<Runner> {
    let backend = match &config.openai_base_url {
        Some(url) => ChatCompletionsClient::with_base_url(config.openai_api_key.clone(), url.clone())?,
        None => ChatCompletionsClient::new(config.openai_api_key.clone())?,
    };
    let moderation = ModerationClient::new(&config.moderation)?;
    let guardrails = GuardrailEngine::new(Arc::new(moderation))
        .with_labels(ScanLabels {
            service: config.moderation.service.clone(),
            model: config.moderation.model.clone(),
        })
        .with_outage_policy(config.outage_policy);

    Ok(Runner::new(
        Arc::new(backend),
        guardrails,
        RunConfig {
            model: config.model.clone(),
            max_hops: config.max_hops,
            max_turns: config.max_turns,
            recheck_on_handoff: config.recheck_on_handoff,
            workspace_root: config.workspace_root.clone(),
        },
    ))
}

fn partial_prompt(files: &[String], diff: Option<&Path>) -> Result<String> {
    let mut prompt = String::from("Please analyze these code changes:\n\n");
    if let Some(path) = diff {
        let diff = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read diff {}", path.display()))?;
        prompt.push_str("Detailed Line Changes:\n");
        prompt.push_str(&diff);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Changed Files:\n");
    prompt.push_str(&files.join("\n"));
    Ok(prompt)
}

async fn full_prompt(root: &Path, ctx: &RunContext) -> Result<String> {
    let listing = ListWorkspaceFiles::default()
        .execute(json!({}), ToolContext { workspace_root: root, run: ctx })
        .await?;
    for warning in &listing.warnings {
        tracing::warn!("{}", warning);
    }

    let files: Vec<String> = listing
        .result
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|file| {
            let path = file["path"].as_str().unwrap_or_default();
            let lines = file["lines"].as_u64().unwrap_or_default();
            format!("{} ({} lines)", path, lines)
        })
        .collect();
    if files.is_empty() {
        anyhow::bail!("no readable files under {}", root.display());
    }

    Ok(format!(
        "Here are all of the files in this application:\n{}",
        files.join("\n")
    ))
}
