mod script;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use steadfast_core::policy::policy_schema;
use steadfast_core::SessionPolicy;
use steadfast_runtime::{Event, SessionError, SessionOrchestrator};

use crate::script::Script;

/// Steadfast - resilient orchestration for token-streaming sources
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted scenario and print its event log
    Run {
        /// Scenario file (YAML)
        #[arg(short, long)]
        script: PathBuf,

        /// Session policy file (YAML or JSON)
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Suppress the event log; print only the final content
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate a policy file and print the effective policy
    Validate {
        /// Policy file (YAML or JSON)
        policy: PathBuf,
    },

    /// Print the policy JSON Schema
    Schema,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("steadfast=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            policy,
            quiet,
        } => run(script, policy, quiet).await,
        Commands::Validate { policy } => validate(policy),
        Commands::Schema => {
            println!("{}", policy_schema());
            Ok(())
        }
    }
}

async fn run(script: PathBuf, policy: Option<PathBuf>, quiet: bool) -> Result<()> {
    let script = Script::from_file(&script)?;
    let policy = match policy {
        Some(path) => SessionPolicy::from_file(&path)
            .with_context(|| format!("Failed to load policy {}", path.display()))?,
        None => SessionPolicy::default(),
    };

    let mut builder = SessionOrchestrator::builder()
        .policy(policy)
        .context(script.context.clone());
    if let Some(id) = &script.session_id {
        builder = builder.session_id(id.as_str());
    }
    for source in script.sources() {
        builder = builder.source(source);
    }
    if let Some(guardrail) = script.guardrail()? {
        builder = builder.guardrail(Arc::new(guardrail));
    }
    if !quiet {
        builder = builder.handler(Arc::new(print_event));
    }

    let orchestrator = builder.build()?;
    info!(session_id = orchestrator.session_id(), "Running scenario");

    match orchestrator.run(|_| {}).await {
        Ok(state) => {
            println!("{}", state.content);
            info!(
                tokens = state.token_count,
                attempts = state.attempt,
                source_index = state.source_index,
                "Session complete"
            );
            Ok(())
        }
        Err(SessionError::Halted { error, state }) => {
            println!("{}", state.content);
            error!(tokens = state.token_count, "Session halted");
            Err(error).context("Session halted")
        }
        Err(e) => Err(e.into()),
    }
}

/// Event log line: one JSON object per event.
fn print_event(event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{line}");
        }
        Err(e) => error!(error = %e, "Failed to serialize event"),
    }
}

fn validate(path: PathBuf) -> Result<()> {
    let policy = SessionPolicy::from_file(&path)
        .with_context(|| format!("Invalid policy {}", path.display()))?;
    println!("{}", serde_yaml::to_string(&policy)?);
    Ok(())
}
