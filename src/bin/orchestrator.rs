//! Agent Orchestrator CLI
//!
//! Routes requests through the orchestration engine, inspects the model
//! provider pool and validates configuration files.

use std::path::PathBuf;
use std::time::Duration;

use agent_orchestrator::{Orchestrator, OrchestratorConfig, UserRequest};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Agent Orchestrator - Route requests to cooperating agents")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a request would be routed
    Classify {
        /// Request text
        text: String,
    },

    /// Route, plan and execute a request
    Run {
        /// Request text
        text: String,

        /// Print the full workflow state instead of the result
        #[arg(long)]
        full: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Show model provider health
    Providers {
        /// Probe every provider before reporting
        #[arg(long)]
        probe: bool,
    },

    /// Validate configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    if let Err(e) = dotenv() {
        eprintln!("Note: no .env file loaded: {}", e);
    }

    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "agent_orchestrator=debug"
    } else {
        "agent_orchestrator=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = OrchestratorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    debug!(agents = config.agents.len(), providers = config.providers.len(), "Configuration loaded");

    match cli.command {
        Commands::CheckConfig => {
            info!("✅ Configuration is valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Classify { text } => {
            let orchestrator = Orchestrator::from_config(config).await?;
            let intent = orchestrator.router().classify(&UserRequest::new(text)).await;
            println!("{}", serde_json::to_string_pretty(&intent)?);
        }

        Commands::Run { text, full, timeout } => {
            let orchestrator = Orchestrator::from_config(config).await?;
            let request = UserRequest::new(text);
            let request_id = request.request_id;

            let handled = match tokio::time::timeout(Duration::from_secs(timeout), orchestrator.handle(request)).await {
                Ok(handled) => handled?,
                Err(_) => {
                    error!(%request_id, timeout, "❌ Request did not finish in time");
                    orchestrator.shutdown(Duration::from_secs(5)).await;
                    anyhow::bail!("request {} timed out after {}s", request_id, timeout);
                }
            };

            let summary = handled.state.summary();
            info!(
                workflow_id = %summary.workflow_id,
                status = %summary.status,
                steps = summary.steps_dispatched,
                elapsed_ms = summary.elapsed_ms,
                "Workflow finished"
            );
            if full {
                println!("{}", serde_json::to_string_pretty(&handled.state)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&handled.state.result)?);
            }
        }

        Commands::Providers { probe } => {
            let orchestrator = Orchestrator::from_config(config).await?;
            let health = if probe {
                orchestrator.pool().health_check().await
            } else {
                orchestrator.pool().health()
            };
            println!("{}", serde_json::to_string_pretty(&health)?);

            let failovers = orchestrator.pool().failover_events(20);
            if !failovers.is_empty() {
                println!("{}", serde_json::to_string_pretty(&failovers)?);
            }
        }
    }

    Ok(())
}
