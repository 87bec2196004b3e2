//! Command-line interface.
//!
//! ```text
//! agent-hub run                      start the worker pool
//! agent-hub submit <agent> -c ctx    submit a job
//! agent-hub status <job_id>          show job status
//! agent-hub cancel <job_id>          cancel a job
//! agent-hub jobs --state running     list jobs
//! agent-hub health                   print the health report as JSON
//! agent-hub recover                  run crash recovery once
//! agent-hub agents list              list registered agents
//! ```

mod agents;
mod health;
mod jobs;

pub use agents::{AgentsCommand, run_agents_command};
pub use health::run_health_command;
pub use jobs::{JobsArgs, SubmitArgs, run_cancel_command, run_jobs_command, run_status_command, run_submit_command};

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::sandbox::DockerRuntime;

#[derive(Parser, Debug)]
#[command(name = "agent-hub", version, about = "Run untrusted agents in isolated containers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the dispatcher pool. Runs recovery first and stops on ctrl-c
    Run,

    /// Submit a job
    Submit(SubmitArgs),

    /// Show the status of a job
    Status {
        job_id: uuid::Uuid,
    },

    /// Cancel a queued or running job
    Cancel {
        job_id: uuid::Uuid,
    },

    /// List jobs by state
    Jobs(JobsArgs),

    /// Print the health report as JSON
    Health,

    /// Run crash recovery once. Refused while a dispatcher is running
    Recover,

    /// Inspect registered agents
    #[command(subcommand)]
    Agents(AgentsCommand),
}

/// Build a dispatcher from the environment, backed by the local container
/// engine. The engine is only contacted when something needs it.
pub async fn dispatcher_from_env(config: &Config) -> anyhow::Result<Dispatcher> {
    let runtime = Arc::new(DockerRuntime::new());
    Ok(Dispatcher::from_config(config, runtime).await?)
}

/// Dispatch a parsed command.
pub async fn run_command(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Run => run_dispatcher(&config).await,
        Command::Submit(args) => run_submit_command(&config, args).await,
        Command::Status { job_id } => run_status_command(&config, job_id).await,
        Command::Cancel { job_id } => run_cancel_command(&config, job_id).await,
        Command::Jobs(args) => run_jobs_command(&config, args).await,
        Command::Health => run_health_command(&config).await,
        Command::Recover => {
            let dispatcher = dispatcher_from_env(&config).await?;
            let report = dispatcher.recover().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Agents(cmd) => run_agents_command(&config, cmd).await,
    }
}

async fn run_dispatcher(config: &Config) -> anyhow::Result<()> {
    let detection = crate::sandbox::check_docker().await;
    if let Some(hint) = detection.hint() {
        anyhow::bail!(
            "container runtime {}: {}\n{}",
            detection.status.as_str(),
            detection.runtime.map(|r| r.to_string()).unwrap_or_default(),
            hint
        );
    }

    let dispatcher = dispatcher_from_env(config).await?;
    dispatcher
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;
    Ok(())
}
