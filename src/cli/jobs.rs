//! Job submission and inspection commands.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use uuid::Uuid;

use crate::cli::dispatcher_from_env;
use crate::config::Config;
use crate::jobs::{JobState, Priority};

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Registered agent to run
    pub agent_id: String,

    /// Context document (JSON). Use `-` to read from stdin
    #[arg(short, long)]
    pub context: PathBuf,

    /// Queue priority: high, normal or low
    #[arg(short, long, default_value = "normal")]
    pub priority: Priority,
}

#[derive(Args, Debug, Clone)]
pub struct JobsArgs {
    /// Only show jobs in these states (repeatable). Defaults to in-flight jobs
    #[arg(short, long = "state")]
    pub states: Vec<JobState>,

    /// Maximum number of jobs to show
    #[arg(short = 'n', long, default_value = "50")]
    pub limit: usize,
}

pub async fn run_submit_command(config: &Config, args: SubmitArgs) -> anyhow::Result<()> {
    let raw = read_context(&args.context)?;
    let context: serde_json::Value =
        serde_json::from_str(&raw).context("context is not valid JSON")?;

    let dispatcher = dispatcher_from_env(config).await?;
    let job_id = dispatcher
        .submit_job_with_priority(&args.agent_id, context, args.priority)
        .await?;
    println!("{job_id}");
    Ok(())
}

pub async fn run_status_command(config: &Config, job_id: Uuid) -> anyhow::Result<()> {
    let dispatcher = dispatcher_from_env(config).await?;
    let status = dispatcher.get_job_status(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

pub async fn run_cancel_command(config: &Config, job_id: Uuid) -> anyhow::Result<()> {
    let dispatcher = dispatcher_from_env(config).await?;
    let status = dispatcher.cancel_job(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

pub async fn run_jobs_command(config: &Config, args: JobsArgs) -> anyhow::Result<()> {
    let states = if args.states.is_empty() {
        JobState::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect()
    } else {
        args.states
    };
    let dispatcher = dispatcher_from_env(config).await?;
    let jobs = dispatcher.list_jobs(&states, args.limit).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in jobs {
        let error = job.error.as_deref().unwrap_or("");
        println!(
            "{}  {:<10} {:<24} attempts={}  {}",
            job.job_id,
            job.state.as_str(),
            job.agent_id,
            job.attempt_count,
            error
        );
    }
    Ok(())
}

fn read_context(path: &PathBuf) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read context from stdin")?;
        Ok(raw)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read context file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn context_is_read_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"schema_version":"1"}}"#).unwrap();
        let raw = read_context(&file.path().to_path_buf()).unwrap();
        assert!(raw.contains("schema_version"));
    }

    #[test]
    fn missing_context_file_names_the_path() {
        let err = read_context(&PathBuf::from("/nonexistent/ctx.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ctx.json"));
    }
}
