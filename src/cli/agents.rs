//! Agent registry commands.

use clap::Subcommand;

use crate::agents::{AgentRegistry, FsAgentRegistry};
use crate::config::Config;

#[derive(Subcommand, Debug, Clone)]
pub enum AgentsCommand {
    /// List registered agents
    List {
        /// Print full descriptors as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn run_agents_command(config: &Config, cmd: AgentsCommand) -> anyhow::Result<()> {
    let registry = FsAgentRegistry::new(
        &config.context.agents_dir,
        &config.sandbox.image,
        config.sandbox.default_limits,
    );
    match cmd {
        AgentsCommand::List { json } => {
            let agents = registry.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
                return Ok(());
            }
            if agents.is_empty() {
                println!("No agents in {}", registry.agents_dir().display());
                return Ok(());
            }
            for agent in agents {
                let integrations: Vec<&str> =
                    agent.allowed_integrations.iter().map(|i| i.as_str()).collect();
                println!(
                    "{:<24} v{:<10} {:<32} {}MB/{}m cpu/{}s  [{}]",
                    agent.agent_id,
                    agent.version,
                    agent.image,
                    agent.resource_limits.memory_mb,
                    agent.resource_limits.cpu_millis,
                    agent.resource_limits.timeout_secs,
                    integrations.join(", ")
                );
            }
        }
    }
    Ok(())
}
