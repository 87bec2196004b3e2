//! Health and diagnostics command.
//!
//! Prints the dispatcher health report as JSON. When the container engine
//! is not answering, adds platform-specific guidance on stderr.

use serde_json::json;

use crate::cli::dispatcher_from_env;
use crate::config::{Config, DatabaseBackend};
use crate::sandbox::check_docker;

/// Run the health command. Exits non-zero when unhealthy.
pub async fn run_health_command(config: &Config) -> anyhow::Result<()> {
    let dispatcher = dispatcher_from_env(config).await?;

    let (healthy, report) = match dispatcher.health_check().await {
        Ok(report) => (report.is_healthy(), serde_json::to_value(&report)?),
        Err(e) => (false, json!({ "error": e.to_string() })),
    };

    let backend = match config.database.backend {
        DatabaseBackend::LibSql => format!("libsql ({})", config.database.libsql_path().display()),
        DatabaseBackend::Memory => "memory".to_string(),
    };
    let output = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "healthy": healthy,
        "database": backend,
        "report": report,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if !healthy {
        let detection = check_docker().await;
        if let Some(hint) = detection.hint() {
            eprintln!("Container runtime {}.", detection.status.as_str());
            eprintln!("{hint}");
        }
        anyhow::bail!("agent-hub is unhealthy");
    }
    Ok(())
}
