//! Process bootstrap: base directory resolution and `.env` loading.
//!
//! These run before any configuration is parsed, so they read the
//! environment directly and never fail hard.

use std::path::PathBuf;

/// Base directory for agent-hub state: `$AGENT_HUB_BASE_DIR`, or
/// `~/.agent-hub` when unset.
pub fn agent_hub_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENT_HUB_BASE_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-hub")
}

/// Load `.env` files into the process environment.
///
/// `~/.agent-hub/.env` is read first, then `./.env`. dotenvy never
/// overwrites variables that are already set, so the real environment wins
/// and the first file wins over the second.
pub fn load_agent_hub_env() {
    let base_env = agent_hub_base_dir().join(".env");
    if base_env.exists()
        && let Err(e) = dotenvy::from_path(&base_env)
    {
        eprintln!("Warning: failed to load {}: {}", base_env.display(), e);
    }
    let _ = dotenvy::dotenv();
}
