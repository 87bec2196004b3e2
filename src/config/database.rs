use std::path::PathBuf;

use secrecy::SecretString;

use crate::bootstrap::agent_hub_base_dir;
use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Which job store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseBackend {
    /// libSQL/Turso embedded database (default, durable).
    #[default]
    LibSql,
    /// Process-local store. Nothing survives a restart.
    Memory,
}

impl std::fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LibSql => write!(f, "libsql"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "libsql" | "turso" | "sqlite" => Ok(Self::LibSql),
            "memory" | "mem" | "in-memory" => Ok(Self::Memory),
            _ => Err(format!(
                "invalid database backend '{}', expected 'libsql' or 'memory'",
                s
            )),
        }
    }
}

/// Job store configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Path to local libSQL database file (default: ~/.agent-hub/agent-hub.db).
    pub libsql_path: Option<PathBuf>,
    /// Turso cloud URL for remote sync (optional).
    pub libsql_url: Option<String>,
    /// Turso auth token (required when libsql_url is set).
    pub libsql_auth_token: Option<SecretString>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::LibSql,
            libsql_path: None,
            libsql_url: None,
            libsql_auth_token: None,
        }
    }
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend: DatabaseBackend = if let Some(b) = optional_env("DATABASE_BACKEND")? {
            b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: e,
            })?
        } else {
            DatabaseBackend::default()
        };

        let libsql_path = optional_env("LIBSQL_PATH")?.map(PathBuf::from);
        let libsql_url = optional_env("LIBSQL_URL")?;
        let libsql_auth_token = optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from);

        if libsql_url.is_some() && libsql_auth_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "LIBSQL_AUTH_TOKEN".to_string(),
                hint: "LIBSQL_AUTH_TOKEN is required when LIBSQL_URL is set".to_string(),
            });
        }

        Ok(Self {
            backend,
            libsql_path,
            libsql_url,
            libsql_auth_token,
        })
    }

    /// Effective database file path.
    pub fn libsql_path(&self) -> PathBuf {
        self.libsql_path.clone().unwrap_or_else(default_libsql_path)
    }
}

/// Default libSQL database path (~/.agent-hub/agent-hub.db).
pub fn default_libsql_path() -> PathBuf {
    agent_hub_base_dir().join("agent-hub.db")
}
