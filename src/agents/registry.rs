//! Agent registry backends.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agents::{AgentDescriptor, Integration, ResourceLimits, validate_agent_id};
use crate::error::AgentError;

/// Metadata file every agent directory must contain.
pub const MANIFEST_FILE: &str = "agent.json";

/// Source of agent descriptors. Consulted before every launch.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Resolve a descriptor, failing with [`AgentError::NotFound`].
    async fn get(&self, agent_id: &str) -> Result<AgentDescriptor, AgentError>;

    /// All registered agents, sorted by id.
    async fn list(&self) -> Result<Vec<AgentDescriptor>, AgentError>;
}

/// On-disk `agent.json` layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    pub description: String,
    pub author: String,
    pub version: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub allowed_integrations: BTreeSet<Integration>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
}

impl AgentManifest {
    fn into_descriptor(
        self,
        agent_id: &str,
        code_dir: PathBuf,
        default_image: &str,
        default_limits: ResourceLimits,
    ) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: agent_id.to_string(),
            name: self.name,
            version: self.version,
            image: self.image.unwrap_or_else(|| default_image.to_string()),
            resource_limits: self.resource_limits.unwrap_or(default_limits),
            allowed_integrations: self.allowed_integrations,
            env_vars: self.env_vars,
            code_dir: Some(code_dir),
        }
    }
}

/// Registry backed by `<agents_dir>/<agent_id>/agent.json`.
///
/// Descriptors are cached on first load so a descriptor never changes under
/// a running dispatcher, even if the file on disk is edited.
pub struct FsAgentRegistry {
    agents_dir: PathBuf,
    default_image: String,
    default_limits: ResourceLimits,
    cache: RwLock<HashMap<String, AgentDescriptor>>,
}

impl FsAgentRegistry {
    pub fn new(
        agents_dir: impl Into<PathBuf>,
        default_image: impl Into<String>,
        default_limits: ResourceLimits,
    ) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            default_image: default_image.into(),
            default_limits,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn agents_dir(&self) -> &Path {
        &self.agents_dir
    }

    async fn load(&self, agent_id: &str) -> Result<AgentDescriptor, AgentError> {
        let code_dir = self.agents_dir.join(agent_id);
        let manifest_path = code_dir.join(MANIFEST_FILE);

        let raw = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::NotFound {
                    agent_id: agent_id.to_string(),
                });
            }
            Err(e) => return Err(AgentError::Io(e)),
        };

        let manifest: AgentManifest =
            serde_json::from_str(&raw).map_err(|e| AgentError::InvalidDescriptor {
                agent_id: agent_id.to_string(),
                reason: format!("{MANIFEST_FILE}: {e}"),
            })?;

        let descriptor = manifest.into_descriptor(
            agent_id,
            code_dir,
            &self.default_image,
            self.default_limits,
        );
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[async_trait]
impl AgentRegistry for FsAgentRegistry {
    async fn get(&self, agent_id: &str) -> Result<AgentDescriptor, AgentError> {
        if validate_agent_id(agent_id).is_err() {
            return Err(AgentError::NotFound {
                agent_id: agent_id.to_string(),
            });
        }

        if let Some(desc) = self.cache.read().await.get(agent_id) {
            return Ok(desc.clone());
        }

        let descriptor = self.load(agent_id).await?;
        let mut cache = self.cache.write().await;
        // Another task may have loaded it first; keep whichever landed first.
        let entry = cache
            .entry(agent_id.to_string())
            .or_insert(descriptor)
            .clone();
        Ok(entry)
    }

    async fn list(&self) -> Result<Vec<AgentDescriptor>, AgentError> {
        let mut entries = match tokio::fs::read_dir(&self.agents_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentError::Io(e)),
        };

        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(agent_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.get(&agent_id).await {
                Ok(desc) => agents.push(desc),
                Err(AgentError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Skipping unreadable agent");
                }
            }
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }
}

/// Registry held entirely in memory.
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<String, AgentDescriptor>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Re-registering an id is an error.
    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<(), AgentError> {
        descriptor.validate()?;
        let mut agents = self.agents.write().await;
        if agents.contains_key(&descriptor.agent_id) {
            return Err(AgentError::AlreadyRegistered {
                agent_id: descriptor.agent_id,
            });
        }
        agents.insert(descriptor.agent_id.clone(), descriptor);
        Ok(())
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn get(&self, agent_id: &str) -> Result<AgentDescriptor, AgentError> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound {
                agent_id: agent_id.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<AgentDescriptor>, AgentError> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }
}
