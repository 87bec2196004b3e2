//! Context and result document schemas.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ContextError;

static ENV_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").unwrap());

/// Versioned context document handed to an agent.
///
/// The `schema_version` tag is required; unknown versions are rejected at
/// the store boundary rather than surfacing inside the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema_version")]
pub enum ContextPayload {
    #[serde(rename = "1")]
    V1(ContextV1),
}

impl ContextPayload {
    /// Parse and validate a submitted document.
    pub fn parse(value: serde_json::Value) -> Result<Self, ContextError> {
        let payload: ContextPayload =
            serde_json::from_value(value).map_err(|e| ContextError::Invalid(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        match self {
            Self::V1(v1) => v1.validate(),
        }
    }

    pub fn schema_version(&self) -> &'static str {
        match self {
            Self::V1(_) => "1",
        }
    }

    /// Variables the submitter wants in the agent's environment.
    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        match self {
            Self::V1(v1) => &v1.env_vars,
        }
    }

    pub fn callback_url(&self) -> Option<&str> {
        match self {
            Self::V1(v1) => v1.callback_url.as_deref(),
        }
    }
}

/// Version 1 of the context schema.
///
/// Secrets such as hub API keys are never part of a stored payload; they are
/// injected into the container environment at launch instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextV1 {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub user_vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl ContextV1 {
    fn validate(&self) -> Result<(), ContextError> {
        for key in self.env_vars.keys() {
            if !ENV_NAME_PATTERN.is_match(key) {
                return Err(ContextError::Invalid(format!(
                    "env var name '{key}' is not a valid identifier"
                )));
            }
        }
        if let Some(ref callback) = self.callback_url {
            let parsed = url::Url::parse(callback)
                .map_err(|e| ContextError::Invalid(format!("callback_url: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ContextError::Invalid(
                    "callback_url must be http or https".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

/// One chat message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// What actually lands at `/workspace/context.json`: the stored payload plus
/// the identifiers of this particular attempt.
#[derive(Debug, Serialize)]
pub struct ExecutionContext<'a> {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    pub agent_id: &'a str,
    pub attempt: u32,
    #[serde(flatten)]
    pub payload: &'a ContextPayload,
}

/// Result document an agent writes before exiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub stats: ExecutionStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    #[serde(default)]
    pub llm_calls: u64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub message_count: u64,
}

impl ExecutionOutput {
    /// Parse raw bytes written by an agent and check they belong to this
    /// execution.
    pub fn parse(
        raw: &[u8],
        execution_id: Uuid,
        agent_id: &str,
        max_bytes: usize,
    ) -> Result<Self, String> {
        if raw.len() > max_bytes {
            return Err(format!(
                "result is {} bytes, limit is {max_bytes}",
                raw.len()
            ));
        }
        let output: ExecutionOutput =
            serde_json::from_slice(raw).map_err(|e| format!("malformed result: {e}"))?;

        if let Some(ref id) = output.execution_id
            && id != &execution_id.to_string()
        {
            return Err(format!(
                "result names execution {id}, expected {execution_id}"
            ));
        }
        if let Some(ref id) = output.agent_id
            && id != agent_id
        {
            return Err(format!("result names agent {id}, expected {agent_id}"));
        }
        Ok(output)
    }
}
