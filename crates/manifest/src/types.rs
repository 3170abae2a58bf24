//! Core types for the trik contract.
//!
//! A trik is a self-contained skill package described by a `manifest.json`
//! file. The manifest is the single source of truth for the trik's actions,
//! capabilities, limits, and entry point. All field names match the JSON
//! wire format (camelCase).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default session lifetime: 30 minutes.
pub const DEFAULT_MAX_DURATION_MS: i64 = 30 * 60 * 1000;

/// Default session history cap.
pub const DEFAULT_MAX_HISTORY_ENTRIES: usize = 20;

/// Default storage quota: 100 MiB.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Runtime environment for trik execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrikRuntime {
    /// Default: executed by the external Node.js worker subprocess
    #[default]
    Node,
    /// Executed by the external Python worker subprocess
    Python,
}

/// Response mode for an action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Structured agent data rendered into agent-visible text via a template
    #[default]
    Template,
    /// Content bypasses the agent and is delivered via a redeemable reference
    Passthrough,
}

/// Entry point configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrikEntry {
    /// Module path relative to the trik directory
    pub module: String,
    /// Exported symbol implementing the graph contract
    pub export: String,
    /// Target runtime, defaulting to `node` when absent
    #[serde(default)]
    pub runtime: TrikRuntime,
}

/// Session capabilities for multi-turn conversations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCapabilities {
    pub enabled: bool,
    /// Maximum session lifetime in milliseconds
    #[serde(default)]
    pub max_duration_ms: Option<i64>,
    /// Maximum number of history entries kept per session
    #[serde(default)]
    pub max_history_entries: Option<usize>,
}

impl SessionCapabilities {
    pub fn max_duration_ms(&self) -> i64 {
        self.max_duration_ms.unwrap_or(DEFAULT_MAX_DURATION_MS)
    }

    pub fn max_history_entries(&self) -> usize {
        self.max_history_entries.unwrap_or(DEFAULT_MAX_HISTORY_ENTRIES)
    }
}

/// Storage capabilities for persistent data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageCapabilities {
    pub enabled: bool,
    /// Cumulative serialized-size quota in bytes
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
    /// Whether data survives process restarts
    #[serde(default)]
    pub persistent: Option<bool>,
}

impl StorageCapabilities {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes.unwrap_or(DEFAULT_MAX_SIZE_BYTES)
    }
}

/// Trik capabilities declared in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrikCapabilities {
    /// Tools the trik is allowed to use
    pub tools: Vec<String>,
    /// Whether the trik may interrupt execution with clarification questions
    pub can_request_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageCapabilities>,
}

impl TrikCapabilities {
    /// Whether session support is declared and enabled.
    pub fn session_enabled(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.enabled)
    }

    /// Whether persistent storage is declared and enabled.
    pub fn storage_enabled(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.enabled)
    }
}

/// Resource limits for trik execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrikLimits {
    /// Wall-clock budget for a single action in milliseconds
    pub max_execution_time_ms: u64,
    pub max_llm_calls: u32,
    pub max_tool_calls: u32,
}

/// Configuration requirement declared in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigRequirement {
    pub key: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Configuration requirements for a trik.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrikConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<ConfigRequirement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<Vec<ConfigRequirement>>,
}

impl TrikConfig {
    /// Default values from optional config declarations.
    pub fn defaults(&self) -> BTreeMap<String, String> {
        self.optional
            .iter()
            .flatten()
            .filter_map(|req| req.default.clone().map(|d| (req.key.clone(), d)))
            .collect()
    }
}

/// Response template for agent responses.
///
/// Templates contain `{{field}}` placeholders substituted with agent data
/// fields at delivery time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseTemplate {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A single named action exposed by a trik.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the action input
    pub input_schema: Value,
    pub response_mode: ResponseMode,
    /// JSON Schema for agent data (template mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_data_schema: Option<Value>,
    /// Named templates rendered from agent data (template mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_templates: Option<BTreeMap<String, ResponseTemplate>>,
    /// JSON Schema for user content (passthrough mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_content_schema: Option<Value>,
}

/// The trik manifest - the contract between a trik and the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrikManifest {
    /// Unique identifier, e.g. `@scope/trik-name`
    pub id: String,
    pub name: String,
    pub description: String,
    /// Semantic version (`major.minor.patch`)
    pub version: String,
    /// Action name to definition, ordered by name
    pub actions: BTreeMap<String, ActionDefinition>,
    pub capabilities: TrikCapabilities,
    pub limits: TrikLimits,
    pub entry: TrikEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TrikConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

impl TrikManifest {
    /// Default config values declared in the manifest, if any.
    pub fn config_defaults(&self) -> BTreeMap<String, String> {
        self.config.as_ref().map(TrikConfig::defaults).unwrap_or_default()
    }
}

/// A clarification question raised by a trik mid-execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationQuestion {
    pub question_id: String,
    pub question_text: String,
    /// One of `text`, `multiple_choice`, `boolean`
    pub question_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// User content produced by a passthrough action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughContent {
    pub content_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Receipt returned to the agent after passthrough delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughDeliveryReceipt {
    pub delivered: bool,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// One-time-delivery ticket for passthrough content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserContentReference {
    pub r#ref: String,
    pub trik_id: String,
    pub action_name: String,
    pub content: PassthroughContent,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Entry in the session history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryEntry {
    pub timestamp: i64,
    pub action: String,
    pub input: Value,
    pub agent_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_content: Option<Value>,
}

/// Session state maintained by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrikSession {
    pub session_id: String,
    pub trik_id: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub expires_at: i64,
    pub history: Vec<SessionHistoryEntry>,
}

/// Session context passed to triks in graph input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    pub history: Vec<SessionHistoryEntry>,
}

impl From<&TrikSession> for SessionContext {
    fn from(session: &TrikSession) -> Self {
        Self { session_id: session.session_id.clone(), history: session.history.clone() }
    }
}
