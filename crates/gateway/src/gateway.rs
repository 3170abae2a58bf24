//! The gateway: loads triks, validates traffic at every boundary, and
//! dispatches actions to in-process graphs or the subprocess worker.
//!
//! `execute` never returns an `Err` for per-invocation failures. Anything
//! the calling agent can react to (bad input, invalid output, timeouts,
//! trik crashes) comes back as a [`GatewayResult::Error`] so the agent loop
//! stays uniform. `GatewayError` is reserved for embedder mistakes such as
//! loading a disallowed trik.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;
use trikgate_manifest::{
    parse_manifest, ActionDefinition, ClarificationQuestion, PassthroughContent,
    PassthroughDeliveryReceipt, ResponseMode, ResponseTemplate, SchemaValidator, SessionContext,
    TrikManifest, TrikSession,
};
use trikgate_protocol::InvokeResult;
use trikgate_store::{FileStorageProvider, StorageContext, StorageProvider};

use crate::config::{ConfigStore, FileConfigStore};
use crate::content::ContentReferenceStore;
use crate::error::{GatewayError, Result};
use crate::graph::{GraphInput, TrikGraph};
use crate::session::{InMemorySessionStore, SessionStore};
use crate::worker::{WorkerConfig, WorkerError, WorkerManager};

/// Grace period granted to the worker on shutdown.
const SHUTDOWN_GRACE_MS: u64 = 5000;

/// Callback fired when a trik asks a clarification question.
pub type ClarificationCallback = Arc<dyn Fn(&str, &[ClarificationQuestion]) + Send + Sync>;

/// Gateway-wide configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// When set, only these trik ids may be loaded
    pub allowed_triks: Option<Vec<String>>,
    /// Refuse to load triks whose required config keys are missing
    pub validate_config: bool,
    pub worker: WorkerConfig,
    pub on_clarification: Option<ClarificationCallback>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allowed_triks: None,
            validate_config: true,
            worker: WorkerConfig::default(),
            on_clarification: None,
        }
    }
}

/// Classified failure reported inside an execution result.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    TrikNotFound,
    InvalidInput,
    InvalidOutput,
    Timeout,
    ExecutionError,
    NotAllowed,
    NetworkError,
    ClarificationNeeded,
}

/// What an execution produced, from the calling agent's point of view.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GatewayResult {
    /// Structured data for the agent, with the resolved template text
    Template { agent_data: Value, template_text: Option<String> },
    /// A redeemable reference; the content itself never reaches the agent
    Passthrough {
        user_content_ref: String,
        content_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// The trik paused and wants answers before continuing
    Clarification { session_id: String, questions: Vec<ClarificationQuestion> },
    Error { code: GatewayErrorCode, message: String },
}

impl GatewayResult {
    fn error(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self::Error { code, message: message.into() }
    }
}

/// Execution result together with the session it ran under.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutcome {
    pub result: GatewayResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ExecuteOutcome {
    fn bare(result: GatewayResult) -> Self {
        Self { result, session_id: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Resume this session instead of creating a fresh one
    pub session_id: Option<String>,
}

/// An action surfaced as an agent tool.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// `<trik-id>:<action-name>`
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub response_mode: ResponseMode,
}

/// Summary of a loaded trik for discovery surfaces.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrikInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tools: Vec<ToolDefinition>,
    pub session_enabled: bool,
}

struct LoadedTrik {
    manifest: TrikManifest,
    path: PathBuf,
}

/// Normalized action output, whichever side produced it.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TrikOutput {
    response_mode: Option<ResponseMode>,
    agent_data: Option<Value>,
    user_content: Option<PassthroughContent>,
    end_session: bool,
    needs_clarification: bool,
    clarification_questions: Option<Vec<ClarificationQuestion>>,
}

impl TrikOutput {
    fn from_invoke(result: InvokeResult) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(result)?)
    }
}

/// Substitute `{{field}}` placeholders from agent data.
///
/// Strings substitute verbatim, other values as their JSON text. Missing
/// and null fields leave the placeholder untouched so the agent can see
/// what the template expected.
pub fn resolve_template(template: &ResponseTemplate, agent_data: &Value) -> String {
    static PLACEHOLDER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("placeholder regex"));

    PLACEHOLDER
        .replace_all(&template.text, |caps: &Captures<'_>| {
            let field = &caps[1];
            match agent_data.get(field) {
                None | Some(Value::Null) => format!("{{{{{field}}}}}"),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(stripped),
        None => path.to_path_buf(),
    }
}

/// The trik gateway.
pub struct TrikGateway {
    config: GatewayConfig,
    triks: RwLock<HashMap<String, Arc<LoadedTrik>>>,
    graphs: RwLock<HashMap<String, Arc<dyn TrikGraph>>>,
    validator: SchemaValidator,
    content: ContentReferenceStore,
    sessions: Arc<dyn SessionStore>,
    config_store: Arc<dyn ConfigStore>,
    storage: Arc<dyn StorageProvider>,
    worker: tokio::sync::Mutex<Option<Arc<WorkerManager>>>,
    config_loaded: tokio::sync::OnceCell<()>,
}

impl TrikGateway {
    /// Gateway with the default stores: in-memory sessions, file-backed
    /// secrets, and file-backed storage under `~/.trikhub/storage`.
    pub fn new(config: GatewayConfig) -> Self {
        let storage_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".trikhub")
            .join("storage");

        Self {
            config,
            triks: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
            validator: SchemaValidator::new(),
            content: ContentReferenceStore::new(),
            sessions: Arc::new(InMemorySessionStore::new()),
            config_store: Arc::new(FileConfigStore::new()),
            storage: Arc::new(FileStorageProvider::new(storage_dir)),
            worker: tokio::sync::Mutex::new(None),
            config_loaded: tokio::sync::OnceCell::new(),
        }
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_config_store(mut self, config_store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = config_store;
        self
    }

    pub fn with_storage_provider(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = storage;
        self
    }

    /// Bind an in-process graph to a trik id. Actions of that trik run
    /// inside this process instead of the subprocess worker.
    pub fn register_graph(&self, trik_id: &str, graph: Arc<dyn TrikGraph>) {
        self.graphs
            .write()
            .expect("graph registry poisoned")
            .insert(trik_id.to_string(), graph);
    }

    async fn ensure_config_loaded(&self) -> Result<()> {
        self.config_loaded
            .get_or_try_init(|| async { self.config_store.load().await })
            .await?;
        Ok(())
    }

    /// Load a trik from a directory containing `manifest.json`.
    #[instrument(skip(self), fields(path = %trik_path.display()))]
    pub async fn load_trik(&self, trik_path: &Path) -> Result<TrikManifest> {
        let manifest_path = trik_path.join("manifest.json");
        let bytes = tokio::fs::read(&manifest_path).await?;
        let document: Value = serde_json::from_slice(&bytes)?;
        let manifest = parse_manifest(&document)?;

        if let Some(allowed) = &self.config.allowed_triks {
            if !allowed.contains(&manifest.id) {
                return Err(GatewayError::NotAllowed(manifest.id));
            }
        }

        if self.config.validate_config {
            self.ensure_config_loaded().await?;
            let missing = self.config_store.validate_config(&manifest)?;
            if !missing.is_empty() {
                return Err(GatewayError::MissingConfig {
                    trik_id: manifest.id.clone(),
                    keys: missing,
                });
            }
        }

        tracing::info!(trik_id = %manifest.id, version = %manifest.version, "trik loaded");
        self.triks.write().expect("trik registry poisoned").insert(
            manifest.id.clone(),
            Arc::new(LoadedTrik { manifest: manifest.clone(), path: trik_path.to_path_buf() }),
        );
        Ok(manifest)
    }

    /// Load every trik under a directory.
    ///
    /// The directory may mix scoped layouts (`@scope/name/manifest.json`)
    /// and flat ones (`name/manifest.json`). A leading `~` expands to the
    /// home directory. Triks that fail to load are logged and skipped.
    pub async fn load_triks_from_directory(&self, directory: &Path) -> Result<Vec<TrikManifest>> {
        let directory = expand_home(directory);
        let mut loaded = Vec::new();

        let mut entries = tokio::fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            if entry.file_name().to_string_lossy().starts_with('@') {
                let mut scoped = tokio::fs::read_dir(&path).await?;
                while let Some(scoped_entry) = scoped.next_entry().await? {
                    let trik_path = scoped_entry.path();
                    if trik_path.is_dir() && trik_path.join("manifest.json").is_file() {
                        self.try_load(&trik_path, &mut loaded).await;
                    }
                }
            } else if path.join("manifest.json").is_file() {
                self.try_load(&path, &mut loaded).await;
            }
        }

        tracing::info!(count = loaded.len(), directory = %directory.display(), "triks loaded");
        Ok(loaded)
    }

    async fn try_load(&self, trik_path: &Path, loaded: &mut Vec<TrikManifest>) {
        match self.load_trik(trik_path).await {
            Ok(manifest) => loaded.push(manifest),
            Err(e) => tracing::warn!(path = %trik_path.display(), "failed to load trik: {e}"),
        }
    }

    /// Execute a trik action.
    #[instrument(skip(self, input, options))]
    pub async fn execute(
        &self,
        trik_id: &str,
        action_name: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> ExecuteOutcome {
        let loaded = self.triks.read().expect("trik registry poisoned").get(trik_id).cloned();
        let Some(loaded) = loaded else {
            return ExecuteOutcome::bare(GatewayResult::error(
                GatewayErrorCode::TrikNotFound,
                format!("Trik \"{trik_id}\" is not loaded. Call load_trik() first."),
            ));
        };
        let manifest = &loaded.manifest;

        let Some(action) = manifest.actions.get(action_name) else {
            let available: Vec<&str> = manifest.actions.keys().map(String::as_str).collect();
            return ExecuteOutcome::bare(GatewayResult::error(
                GatewayErrorCode::InvalidInput,
                format!(
                    "Action \"{action_name}\" not found. Available: {}",
                    available.join(", ")
                ),
            ));
        };

        match self.validator.validate(
            &format!("{trik_id}:{action_name}:input"),
            &action.input_schema,
            &input,
        ) {
            Ok(validation) if !validation.valid => {
                return ExecuteOutcome::bare(GatewayResult::error(
                    GatewayErrorCode::InvalidInput,
                    format!("Invalid input: {}", validation.errors.join(", ")),
                ));
            }
            Err(e) => {
                return ExecuteOutcome::bare(GatewayResult::error(
                    GatewayErrorCode::ExecutionError,
                    e.to_string(),
                ));
            }
            Ok(_) => {}
        }

        // Resolve or create the session before dispatch; an expired or
        // unknown session id silently becomes a fresh session.
        let mut session: Option<TrikSession> = None;
        if manifest.capabilities.session_enabled() {
            if let Some(session_id) = &options.session_id {
                session = self.sessions.get(session_id).await;
            }
            if session.is_none() {
                session = Some(
                    self.sessions
                        .create(trik_id, manifest.capabilities.session.as_ref())
                        .await,
                );
            }
        }
        let session_id = session.as_ref().map(|s| s.session_id.clone());

        let output =
            match self.run_action(&loaded, action_name, input.clone(), session.as_ref()).await {
                Ok(output) => output,
                Err(result) => return ExecuteOutcome { result, session_id },
            };

        // Clarifications short-circuit: no history is committed, the
        // session stays as it was so the follow-up lands in context.
        if output.needs_clarification {
            let questions = output.clarification_questions.unwrap_or_default();
            if let Some(callback) = &self.config.on_clarification {
                callback(trik_id, &questions);
            }
            return ExecuteOutcome {
                result: GatewayResult::Clarification {
                    session_id: session_id.clone().unwrap_or_default(),
                    questions,
                },
                session_id,
            };
        }

        self.process_result(trik_id, action_name, action, session, output, input).await
    }

    /// Dispatch to the in-process graph when one is registered, otherwise
    /// to the subprocess worker. Failures come back as ready-made results.
    async fn run_action(
        &self,
        loaded: &LoadedTrik,
        action_name: &str,
        input: Value,
        session: Option<&TrikSession>,
    ) -> std::result::Result<TrikOutput, GatewayResult> {
        let manifest = &loaded.manifest;
        let execution_error =
            |message: String| GatewayResult::error(GatewayErrorCode::ExecutionError, message);

        if let Err(e) = self.ensure_config_loaded().await {
            return Err(execution_error(e.to_string()));
        }
        let config = self
            .config_store
            .get_for_trik(&manifest.id)
            .map_err(|e| execution_error(e.to_string()))?;

        let storage: Option<Arc<dyn StorageContext>> =
            if manifest.capabilities.storage_enabled() {
                let context = self
                    .storage
                    .for_trik(&manifest.id, manifest.capabilities.storage.as_ref())
                    .await
                    .map_err(|e| execution_error(e.to_string()))?;
                Some(context)
            } else {
                None
            };

        let timeout_ms = manifest.limits.max_execution_time_ms;
        let graph = self.graphs.read().expect("graph registry poisoned").get(&manifest.id).cloned();

        if let Some(graph) = graph {
            let graph_input = GraphInput {
                action: action_name.to_string(),
                input,
                session: session.map(SessionContext::from),
                config: config.to_map(),
                storage,
            };
            let invoked =
                tokio::time::timeout(Duration::from_millis(timeout_ms), graph.invoke(graph_input))
                    .await;
            return match invoked {
                Err(_) => Err(GatewayResult::error(
                    GatewayErrorCode::Timeout,
                    format!("Execution timed out after {timeout_ms}ms"),
                )),
                Ok(Err(message)) => Err(execution_error(message)),
                Ok(Ok(value)) => serde_json::from_value::<TrikOutput>(value)
                    .map_err(|e| execution_error(format!("Malformed trik output: {e}"))),
            };
        }

        let worker = self.worker().await;
        let session_value =
            session.and_then(|s| serde_json::to_value(SessionContext::from(s)).ok());
        let invoked = worker
            .invoke(
                &loaded.path.to_string_lossy(),
                action_name,
                input,
                session_value,
                Some(config.to_map()),
                storage,
                Some(timeout_ms),
            )
            .await;
        match invoked {
            Ok(result) => TrikOutput::from_invoke(result)
                .map_err(|e| execution_error(format!("Malformed trik output: {e}"))),
            Err(WorkerError::InvokeTimeout(ms)) => Err(GatewayResult::error(
                GatewayErrorCode::Timeout,
                format!("Execution timed out after {ms}ms"),
            )),
            Err(WorkerError::Rpc { message, .. }) => Err(execution_error(message)),
            Err(e) => Err(execution_error(e.to_string())),
        }
    }

    async fn worker(&self) -> Arc<WorkerManager> {
        let mut guard = self.worker.lock().await;
        match &*guard {
            Some(worker) => Arc::clone(worker),
            None => {
                let worker = Arc::new(WorkerManager::new(self.config.worker.clone()));
                *guard = Some(Arc::clone(&worker));
                worker
            }
        }
    }

    /// Post-process a successful dispatch: validate the output against the
    /// action's schemas and build the agent-facing result. The session is
    /// only touched at the very end, so a rejected output never pollutes
    /// history and `endSession` only fires for output the agent will see.
    async fn process_result(
        &self,
        trik_id: &str,
        action_name: &str,
        action: &ActionDefinition,
        session: Option<TrikSession>,
        output: TrikOutput,
        input: Value,
    ) -> ExecuteOutcome {
        let effective_mode = output.response_mode.unwrap_or(action.response_mode);
        let session_id = session.as_ref().map(|s| s.session_id.clone());

        let result = match effective_mode {
            ResponseMode::Passthrough => {
                self.finish_passthrough(trik_id, action_name, action, &output)
            }
            ResponseMode::Template => self.finish_template(trik_id, action_name, action, &output),
        };

        let result = match result {
            Ok(result) => result,
            Err(error) => return ExecuteOutcome { result: error, session_id },
        };

        let session_id = match &session {
            Some(session) if output.end_session => {
                self.sessions.delete(&session.session_id).await;
                None
            }
            Some(session) => {
                let agent_data = output.agent_data.clone().unwrap_or(Value::Null);
                let user_content =
                    output.user_content.as_ref().and_then(|c| serde_json::to_value(c).ok());
                if let Err(e) = self
                    .sessions
                    .add_history(&session.session_id, action_name, input, agent_data, user_content)
                    .await
                {
                    tracing::warn!(session_id = %session.session_id, "history not recorded: {e}");
                }
                Some(session.session_id.clone())
            }
            None => None,
        };

        ExecuteOutcome { result, session_id }
    }

    fn finish_passthrough(
        &self,
        trik_id: &str,
        action_name: &str,
        action: &ActionDefinition,
        output: &TrikOutput,
    ) -> std::result::Result<GatewayResult, GatewayResult> {
        let Some(user_content) = &output.user_content else {
            return Err(GatewayResult::error(
                GatewayErrorCode::InvalidOutput,
                "Passthrough mode requires userContent",
            ));
        };

        if let Some(schema) = &action.user_content_schema {
            let document = serde_json::to_value(user_content).unwrap_or(Value::Null);
            match self.validator.validate(
                &format!("{trik_id}:{action_name}:userContent"),
                schema,
                &document,
            ) {
                Ok(validation) if !validation.valid => {
                    return Err(GatewayResult::error(
                        GatewayErrorCode::InvalidOutput,
                        format!("Invalid userContent: {}", validation.errors.join(", ")),
                    ));
                }
                Err(e) => {
                    return Err(GatewayResult::error(
                        GatewayErrorCode::ExecutionError,
                        e.to_string(),
                    ));
                }
                Ok(_) => {}
            }
        }

        let reference = self.content.store(trik_id, action_name, user_content.clone());
        Ok(GatewayResult::Passthrough {
            user_content_ref: reference,
            content_type: user_content.content_type.clone(),
            metadata: user_content.metadata.clone(),
        })
    }

    fn finish_template(
        &self,
        trik_id: &str,
        action_name: &str,
        action: &ActionDefinition,
        output: &TrikOutput,
    ) -> std::result::Result<GatewayResult, GatewayResult> {
        let Some(agent_data) = &output.agent_data else {
            return Err(GatewayResult::error(
                GatewayErrorCode::InvalidOutput,
                "Template mode requires agentData",
            ));
        };

        if let Some(schema) = &action.agent_data_schema {
            match self.validator.validate(
                &format!("{trik_id}:{action_name}:agentData"),
                schema,
                agent_data,
            ) {
                Ok(validation) if !validation.valid => {
                    return Err(GatewayResult::error(
                        GatewayErrorCode::InvalidOutput,
                        format!("Invalid agentData: {}", validation.errors.join(", ")),
                    ));
                }
                Err(e) => {
                    return Err(GatewayResult::error(
                        GatewayErrorCode::ExecutionError,
                        e.to_string(),
                    ));
                }
                Ok(_) => {}
            }
        }

        // Agent data may name one of the action's templates via its
        // "template" field; the text is rendered with the same data.
        let template_text = agent_data
            .get("template")
            .and_then(Value::as_str)
            .and_then(|template_id| action.response_templates.as_ref()?.get(template_id))
            .map(|template| resolve_template(template, agent_data));

        Ok(GatewayResult::Template { agent_data: agent_data.clone(), template_text })
    }

    // Passthrough content delivery

    /// Redeem a content reference; at most one redemption succeeds.
    pub fn deliver_content(
        &self,
        reference: &str,
    ) -> Option<(PassthroughContent, PassthroughDeliveryReceipt)> {
        self.content.deliver(reference)
    }

    pub fn has_content_ref(&self, reference: &str) -> bool {
        self.content.contains(reference)
    }

    /// Content type and metadata of a live reference, without redeeming it.
    pub fn content_ref_info(&self, reference: &str) -> Option<(String, Option<Value>)> {
        self.content.info(reference)
    }

    // Introspection

    pub fn is_loaded(&self, trik_id: &str) -> bool {
        self.triks.read().expect("trik registry poisoned").contains_key(trik_id)
    }

    pub fn available_triks(&self) -> Vec<String> {
        let mut ids: Vec<String> =
            self.triks.read().expect("trik registry poisoned").keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn manifest(&self, trik_id: &str) -> Option<TrikManifest> {
        self.triks
            .read()
            .expect("trik registry poisoned")
            .get(trik_id)
            .map(|loaded| loaded.manifest.clone())
    }

    /// Tool definitions for every action of every loaded trik.
    pub fn get_tool_definitions(&self) -> Vec<ToolDefinition> {
        let triks = self.triks.read().expect("trik registry poisoned");
        let mut tools: Vec<ToolDefinition> = triks
            .values()
            .flat_map(|loaded| {
                let trik_id = loaded.manifest.id.clone();
                loaded
                    .manifest
                    .actions
                    .iter()
                    .map(move |(name, action)| action_to_tool(&trik_id, name, action))
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn list_triks(&self) -> Vec<TrikInfo> {
        let triks = self.triks.read().expect("trik registry poisoned");
        let mut infos: Vec<TrikInfo> = triks
            .values()
            .map(|loaded| {
                let manifest = &loaded.manifest;
                TrikInfo {
                    id: manifest.id.clone(),
                    name: manifest.name.clone(),
                    description: manifest.description.clone(),
                    tools: manifest
                        .actions
                        .iter()
                        .map(|(name, action)| action_to_tool(&manifest.id, name, action))
                        .collect(),
                    session_enabled: manifest.capabilities.session_enabled(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Drop expired sessions, returning how many were removed.
    pub async fn cleanup_sessions(&self) -> usize {
        self.sessions.cleanup().await
    }

    /// Re-read the config store from its backing files.
    pub async fn reload_config(&self) -> Result<()> {
        self.config_store.reload().await?;
        Ok(())
    }

    /// Stop the worker, if one was ever started.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown(SHUTDOWN_GRACE_MS).await;
        }
    }
}

fn action_to_tool(trik_id: &str, action_name: &str, action: &ActionDefinition) -> ToolDefinition {
    ToolDefinition {
        name: format!("{trik_id}:{action_name}"),
        description: action
            .description
            .clone()
            .unwrap_or_else(|| format!("Execute {action_name} on {trik_id}")),
        input_schema: action.input_schema.clone(),
        response_mode: action.response_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(text: &str) -> ResponseTemplate {
        ResponseTemplate { text: text.to_string(), condition: None }
    }

    #[test]
    fn test_resolve_template_substitutes_values() {
        let resolved = resolve_template(
            &template("Found {{count}} articles for {{query}}"),
            &json!({"count": 2, "query": "rust"}),
        );
        assert_eq!(resolved, "Found 2 articles for rust");
    }

    #[test]
    fn test_resolve_template_strings_are_unquoted() {
        let resolved =
            resolve_template(&template("Hello {{name}}"), &json!({"name": "world"}));
        assert_eq!(resolved, "Hello world");
    }

    #[test]
    fn test_resolve_template_missing_fields_stay_literal() {
        let resolved = resolve_template(
            &template("{{present}} and {{absent}} and {{nothing}}"),
            &json!({"present": "here", "nothing": null}),
        );
        assert_eq!(resolved, "here and {{absent}} and {{nothing}}");
    }

    #[test]
    fn test_resolve_template_non_scalar_values_render_as_json() {
        let resolved =
            resolve_template(&template("got {{items}}"), &json!({"items": [1, 2]}));
        assert_eq!(resolved, "got [1,2]");
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home(Path::new("/opt/triks")), PathBuf::from("/opt/triks"));
    }

    #[test]
    fn test_trik_output_from_invoke_parses_mode() {
        let result = InvokeResult {
            response_mode: Some("passthrough".to_string()),
            agent_data: None,
            user_content: Some(json!({"contentType": "text/plain", "content": "hi"})),
            needs_clarification: false,
            clarification_questions: None,
            end_session: true,
        };
        let output = TrikOutput::from_invoke(result).unwrap();
        assert_eq!(output.response_mode, Some(ResponseMode::Passthrough));
        assert!(output.end_session);
        assert_eq!(output.user_content.unwrap().content, "hi");
    }

    #[test]
    fn test_trik_output_rejects_unknown_mode() {
        let result = InvokeResult {
            response_mode: Some("telepathy".to_string()),
            ..InvokeResult::default()
        };
        assert!(TrikOutput::from_invoke(result).is_err());
    }

    #[tokio::test]
    async fn test_execute_unknown_trik() {
        let gateway = TrikGateway::new(GatewayConfig::default());
        let outcome = gateway
            .execute("@demo/nope", "search", json!({}), ExecuteOptions::default())
            .await;
        assert_eq!(
            outcome.result,
            GatewayResult::Error {
                code: GatewayErrorCode::TrikNotFound,
                message: "Trik \"@demo/nope\" is not loaded. Call load_trik() first.".to_string(),
            }
        );
        assert!(outcome.session_id.is_none());
    }

    #[test]
    fn test_gateway_result_wire_shape() {
        let result = GatewayResult::Template {
            agent_data: json!({"count": 2}),
            template_text: Some("Found 2 articles".to_string()),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "template");
        assert_eq!(value["agentData"]["count"], 2);
        assert_eq!(value["templateText"], "Found 2 articles");

        let error = GatewayResult::error(GatewayErrorCode::InvalidInput, "bad");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["code"], "INVALID_INPUT");
    }
}
