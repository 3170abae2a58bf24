//! The trik gateway: loading, validation, and execution of skill packages.
//!
//! A trik is a declarative skill package with a schema-validated manifest.
//! The gateway loads manifests, exposes their actions as agent tools, and
//! executes them with every boundary validated: input against the action's
//! input schema, output against its agent-data or user-content schema.
//! Actions run either in-process through a registered [`TrikGraph`] or in a
//! subprocess runtime worker over JSON-RPC.
//!
//! Around execution the gateway maintains the capability contexts a trik
//! may declare: multi-turn sessions with bounded history, read-only config
//! from the secrets files, and quota-enforced persistent storage. Content
//! produced in passthrough mode never reaches the agent; it is parked
//! behind a one-time reference the embedder redeems for the user.

mod config;
mod content;
mod error;
mod gateway;
mod graph;
mod session;
mod worker;

use std::time::{SystemTime, UNIX_EPOCH};

pub use config::{
    ConfigContext, ConfigError, ConfigStore, FileConfigStore, InMemoryConfigStore,
};
pub use content::{ContentReferenceStore, CONTENT_REF_TTL_MS};
pub use error::{GatewayError, Result};
pub use gateway::{
    resolve_template, ClarificationCallback, ExecuteOptions, ExecuteOutcome, GatewayConfig,
    GatewayErrorCode, GatewayResult, ToolDefinition, TrikGateway, TrikInfo,
};
pub use graph::{GraphInput, TrikGraph};
pub use session::{InMemorySessionStore, SessionError, SessionStore};
pub use worker::{
    find_worker_launch, WorkerConfig, WorkerError, WorkerLaunch, WorkerManager,
};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
