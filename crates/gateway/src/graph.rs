//! In-process trik execution.
//!
//! The original package format binds an exported "graph" object from the
//! trik's entry module. Here the binding is explicit: an embedder registers
//! a [`TrikGraph`] under the trik's manifest id and the gateway dispatches
//! to it in-process; triks without a registered graph go through the
//! subprocess worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use trikgate_manifest::SessionContext;
use trikgate_store::StorageContext;

/// Everything a trik action invocation can see.
pub struct GraphInput {
    pub action: String,
    pub input: Value,
    /// Present when the trik declares session capability
    pub session: Option<SessionContext>,
    /// Merged config values for this trik
    pub config: BTreeMap<String, String>,
    /// Present when the trik declares storage capability
    pub storage: Option<Arc<dyn StorageContext>>,
}

/// An in-process action handler.
///
/// `invoke` returns the raw output object; the gateway normalizes it
/// (responseMode, agentData, userContent, clarification and session flags)
/// exactly as it does for subprocess results.
#[async_trait]
pub trait TrikGraph: Send + Sync {
    async fn invoke(&self, input: GraphInput) -> Result<Value, String>;
}
