//! JSON-RPC 2.0 wire protocol spoken between the gateway and runtime workers.
//!
//! Messages travel over the worker's stdio as newline-delimited JSON, one
//! message per line. Requests flow both ways: the gateway invokes trik
//! actions on the worker, and the worker calls back into the gateway for
//! storage operations. Request ids are strings (UUIDs on the gateway side)
//! so responses can be correlated across the full-duplex stream.

mod codes;
mod message;
mod types;

pub use codes::{
    ACTION_NOT_FOUND, EXECUTION_TIMEOUT, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, SCHEMA_VALIDATION_FAILED, STORAGE_ERROR, TRIK_NOT_FOUND,
    WORKER_NOT_READY,
};
pub use message::{
    parse_message, serialize_message, JsonRpcError, JsonRpcMessage, JsonRpcRequest,
    JsonRpcResponse, JSONRPC_VERSION,
};
pub use types::{HealthResult, InvokeParams, InvokeResult};

/// Result type alias for trikgate-protocol.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally valid JSON that is not a valid protocol message
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
