//! JSON-RPC error codes.
//!
//! The negative codes are the standard JSON-RPC 2.0 set; the 1000-range
//! codes are gateway-specific and carried unchanged across the wire.

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const TRIK_NOT_FOUND: i64 = 1001;
pub const ACTION_NOT_FOUND: i64 = 1002;
pub const EXECUTION_TIMEOUT: i64 = 1003;
pub const SCHEMA_VALIDATION_FAILED: i64 = 1004;
pub const WORKER_NOT_READY: i64 = 1005;
pub const STORAGE_ERROR: i64 = 1006;
