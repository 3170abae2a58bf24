//! Error and result types for trikgate-gateway.

use crate::config::ConfigError;
use crate::session::SessionError;
use crate::worker::WorkerError;
use trikgate_manifest::ManifestError;

/// Result type alias for trikgate-gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised by gateway operations.
///
/// Per-invocation failures (bad input, timeouts, trik crashes) are not
/// errors at this level; `execute` reports those inside its result so the
/// calling agent can react to them. This enum covers the operations where
/// the embedder itself did something wrong.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("trik \"{0}\" is not in the allowlist")]
    NotAllowed(String),

    #[error("trik \"{trik_id}\" is missing required config keys: {}", keys.join(", "))]
    MissingConfig { trik_id: String, keys: Vec<String> },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] trikgate_store::Error),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_message() {
        let err = GatewayError::MissingConfig {
            trik_id: "@demo/articles".to_string(),
            keys: vec!["apiKey".to_string(), "region".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "trik \"@demo/articles\" is missing required config keys: apiKey, region"
        );
    }

    #[test]
    fn test_not_allowed_message() {
        let err = GatewayError::NotAllowed("@demo/articles".to_string());
        assert!(err.to_string().contains("allowlist"));
    }
}
