//! Trik manifest model and schema validation.
//!
//! A trik is a declarative skill package: a `manifest.json` describing its
//! actions, capabilities, and limits, plus an entry point executed by a
//! runtime worker. This crate owns the typed manifest model and the
//! Draft-07 validation used both for manifests and for per-action input and
//! output payloads.

mod types;
mod validator;

pub use types::{
    ActionDefinition, ClarificationQuestion, ConfigRequirement, PassthroughContent,
    PassthroughDeliveryReceipt, ResponseMode, ResponseTemplate, SessionCapabilities,
    SessionContext, SessionHistoryEntry, StorageCapabilities, TrikCapabilities, TrikConfig,
    TrikEntry, TrikLimits, TrikManifest, TrikRuntime, TrikSession, UserContentReference,
    DEFAULT_MAX_DURATION_MS, DEFAULT_MAX_HISTORY_ENTRIES, DEFAULT_MAX_SIZE_BYTES,
};
pub use validator::{
    parse_manifest, validate_data, validate_manifest, ManifestError, Result, SchemaValidator,
    ValidationResult,
};
