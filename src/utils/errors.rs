// src/utils/errors.rs
//! Engine error types
//!
//! Every fallible operation in the crate returns [`Result`]. Producer-side
//! calls never surface these to instrumented code; they are logged and
//! turned into no-op returns at the context boundary.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event failed validation at construction
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Redaction failed: {0}")]
    RedactionFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Wrong key, tampered payload, or envelope mismatch
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// A pipeline stage failed for a specific event
    #[error("Pipeline failed for event {event_id} (kind={kind}, run={run_id}): {source}")]
    Pipeline {
        event_id: String,
        kind: String,
        run_id: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Storage error: {0}")]
    StorageFailed(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),

    /// Subsystem used before (or after) its lifecycle allows
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Wrap a stage error with the identity of the event being processed
    pub fn for_event(self, event_id: &str, kind: &str, run_id: &str) -> Self {
        EngineError::Pipeline {
            event_id: event_id.to_string(),
            kind: kind.to_string(),
            run_id: run_id.to_string(),
            source: Box::new(self),
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<regex::Error> for EngineError {
    fn from(e: regex::Error) -> Self {
        EngineError::Config(format!("Invalid redaction pattern: {}", e))
    }
}
