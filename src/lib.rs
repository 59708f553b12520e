// src/lib.rs
//! AgentLens Engine Library
//!
//! Captures structured events from AI agent runs without getting in the
//! agent's way, and stores them durably under configurable privacy and
//! performance policies.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **events**: Event envelope, kinds and kind-specific payloads
//! - **trace**: Runs, sampling, nested contexts and event emission
//! - **recording**: Bounded ingestion queue, batching worker, exporters
//! - **processing**: Redaction, serialization, compression, encryption
//! - **storage**: SQLite schema, batched writes, queries, retention, backup
//! - **observability**: Logging setup
//! - **utils**: Configuration, errors and time helpers
//!
//! # Example
//!
//! ```no_run
//! use agentlens_engine::events::ToolCall;
//! use agentlens_engine::trace::{RunOptions, Trace};
//! use agentlens_engine::utils::config::TraceConfig;
//! use serde_json::json;
//!
//! let trace = Trace::new(TraceConfig::default());
//! {
//!     let run = trace.run(RunOptions::new("support_agent").user_id("u42"));
//!     if let Some(context) = run.context() {
//!         context.tool_call(ToolCall::new("search", json!({"q": "refund"}), json!(["doc-7"])));
//!     }
//! }
//! trace.shutdown();
//! ```

// Public module exports
pub mod events;
pub mod observability;
pub mod processing;
pub mod recording;
pub mod storage;
pub mod trace;
pub mod utils;

// Re-export commonly used types
pub use events::{Event, EventKind, EventMap, EventPayload, EventStatus, RunStatus};
pub use processing::ProcessingPipeline;
pub use recording::{EventQueue, Exporter};
pub use storage::{Database, StorageExporter};
pub use trace::{RunOptions, RunScope, Trace, TraceContext};
pub use utils::config::TraceConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
