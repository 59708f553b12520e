// src/storage/mod.rs
//! Persistent storage of runs and steps
//!
//! - **Schema**: tables, indexes and versioned migrations
//! - **Database**: per-thread SQLite connections, batched writes, reads,
//!   pruning, vacuum and online backup
//! - **Models**: row types, filters and the [`ReadStore`] query trait
//! - **Exporter**: [`StorageExporter`], the batch sink feeding the database
//!
//! # Layout
//!
//! ```text
//! runs  (id PK, name, status, started_at, completed_at, duration_ms, labels, metadata)
//!   └── steps (id PK, run_id FK ON DELETE CASCADE, timestamp, type, name,
//!              status, duration_ms, parent_event_id, data BLOB)
//! ```

pub mod database;
pub mod exporter;
pub mod models;
pub mod schema;

// Re-export commonly used types
pub use database::Database;
pub use exporter::StorageExporter;
pub use models::{
    ExportedStep, ReadStore, RunExport, RunFilter, RunOrder, RunRecord, RunUpdate, StepFilter,
    StepRecord, StorageStats,
};
