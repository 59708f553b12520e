// src/recording/mod.rs
//! Event ingestion
//!
//! This module moves events from instrumented code to exporters without
//! ever blocking the producer:
//!
//! - **Event Queue**: bounded MPSC buffer, drop-on-full by default
//! - **Worker**: background thread batching queue contents
//! - **Exporter**: pluggable batch sinks (storage, in-memory, composite)
//!
//! # Architecture
//!
//! ```text
//! Context → enqueue() → Bounded Queue → Background Worker
//!           (drop on full)                    ↓
//!                                  Batch (size or timeout)
//!                                             ↓
//!                                   Exporter::export_batch
//!                                             ↓
//!                               Pipeline encode → SQLite
//! ```

pub mod event_queue;
pub mod exporter;
pub mod worker;

// Re-export commonly used types
pub use event_queue::{EnqueueMode, EventQueue, QueueStats};
pub use exporter::{CompositeExporter, Exporter, InMemoryExporter};
pub use worker::{BatchSink, BatchWorker, WorkerConfig};
