// src/processing/mod.rs
//! Event processing pipeline
//!
//! - **Redactor**: key- and pattern-based removal of secrets
//! - **Serializer**: deterministic compact JSON
//! - **Compressor**: zstd, sniffed on read
//! - **Encryptor**: ChaCha20-Poly1305 envelope
//! - **Pipeline**: the four stages in order, and their inverse

pub mod compressor;
pub mod encryptor;
pub mod pipeline;
pub mod redactor;
pub mod serializer;

pub use compressor::{CompressionLevel, Compressor};
pub use encryptor::Encryptor;
pub use pipeline::{EncodedEvent, PipelineStats, ProcessingPipeline};
pub use redactor::Redactor;
pub use serializer::Serializer;
