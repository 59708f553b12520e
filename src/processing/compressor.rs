// src/processing/compressor.rs
//! zstd compression for event payloads
//!
//! Decompression is driven by the zstd frame magic rather than the
//! `enabled` flag, so payloads written with compression off can still be
//! read after it is turned on (and vice versa).

use crate::utils::errors::{EngineError, Result};
use tracing::debug;

/// zstd frame magic number (little-endian 0xFD2FB528)
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compression presets
#[derive(Debug, Clone, Copy)]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 3)
    Balanced,

    /// Best compression (level 19)
    Best,

    /// Explicit zstd level
    Level(i32),
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
            CompressionLevel::Level(level) => *level,
        }
    }
}

/// Optional zstd compressor
pub struct Compressor {
    enabled: bool,
    level: CompressionLevel,
}

impl Compressor {
    pub fn new(enabled: bool, level: CompressionLevel) -> Self {
        Self { enabled, level }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn level(&self) -> i32 {
        self.level.as_i32()
    }

    /// Compress data; returns a copy when compression is disabled
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.enabled {
            return Ok(data.to_vec());
        }

        let compressed = zstd::encode_all(data, self.level.as_i32()).map_err(|e| {
            EngineError::CompressionFailed(format!("Compression error: {}", e))
        })?;

        debug!(
            "Compressed {} bytes -> {} bytes",
            data.len(),
            compressed.len()
        );

        Ok(compressed)
    }

    /// Decompress data if it carries a zstd frame, otherwise pass it through
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !Self::is_compressed(data) {
            return Ok(data.to_vec());
        }

        zstd::decode_all(data).map_err(|e| {
            EngineError::CompressionFailed(format!("Decompression error: {}", e))
        })
    }

    pub fn is_compressed(data: &[u8]) -> bool {
        data.starts_with(&ZSTD_MAGIC)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(true, CompressionLevel::Balanced)
    }
}
