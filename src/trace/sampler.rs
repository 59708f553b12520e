// src/trace/sampler.rs
//! Run sampling
//!
//! The default decision hashes the run id, so the same id always gets the
//! same answer for a given rate.

use crate::utils::config::TraceConfig;
use sha2::{Digest, Sha256};

/// Decides whether a run is traced at all
pub trait Sampler: Send + Sync {
    fn should_sample(&self, run_id: &str, run_name: &str, config: &TraceConfig) -> bool;
}

impl<F> Sampler for F
where
    F: Fn(&str, &str, &TraceConfig) -> bool + Send + Sync,
{
    fn should_sample(&self, run_id: &str, run_name: &str, config: &TraceConfig) -> bool {
        self(run_id, run_name, config)
    }
}

/// Deterministic rate sampler over a hash of the run id
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSampler;

impl Sampler for HashSampler {
    fn should_sample(&self, run_id: &str, _run_name: &str, config: &TraceConfig) -> bool {
        default_should_sample(run_id, config)
    }
}

/// Trace everything in only-on-error mode (the outcome is unknown up front),
/// otherwise compare the run id hash against `sample_rate`.
pub fn default_should_sample(run_id: &str, config: &TraceConfig) -> bool {
    if config.only_on_error {
        return true;
    }
    if config.sample_rate >= 1.0 {
        return true;
    }
    if config.sample_rate <= 0.0 {
        return false;
    }

    let digest = Sha256::digest(run_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bucket = u64::from_be_bytes(prefix) % (1u64 << 32);
    let threshold = (config.sample_rate * (1u64 << 32) as f64) as u64;

    bucket < threshold
}
