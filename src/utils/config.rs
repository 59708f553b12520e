// src/utils/config.rs
//! Trace configuration
//!
//! Layered loading with the `config` crate:
//!
//! ```text
//! defaults (or TRACE_PROFILE preset) → optional file → TRACE_* env vars
//! ```
//!
//! The process-wide instance is reachable through [`get_config`] and
//! replaceable with [`set_config`].

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Configuration presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Minimal overhead, 1% sampling, encryption when a key is available
    Production,

    /// Moderate sampling, no encryption
    Development,

    /// Trace everything, small batches, no compression
    Debug,
}

impl Profile {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" => Ok(Profile::Production),
            "development" => Ok(Profile::Development),
            "debug" => Ok(Profile::Debug),
            other => Err(EngineError::Config(format!("Invalid TRACE_PROFILE: {}", other))),
        }
    }
}

/// Trace configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TraceConfig {
    /// Fraction of runs to trace (0.0 to 1.0)
    pub sample_rate: f64,

    /// Trace every run but keep only those that hit an error
    pub only_on_error: bool,

    /// Maximum number of events buffered in memory
    pub queue_size: usize,

    /// Events per batch handed to the exporter
    pub batch_size: usize,

    /// Maximum time a partial batch waits before flushing (milliseconds)
    pub batch_timeout_ms: u64,

    /// Block (bounded) when enqueueing run-end so it survives backpressure
    pub block_on_run_end: bool,

    /// Upper bound on the run-end blocking enqueue (milliseconds)
    pub run_end_block_timeout_ms: u64,

    /// How long shutdown waits for the worker before draining itself (milliseconds)
    pub worker_join_timeout_ms: u64,

    /// Keys whose values are replaced wholesale (case-insensitive)
    pub redact_keys: Vec<String>,

    /// Regexes applied to every remaining string
    pub redact_patterns: Vec<String>,

    /// Replacement text for redacted values
    pub redaction_marker: String,

    /// Compress payloads with zstd before storage
    pub compression_enabled: bool,

    /// zstd level (1-22)
    pub compression_level: i32,

    /// Encrypt payloads at rest
    pub encryption_enabled: bool,

    /// Base64-encoded 32-byte key
    pub encryption_key: Option<String>,

    /// SQLite database file
    pub db_path: PathBuf,

    /// Age-based retention; 0 disables pruning
    pub retention_days: i64,

    /// Size-based retention budget for the database
    pub retention_max_bytes: Option<u64>,

    /// trace, debug, info, warn or error
    pub log_level: String,

    /// text or json
    pub log_format: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.1,
            only_on_error: false,
            queue_size: 1000,
            batch_size: 50,
            batch_timeout_ms: 1000,
            block_on_run_end: false,
            run_end_block_timeout_ms: 5000,
            worker_join_timeout_ms: 5000,
            redact_keys: [
                "password",
                "api_key",
                "token",
                "secret",
                "credential",
                "access_key",
                "private_key",
                "auth_token",
                "session_token",
                "authorization",
                "bearer",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
            redact_patterns: vec![
                r"\b\d{3}-\d{2}-\d{4}\b".to_string(),                       // SSN
                r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b".to_string(), // card numbers
                r"\b[A-Za-z0-9]{32,}\b".to_string(),                       // opaque tokens
                r"Bearer\s+[A-Za-z0-9\-._~+/]+=*".to_string(),
                r"Authorization:\s*[A-Za-z0-9\-._~+/]+".to_string(),
            ],
            redaction_marker: "[REDACTED]".to_string(),
            compression_enabled: true,
            compression_level: 3,
            encryption_enabled: false,
            encryption_key: None,
            db_path: PathBuf::from("agentlens.db"),
            retention_days: 30,
            retention_max_bytes: None,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl TraceConfig {
    /// Load from defaults, the `TRACE_PROFILE` preset and `TRACE_*` env vars
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an additional config file layered between defaults and env
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let base = match std::env::var("TRACE_PROFILE") {
            Ok(profile) => Self::preset(Profile::parse(&profile)?),
            Err(_) => Self::default(),
        };

        let mut builder = Config::builder().add_source(Config::try_from(&base)?);

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("TRACE")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redact_keys")
                .with_list_parse_key("redact_patterns"),
        );

        let mut config: TraceConfig = builder.build()?.try_deserialize()?;

        // Key may come from the environment alone
        if config.encryption_enabled && config.encryption_key.is_none() {
            config.encryption_key = std::env::var("TRACE_ENCRYPTION_KEY").ok();
        }

        config.validate()?;
        Ok(config)
    }

    /// Preset configuration for a profile
    pub fn preset(profile: Profile) -> Self {
        let mut config = Self::default();
        match profile {
            Profile::Production => {
                config.sample_rate = 0.01;
                config.queue_size = 1000;
                config.batch_size = 100;
                config.compression_enabled = true;
                config.compression_level = 3;
                config.encryption_key = std::env::var("TRACE_ENCRYPTION_KEY").ok();
                config.encryption_enabled = config.encryption_key.is_some();
                config.log_level = "warn".to_string();
            }
            Profile::Development => {
                config.sample_rate = 0.5;
                config.queue_size = 1000;
                config.batch_size = 50;
                config.compression_enabled = true;
                config.compression_level = 3;
                config.encryption_enabled = false;
                config.log_level = "info".to_string();
            }
            Profile::Debug => {
                config.sample_rate = 1.0;
                config.queue_size = 2000;
                config.batch_size = 10;
                config.compression_enabled = false;
                config.encryption_enabled = false;
                config.log_level = "debug".to_string();
            }
        }
        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(EngineError::Config(format!(
                "sample_rate must be between 0.0 and 1.0, got {}",
                self.sample_rate
            )));
        }

        if self.queue_size == 0 {
            return Err(EngineError::Config("queue_size must be positive".to_string()));
        }

        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be positive".to_string()));
        }

        if !(1..=22).contains(&self.compression_level) {
            return Err(EngineError::Config(format!(
                "compression_level must be between 1 and 22, got {}",
                self.compression_level
            )));
        }

        if self.encryption_enabled && self.encryption_key.is_none() {
            return Err(EngineError::Config(
                "encryption_key is required when encryption_enabled=true".to_string(),
            ));
        }

        let level = self.log_level.to_ascii_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            return Err(EngineError::Config(format!(
                "log_level must be one of trace, debug, info, warn, error, got {}",
                self.log_level
            )));
        }

        if !["text", "json"].contains(&self.log_format.as_str()) {
            return Err(EngineError::Config(format!(
                "log_format must be text or json, got {}",
                self.log_format
            )));
        }

        self.compiled_redaction_patterns()?;

        Ok(())
    }

    /// Redaction keys, lower-cased for lookup
    pub fn redaction_keys(&self) -> HashSet<String> {
        self.redact_keys.iter().map(|k| k.to_lowercase()).collect()
    }

    /// Compile the configured redaction regexes
    pub fn compiled_redaction_patterns(&self) -> Result<Vec<Regex>> {
        self.redact_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(EngineError::from))
            .collect()
    }

    pub fn add_redaction_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.redact_keys.contains(&key) {
            self.redact_keys.push(key);
        }
    }

    pub fn add_redaction_pattern(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if !self.redact_patterns.contains(&pattern) {
            self.redact_patterns.push(pattern);
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn run_end_block_timeout(&self) -> Duration {
        Duration::from_millis(self.run_end_block_timeout_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

static GLOBAL_CONFIG: Lazy<Mutex<Option<Arc<TraceConfig>>>> = Lazy::new(|| Mutex::new(None));

/// Process-wide configuration, loaded on first use
pub fn get_config() -> Arc<TraceConfig> {
    let mut slot = GLOBAL_CONFIG.lock();
    if let Some(config) = slot.as_ref() {
        return Arc::clone(config);
    }

    let config = match TraceConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration, using defaults: {}", e);
            TraceConfig::default()
        }
    };
    info!("Configuration loaded (db_path={:?})", config.db_path);

    let config = Arc::new(config);
    *slot = Some(Arc::clone(&config));
    config
}

/// Replace the process-wide configuration; `None` forces a reload on next use
pub fn set_config(config: Option<TraceConfig>) {
    *GLOBAL_CONFIG.lock() = config.map(Arc::new);
}
