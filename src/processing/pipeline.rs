// src/processing/pipeline.rs
//! Event processing pipeline
//!
//! ```text
//! encode: event map → redact → serialize → compress → encrypt → bytes
//! decode: bytes → decrypt → decompress (sniffed) → deserialize → event map
//! ```
//!
//! Redaction is one-way; decode returns the redacted map.

use crate::events::EventMap;
use crate::processing::compressor::{CompressionLevel, Compressor};
use crate::processing::encryptor::Encryptor;
use crate::processing::redactor::Redactor;
use crate::processing::serializer::Serializer;
use crate::utils::config::TraceConfig;
use crate::utils::errors::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

/// Output of [`ProcessingPipeline::encode_with_json`]
#[derive(Debug, Clone)]
pub struct EncodedEvent {
    /// Redacted, serialized JSON before compression/encryption
    pub json: String,

    /// Bytes to persist
    pub blob: Vec<u8>,
}

/// Pipeline configuration summary
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub redact_keys: usize,
    pub redact_patterns: usize,
    pub compression_enabled: bool,
    pub compression_level: i32,
    pub encryption_enabled: bool,
}

/// Redact → serialize → compress → encrypt
pub struct ProcessingPipeline {
    redactor: Redactor,
    compressor: Compressor,
    encryptor: Encryptor,
}

impl ProcessingPipeline {
    pub fn new(config: &TraceConfig) -> Result<Self> {
        Ok(Self {
            redactor: Redactor::new(config)?,
            compressor: Compressor::new(
                config.compression_enabled,
                CompressionLevel::Level(config.compression_level),
            ),
            encryptor: Encryptor::new(
                config.encryption_enabled,
                config.encryption_key.as_deref(),
            )?,
        })
    }

    /// Encode one event map into storage bytes
    pub fn encode(&self, event: &EventMap) -> Result<Vec<u8>> {
        self.encode_with_json(event).map(|encoded| encoded.blob)
    }

    /// Encode one event, also returning the intermediate JSON text
    pub fn encode_with_json(&self, event: &EventMap) -> Result<EncodedEvent> {
        self.run_stages(event).map_err(|e| {
            let (event_id, kind, run_id) = identity(event);
            let e = e.for_event(event_id, kind, run_id);
            error!("{}", e);
            e
        })
    }

    fn run_stages(&self, event: &EventMap) -> Result<EncodedEvent> {
        let redacted = self.redactor.redact_map(event)?;
        let json = Serializer::serialize(&redacted)?;
        let compressed = self.compressor.compress(json.as_bytes())?;
        let blob = self.encryptor.encrypt(&compressed)?;
        Ok(EncodedEvent { json, blob })
    }

    /// Redaction stage alone, for values stored outside the encoded blob
    pub fn redact(&self, event: &EventMap) -> Result<EventMap> {
        self.redactor.redact_map(event)
    }

    /// Encode a batch, skipping (and logging) events that fail
    pub fn encode_batch(&self, events: &[EventMap]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|event| self.encode(event).ok())
            .collect()
    }

    /// Reverse the pipeline; every failure is surfaced
    pub fn decode(&self, data: &[u8]) -> Result<EventMap> {
        let decrypted = self.encryptor.decrypt(data)?;
        let decompressed = self.compressor.decompress(&decrypted)?;
        Serializer::deserialize(&decompressed)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            redact_keys: self.redactor.key_count(),
            redact_patterns: self.redactor.pattern_count(),
            compression_enabled: self.compressor.is_enabled(),
            compression_level: self.compressor.level(),
            encryption_enabled: self.encryptor.is_enabled(),
        }
    }
}

fn identity(event: &EventMap) -> (&str, &str, &str) {
    fn field<'a>(event: &'a EventMap, name: &str) -> &'a str {
        event.get(name).and_then(Value::as_str).unwrap_or("unknown")
    }
    (
        field(event, "event_id"),
        field(event, "type"),
        field(event, "run_id"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::EngineError;
    use serde_json::json;

    fn plain_config() -> TraceConfig {
        TraceConfig {
            compression_enabled: false,
            encryption_enabled: false,
            ..Default::default()
        }
    }

    fn encrypted_config() -> TraceConfig {
        TraceConfig {
            compression_enabled: true,
            encryption_enabled: true,
            encryption_key: Some(Encryptor::generate_key()),
            ..Default::default()
        }
    }

    fn sample_event() -> EventMap {
        json!({
            "event_id": "evt_1",
            "run_id": "run_1",
            "type": "model_call",
            "model": "gpt-4",
            "prompt": "What's the weather?",
            "metadata": {"api_key": "sk-live-XYZ"},
            "prompt_tokens": 12
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_secret_is_redacted_after_round_trip() {
        let pipeline = ProcessingPipeline::new(&encrypted_config()).unwrap();

        let bytes = pipeline.encode(&sample_event()).unwrap();
        let decoded = pipeline.decode(&bytes).unwrap();

        assert_eq!(decoded["metadata"]["api_key"], "[REDACTED]");
        assert_eq!(decoded["prompt"], "What's the weather?");
        assert_eq!(decoded["prompt_tokens"], 12);
    }

    #[test]
    fn test_identity_without_sensitive_content() {
        let mut event = sample_event();
        event.remove("metadata");

        for config in [plain_config(), TraceConfig::default(), encrypted_config()] {
            let pipeline = ProcessingPipeline::new(&config).unwrap();
            let bytes = pipeline.encode(&event).unwrap();
            assert_eq!(pipeline.decode(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn test_decode_tolerates_payloads_written_uncompressed() {
        let mut event = sample_event();
        event.remove("metadata");

        let old = ProcessingPipeline::new(&plain_config()).unwrap();
        let new = ProcessingPipeline::new(&TraceConfig::default()).unwrap();

        let bytes = old.encode(&event).unwrap();
        assert_eq!(new.decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_decode_with_wrong_key_fails() {
        let writer = ProcessingPipeline::new(&encrypted_config()).unwrap();
        let reader = ProcessingPipeline::new(&encrypted_config()).unwrap();

        let bytes = writer.encode(&sample_event()).unwrap();
        assert!(reader.decode(&bytes).is_err());
    }

    #[test]
    fn test_encode_with_json_exposes_redacted_text() {
        let pipeline = ProcessingPipeline::new(&TraceConfig::default()).unwrap();
        let encoded = pipeline.encode_with_json(&sample_event()).unwrap();

        assert!(encoded.json.contains("[REDACTED]"));
        assert!(!encoded.json.contains("sk-live-XYZ"));
        assert!(Compressor::is_compressed(&encoded.blob));
    }

    #[test]
    fn test_stage_error_carries_event_identity() {
        let pipeline = ProcessingPipeline::new(&plain_config()).unwrap();

        let mut deep = json!("leaf");
        for _ in 0..200 {
            deep = json!([deep]);
        }
        let mut event = sample_event();
        event.insert("input".to_string(), deep);

        let err = pipeline.encode(&event).unwrap_err();
        match err {
            EngineError::Pipeline {
                event_id,
                kind,
                run_id,
                ..
            } => {
                assert_eq!(event_id, "evt_1");
                assert_eq!(kind, "model_call");
                assert_eq!(run_id, "run_1");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_batch_skips_failures() {
        let pipeline = ProcessingPipeline::new(&plain_config()).unwrap();

        let mut deep = json!(1);
        for _ in 0..200 {
            deep = json!([deep]);
        }
        let mut bad = sample_event();
        bad.insert("input".to_string(), deep);

        let out = pipeline.encode_batch(&[sample_event(), bad, sample_event()]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_redact_matches_encoded_text() {
        let pipeline = ProcessingPipeline::new(&TraceConfig::default()).unwrap();
        let redacted = pipeline.redact(&sample_event()).unwrap();
        let encoded = pipeline.encode_with_json(&sample_event()).unwrap();

        assert_eq!(redacted["metadata"]["api_key"], "[REDACTED]");
        assert_eq!(Serializer::serialize(&redacted).unwrap(), encoded.json);
    }

    #[test]
    fn test_stats_reflect_config() {
        let stats = ProcessingPipeline::new(&encrypted_config()).unwrap().stats();
        assert!(stats.encryption_enabled);
        assert!(stats.compression_enabled);
        assert_eq!(stats.compression_level, 3);
        assert_eq!(stats.redact_keys, 11);
    }
}
