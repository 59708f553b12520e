// src/processing/redactor.rs
//! Irreversible redaction of sensitive values
//!
//! Two passes over every event:
//!
//! - **Key-based**: a map entry whose lower-cased key is configured has its
//!   whole value replaced by the marker (no recursion into it).
//! - **Pattern-based**: every remaining string is scanned for
//!   `key: value` / `key=value` text for each configured key, then for each
//!   standalone pattern (SSNs, card numbers, bearer tokens, ...).

use crate::events::EventMap;
use crate::utils::config::TraceConfig;
use crate::utils::errors::{EngineError, Result};
use regex::{Captures, NoExpand, Regex};
use serde_json::Value;
use std::collections::HashSet;

/// Nesting limit for the recursive walk
const MAX_DEPTH: usize = 128;

/// Redacts configured keys and patterns
pub struct Redactor {
    keys: HashSet<String>,

    /// One `key <sep> value` matcher per key
    key_patterns: Vec<Regex>,

    patterns: Vec<Regex>,
    marker: String,
}

impl Redactor {
    pub fn new(config: &TraceConfig) -> Result<Self> {
        let mut redactor = Self {
            keys: HashSet::new(),
            key_patterns: Vec::new(),
            patterns: config.compiled_redaction_patterns()?,
            marker: config.redaction_marker.clone(),
        };

        let mut keys: Vec<String> = config.redaction_keys().into_iter().collect();
        keys.sort();
        for key in keys {
            redactor.add_redaction_key(&key)?;
        }

        Ok(redactor)
    }

    /// Add a key (case-insensitive)
    pub fn add_redaction_key(&mut self, key: &str) -> Result<()> {
        let key = key.to_lowercase();
        if self.keys.contains(&key) {
            return Ok(());
        }

        let pattern = Regex::new(&format!(
            r"(?im)(\b{}\b\s*[:=]\s*)([^:\s]+(?:\s+[^\s:\n]+)*)",
            regex::escape(&key)
        ))?;

        self.key_patterns.push(pattern);
        self.keys.insert(key);
        Ok(())
    }

    /// Add a standalone pattern
    pub fn add_redaction_pattern(&mut self, pattern: &str) -> Result<()> {
        self.patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn redact_map(&self, map: &EventMap) -> Result<EventMap> {
        self.redact_entries(map, 0)
    }

    pub fn redact(&self, value: &Value) -> Result<Value> {
        self.redact_value(value, 0)
    }

    fn redact_value(&self, value: &Value, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(EngineError::RedactionFailed(format!(
                "Payload nested deeper than {} levels",
                MAX_DEPTH
            )));
        }

        Ok(match value {
            Value::Object(map) => Value::Object(self.redact_entries(map, depth)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.redact_value(item, depth + 1))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::String(text) => Value::String(self.redact_str(text)),
            other => other.clone(),
        })
    }

    fn redact_entries(&self, map: &EventMap, depth: usize) -> Result<EventMap> {
        let mut out = EventMap::new();
        for (key, value) in map {
            let redacted = if self.keys.contains(&key.to_lowercase()) {
                Value::String(self.marker.clone())
            } else {
                self.redact_value(value, depth + 1)?
            };
            out.insert(key.clone(), redacted);
        }
        Ok(out)
    }

    fn redact_str(&self, text: &str) -> String {
        let mut out = text.to_string();

        for pattern in &self.key_patterns {
            if pattern.is_match(&out) {
                out = pattern
                    .replace_all(&out, |caps: &Captures| format!("{}{}", &caps[1], self.marker))
                    .into_owned();
            }
        }

        for pattern in &self.patterns {
            if pattern.is_match(&out) {
                out = pattern
                    .replace_all(&out, NoExpand(&self.marker))
                    .into_owned();
            }
        }

        out
    }
}
