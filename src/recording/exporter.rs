// src/recording/exporter.rs
//! Batch exporters
//!
//! An [`Exporter`] receives every flushed batch from the background worker.
//! Supported sinks:
//! - SQLite storage (`storage::StorageExporter`)
//! - In-memory collection (tests, embedding)
//! - Fan-out to several sinks (`CompositeExporter`)

use crate::events::EventMap;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Pluggable batch sink
pub trait Exporter: Send + Sync {
    /// Prepare resources; called once before the first batch
    fn initialize(&self) -> Result<()>;

    /// Process one batch of event maps
    fn export_batch(&self, events: &[EventMap]) -> Result<()>;

    /// Release resources; called once after the last batch
    fn shutdown(&self) -> Result<()>;
}

/// Forwards every batch to several exporters in registration order
pub struct CompositeExporter {
    exporters: Vec<Arc<dyn Exporter>>,
}

impl CompositeExporter {
    pub fn new(exporters: Vec<Arc<dyn Exporter>>) -> Result<Self> {
        if exporters.is_empty() {
            return Err(EngineError::Config(
                "CompositeExporter requires at least one exporter".to_string(),
            ));
        }
        Ok(Self { exporters })
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

impl Exporter for CompositeExporter {
    /// Fails fast on the first exporter that cannot initialize
    fn initialize(&self) -> Result<()> {
        for (i, exporter) in self.exporters.iter().enumerate() {
            exporter.initialize().map_err(|e| {
                error!("CompositeExporter: failed to initialize exporter {}: {}", i, e);
                e
            })?;
        }
        Ok(())
    }

    fn export_batch(&self, events: &[EventMap]) -> Result<()> {
        for (i, exporter) in self.exporters.iter().enumerate() {
            if let Err(e) = exporter.export_batch(events) {
                error!(
                    "CompositeExporter: exporter {} failed on batch of {} events: {}",
                    i,
                    events.len(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Shuts exporters down in reverse order
    fn shutdown(&self) -> Result<()> {
        for exporter in self.exporters.iter().rev() {
            if let Err(e) = exporter.shutdown() {
                error!("CompositeExporter: shutdown error: {}", e);
            }
        }
        Ok(())
    }
}

/// Keeps every batch in memory
#[derive(Default)]
pub struct InMemoryExporter {
    batches: Mutex<Vec<Vec<EventMap>>>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<EventMap>> {
        self.batches.lock().clone()
    }

    /// All received events, in arrival order
    pub fn events(&self) -> Vec<EventMap> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Received events of one kind (`type` field)
    pub fn events_of_type(&self, kind: &str) -> Vec<EventMap> {
        self.events()
            .into_iter()
            .filter(|e| e.get("type").and_then(|t| t.as_str()) == Some(kind))
            .collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

impl Exporter for InMemoryExporter {
    fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn export_batch(&self, events: &[EventMap]) -> Result<()> {
        debug!("Collected batch of {} events", events.len());
        self.batches.lock().push(events.to_vec());
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingExporter {
        fail_init: bool,
        log: Arc<Mutex<Vec<String>>>,
        name: &'static str,
    }

    impl Exporter for FailingExporter {
        fn initialize(&self) -> Result<()> {
            self.log.lock().push(format!("init:{}", self.name));
            if self.fail_init {
                return Err(EngineError::ExportFailed("init".to_string()));
            }
            Ok(())
        }

        fn export_batch(&self, _events: &[EventMap]) -> Result<()> {
            self.log.lock().push(format!("export:{}", self.name));
            Err(EngineError::ExportFailed("export".to_string()))
        }

        fn shutdown(&self) -> Result<()> {
            self.log.lock().push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    fn batch() -> Vec<EventMap> {
        vec![json!({"event_id": "evt_1", "type": "custom"})
            .as_object()
            .cloned()
            .unwrap()]
    }

    #[test]
    fn test_composite_requires_exporters() {
        assert!(CompositeExporter::new(vec![]).is_err());
    }

    #[test]
    fn test_composite_continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(FailingExporter {
            fail_init: false,
            log: Arc::clone(&log),
            name: "a",
        });
        let memory = Arc::new(InMemoryExporter::new());

        let exporters: Vec<Arc<dyn Exporter>> = vec![
            failing as Arc<dyn Exporter>,
            memory.clone() as Arc<dyn Exporter>,
        ];
        let composite = CompositeExporter::new(exporters).unwrap();
        composite.initialize().unwrap();
        assert!(composite.export_batch(&batch()).is_ok());

        assert_eq!(memory.events().len(), 1);
        assert_eq!(log.lock().as_slice(), ["init:a", "export:a"]);
    }

    #[test]
    fn test_composite_init_fails_fast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(FailingExporter {
            fail_init: true,
            log: Arc::clone(&log),
            name: "a",
        });
        let second = Arc::new(FailingExporter {
            fail_init: false,
            log: Arc::clone(&log),
            name: "b",
        });

        let exporters: Vec<Arc<dyn Exporter>> =
            vec![first as Arc<dyn Exporter>, second as Arc<dyn Exporter>];
        let composite = CompositeExporter::new(exporters).unwrap();
        assert!(composite.initialize().is_err());
        assert_eq!(log.lock().as_slice(), ["init:a"]);
    }

    #[test]
    fn test_composite_shuts_down_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let exporters: Vec<Arc<dyn Exporter>> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                Arc::new(FailingExporter {
                    fail_init: false,
                    log: Arc::clone(&log),
                    name,
                }) as Arc<dyn Exporter>
            })
            .collect();

        CompositeExporter::new(exporters).unwrap().shutdown().unwrap();
        assert_eq!(
            log.lock().as_slice(),
            ["shutdown:c", "shutdown:b", "shutdown:a"]
        );
    }

    #[test]
    fn test_in_memory_filters_by_type() {
        let memory = InMemoryExporter::new();
        memory.initialize().unwrap();
        memory.export_batch(&batch()).unwrap();

        assert!(memory.is_initialized());
        assert_eq!(memory.events_of_type("custom").len(), 1);
        assert!(memory.events_of_type("tool_call").is_empty());
    }
}
