// src/storage/exporter.rs
//! Exporter that persists batches into SQLite
//!
//! - `run_start` creates the run row (status `running`) from its redacted
//!   fields
//! - `run_end` finalizes or deletes the run row; it is never stored as a step
//! - everything else is encoded by the pipeline and inserted as a step

use crate::events::{EventKind, EventMap, RunStatus};
use crate::processing::{EncodedEvent, ProcessingPipeline};
use crate::recording::exporter::Exporter;
use crate::storage::database::Database;
use crate::storage::models::{RunRecord, RunUpdate};
use crate::utils::config::TraceConfig;
use crate::utils::errors::{EngineError, Result};
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Writes runs and steps through the processing pipeline into [`Database`]
pub struct StorageExporter {
    config: TraceConfig,
    database: Arc<Database>,
    pipeline: OnceCell<ProcessingPipeline>,
}

impl StorageExporter {
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            config: config.clone(),
            database: Arc::new(Database::new(config)),
            pipeline: OnceCell::new(),
        }
    }

    /// Underlying database, for the read path
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.database)
    }

    fn pipeline(&self) -> Result<&ProcessingPipeline> {
        self.pipeline.get().ok_or_else(|| {
            EngineError::NotInitialized("StorageExporter used before initialize()".to_string())
        })
    }

    fn flush_steps(&self, pending: &mut Vec<EncodedEvent>, failures: &mut usize) {
        if pending.is_empty() {
            return;
        }
        match self.database.insert_steps(pending) {
            Ok(inserted) => *failures += pending.len() - inserted,
            Err(e) => {
                error!("Failed to insert batch of {} steps: {}", pending.len(), e);
                *failures += pending.len();
            }
        }
        pending.clear();
    }

    fn start_run(&self, event: &EventMap) -> Result<()> {
        let run_id = str_field(event, "run_id").unwrap_or_default();
        let mut run = RunRecord::new(
            run_id,
            str_field(event, "run_name").unwrap_or_default(),
            event.get("timestamp_ms").and_then(Value::as_i64).unwrap_or(0),
        );
        run.agent_type = str_field(event, "agent_type").map(str::to_string);
        run.user_id = str_field(event, "user_id").map(str::to_string);
        run.session_id = str_field(event, "session_id").map(str::to_string);
        if let Some(Value::Object(metadata)) = event.get("metadata") {
            run.metadata = metadata.clone();
        }

        self.database.insert_run(&run)
    }

    fn end_run(&self, event: &EventMap) -> Result<()> {
        let run_id = str_field(event, "run_id").unwrap_or_default();

        if event.get("delete_run").and_then(Value::as_bool).unwrap_or(false) {
            self.database.delete_run(run_id)?;
            return Ok(());
        }

        let update = RunUpdate {
            status: str_field(event, "run_status").and_then(RunStatus::parse),
            completed_at: event.get("completed_at").and_then(Value::as_i64),
            duration_ms: event.get("duration_ms").and_then(Value::as_i64),
            metadata: None,
        };
        self.database.update_run(run_id, &update)?;
        Ok(())
    }
}

impl Exporter for StorageExporter {
    fn initialize(&self) -> Result<()> {
        self.database.initialize()?;
        self.pipeline
            .get_or_try_init(|| ProcessingPipeline::new(&self.config))?;
        info!("Storage exporter ready ({:?})", self.database.path());
        Ok(())
    }

    fn export_batch(&self, events: &[EventMap]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let pipeline = self.pipeline()?;
        let mut pending: Vec<EncodedEvent> = Vec::with_capacity(events.len());
        let mut failures = 0usize;

        for event in events {
            let kind = str_field(event, "type").and_then(EventKind::parse);

            match kind {
                Some(EventKind::RunStart) => {
                    let inserted = pipeline
                        .redact(event)
                        .and_then(|redacted| self.start_run(&redacted));
                    if let Err(e) = inserted {
                        error!("Failed to insert run: {}", e);
                        failures += 1;
                    }
                    // Run-start is also kept as the first step of the timeline
                    match pipeline.encode_with_json(event) {
                        Ok(encoded) => pending.push(encoded),
                        Err(_) => failures += 1,
                    }
                }
                Some(EventKind::RunEnd) => {
                    // Steps of this run must land before it is finalized or deleted
                    self.flush_steps(&mut pending, &mut failures);
                    if let Err(e) = self.end_run(event) {
                        error!("Failed to finalize run: {}", e);
                        failures += 1;
                    }
                }
                _ => match pipeline.encode_with_json(event) {
                    Ok(encoded) => pending.push(encoded),
                    // Already logged with the event's identity
                    Err(_) => failures += 1,
                },
            }
        }

        self.flush_steps(&mut pending, &mut failures);

        if failures > 0 {
            return Err(EngineError::ExportFailed(format!(
                "{} of {} events could not be stored",
                failures,
                events.len()
            )));
        }

        debug!("Stored batch of {} events", events.len());
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.database.close();
        info!("Storage exporter shut down");
        Ok(())
    }
}

fn str_field<'a>(event: &'a EventMap, name: &str) -> Option<&'a str> {
    event.get(name).and_then(Value::as_str)
}
