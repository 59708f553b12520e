// src/storage/models.rs
//! Row types and query filters for the read path

use crate::events::{EventKind, EventMap, RunStatus};
use crate::utils::errors::Result;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::Serialize;

/// One row of the `runs` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub name: String,
    pub status: RunStatus,

    /// Milliseconds since epoch
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,

    pub agent_type: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,

    pub metadata: EventMap,

    /// Row creation time (SQLite `CURRENT_TIMESTAMP`)
    pub created_at: Option<String>,
}

impl RunRecord {
    /// A fresh `running` run
    pub fn new(id: impl Into<String>, name: impl Into<String>, started_at: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            agent_type: None,
            user_id: None,
            session_id: None,
            metadata: EventMap::new(),
            created_at: None,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let status = RunStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown run status '{}'", status).into(),
            )
        })?;

        let metadata: Option<String> = row.get("metadata")?;
        let metadata = metadata
            .and_then(|text| serde_json::from_str::<EventMap>(&text).ok())
            .unwrap_or_default();

        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            status,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            duration_ms: row.get("duration_ms")?,
            agent_type: row.get("agent_type")?,
            user_id: row.get("user_id")?,
            session_id: row.get("session_id")?,
            metadata,
            created_at: row.get("created_at")?,
        })
    }
}

/// Partial update applied by [`Database::update_run`](super::Database::update_run);
/// `None` fields are left unchanged and metadata is merged
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<EventMap>,
}

/// One row of the `steps` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub timestamp: i64,

    /// Event kind wire name
    #[serde(rename = "type")]
    pub kind: String,

    pub name: Option<String>,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub parent_event_id: Option<String>,

    /// Processed payload; absent in lean projections
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

impl StepRecord {
    pub(crate) fn from_row(row: &Row<'_>, with_data: bool) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            timestamp: row.get("timestamp")?,
            kind: row.get("type")?,
            name: row.get("name")?,
            status: row.get("status")?,
            duration_ms: row.get("duration_ms")?,
            parent_event_id: row.get("parent_event_id")?,
            data: if with_data { row.get("data")? } else { None },
        })
    }
}

/// Sort column for run listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOrder {
    #[default]
    StartedAt,
    CompletedAt,
    DurationMs,
    Name,
}

impl RunOrder {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            RunOrder::StartedAt => "started_at",
            RunOrder::CompletedAt => "completed_at",
            RunOrder::DurationMs => "duration_ms",
            RunOrder::Name => "name",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started_at" => Some(RunOrder::StartedAt),
            "completed_at" => Some(RunOrder::CompletedAt),
            "duration_ms" => Some(RunOrder::DurationMs),
            "name" => Some(RunOrder::Name),
            _ => None,
        }
    }
}

/// Run listing filters and pagination
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub limit: usize,
    pub offset: usize,
    pub status: Option<RunStatus>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,

    /// Substring match on run name
    pub search: Option<String>,

    pub started_after: Option<i64>,
    pub started_before: Option<i64>,

    pub order_by: RunOrder,
    pub descending: bool,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            status: None,
            user_id: None,
            session_id: None,
            search: None,
            started_after: None,
            started_before: None,
            order_by: RunOrder::StartedAt,
            descending: true,
        }
    }
}

/// Per-run step listing filters
#[derive(Debug, Clone, Default)]
pub struct StepFilter {
    pub limit: Option<usize>,
    pub offset: usize,
    pub event_type: Option<EventKind>,
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_runs: u64,
    pub running_runs: u64,
    pub completed_runs: u64,
    pub failed_runs: u64,
    pub total_steps: u64,

    /// Allocated pages times page size
    pub db_size_bytes: u64,

    /// Runs started in the last 24 hours
    pub recent_runs_24h: u64,
}

/// One timeline entry of an exported run
#[derive(Debug, Clone, Serialize)]
pub struct ExportedStep {
    #[serde(flatten)]
    pub step: StepRecord,

    /// Decoded payload, or `None` if it could not be decoded
    pub data: Option<EventMap>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
}

/// A run with its decoded timeline
#[derive(Debug, Clone, Serialize)]
pub struct RunExport {
    pub run: RunRecord,
    pub timeline: Vec<ExportedStep>,
}

/// Read-only query surface consumed by API layers
pub trait ReadStore: Send + Sync {
    fn get_stats(&self) -> Result<StorageStats>;

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>>;

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    fn get_run_steps(&self, run_id: &str, filter: &StepFilter) -> Result<Vec<StepRecord>>;

    fn get_run_timeline(&self, run_id: &str, include_data: bool) -> Result<Vec<StepRecord>>;

    fn get_step_data(&self, step_id: &str) -> Result<Option<Vec<u8>>>;
}
