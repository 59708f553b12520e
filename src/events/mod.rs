// src/events/mod.rs
//! Event model
//!
//! An [`Event`] is a shared envelope (identity, run, timing, status, call-tree
//! parent, free-form metadata/input/output) around a kind-specific
//! [`EventPayload`]. Events are immutable once built except for a single
//! transition to `completed` or `failed`.
//!
//! The flattened JSON object produced by [`Event::to_map`] is the unit that
//! travels through the queue, the processing pipeline and storage.

pub mod payload;

pub use payload::{
    AgentCommunication, AgentHandoff, AgentJoin, AgentLeave, AgentSpawn, CustomEvent, ErrorInfo,
    EventPayload, FinalAnswer, MemoryRead, MemoryWrite, ModelCall, RunEnd, RunStart, TaskAssign,
    TaskComplete, ToolCall,
};

use crate::utils::errors::{EngineError, Result};
use crate::utils::time::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Serialized event, as handed to exporters
pub type EventMap = serde_json::Map<String, Value>;

/// Event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    RunEnd,
    ModelCall,
    ToolCall,
    MemoryRead,
    MemoryWrite,
    Error,
    FinalAnswer,
    Custom,
    AgentSpawn,
    AgentJoin,
    AgentLeave,
    AgentCommunication,
    AgentHandoff,
    TaskAssign,
    TaskComplete,
}

impl EventKind {
    pub const ALL: [EventKind; 16] = [
        EventKind::RunStart,
        EventKind::RunEnd,
        EventKind::ModelCall,
        EventKind::ToolCall,
        EventKind::MemoryRead,
        EventKind::MemoryWrite,
        EventKind::Error,
        EventKind::FinalAnswer,
        EventKind::Custom,
        EventKind::AgentSpawn,
        EventKind::AgentJoin,
        EventKind::AgentLeave,
        EventKind::AgentCommunication,
        EventKind::AgentHandoff,
        EventKind::TaskAssign,
        EventKind::TaskComplete,
    ];

    /// Wire name (the `type` field)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStart => "run_start",
            EventKind::RunEnd => "run_end",
            EventKind::ModelCall => "model_call",
            EventKind::ToolCall => "tool_call",
            EventKind::MemoryRead => "memory_read",
            EventKind::MemoryWrite => "memory_write",
            EventKind::Error => "error",
            EventKind::FinalAnswer => "final_answer",
            EventKind::Custom => "custom",
            EventKind::AgentSpawn => "agent_spawn",
            EventKind::AgentJoin => "agent_join",
            EventKind::AgentLeave => "agent_leave",
            EventKind::AgentCommunication => "agent_communication",
            EventKind::AgentHandoff => "agent_handoff",
            EventKind::TaskAssign => "task_assign",
            EventKind::TaskComplete => "task_complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == value)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Deleted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "deleted" => Some(RunStatus::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded occurrence inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,
    run_id: String,

    /// Milliseconds since epoch
    timestamp_ms: i64,

    name: String,
    status: EventStatus,
    duration_ms: Option<i64>,
    parent_event_id: Option<String>,

    #[serde(default)]
    metadata: EventMap,

    #[serde(default)]
    input: Option<Value>,

    #[serde(default)]
    output: Option<Value>,

    #[serde(flatten)]
    payload: EventPayload,
}

impl Event {
    /// Create an event with a fresh id, the current time and a derived name
    pub fn new(run_id: impl Into<String>, payload: EventPayload) -> Result<Self> {
        EventBuilder::new(run_id, payload).build()
    }

    pub fn builder(run_id: impl Into<String>, payload: EventPayload) -> EventBuilder {
        EventBuilder::new(run_id, payload)
    }

    /// Rebuild an event from its serialized form
    pub fn from_map(map: EventMap) -> Result<Self> {
        let event: Event = serde_json::from_value(Value::Object(map))
            .map_err(|e| EngineError::InvalidEvent(format!("Malformed event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<()> {
        if self.run_id.is_empty() {
            return Err(EngineError::InvalidEvent("run_id is required".to_string()));
        }
        if self.event_id.is_empty() {
            return Err(EngineError::InvalidEvent("event_id is required".to_string()));
        }
        if self.status.is_finished() && self.duration_ms.is_none() {
            return Err(EngineError::InvalidEvent(format!(
                "Event {} is {} without a duration",
                self.event_id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Flatten into the map representation used by exporters
    pub fn to_map(&self) -> Result<EventMap> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(EngineError::SerializationFailed(format!(
                "Event {} serialized to non-object {}",
                self.event_id, other
            ))),
            Err(e) => Err(EngineError::SerializationFailed(format!(
                "Event {}: {}",
                self.event_id, e
            ))),
        }
    }

    /// Finish the event successfully. Allowed once.
    pub fn mark_completed(&mut self, output: Option<Value>) -> Result<()> {
        self.finish(EventStatus::Completed)?;
        if output.is_some() {
            self.output = output;
        }
        Ok(())
    }

    /// Finish the event as failed. Allowed once.
    pub fn mark_failed(&mut self, error_type: &str, error_message: &str) -> Result<()> {
        self.finish(EventStatus::Failed)?;
        self.output = Some(json!({
            "error_type": error_type,
            "error_message": error_message,
        }));
        Ok(())
    }

    fn finish(&mut self, status: EventStatus) -> Result<()> {
        if self.status.is_finished() {
            return Err(EngineError::InvalidEvent(format!(
                "Event {} already {}",
                self.event_id,
                self.status.as_str()
            )));
        }
        self.status = status;
        self.duration_ms = Some((now_ms() - self.timestamp_ms).max(0));
        Ok(())
    }

    /// Replace the measured duration of a finished event (run-end carries
    /// the whole run's duration)
    pub(crate) fn set_duration(&mut self, duration_ms: i64) {
        if self.status.is_finished() {
            self.duration_ms = Some(duration_ms.max(0));
        }
    }

    /// Attach to `parent` unless the event already has a parent
    pub(crate) fn adopt_parent(&mut self, parent: Option<&str>) {
        if self.parent_event_id.is_none() {
            self.parent_event_id = parent.map(str::to_string);
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.duration_ms
    }

    pub fn parent_event_id(&self) -> Option<&str> {
        self.parent_event_id.as_deref()
    }

    pub fn metadata(&self) -> &EventMap {
        &self.metadata
    }

    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }
}

/// Builder for [`Event`]
pub struct EventBuilder {
    run_id: String,
    payload: EventPayload,
    name: Option<String>,
    timestamp_ms: Option<i64>,
    parent_event_id: Option<String>,
    metadata: EventMap,
    input: Option<Value>,
}

impl EventBuilder {
    pub fn new(run_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            run_id: run_id.into(),
            payload,
            name: None,
            timestamp_ms: None,
            parent_event_id: None,
            metadata: EventMap::new(),
            input: None,
        }
    }

    /// Override the derived display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn parent(mut self, parent_event_id: Option<String>) -> Self {
        self.parent_event_id = parent_event_id;
        self
    }

    pub fn metadata(mut self, metadata: EventMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn build(self) -> Result<Event> {
        if self.run_id.is_empty() {
            return Err(EngineError::InvalidEvent("run_id is required".to_string()));
        }

        let name = self.name.unwrap_or_else(|| self.payload.display_name());

        Ok(Event {
            event_id: ulid::Ulid::new().to_string(),
            run_id: self.run_id,
            timestamp_ms: self.timestamp_ms.unwrap_or_else(now_ms),
            name,
            status: EventStatus::Started,
            duration_ms: None,
            parent_event_id: self.parent_event_id,
            metadata: self.metadata,
            input: self.input,
            output: None,
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_payload() -> EventPayload {
        EventPayload::ToolCall(ToolCall {
            tool_name: "search".to_string(),
            tool_args: json!({"q": "flights"}),
            tool_result: json!(["AA100"]),
            tool_type: Some("search".to_string()),
        })
    }

    #[test]
    fn test_event_requires_run_id() {
        let result = Event::new("", tool_payload());
        assert!(matches!(result, Err(EngineError::InvalidEvent(_))));
    }

    #[test]
    fn test_event_defaults() {
        let event = Event::new("run_1", tool_payload()).unwrap();
        assert_eq!(event.run_id(), "run_1");
        assert_eq!(event.kind(), EventKind::ToolCall);
        assert_eq!(event.name(), "search");
        assert_eq!(event.status(), EventStatus::Started);
        assert!(event.duration_ms().is_none());
        assert!(!event.event_id().is_empty());
    }

    #[test]
    fn test_mark_completed_is_write_once() {
        let mut event = Event::new("run_1", tool_payload()).unwrap();
        event
            .mark_completed(Some(json!({"tool_result": ["AA100"]})))
            .unwrap();
        assert_eq!(event.status(), EventStatus::Completed);
        assert!(event.duration_ms().is_some());

        assert!(event.mark_completed(None).is_err());
        assert!(event.mark_failed("Boom", "again").is_err());
        assert_eq!(event.status(), EventStatus::Completed);
    }

    #[test]
    fn test_mark_failed_sets_error_output() {
        let mut event = Event::new("run_1", tool_payload()).unwrap();
        event.mark_failed("ValueError", "bad input").unwrap();

        assert_eq!(event.status(), EventStatus::Failed);
        let output = event.output().unwrap();
        assert_eq!(output["error_type"], "ValueError");
        assert_eq!(output["error_message"], "bad input");
    }

    #[test]
    fn test_map_is_flat_with_type_tag() {
        let mut event = Event::builder("run_1", tool_payload())
            .parent(Some("evt_parent".to_string()))
            .build()
            .unwrap();
        event.mark_completed(None).unwrap();

        let map = event.to_map().unwrap();
        assert_eq!(map["type"], "tool_call");
        assert_eq!(map["tool_name"], "search");
        assert_eq!(map["run_id"], "run_1");
        assert_eq!(map["status"], "completed");
        assert_eq!(map["parent_event_id"], "evt_parent");

        let back = Event::from_map(map).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_from_map_rejects_finished_without_duration() {
        let event = Event::new("run_1", tool_payload()).unwrap();
        let mut map = event.to_map().unwrap();
        map.insert("status".to_string(), json!("completed"));

        assert!(Event::from_map(map).is_err());
    }

    #[test]
    fn test_kind_wire_names() {
        for kind in EventKind::ALL {
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, kind.as_str());
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }
}
