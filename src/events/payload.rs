// src/events/payload.rs
//! Kind-specific event fields
//!
//! Each variant of [`EventPayload`] carries only the fields of its kind. On
//! the wire the variant is selected by the `type` tag and its fields sit
//! alongside the envelope fields.

use crate::events::{EventKind, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind-specific part of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStart(RunStart),
    RunEnd(RunEnd),
    ModelCall(ModelCall),
    ToolCall(ToolCall),
    MemoryRead(MemoryRead),
    MemoryWrite(MemoryWrite),
    Error(ErrorInfo),
    FinalAnswer(FinalAnswer),
    Custom(CustomEvent),
    AgentSpawn(AgentSpawn),
    AgentJoin(AgentJoin),
    AgentLeave(AgentLeave),
    AgentCommunication(AgentCommunication),
    AgentHandoff(AgentHandoff),
    TaskAssign(TaskAssign),
    TaskComplete(TaskComplete),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::RunStart(_) => EventKind::RunStart,
            EventPayload::RunEnd(_) => EventKind::RunEnd,
            EventPayload::ModelCall(_) => EventKind::ModelCall,
            EventPayload::ToolCall(_) => EventKind::ToolCall,
            EventPayload::MemoryRead(_) => EventKind::MemoryRead,
            EventPayload::MemoryWrite(_) => EventKind::MemoryWrite,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::FinalAnswer(_) => EventKind::FinalAnswer,
            EventPayload::Custom(_) => EventKind::Custom,
            EventPayload::AgentSpawn(_) => EventKind::AgentSpawn,
            EventPayload::AgentJoin(_) => EventKind::AgentJoin,
            EventPayload::AgentLeave(_) => EventKind::AgentLeave,
            EventPayload::AgentCommunication(_) => EventKind::AgentCommunication,
            EventPayload::AgentHandoff(_) => EventKind::AgentHandoff,
            EventPayload::TaskAssign(_) => EventKind::TaskAssign,
            EventPayload::TaskComplete(_) => EventKind::TaskComplete,
        }
    }

    /// Human-readable name shown in timelines
    pub fn display_name(&self) -> String {
        fn or(value: &str, fallback: &str) -> String {
            if value.is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        }

        match self {
            EventPayload::RunStart(p) => or(&p.run_name, "Run Start"),
            EventPayload::RunEnd(_) => "Run End".to_string(),
            EventPayload::ModelCall(p) => or(&p.model, "Model Call"),
            EventPayload::ToolCall(p) => or(&p.tool_name, "Tool Call"),
            EventPayload::MemoryRead(p) => format!("Read: {}", or(&p.memory_key, "Unknown")),
            EventPayload::MemoryWrite(p) => format!("Write: {}", or(&p.memory_key, "Unknown")),
            EventPayload::Error(p) => or(&p.error_type, "Error"),
            EventPayload::FinalAnswer(_) => "Final Answer".to_string(),
            EventPayload::Custom(p) => or(&p.custom_type, "Custom"),
            EventPayload::AgentSpawn(p) => format!("Spawn: {}", p.agent_name),
            EventPayload::AgentJoin(p) => format!("Join: {}", p.agent_name),
            EventPayload::AgentLeave(p) => format!("Leave: {}", p.agent_name),
            EventPayload::AgentCommunication(p) => match &p.to_agent_name {
                Some(to) => format!("{} → {}", p.from_agent_name, to),
                None => format!("{} → All", p.from_agent_name),
            },
            EventPayload::AgentHandoff(p) => {
                format!("Handoff: {} → {}", p.from_agent_name, p.to_agent_name)
            }
            EventPayload::TaskAssign(p) => {
                format!("Task: {} → {}", p.task_name, p.assigned_to_agent_name)
            }
            EventPayload::TaskComplete(p) => {
                let mark = if p.success { "✓" } else { "✗" };
                format!("{} Task: {}", mark, p.task_name)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStart {
    pub run_name: String,

    /// Agent framework (e.g. "langchain")
    pub agent_type: Option<String>,

    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunEnd {
    pub run_status: RunStatus,

    /// Completion timestamp (milliseconds)
    pub completed_at: i64,

    /// Physically remove the run and its steps
    pub delete_run: bool,
}

impl Default for RunEnd {
    fn default() -> Self {
        Self {
            run_status: RunStatus::Completed,
            completed_at: 0,
            delete_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCall {
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub streaming: bool,

    /// Time to first token when streaming (milliseconds)
    pub first_token_latency_ms: Option<i64>,

    /// Time to last token when streaming (milliseconds)
    pub last_token_latency_ms: Option<i64>,

    #[serde(with = "float_repr")]
    pub tokens_per_second: Option<f64>,

    #[serde(with = "float_repr")]
    pub temperature: Option<f64>,

    pub max_tokens: Option<u64>,
}

impl ModelCall {
    pub fn new(
        model: impl Into<String>,
        prompt: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            response: response.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_args: Value,
    pub tool_result: Value,

    /// e.g. "search", "calculator", "api"
    pub tool_type: Option<String>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, tool_args: Value, tool_result: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args,
            tool_result,
            tool_type: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRead {
    pub memory_key: String,
    pub memory_value: Value,

    /// e.g. "vector", "key_value", "cache"
    pub memory_type: Option<String>,
}

impl MemoryRead {
    pub fn new(memory_key: impl Into<String>, memory_value: Value) -> Self {
        Self {
            memory_key: memory_key.into(),
            memory_value,
            memory_type: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryWrite {
    pub memory_key: String,
    pub memory_value: Value,
    pub memory_type: Option<String>,
    pub overwrite: bool,
}

impl MemoryWrite {
    pub fn new(memory_key: impl Into<String>, memory_value: Value) -> Self {
        Self {
            memory_key: memory_key.into(),
            memory_value,
            memory_type: None,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInfo {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,

    /// Error stopped execution of the run
    pub critical: bool,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            ..Default::default()
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalAnswer {
    pub answer: String,

    /// e.g. "text", "json", "action"
    pub answer_type: Option<String>,

    pub success: bool,
}

impl FinalAnswer {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..Default::default()
        }
    }
}

impl Default for FinalAnswer {
    fn default() -> Self {
        Self {
            answer: String::new(),
            answer_type: None,
            success: true,
        }
    }
}

/// Application-defined event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomEvent {
    pub custom_type: String,
    pub data: Value,
}

impl CustomEvent {
    pub fn new(custom_type: impl Into<String>, data: Value) -> Self {
        Self {
            custom_type: custom_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpawn {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_role: Option<String>,
    pub parent_run_id: Option<String>,
    pub agent_config: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentJoin {
    pub agent_id: String,
    pub agent_name: String,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLeave {
    pub agent_id: String,
    pub agent_name: String,
    pub group_id: Option<String>,
    pub reason: Option<String>,
}

/// Message between agents; no recipient means broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCommunication {
    pub from_agent_id: String,
    pub from_agent_name: String,
    pub to_agent_id: Option<String>,
    pub to_agent_name: Option<String>,
    pub message_content: String,
    pub message_type: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentHandoff {
    pub from_agent_id: String,
    pub from_agent_name: String,
    pub to_agent_id: String,
    pub to_agent_name: String,
    pub handoff_reason: Option<String>,
    pub context_summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskAssign {
    pub task_id: String,
    pub task_name: String,
    pub assigned_to_agent_id: String,
    pub assigned_to_agent_name: String,
    pub assigned_by_agent_id: Option<String>,
    pub priority: Option<String>,

    /// Deadline timestamp (milliseconds)
    pub deadline: Option<i64>,

    pub task_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskComplete {
    pub task_id: String,
    pub task_name: String,
    pub completed_by_agent_id: String,
    pub completed_by_agent_name: String,
    pub success: bool,
    pub result: Value,
    pub completion_time_ms: Option<i64>,
}

impl Default for TaskComplete {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            task_name: String::new(),
            completed_by_agent_id: String::new(),
            completed_by_agent_name: String::new(),
            success: true,
            result: Value::Null,
            completion_time_ms: None,
        }
    }
}

/// Optional floats that fall back to their string form when not finite
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) if v.is_finite() => s.serialize_f64(*v),
            Some(v) => s.serialize_str(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match Option::<Repr>::deserialize(d)? {
            Some(Repr::Number(v)) => Ok(Some(v)),
            Some(Repr::Text(text)) => text
                .parse::<f64>()
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
