// src/trace/context.rs
//! Live context of one traced run
//!
//! Every emission builds an event stamped with the run id and the current
//! parent event, finishes it immediately and offers it to the queue without
//! blocking. Nothing here returns an error to the caller: failures are
//! logged and surface as `None`.

use crate::events::{
    AgentCommunication, AgentHandoff, AgentJoin, AgentLeave, AgentSpawn, CustomEvent, ErrorInfo,
    Event, EventKind, EventMap, EventPayload, FinalAnswer, MemoryRead, MemoryWrite, ModelCall,
    RunEnd, RunStart, RunStatus, TaskAssign, TaskComplete, ToolCall,
};
use crate::recording::event_queue::{EnqueueMode, EventQueue};
use crate::utils::config::TraceConfig;
use crate::utils::time::now_ms;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Labels attached to a run at start
#[derive(Debug, Clone, Default)]
pub struct RunLabels {
    pub agent_type: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: EventMap,
}

/// How an emitted event is finished
enum Finish {
    Completed(Option<Value>),
    Failed { error_type: String, message: String },
}

struct ContextState {
    active: bool,
    closed: bool,
    error_occurred: bool,
    status: RunStatus,
    end_time_ms: Option<i64>,

    /// Parent event ids for nesting; the last one is current
    parents: Vec<String>,

    /// Event maps accepted by the queue, in emission order
    events: Vec<EventMap>,
}

/// Context of one run while its scope is open
pub struct TraceContext {
    run_id: String,
    run_name: String,
    labels: RunLabels,
    config: Arc<TraceConfig>,
    queue: Arc<EventQueue>,
    start_time_ms: i64,
    state: Mutex<ContextState>,
}

impl TraceContext {
    /// Create the context and emit its run-start event
    pub(crate) fn start(
        run_id: String,
        run_name: String,
        labels: RunLabels,
        config: Arc<TraceConfig>,
        queue: Arc<EventQueue>,
    ) -> Arc<Self> {
        let context = Arc::new(Self {
            run_id,
            run_name,
            labels,
            config,
            queue,
            start_time_ms: now_ms(),
            state: Mutex::new(ContextState {
                active: true,
                closed: false,
                error_occurred: false,
                status: RunStatus::Running,
                end_time_ms: None,
                parents: Vec::new(),
                events: Vec::new(),
            }),
        });

        let start = RunStart {
            run_name: context.run_name.clone(),
            agent_type: context.labels.agent_type.clone(),
            user_id: context.labels.user_id.clone(),
            session_id: context.labels.session_id.clone(),
        };
        match Event::builder(&context.run_id, EventPayload::RunStart(start))
            .timestamp_ms(context.start_time_ms)
            .metadata(context.labels.metadata.clone())
            .build()
        {
            Ok(event) => {
                let mut state = context.state.lock();
                context.enqueue_event(
                    &mut state,
                    event,
                    Some(Finish::Completed(None)),
                    EnqueueMode::NonBlocking,
                );
            }
            Err(e) => error!("Failed to build run start for {}: {}", context.run_id, e),
        }

        debug!("Started trace run: {} ({})", context.run_id, context.run_name);
        context
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn labels(&self) -> &RunLabels {
        &self.labels
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn error_occurred(&self) -> bool {
        self.state.lock().error_occurred
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    /// Milliseconds since start, or the final duration once completed
    pub fn duration_ms(&self) -> i64 {
        let end = self.state.lock().end_time_ms.unwrap_or_else(now_ms);
        (end - self.start_time_ms).max(0)
    }

    /// Current parent event id
    pub fn parent_event_id(&self) -> Option<String> {
        self.state.lock().parents.last().cloned()
    }

    /// Events accepted by the queue so far
    pub fn events(&self) -> Vec<EventMap> {
        self.state.lock().events.clone()
    }

    /// Nest subsequent events under `event_id` until the guard drops
    pub fn push_parent(&self, event_id: impl Into<String>) -> ParentGuard<'_> {
        let event_id = event_id.into();
        self.state.lock().parents.push(event_id.clone());
        ParentGuard {
            context: self,
            event_id,
        }
    }

    // ---------------------------------------------------------------------
    // Emission
    // ---------------------------------------------------------------------

    pub fn model_call(&self, call: ModelCall) -> Option<Event> {
        self.record(EventPayload::ModelCall(call), |_| Finish::Completed(None))
    }

    pub fn tool_call(&self, call: ToolCall) -> Option<Event> {
        self.record(EventPayload::ToolCall(call), |payload| match payload {
            EventPayload::ToolCall(c) => {
                Finish::Completed(Some(json!({ "tool_result": c.tool_result })))
            }
            _ => Finish::Completed(None),
        })
    }

    pub fn memory_read(&self, read: MemoryRead) -> Option<Event> {
        self.record(EventPayload::MemoryRead(read), |payload| match payload {
            EventPayload::MemoryRead(r) => {
                Finish::Completed(Some(json!({ "memory_value": r.memory_value })))
            }
            _ => Finish::Completed(None),
        })
    }

    pub fn memory_write(&self, write: MemoryWrite) -> Option<Event> {
        self.record(EventPayload::MemoryWrite(write), |payload| match payload {
            EventPayload::MemoryWrite(w) => {
                Finish::Completed(Some(json!({ "memory_value": w.memory_value })))
            }
            _ => Finish::Completed(None),
        })
    }

    /// Record an error; the run will end as `failed`
    pub fn error(&self, info: ErrorInfo) -> Option<Event> {
        self.emit_payload(EventPayload::Error(info))
    }

    /// Record the final answer and deactivate the context
    pub fn final_answer(&self, answer: FinalAnswer) -> Option<Event> {
        let event = self.record(EventPayload::FinalAnswer(answer), |payload| match payload {
            EventPayload::FinalAnswer(a) => Finish::Completed(Some(json!({ "answer": a.answer }))),
            _ => Finish::Completed(None),
        })?;
        self.state.lock().active = false;
        Some(event)
    }

    pub fn custom(&self, custom_type: impl Into<String>, data: Value) -> Option<Event> {
        self.record(
            EventPayload::Custom(CustomEvent::new(custom_type, data)),
            |_| Finish::Completed(None),
        )
    }

    pub fn agent_spawn(&self, spawn: AgentSpawn) -> Option<Event> {
        self.record(EventPayload::AgentSpawn(spawn), |_| Finish::Completed(None))
    }

    pub fn agent_join(&self, join: AgentJoin) -> Option<Event> {
        self.record(EventPayload::AgentJoin(join), |_| Finish::Completed(None))
    }

    pub fn agent_leave(&self, leave: AgentLeave) -> Option<Event> {
        self.record(EventPayload::AgentLeave(leave), |_| Finish::Completed(None))
    }

    pub fn agent_communication(&self, message: AgentCommunication) -> Option<Event> {
        self.record(EventPayload::AgentCommunication(message), |_| {
            Finish::Completed(None)
        })
    }

    pub fn agent_handoff(&self, handoff: AgentHandoff) -> Option<Event> {
        self.record(EventPayload::AgentHandoff(handoff), |_| Finish::Completed(None))
    }

    pub fn task_assign(&self, task: TaskAssign) -> Option<Event> {
        self.record(EventPayload::TaskAssign(task), |_| Finish::Completed(None))
    }

    pub fn task_complete(&self, task: TaskComplete) -> Option<Event> {
        self.record(EventPayload::TaskComplete(task), |payload| match payload {
            EventPayload::TaskComplete(t) => Finish::Completed(Some(json!({ "result": t.result }))),
            _ => Finish::Completed(None),
        })
    }

    /// Emit any payload, finished as completed
    pub fn emit_payload(&self, payload: EventPayload) -> Option<Event> {
        if let EventPayload::Error(_) = payload {
            let mut state = self.state.lock();
            if state.active {
                state.error_occurred = true;
            }
        }
        self.record(payload, |payload| match payload {
            EventPayload::Error(e) => Finish::Failed {
                error_type: e.error_type.clone(),
                message: e.error_message.clone(),
            },
            _ => Finish::Completed(None),
        })
    }

    /// Emit a pre-built event. Its run id is kept; the current parent is
    /// attached if it has none. Unfinished events are marked completed.
    pub fn emit(&self, mut event: Event) -> Option<Event> {
        let mut state = self.state.lock();
        if !state.active {
            warn!("Attempted to emit event on inactive trace context");
            return None;
        }

        if event.run_id() != self.run_id {
            debug!(
                "Emitting event {} of run {} on context of run {}",
                event.event_id(),
                event.run_id(),
                self.run_id
            );
        }
        event.adopt_parent(state.parents.last().map(String::as_str));
        if event.kind() == EventKind::Error {
            state.error_occurred = true;
        }

        let finish = if event.status().is_finished() {
            None
        } else {
            Some(Finish::Completed(None))
        };
        self.enqueue_event(&mut state, event, finish, EnqueueMode::NonBlocking)
    }

    /// Deactivate without a final answer
    pub fn complete(&self, success: bool) {
        let mut state = self.state.lock();
        state.status = if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        state.active = false;
        state.end_time_ms.get_or_insert_with(now_ms);
        debug!(
            "Completed trace run: {} (status: {})",
            self.run_id, state.status
        );
    }

    // ---------------------------------------------------------------------
    // Scope exit
    // ---------------------------------------------------------------------

    /// Mark the run failed by an error escaping its scope. The error event is
    /// only emitted while the context is still active.
    pub(crate) fn fail_scope(&self, error_type: &str, message: &str) {
        let active = {
            let mut state = self.state.lock();
            state.error_occurred = true;
            state.active
        };
        if active {
            self.error(ErrorInfo::new(error_type, message).critical());
        }
    }

    /// Deactivate and emit run-end. Runs at most once.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.active = false;

        let end = *state.end_time_ms.get_or_insert_with(now_ms);
        let duration_ms = (end - self.start_time_ms).max(0);

        let mut status = if state.error_occurred {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let mut delete_run = false;
        if self.config.only_on_error && !state.error_occurred {
            debug!("Deleting run {} (only_on_error and no error)", self.run_id);
            status = RunStatus::Deleted;
            delete_run = true;
        }
        state.status = status;

        let run_end = RunEnd {
            run_status: status,
            completed_at: end,
            delete_run,
        };
        let event = match Event::new(&self.run_id, EventPayload::RunEnd(run_end)) {
            Ok(event) => event,
            Err(e) => {
                error!("Failed to build run end for {}: {}", self.run_id, e);
                return;
            }
        };

        let mode = if self.config.block_on_run_end {
            EnqueueMode::Blocking(self.config.run_end_block_timeout())
        } else {
            EnqueueMode::NonBlocking
        };

        if let Some(mut event) = self.finish_event(event, Finish::Completed(None)) {
            event.set_duration(duration_ms);
            self.push_to_queue(&mut state, event, mode);
        }

        debug!(
            "Trace run {} completed in {}ms (status: {})",
            self.run_id, duration_ms, status
        );
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn record(
        &self,
        payload: EventPayload,
        finish: impl FnOnce(&EventPayload) -> Finish,
    ) -> Option<Event> {
        let mut state = self.state.lock();
        if !state.active {
            warn!("Attempted to emit event on inactive trace context");
            return None;
        }

        let finish = finish(&payload);
        let event = match Event::builder(&self.run_id, payload)
            .parent(state.parents.last().cloned())
            .build()
        {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping event for run {}: {}", self.run_id, e);
                return None;
            }
        };

        self.enqueue_event(&mut state, event, Some(finish), EnqueueMode::NonBlocking)
    }

    fn enqueue_event(
        &self,
        state: &mut ContextState,
        event: Event,
        finish: Option<Finish>,
        mode: EnqueueMode,
    ) -> Option<Event> {
        let event = match finish {
            Some(finish) => self.finish_event(event, finish)?,
            None => event,
        };
        self.push_to_queue(state, event, mode)
    }

    fn finish_event(&self, mut event: Event, finish: Finish) -> Option<Event> {
        let result = match finish {
            Finish::Completed(output) => event.mark_completed(output),
            Finish::Failed {
                error_type,
                message,
            } => event.mark_failed(&error_type, &message),
        };
        match result {
            Ok(()) => Some(event),
            Err(e) => {
                warn!("Dropping event {}: {}", event.event_id(), e);
                None
            }
        }
    }

    fn push_to_queue(
        &self,
        state: &mut ContextState,
        event: Event,
        mode: EnqueueMode,
    ) -> Option<Event> {
        let map = match event.to_map() {
            Ok(map) => map,
            Err(e) => {
                error!("Failed to queue event {}: {}", event.event_id(), e);
                return None;
            }
        };

        if self.queue.enqueue(map.clone(), mode) {
            state.events.push(map);
        }
        Some(event)
    }

    fn pop_parent(&self, event_id: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.parents.iter().rposition(|id| id == event_id) {
            state.parents.remove(pos);
        }
    }
}

/// Pops its parent event id on drop
pub struct ParentGuard<'a> {
    context: &'a TraceContext,
    event_id: String,
}

impl ParentGuard<'_> {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }
}

impl Drop for ParentGuard<'_> {
    fn drop(&mut self) {
        self.context.pop_parent(&self.event_id);
    }
}
