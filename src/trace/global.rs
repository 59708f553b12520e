// src/trace/global.rs
//! Process-wide trace
//!
//! Built lazily from [`get_config`] on first use and replaceable with
//! [`set_trace`]; `set_trace(None)` forces the next call to rebuild it.

use crate::events::{ErrorInfo, Event, FinalAnswer, MemoryRead, MemoryWrite, ModelCall, ToolCall};
use crate::trace::context::TraceContext;
use crate::trace::scope;
use crate::trace::tracer::{RunOptions, RunScope, Trace};
use crate::utils::config::get_config;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

static GLOBAL_TRACE: Lazy<Mutex<Option<Arc<Trace>>>> = Lazy::new(|| Mutex::new(None));

/// The process-wide trace, created on first call
pub fn get_trace() -> Arc<Trace> {
    let mut slot = GLOBAL_TRACE.lock();
    if let Some(trace) = slot.as_ref() {
        return Arc::clone(trace);
    }

    let config = get_config();
    let trace = Arc::new(Trace::new(config.as_ref().clone()));
    *slot = Some(Arc::clone(&trace));
    debug!("Created global trace");
    trace
}

/// Replace the process-wide trace. The previous one shuts down once its
/// last handle is dropped and its open runs have ended.
pub fn set_trace(trace: Option<Arc<Trace>>) {
    let previous = std::mem::replace(&mut *GLOBAL_TRACE.lock(), trace);
    drop(previous);
}

/// Start a run on the global trace
pub fn run(options: impl Into<RunOptions>) -> RunScope {
    get_trace().run(options)
}

pub fn in_run<R>(
    options: impl Into<RunOptions>,
    f: impl FnOnce(Option<Arc<TraceContext>>) -> R,
) -> R {
    get_trace().in_run(options, f)
}

pub async fn run_async<F, Fut>(options: impl Into<RunOptions>, f: F) -> Fut::Output
where
    F: FnOnce(Option<Arc<TraceContext>>) -> Fut,
    Fut: Future,
{
    let trace = get_trace();
    trace.run_async(options, f).await
}

/// Innermost open context on this thread or task
pub fn get_active_context() -> Option<Arc<TraceContext>> {
    scope::current()
}

fn with_active<T>(f: impl FnOnce(&TraceContext) -> Option<T>) -> Option<T> {
    match scope::current() {
        Some(context) => f(&context),
        None => {
            warn!("No active trace context; event not recorded");
            None
        }
    }
}

pub fn model_call(call: ModelCall) -> Option<Event> {
    with_active(|context| context.model_call(call))
}

pub fn tool_call(call: ToolCall) -> Option<Event> {
    with_active(|context| context.tool_call(call))
}

pub fn memory_read(read: MemoryRead) -> Option<Event> {
    with_active(|context| context.memory_read(read))
}

pub fn memory_write(write: MemoryWrite) -> Option<Event> {
    with_active(|context| context.memory_write(write))
}

pub fn error(info: ErrorInfo) -> Option<Event> {
    with_active(|context| context.error(info))
}

pub fn final_answer(answer: FinalAnswer) -> Option<Event> {
    with_active(|context| context.final_answer(answer))
}

pub fn custom(custom_type: impl Into<String>, data: Value) -> Option<Event> {
    with_active(|context| context.custom(custom_type, data))
}
