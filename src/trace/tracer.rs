// src/trace/tracer.rs
//! Trace entry point
//!
//! [`Trace`] owns the queue, the background worker and the exporter. The
//! worker and exporter are started lazily by the first sampled run. Each
//! run is sampled, gets a [`TraceContext`] pushed on the active stack and
//! emits run-start; leaving the scope emits run-end exactly once, whether
//! the body returned, failed or panicked.
//!
//! Open runs hold the backend alive: dropping the last [`Trace`] handle
//! while a run is open stops the worker only after that run's end has been
//! drained. An explicit [`Trace::shutdown`] stops it immediately.

use crate::events::{
    AgentCommunication, AgentHandoff, AgentJoin, AgentLeave, AgentSpawn, ErrorInfo, Event,
    EventMap, FinalAnswer, MemoryRead, MemoryWrite, ModelCall, TaskAssign, TaskComplete, ToolCall,
};
use crate::recording::event_queue::{EventQueue, QueueStats};
use crate::recording::exporter::Exporter;
use crate::recording::worker::{BatchSink, BatchWorker, WorkerConfig};
use crate::storage::exporter::StorageExporter;
use crate::trace::context::{RunLabels, TraceContext};
use crate::trace::sampler::{HashSampler, Sampler};
use crate::trace::scope;
use crate::utils::config::TraceConfig;
use crate::utils::errors::Result;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Options for one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub name: String,
    pub agent_type: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: EventMap,

    /// Overrides the trace configuration for this run only
    pub config: Option<TraceConfig>,
}

impl RunOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn config(mut self, config: TraceConfig) -> Self {
        self.config = Some(config);
        self
    }
}

impl From<&str> for RunOptions {
    fn from(name: &str) -> Self {
        RunOptions::new(name)
    }
}

impl From<String> for RunOptions {
    fn from(name: String) -> Self {
        RunOptions::new(name)
    }
}

/// Handle to an open run. Dropping it ends the run.
///
/// An unsampled run yields an empty scope: no context, no events.
#[must_use = "the run ends when the scope is dropped"]
pub struct RunScope {
    context: Option<Arc<TraceContext>>,
    _backend: Option<Arc<Backend>>,

    // Must be dropped on the thread (or task) that pushed the context
    _not_send: PhantomData<*const ()>,
}

impl RunScope {
    fn new(context: Option<Arc<TraceContext>>, backend: Option<Arc<Backend>>) -> Self {
        Self {
            context,
            _backend: backend,
            _not_send: PhantomData,
        }
    }

    pub fn context(&self) -> Option<&Arc<TraceContext>> {
        self.context.as_ref()
    }

    pub fn is_sampled(&self) -> bool {
        self.context.is_some()
    }

    /// Record an error that ended the run's body; the run ends as `failed`
    pub fn fail(&self, error_type: &str, message: &str) {
        if let Some(context) = &self.context {
            context.fail_scope(error_type, message);
        }
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        if std::thread::panicking() {
            context.fail_scope("panic", "run scope exited by panic");
        }
        scope::pop(&context);
        context.close();
    }
}

/// Closes an async run when its future completes or is dropped
struct AsyncExit {
    context: Option<Arc<TraceContext>>,
    _backend: Option<Arc<Backend>>,
}

impl Drop for AsyncExit {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            context.close();
        }
    }
}

/// Queue, worker and exporter, shared by a trace and its open runs
struct Backend {
    config: Arc<TraceConfig>,
    queue: Arc<EventQueue>,
    exporter: Arc<dyn Exporter>,
    worker: Mutex<Option<BatchWorker>>,

    /// Outcome of the one-time startup
    started: OnceCell<bool>,
    stopped: AtomicBool,
}

impl Backend {
    fn ensure_started(&self) -> bool {
        *self.started.get_or_init(|| match self.start_worker() {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start tracing, runs will not be traced: {}", e);
                false
            }
        })
    }

    fn start_worker(&self) -> Result<()> {
        self.exporter.initialize()?;

        let exporter = Arc::clone(&self.exporter);
        let sink: BatchSink = Arc::new(move |batch: &[EventMap]| exporter.export_batch(batch));
        let worker = BatchWorker::start(
            Arc::clone(&self.queue),
            sink,
            WorkerConfig::from(self.config.as_ref()),
        )?;
        *self.worker.lock() = Some(worker);

        info!(
            "Tracing started (sample_rate: {}, queue_size: {}, batch_size: {})",
            self.config.sample_rate, self.config.queue_size, self.config.batch_size
        );
        Ok(())
    }

    /// Drain and stop the worker, then shut the exporter down. Runs once.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop(self.config.worker_join_timeout());
        }

        if self.started.get().copied().unwrap_or(false) {
            if let Err(e) = self.exporter.shutdown() {
                error!("Exporter shutdown failed: {}", e);
            }
        }

        let stats = self.queue.stats();
        info!(
            "Trace shut down (queued: {}, processed: {}, dropped: {})",
            stats.queued, stats.processed, stats.dropped
        );
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tracing entry point
pub struct Trace {
    backend: Arc<Backend>,
    sampler: Arc<dyn Sampler>,
    shut_down: AtomicBool,
}

impl Trace {
    /// Trace persisting into the configured database
    pub fn new(config: TraceConfig) -> Self {
        let exporter = Arc::new(StorageExporter::new(&config));
        Self::with_components(config, exporter, Arc::new(HashSampler))
    }

    pub fn with_exporter(config: TraceConfig, exporter: Arc<dyn Exporter>) -> Self {
        Self::with_components(config, exporter, Arc::new(HashSampler))
    }

    pub fn with_components(
        config: TraceConfig,
        exporter: Arc<dyn Exporter>,
        sampler: Arc<dyn Sampler>,
    ) -> Self {
        let queue = Arc::new(EventQueue::new(config.queue_size.max(1)));
        let backend = Backend {
            config: Arc::new(config),
            queue,
            exporter,
            worker: Mutex::new(None),
            started: OnceCell::new(),
            stopped: AtomicBool::new(false),
        };
        Self {
            backend: Arc::new(backend),
            sampler,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.backend.config
    }

    pub fn exporter(&self) -> Arc<dyn Exporter> {
        Arc::clone(&self.backend.exporter)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.backend.queue.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Start a run; it ends when the returned scope is dropped
    pub fn run(&self, options: impl Into<RunOptions>) -> RunScope {
        let context = self.open(options.into());
        if let Some(context) = &context {
            scope::push(Arc::clone(context));
        }
        let backend = context.as_ref().map(|_| Arc::clone(&self.backend));
        RunScope::new(context, backend)
    }

    /// Run `f` inside a run. A panic is recorded and resumed unchanged.
    pub fn in_run<R>(
        &self,
        options: impl Into<RunOptions>,
        f: impl FnOnce(Option<Arc<TraceContext>>) -> R,
    ) -> R {
        let run = self.run(options);
        let context = run.context().cloned();

        match panic::catch_unwind(AssertUnwindSafe(|| f(context))) {
            Ok(value) => value,
            Err(payload) => {
                run.fail("panic", &panic_message(payload.as_ref()));
                drop(run);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Like [`Trace::in_run`]; an `Err` is recorded as an error event and
    /// ends the run as `failed`
    pub fn try_in_run<T, E: std::fmt::Display>(
        &self,
        options: impl Into<RunOptions>,
        f: impl FnOnce(Option<Arc<TraceContext>>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let run = self.run(options);
        let context = run.context().cloned();

        match panic::catch_unwind(AssertUnwindSafe(|| f(context))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                run.fail(short_type_name::<E>(), &e.to_string());
                Err(e)
            }
            Err(payload) => {
                run.fail("panic", &panic_message(payload.as_ref()));
                drop(run);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Run the future returned by `f` inside a run. The context is visible
    /// to [`scope::current`] inside the future and in tasks it spawns
    /// through [`scope::propagate`]. Dropping the future ends the run.
    pub async fn run_async<F, Fut>(&self, options: impl Into<RunOptions>, f: F) -> Fut::Output
    where
        F: FnOnce(Option<Arc<TraceContext>>) -> Fut,
        Fut: Future,
    {
        let context = self.open(options.into());
        let stack = match &context {
            Some(context) => scope::extended(context),
            None => scope::snapshot(),
        };
        let exit = AsyncExit {
            context: context.clone(),
            _backend: context.as_ref().map(|_| Arc::clone(&self.backend)),
        };

        let body_context = context.clone();
        let result = scope::scoped(
            stack,
            AssertUnwindSafe(async move { f(body_context).await }).catch_unwind(),
        )
        .await;

        match result {
            Ok(value) => {
                drop(exit);
                value
            }
            Err(payload) => {
                if let Some(context) = &context {
                    context.fail_scope("panic", &panic_message(payload.as_ref()));
                }
                drop(exit);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Innermost open context on this thread or task
    pub fn get_active_context(&self) -> Option<Arc<TraceContext>> {
        scope::current()
    }

    pub fn model_call(&self, call: ModelCall) -> Option<Event> {
        self.with_active(|context| context.model_call(call))
    }

    pub fn tool_call(&self, call: ToolCall) -> Option<Event> {
        self.with_active(|context| context.tool_call(call))
    }

    pub fn memory_read(&self, read: MemoryRead) -> Option<Event> {
        self.with_active(|context| context.memory_read(read))
    }

    pub fn memory_write(&self, write: MemoryWrite) -> Option<Event> {
        self.with_active(|context| context.memory_write(write))
    }

    pub fn error(&self, info: ErrorInfo) -> Option<Event> {
        self.with_active(|context| context.error(info))
    }

    pub fn final_answer(&self, answer: FinalAnswer) -> Option<Event> {
        self.with_active(|context| context.final_answer(answer))
    }

    pub fn custom(&self, custom_type: impl Into<String>, data: Value) -> Option<Event> {
        self.with_active(|context| context.custom(custom_type, data))
    }

    pub fn agent_spawn(&self, spawn: AgentSpawn) -> Option<Event> {
        self.with_active(|context| context.agent_spawn(spawn))
    }

    pub fn agent_join(&self, join: AgentJoin) -> Option<Event> {
        self.with_active(|context| context.agent_join(join))
    }

    pub fn agent_leave(&self, leave: AgentLeave) -> Option<Event> {
        self.with_active(|context| context.agent_leave(leave))
    }

    pub fn agent_communication(&self, message: AgentCommunication) -> Option<Event> {
        self.with_active(|context| context.agent_communication(message))
    }

    pub fn agent_handoff(&self, handoff: AgentHandoff) -> Option<Event> {
        self.with_active(|context| context.agent_handoff(handoff))
    }

    pub fn task_assign(&self, task: TaskAssign) -> Option<Event> {
        self.with_active(|context| context.task_assign(task))
    }

    pub fn task_complete(&self, task: TaskComplete) -> Option<Event> {
        self.with_active(|context| context.task_complete(task))
    }

    /// Stop the worker (draining the queue) and shut the exporter down.
    /// Later runs are not traced.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.stop();
    }

    fn with_active<T>(&self, f: impl FnOnce(&TraceContext) -> Option<T>) -> Option<T> {
        match scope::current() {
            Some(context) => f(&context),
            None => {
                warn!("No active trace context; event not recorded");
                None
            }
        }
    }

    fn open(&self, options: RunOptions) -> Option<Arc<TraceContext>> {
        if self.is_shut_down() {
            warn!("Trace is shut down; run '{}' is not traced", options.name);
            return None;
        }

        let config = options
            .config
            .map(Arc::new)
            .unwrap_or_else(|| Arc::clone(&self.backend.config));
        let run_id = ulid::Ulid::new().to_string();

        if !self.sampler.should_sample(&run_id, &options.name, &config) {
            debug!("Run {} ({}) not sampled", run_id, options.name);
            return None;
        }

        if !self.backend.ensure_started() {
            return None;
        }

        let labels = RunLabels {
            agent_type: options.agent_type,
            user_id: options.user_id,
            session_id: options.session_id,
            metadata: options.metadata,
        };
        Some(TraceContext::start(
            run_id,
            options.name,
            labels,
            config,
            Arc::clone(&self.backend.queue),
        ))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunStatus;
    use crate::recording::exporter::InMemoryExporter;
    use serde_json::json;

    fn traced() -> (Trace, Arc<InMemoryExporter>) {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = TraceConfig {
            sample_rate: 1.0,
            batch_timeout_ms: 10,
            ..Default::default()
        };
        let trace = Trace::with_exporter(config, exporter.clone());
        (trace, exporter)
    }

    fn types(events: &[EventMap]) -> Vec<String> {
        events
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_run_lifecycle() {
        let (trace, exporter) = traced();
        {
            let run = trace.run(RunOptions::new("agent").user_id("u1"));
            assert!(run.is_sampled());
            let context = trace.get_active_context().unwrap();
            assert_eq!(context.run_id(), run.context().unwrap().run_id());
            trace.tool_call(ToolCall::new("search", json!({}), json!("ok")));
        }
        assert!(trace.get_active_context().is_none());
        trace.shutdown();

        let events = exporter.events();
        assert_eq!(types(&events), vec!["run_start", "tool_call", "run_end"]);
        assert_eq!(events[0]["user_id"], "u1");
        assert_eq!(events[2]["run_status"], "completed");
        assert!(events[1..]
            .iter()
            .all(|e| e["run_id"] == events[0]["run_id"]));
        assert!(exporter.is_shut_down());
    }

    #[test]
    fn test_unsampled_run_is_noop() {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = TraceConfig {
            sample_rate: 0.0,
            ..Default::default()
        };
        let trace = Trace::with_exporter(config, exporter.clone());
        {
            let run = trace.run("agent");
            assert!(!run.is_sampled());
            assert!(trace.model_call(ModelCall::new("m", "p", "r")).is_none());
        }
        trace.shutdown();

        assert!(exporter.events().is_empty());
        assert!(!exporter.is_initialized());
    }

    #[test]
    fn test_custom_sampler_sees_run_name() {
        let exporter = Arc::new(InMemoryExporter::new());
        let sampler = |_: &str, name: &str, _: &TraceConfig| name == "keep";
        let trace =
            Trace::with_components(TraceConfig::default(), exporter.clone(), Arc::new(sampler));

        assert!(trace.run("keep").is_sampled());
        assert!(!trace.run("skip").is_sampled());
    }

    #[test]
    fn test_panic_fails_run_and_resumes() {
        let (trace, exporter) = traced();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            trace.in_run("agent", |_| -> () { panic!("tool exploded") })
        }));
        assert!(result.is_err());
        trace.shutdown();

        let events = exporter.events();
        assert_eq!(types(&events), vec!["run_start", "error", "run_end"]);
        assert_eq!(events[1]["error_message"], "tool exploded");
        assert_eq!(events[1]["critical"], true);
        assert_eq!(events[2]["run_status"], RunStatus::Failed.as_str());
    }

    #[test]
    fn test_try_in_run_records_error() {
        let (trace, exporter) = traced();

        let result: std::result::Result<(), String> =
            trace.try_in_run("agent", |_| Err("bad".to_string()));
        assert_eq!(result, Err("bad".to_string()));
        trace.shutdown();

        let events = exporter.events();
        assert_eq!(events[1]["error_type"], "String");
        assert_eq!(events.last().unwrap()["run_status"], "failed");
    }

    #[test]
    fn test_nested_runs_restore_outer_context() {
        let (trace, _exporter) = traced();
        let outer = trace.run("outer");
        let outer_id = outer.context().unwrap().run_id().to_string();
        {
            let inner = trace.run("inner");
            assert_eq!(
                trace.get_active_context().unwrap().run_id(),
                inner.context().unwrap().run_id()
            );
        }
        assert_eq!(trace.get_active_context().unwrap().run_id(), outer_id);
    }

    #[test]
    fn test_runs_after_shutdown_are_not_traced() {
        let (trace, exporter) = traced();
        trace.shutdown();
        assert!(!trace.run("late").is_sampled());
        assert!(exporter.events().is_empty());
    }

    #[test]
    fn test_without_context_emissions_are_none() {
        let (trace, _exporter) = traced();
        assert!(trace.final_answer(FinalAnswer::new("x")).is_none());
        assert!(trace.custom("note", json!(1)).is_none());
    }

    #[tokio::test]
    async fn test_run_async_propagates_to_spawned_tasks() {
        let (trace, exporter) = traced();

        let run_id = trace
            .run_async("async_agent", |context| async move {
                let run_id = context.unwrap().run_id().to_string();
                let seen = tokio::spawn(scope::propagate(async {
                    let context = scope::current().unwrap();
                    context.model_call(ModelCall::new("m", "p", "r"));
                    context.run_id().to_string()
                }))
                .await
                .unwrap();
                assert_eq!(seen, run_id);
                run_id
            })
            .await;

        assert!(trace.get_active_context().is_none());
        trace.shutdown();

        let events = exporter.events();
        assert_eq!(types(&events), vec!["run_start", "model_call", "run_end"]);
        assert!(events.iter().all(|e| e["run_id"] == run_id.as_str()));
    }

    #[test]
    fn test_only_on_error_run_is_marked_for_deletion() {
        let exporter = Arc::new(InMemoryExporter::new());
        let trace = Trace::with_exporter(
            TraceConfig {
                only_on_error: true,
                sample_rate: 0.0,
                ..Default::default()
            },
            exporter.clone(),
        );
        trace.in_run("agent", |_| ());
        trace.shutdown();

        let end = exporter.events().pop().unwrap();
        assert_eq!(end["run_status"], "deleted");
        assert_eq!(end["delete_run"], true);
    }

    #[test]
    fn test_dropping_trace_keeps_open_run_alive() {
        let (trace, exporter) = traced();
        let run = trace.run("inflight");
        drop(trace);

        // Worker is still running for the open run
        assert!(!exporter.is_shut_down());
        drop(run);

        let events = exporter.events();
        assert_eq!(types(&events), vec!["run_start", "run_end"]);
        assert_eq!(events[1]["run_status"], "completed");
        assert!(exporter.is_shut_down());
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<String>(), "String");
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
    }
}
