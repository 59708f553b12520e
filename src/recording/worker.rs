// src/recording/worker.rs
//! Background batching worker
//!
//! A single thread drains the [`EventQueue`] into batches and hands each
//! batch to a sink. A batch is flushed when it reaches `batch_size`, when
//! `batch_timeout` has passed since the last flush, or when stop is
//! requested. Sink errors and panics are logged and never end the loop.
//!
//! Shutdown is two-phase: signal stop and wait (bounded) for the thread to
//! drain and exit; if it does not finish in time, drain on the caller.

use crate::events::EventMap;
use crate::recording::event_queue::EventQueue;
use crate::utils::config::TraceConfig;
use crate::utils::errors::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Receives each flushed batch
pub type BatchSink = Arc<dyn Fn(&[EventMap]) -> Result<()> + Send + Sync>;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Events per batch
    pub batch_size: usize,

    /// Maximum age of a partial batch
    pub batch_timeout: Duration,

    /// How long one queue poll waits
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&TraceConfig> for WorkerConfig {
    fn from(config: &TraceConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout(),
            ..Default::default()
        }
    }
}

/// Handle to the running worker thread
pub struct BatchWorker {
    queue: Arc<EventQueue>,
    sink: BatchSink,
    batch_size: usize,
    stop: Arc<AtomicBool>,
    done: Option<Receiver<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BatchWorker {
    /// Spawn the worker thread
    pub fn start(queue: Arc<EventQueue>, sink: BatchSink, mut config: WorkerConfig) -> Result<Self> {
        config.batch_size = config.batch_size.max(1);
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(1);
        let batch_size = config.batch_size;

        let handle = {
            let queue = Arc::clone(&queue);
            let sink = Arc::clone(&sink);
            let stop = Arc::clone(&stop);

            std::thread::Builder::new()
                .name("agentlens-worker".to_string())
                .spawn(move || {
                    queue.set_worker_alive(true);
                    info!("Background worker started");

                    worker_loop(&queue, &sink, &stop, &config);

                    queue.set_worker_alive(false);
                    info!("Background worker exiting");
                    let _ = done_tx.send(());
                })?
        };

        Ok(Self {
            queue,
            sink,
            batch_size,
            stop,
            done: Some(done_rx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the worker, flushing everything still buffered
    pub fn stop(&mut self, join_timeout: Duration) {
        let Some(done) = self.done.take() else {
            return;
        };

        info!("Stopping background worker");
        self.stop.store(true, Ordering::Release);

        match done.recv_timeout(join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        error!("Background worker panicked");
                    }
                }
                info!("Background worker stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Background worker did not stop within {:?}, draining on caller",
                    join_timeout
                );
                // Detach; the thread exits on its own once its current flush returns
                self.handle.take();
                drain(&self.queue, &self.sink, self.batch_size);
            }
        }
    }
}

impl Drop for BatchWorker {
    fn drop(&mut self) {
        if self.done.is_some() {
            self.stop(Duration::from_secs(5));
        }
    }
}

fn worker_loop(queue: &EventQueue, sink: &BatchSink, stop: &AtomicBool, config: &WorkerConfig) {
    let mut batch: Vec<EventMap> = Vec::with_capacity(config.batch_size);
    let mut last_flush = Instant::now();

    while !stop.load(Ordering::Acquire) {
        if let Some(event) = queue.recv_timeout(config.poll_interval) {
            batch.push(event);
            while batch.len() < config.batch_size {
                match queue.try_pop() {
                    Some(event) => batch.push(event),
                    None => break,
                }
            }
        }

        let due = batch.len() >= config.batch_size
            || last_flush.elapsed() >= config.batch_timeout
            || stop.load(Ordering::Acquire);

        if due && !batch.is_empty() {
            flush(queue, sink, &mut batch);
            last_flush = Instant::now();
        }
    }

    // Residual events
    while let Some(event) = queue.try_pop() {
        batch.push(event);
        if batch.len() >= config.batch_size {
            flush(queue, sink, &mut batch);
        }
    }
    flush(queue, sink, &mut batch);
}

fn drain(queue: &EventQueue, sink: &BatchSink, batch_size: usize) {
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(event) = queue.try_pop() {
        batch.push(event);
        if batch.len() >= batch_size {
            flush(queue, sink, &mut batch);
        }
    }
    flush(queue, sink, &mut batch);
}

fn flush(queue: &EventQueue, sink: &BatchSink, batch: &mut Vec<EventMap>) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    let start = Instant::now();

    match catch_unwind(AssertUnwindSafe(|| sink(batch.as_slice()))) {
        Ok(Ok(())) => {
            queue.record_processed(count);
            metrics::counter!("agentlens_batches_flushed_total").increment(1);
            debug!("Flushed batch of {} events in {:?}", count, start.elapsed());
        }
        Ok(Err(e)) => {
            metrics::counter!("agentlens_sink_failures_total").increment(1);
            error!("Failed to export batch of {} events: {}", count, e);
        }
        Err(_) => {
            metrics::counter!("agentlens_sink_failures_total").increment(1);
            error!("Batch sink panicked on batch of {} events", count);
        }
    }

    batch.clear();
}
