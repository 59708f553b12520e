// src/recording/event_queue.rs
//! Bounded MPSC event queue
//!
//! Producers never wait unless they ask to: the default enqueue drops the
//! event when the buffer is full. A bounded blocking mode exists for the
//! run-end event so run status survives short bursts of backpressure.

use crate::events::EventMap;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// How [`EventQueue::enqueue`] behaves when the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Drop immediately
    NonBlocking,

    /// Wait up to the given time for space, then drop
    Blocking(Duration),
}

/// Bounded event queue
pub struct EventQueue {
    sender: Sender<EventMap>,
    receiver: Receiver<EventMap>,
    capacity: usize,

    /// Accepted events
    queued: AtomicU64,

    /// Events rejected (queue full or blocking timeout)
    dropped: AtomicU64,

    /// Events handed to the batch sink
    processed: AtomicU64,

    /// Set by the worker thread while it runs
    worker_alive: AtomicBool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);

        Self {
            sender,
            receiver,
            capacity,
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            worker_alive: AtomicBool::new(false),
        }
    }

    /// Enqueue an event; returns whether it was accepted
    pub fn enqueue(&self, event: EventMap, mode: EnqueueMode) -> bool {
        let accepted = match mode {
            EnqueueMode::NonBlocking => match self.sender.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Event queue full ({} events), dropping event. Total dropped: {}",
                        self.capacity,
                        self.dropped.load(Ordering::Relaxed) + 1
                    );
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            EnqueueMode::Blocking(timeout) => match self.sender.send_timeout(event, timeout) {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        "Event queue full, blocking enqueue timed out after {:?}",
                        timeout
                    );
                    false
                }
                Err(SendTimeoutError::Disconnected(_)) => false,
            },
        };

        if accepted {
            self.queued.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("agentlens_events_queued_total").increment(1);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("agentlens_events_dropped_total").increment(1);
        }

        accepted
    }

    /// Wait up to `timeout` for the next event
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<EventMap> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the next event without waiting
    pub(crate) fn try_pop(&self) -> Option<EventMap> {
        self.receiver.try_recv().ok()
    }

    pub(crate) fn record_processed(&self, count: usize) {
        self.processed.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!("agentlens_events_processed_total").increment(count as u64);
    }

    pub(crate) fn set_worker_alive(&self, alive: bool) {
        self.worker_alive.store(alive, Ordering::Release);
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            depth: self.receiver.len(),
            capacity: self.capacity,
            worker_alive: self.worker_alive.load(Ordering::Acquire),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.receiver.is_full()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Total events accepted
    pub queued: u64,

    /// Total events dropped
    pub dropped: u64,

    /// Total events handed to the sink
    pub processed: u64,

    /// Events currently buffered
    pub depth: usize,

    pub capacity: usize,

    /// Whether the background worker is running
    pub worker_alive: bool,
}

impl QueueStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.depth as f64 / self.capacity as f64) * 100.0
    }

    /// Share of offered events that were dropped
    pub fn drop_rate(&self) -> f64 {
        let offered = self.queued + self.dropped;
        if offered == 0 {
            0.0
        } else {
            (self.dropped as f64 / offered as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;

    fn event(id: &str) -> EventMap {
        json!({"event_id": id, "run_id": "run_1", "type": "custom"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_queue_creation() {
        let queue = EventQueue::new(100);
        assert_eq!(queue.capacity(), 100);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_pop() {
        let queue = EventQueue::new(10);
        assert!(queue.enqueue(event("evt_1"), EnqueueMode::NonBlocking));
        assert_eq!(queue.len(), 1);

        let popped = queue.try_pop().unwrap();
        assert_eq!(popped["event_id"], "evt_1");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let queue = EventQueue::new(2);
        assert!(queue.enqueue(event("evt_1"), EnqueueMode::NonBlocking));
        assert!(queue.enqueue(event("evt_2"), EnqueueMode::NonBlocking));
        assert!(queue.is_full());

        let start = Instant::now();
        assert!(!queue.enqueue(event("evt_3"), EnqueueMode::NonBlocking));
        assert!(start.elapsed() < Duration::from_millis(50));

        let stats = queue.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.depth, 2);
    }

    #[test]
    fn test_blocking_enqueue_times_out_as_drop() {
        let queue = EventQueue::new(1);
        assert!(queue.enqueue(event("evt_1"), EnqueueMode::NonBlocking));

        let start = Instant::now();
        let accepted = queue.enqueue(
            event("evt_2"),
            EnqueueMode::Blocking(Duration::from_millis(50)),
        );
        assert!(!accepted);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_blocking_enqueue_succeeds_when_space_frees() {
        let queue = Arc::new(EventQueue::new(1));
        assert!(queue.enqueue(event("evt_1"), EnqueueMode::NonBlocking));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.try_pop()
            })
        };

        assert!(queue.enqueue(event("evt_2"), EnqueueMode::Blocking(Duration::from_secs(5))));
        assert!(consumer.join().unwrap().is_some());
    }

    #[test]
    fn test_drop_rate() {
        let stats = QueueStats {
            queued: 3,
            dropped: 1,
            processed: 0,
            depth: 3,
            capacity: 4,
            worker_alive: false,
        };
        assert_eq!(stats.drop_rate(), 25.0);
        assert_eq!(stats.fill_percentage(), 75.0);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(EventQueue::new(1000));
        let mut handles = vec![];

        for i in 0..10 {
            let q = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for j in 0..100 {
                    q.enqueue(event(&format!("evt_{}_{}", i, j)), EnqueueMode::NonBlocking);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.queued + stats.dropped, 1000);
        assert_eq!(stats.depth as u64, stats.queued);
    }
}
