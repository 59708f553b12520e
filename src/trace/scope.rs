// src/trace/scope.rs
//! Active-context stack
//!
//! Each thread has its own stack, and each tokio task entered through
//! [`propagate`] gets a copy of the stack that was current when it was
//! created. Pushes and pops replace the stack value instead of mutating it,
//! so a copy handed to a child task never sees the parent's later changes.

use crate::trace::context::TraceContext;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

/// Immutable stack of open contexts, innermost last
#[derive(Clone, Default)]
pub struct ContextStack(Arc<Vec<Arc<TraceContext>>>);

impl ContextStack {
    pub fn current(&self) -> Option<Arc<TraceContext>> {
        self.0.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn with(&self, context: Arc<TraceContext>) -> Self {
        let mut contexts = Vec::with_capacity(self.0.len() + 1);
        contexts.extend(self.0.iter().cloned());
        contexts.push(context);
        Self(Arc::new(contexts))
    }

    /// Drop the innermost occurrence of `context`
    fn without(&self, context: &Arc<TraceContext>) -> Self {
        let mut contexts: Vec<_> = self.0.iter().cloned().collect();
        if let Some(pos) = contexts.iter().rposition(|c| Arc::ptr_eq(c, context)) {
            contexts.remove(pos);
        }
        Self(Arc::new(contexts))
    }
}

thread_local! {
    static THREAD_STACK: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

tokio::task_local! {
    static TASK_STACK: RefCell<ContextStack>;
}

fn update(f: impl Fn(&ContextStack) -> ContextStack) {
    let in_task = TASK_STACK
        .try_with(|cell| {
            let next = f(&cell.borrow());
            *cell.borrow_mut() = next;
        })
        .is_ok();

    if !in_task {
        THREAD_STACK.with(|cell| {
            let next = f(&cell.borrow());
            *cell.borrow_mut() = next;
        });
    }
}

/// Snapshot of the stack visible here
pub fn snapshot() -> ContextStack {
    TASK_STACK
        .try_with(|cell| cell.borrow().clone())
        .unwrap_or_else(|_| THREAD_STACK.with(|cell| cell.borrow().clone()))
}

/// Innermost open context, if any
pub fn current() -> Option<Arc<TraceContext>> {
    snapshot().current()
}

pub(crate) fn push(context: Arc<TraceContext>) {
    update(|stack| stack.with(Arc::clone(&context)));
}

pub(crate) fn pop(context: &Arc<TraceContext>) {
    update(|stack| stack.without(context));
}

/// Run `future` with a copy of the current stack, so contexts opened before
/// spawning stay visible inside the spawned task
pub fn propagate<F: Future>(future: F) -> impl Future<Output = F::Output> {
    TASK_STACK.scope(RefCell::new(snapshot()), future)
}

/// Current stack with `context` on top, without installing it
pub(crate) fn extended(context: &Arc<TraceContext>) -> ContextStack {
    snapshot().with(Arc::clone(context))
}

/// Run `future` with the given stack
pub(crate) fn scoped<F: Future>(stack: ContextStack, future: F) -> impl Future<Output = F::Output> {
    TASK_STACK.scope(RefCell::new(stack), future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::EventQueue;
    use crate::trace::context::RunLabels;
    use crate::utils::config::TraceConfig;

    fn context(run_id: &str) -> Arc<TraceContext> {
        TraceContext::start(
            run_id.to_string(),
            "agent".to_string(),
            RunLabels::default(),
            Arc::new(TraceConfig::default()),
            Arc::new(EventQueue::new(10)),
        )
    }

    #[test]
    fn test_push_and_pop_on_thread() {
        assert!(current().is_none());

        let outer = context("outer");
        let inner = context("inner");
        push(Arc::clone(&outer));
        push(Arc::clone(&inner));
        assert_eq!(current().unwrap().run_id(), "inner");

        pop(&inner);
        assert_eq!(current().unwrap().run_id(), "outer");
        pop(&outer);
        assert!(current().is_none());
    }

    #[test]
    fn test_threads_do_not_share_stacks() {
        let ctx = context("main");
        push(Arc::clone(&ctx));

        let seen = std::thread::spawn(|| current().map(|c| c.run_id().to_string()))
            .join()
            .unwrap();
        assert!(seen.is_none());

        pop(&ctx);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_pushes() {
        let ctx = context("a");
        let before = snapshot();
        push(Arc::clone(&ctx));
        assert!(before.is_empty());
        assert_eq!(snapshot().len(), 1);
        pop(&ctx);
    }

    #[tokio::test]
    async fn test_propagate_into_spawned_task() {
        let ctx = context("async");
        push(Arc::clone(&ctx));

        let handle = tokio::spawn(propagate(async {
            current().map(|c| c.run_id().to_string())
        }));
        assert_eq!(handle.await.unwrap().as_deref(), Some("async"));

        pop(&ctx);
    }

    #[tokio::test]
    async fn test_task_pushes_stay_in_task() {
        let outer = context("outer");
        push(Arc::clone(&outer));

        propagate(async {
            let inner = context("inner");
            push(Arc::clone(&inner));
            assert_eq!(current().unwrap().run_id(), "inner");
            pop(&inner);
        })
        .await;

        assert_eq!(current().unwrap().run_id(), "outer");
        pop(&outer);
    }
}
