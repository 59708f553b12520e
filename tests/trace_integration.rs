// tests/trace_integration.rs
//! End-to-end tests: trace runs through the queue, worker, pipeline and
//! SQLite storage

use agentlens_engine::events::{ErrorInfo, FinalAnswer, ModelCall, RunStatus, ToolCall};
use agentlens_engine::storage::{Database, RunFilter, RunRecord};
use agentlens_engine::trace::{global, propagate, scope, RunOptions, Trace};
use agentlens_engine::utils::config::TraceConfig;
use agentlens_engine::utils::time::days_ago_ms;
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn test_config(dir: &TempDir) -> TraceConfig {
    TraceConfig {
        sample_rate: 1.0,
        batch_size: 10,
        batch_timeout_ms: 20,
        db_path: dir.path().join("traces.db"),
        ..Default::default()
    }
}

fn open(config: &TraceConfig) -> Database {
    Database::open(config).unwrap()
}

/// A completed run lands in storage with its steps in order
#[test]
fn test_run_is_persisted() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let trace = Trace::new(config.clone());

    let run_id = trace.in_run(RunOptions::new("support").user_id("u1"), |context| {
        let context = context.unwrap();
        context.model_call(ModelCall::new("gpt-4", "hello", "hi there"));
        context.tool_call(ToolCall::new("search", json!({"q": "refund"}), json!(["doc"])));
        context.final_answer(FinalAnswer::new("done"));
        context.run_id().to_string()
    });
    trace.shutdown();

    let db = open(&config);
    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.name, "support");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.user_id.as_deref(), Some("u1"));
    assert!(run.completed_at.is_some());
    assert!(run.duration_ms.is_some());

    // Steps within the same millisecond have no defined order
    let mut kinds: Vec<String> = db
        .get_run_timeline(&run_id, false)
        .unwrap()
        .into_iter()
        .map(|step| step.kind)
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["final_answer", "model_call", "run_start", "tool_call"]);
}

/// A panicking body yields exactly one run-start, one error and a failed run
#[test]
fn test_panicking_run_is_failed() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let trace = Trace::new(config.clone());

    let mut run_id = String::new();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        trace.in_run("flaky", |context| {
            run_id = context.unwrap().run_id().to_string();
            panic!("upstream timeout");
        })
    }));
    assert!(result.is_err());
    trace.shutdown();

    let db = open(&config);
    assert_eq!(db.get_run(&run_id).unwrap().unwrap().status, RunStatus::Failed);

    let steps = db.get_run_timeline(&run_id, false).unwrap();
    assert_eq!(steps.iter().filter(|s| s.kind == "run_start").count(), 1);
    let errors: Vec<_> = steps.iter().filter(|s| s.kind == "error").collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].status.as_deref(), Some("failed"));
}

#[test]
fn test_only_on_error_keeps_failed_runs_only() {
    let dir = tempdir().unwrap();
    let config = TraceConfig {
        only_on_error: true,
        block_on_run_end: true,
        ..test_config(&dir)
    };
    let trace = Trace::new(config.clone());

    let clean = trace.in_run("clean", |context| {
        let context = context.unwrap();
        context.tool_call(ToolCall::new("noop", json!({}), json!(null)));
        context.run_id().to_string()
    });
    let broken = trace.in_run("broken", |context| {
        let context = context.unwrap();
        context.error(ErrorInfo::new("ValueError", "bad input"));
        context.run_id().to_string()
    });
    trace.shutdown();

    let db = open(&config);
    assert!(db.get_run(&clean).unwrap().is_none());
    assert!(db.get_run_timeline(&clean, false).unwrap().is_empty());

    let kept = db.get_run(&broken).unwrap().unwrap();
    assert_eq!(kept.status, RunStatus::Failed);
}

/// Concurrent runs on separate threads never mix their events
#[test]
fn test_concurrent_runs_are_isolated() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let trace = Arc::new(Trace::new(config.clone()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let trace = Arc::clone(&trace);
            std::thread::spawn(move || {
                trace.in_run(format!("agent_{}", i), |context| {
                    let context = context.unwrap();
                    for step in 0..5 {
                        trace.tool_call(ToolCall::new(
                            format!("tool_{}", step),
                            json!({"agent": i}),
                            json!(step),
                        ));
                    }
                    context.run_id().to_string()
                })
            })
        })
        .collect();
    let run_ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    trace.shutdown();

    let db = open(&config);
    let runs = db.list_runs(&RunFilter::default()).unwrap();
    assert_eq!(runs.len(), 8);

    for run_id in &run_ids {
        let steps = db.get_run_timeline(run_id, false).unwrap();
        assert_eq!(steps.len(), 6);
        assert!(steps.iter().all(|s| &s.run_id == run_id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_run_reaches_spawned_tasks() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let trace = Trace::new(config.clone());

    let run_id = trace
        .run_async("async_agent", |context| async move {
            let run_id = context.unwrap().run_id().to_string();

            let tasks: Vec<_> = (0..3)
                .map(|i| {
                    tokio::spawn(propagate(async move {
                        let context = scope::current().unwrap();
                        context.tool_call(ToolCall::new(format!("tool_{}", i), json!({}), json!(i)));
                    }))
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
            run_id
        })
        .await;
    trace.shutdown();

    let db = open(&config);
    let steps = db.get_run_timeline(&run_id, false).unwrap();
    assert_eq!(steps.iter().filter(|s| s.kind == "tool_call").count(), 3);
    assert_eq!(db.get_run(&run_id).unwrap().unwrap().status, RunStatus::Completed);
}

/// Sensitive values never reach storage
#[test]
fn test_payloads_are_redacted_at_rest() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let trace = Trace::new(config.clone());

    let run_id = trace.in_run("secrets", |context| {
        let context = context.unwrap();
        context.custom("credentials", json!({"api_key": "sk-live-XYZ", "region": "eu"}));
        context.run_id().to_string()
    });
    trace.shutdown();

    let db = open(&config);
    let pipeline = agentlens_engine::ProcessingPipeline::new(&config).unwrap();
    let export = db.export_run(&run_id, &pipeline).unwrap().unwrap();

    let custom = export
        .timeline
        .iter()
        .find(|s| s.step.kind == "custom")
        .and_then(|s| s.data.clone())
        .unwrap();
    assert_eq!(custom["data"]["api_key"], "[REDACTED]");
    assert_eq!(custom["data"]["region"], "eu");
}

#[test]
fn test_run_metadata_is_redacted_at_rest() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let trace = Trace::new(config.clone());

    let options = RunOptions::new("agent")
        .metadata("api_key", json!("sk-live-XYZ"))
        .metadata("team", json!("billing"));
    let run_id = trace.in_run(options, |context| context.unwrap().run_id().to_string());
    trace.shutdown();

    let db = open(&config);
    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.metadata["api_key"], "[REDACTED]");
    assert_eq!(run.metadata["team"], "billing");
}

/// Replacing the global trace mid-run still finalizes the open run
#[test]
fn test_open_run_survives_global_trace_replacement() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    global::set_trace(Some(Arc::new(Trace::new(config.clone()))));

    let run = global::run("inflight");
    let run_id = run.context().unwrap().run_id().to_string();
    global::set_trace(None);
    drop(run);

    let db = open(&config);
    let stored = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(stored.completed_at.is_some());
}

#[test]
fn test_age_pruning_removes_old_runs_only() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let db = open(&config);

    db.insert_run(&RunRecord::new("old", "agent", days_ago_ms(10).unwrap())).unwrap();
    db.insert_run(&RunRecord::new("recent", "agent", days_ago_ms(1).unwrap())).unwrap();

    assert_eq!(db.prune_old_runs(Some(7)).unwrap(), 1);
    assert!(db.get_run("old").unwrap().is_none());
    assert!(db.get_run("recent").unwrap().is_some());
}

#[test]
fn test_size_pruning_keeps_newest_runs() {
    let dir = tempdir().unwrap();
    let config = TraceConfig {
        compression_enabled: false,
        ..test_config(&dir)
    };
    let trace = Trace::new(config.clone());

    let filler = "lorem ipsum ".repeat(500);
    let mut run_ids = Vec::new();
    for i in 0..20 {
        let run_id = trace.in_run(format!("run_{}", i), |context| {
            let context = context.unwrap();
            context.custom("filler", json!(filler));
            context.run_id().to_string()
        });
        run_ids.push(run_id);
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    trace.shutdown();

    let db = open(&config);
    let before = db.get_stats().unwrap();
    let pruned = db.prune_by_size(before.db_size_bytes / 2).unwrap();
    assert!(pruned > 0);

    let after = db.get_stats().unwrap();
    assert!(after.db_size_bytes < before.db_size_bytes);
    assert!(db.get_run(run_ids.last().unwrap()).unwrap().is_some());
    assert!(db.get_run(&run_ids[0]).unwrap().is_none());
}
