// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Integration tests for the model lifecycle: registry operations,
//! availability probing, and pull orchestration against scripted
//! transports. No live daemon required.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use common::{FakeDaemon, Scripted};
use serde_json::json;
use stablehand::{
    DeleteOutcome, Error, FailureCause, ManagerConfig, Prober, PullOrchestrator, PullResult,
    PullSource, RegistryClient, ServiceStatus,
};

fn registry(daemon: FakeDaemon) -> RegistryClient<FakeDaemon> {
    RegistryClient::new(daemon, &ManagerConfig::default())
}

fn http_orchestrator(daemon: FakeDaemon) -> PullOrchestrator<FakeDaemon> {
    PullOrchestrator::new(registry(daemon), PullSource::Http)
}

// =============================================================================
// Registry Client
// =============================================================================

#[test]
fn list_decodes_envelope_shape() {
    let registry = registry(FakeDaemon::new().with_installed(&["qwen3:0.6b"]));

    let models = registry.list().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "qwen3:0.6b");
}

#[test]
fn list_accepts_bare_array_shape() {
    let registry = RegistryClient::new(
        Scripted::ok(json!([{ "name": "mistral:7b" }])),
        &ManagerConfig::default(),
    );

    let models = registry.list().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "mistral:7b");
}

#[test]
fn list_on_empty_daemon_is_empty_not_error() {
    let registry = registry(FakeDaemon::new());
    assert!(registry.list().unwrap().is_empty());
}

#[test]
fn list_propagates_connection_error_without_retry() {
    let transport = Scripted::err(Error::Connection("connection refused".to_string()));
    let registry = RegistryClient::new(transport, &ManagerConfig::default());

    match registry.list() {
        Err(Error::Connection(_)) => {}
        other => panic!("expected Connection error, got {:?}", other),
    }
    assert_eq!(registry.transport().calls(), 1);
}

#[test]
fn show_reports_absent_model_as_none() {
    let registry = registry(FakeDaemon::new().with_installed(&["qwen3:0.6b"]));

    assert!(registry.show("qwen3:0.6b").unwrap().is_some());
    assert!(registry.show("nonexistent:tag").unwrap().is_none());
}

#[test]
fn delete_distinguishes_deleted_from_not_found() {
    let registry = registry(FakeDaemon::new().with_installed(&["gemma2:2b"]));

    assert_eq!(registry.delete("gemma2:2b").unwrap(), DeleteOutcome::Deleted);
    // already gone now
    assert_eq!(
        registry.delete("gemma2:2b").unwrap(),
        DeleteOutcome::NotFound
    );
    assert_eq!(
        registry.delete("nonexistent:tag").unwrap(),
        DeleteOutcome::NotFound
    );
}

// =============================================================================
// Availability Prober
// =============================================================================

#[test]
fn zero_wait_performs_exactly_one_probe() {
    let transport = Scripted::err(Error::Connection("connection refused".to_string()));
    let registry = RegistryClient::new(transport, &ManagerConfig::default());
    let prober = Prober::new(&registry);

    let status = prober.wait_until_ready(Duration::ZERO, Duration::from_millis(10));

    assert_eq!(status, ServiceStatus::Unreachable);
    assert_eq!(registry.transport().calls(), 1);
}

#[test]
fn first_successful_probe_is_reachable() {
    let registry = registry(FakeDaemon::new());
    let prober = Prober::new(&registry);

    let status = prober.wait_until_ready(Duration::ZERO, Duration::from_millis(10));

    assert_eq!(status, ServiceStatus::Reachable);
    assert_eq!(registry.transport().tags_calls(), 1);
}

// =============================================================================
// Pull Orchestrator
// =============================================================================

#[test]
fn ensure_present_model_never_pulls() {
    let orchestrator = http_orchestrator(FakeDaemon::new().with_installed(&["qwen3:0.6b"]));

    let result = orchestrator.ensure("qwen3:0.6b", |_| Ok(()), None);

    assert_eq!(result, PullResult::Success);
    assert_eq!(orchestrator.registry().transport().pull_calls(), 0);
}

#[test]
fn ensure_absent_model_streams_progress_then_succeeds() {
    let daemon = FakeDaemon::new().with_pull_lines(vec![
        r#"{"status":"downloading","completed":50,"total":100}"#.to_string(),
        r#"{"status":"success"}"#.to_string(),
    ]);
    let orchestrator = http_orchestrator(daemon);

    let statuses = Mutex::new(Vec::new());
    let result = orchestrator.ensure(
        "qwen3:0.6b",
        |event| {
            statuses.lock().unwrap().push(event.status.clone());
            Ok(())
        },
        None,
    );

    assert_eq!(result, PullResult::Success);
    assert_eq!(
        *statuses.lock().unwrap(),
        vec!["downloading".to_string(), "success".to_string()]
    );
    assert_eq!(orchestrator.registry().transport().pull_calls(), 1);
}

#[test]
fn benign_close_is_success() {
    // Stream closes with neither a success marker nor an error indicator.
    // Inherited protocol assumption: this is a completed pull.
    let daemon = FakeDaemon::new().with_pull_lines(vec![
        r#"{"status":"downloading","completed":100,"total":100}"#.to_string(),
        r#"{"status":"verifying sha256 digest"}"#.to_string(),
    ]);
    let orchestrator = http_orchestrator(daemon);

    let result = orchestrator.ensure("qwen3:0.6b", |_| Ok(()), None);
    assert_eq!(result, PullResult::Success);
}

#[test]
fn error_status_before_close_is_failure() {
    let daemon = FakeDaemon::new().with_pull_lines(vec![
        r#"{"status":"pulling manifest"}"#.to_string(),
        r#"{"error":"manifest unknown"}"#.to_string(),
    ]);
    let orchestrator = http_orchestrator(daemon);

    match orchestrator.ensure("nonexistent:tag", |_| Ok(()), None) {
        PullResult::Failure(FailureCause::Stream(status)) => {
            assert!(status.contains("manifest unknown"));
        }
        other => panic!("expected stream failure, got {:?}", other),
    }
}

#[test]
fn malformed_lines_are_skipped_not_fatal() {
    let daemon = FakeDaemon::new().with_pull_lines(vec![
        String::new(),
        "not json at all".to_string(),
        r#"{"digest":"sha256:aa"}"#.to_string(),
        r#"{"status":"downloading"}"#.to_string(),
    ]);
    let orchestrator = http_orchestrator(daemon);

    let mut seen = 0;
    let result = orchestrator.ensure(
        "qwen3:0.6b",
        |_| {
            seen += 1;
            Ok(())
        },
        None,
    );

    assert_eq!(result, PullResult::Success);
    assert_eq!(seen, 1);
}

#[test]
fn callback_error_aborts_with_callback_cause() {
    let daemon = FakeDaemon::new().with_pull_lines(vec![
        r#"{"status":"downloading","completed":1,"total":4}"#.to_string(),
        r#"{"status":"downloading","completed":2,"total":4}"#.to_string(),
        r#"{"status":"success"}"#.to_string(),
    ]);
    let orchestrator = http_orchestrator(daemon);

    let mut seen = 0;
    let result = orchestrator.ensure(
        "qwen3:0.6b",
        |_| {
            seen += 1;
            if seen == 2 {
                anyhow::bail!("progress sink full");
            }
            Ok(())
        },
        None,
    );

    match result {
        PullResult::Failure(FailureCause::Callback(msg)) => {
            assert!(msg.contains("progress sink full"));
        }
        other => panic!("expected callback failure, got {:?}", other),
    }
    assert_eq!(seen, 2);
}

#[test]
fn deadline_exceeded_mid_stream_is_timeout() {
    let lines: Vec<String> = std::iter::repeat(r#"{"status":"downloading"}"#.to_string())
        .take(50)
        .collect();
    let daemon = FakeDaemon::new()
        .with_pull_lines(lines)
        .with_line_delay(Duration::from_millis(50));
    let orchestrator = http_orchestrator(daemon);

    let start = std::time::Instant::now();
    let result = orchestrator.ensure("qwen3:0.6b", |_| Ok(()), Some(Duration::from_millis(120)));

    assert_eq!(result, PullResult::Failure(FailureCause::Timeout));
    // abandoned promptly, nowhere near the 2.5s the full stream would take
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn cancelled_before_transfer_starts() {
    let orchestrator = http_orchestrator(FakeDaemon::new());
    orchestrator.cancel_flag().store(true, Ordering::SeqCst);

    let result = orchestrator.ensure("qwen3:0.6b", |_| Ok(()), None);

    assert_eq!(result, PullResult::Cancelled);
    assert_eq!(orchestrator.registry().transport().pull_calls(), 0);
}

#[test]
fn concurrent_ensure_for_same_name_pulls_once() {
    let daemon = FakeDaemon::new()
        .with_pull_lines(vec![r#"{"status":"success"}"#.to_string(); 5])
        .with_line_delay(Duration::from_millis(20));
    let orchestrator = http_orchestrator(daemon);

    std::thread::scope(|scope| {
        let a = scope.spawn(|| orchestrator.ensure("qwen3:0.6b", |_| Ok(()), None));
        let b = scope.spawn(|| orchestrator.ensure("qwen3:0.6b", |_| Ok(()), None));
        assert_eq!(a.join().unwrap(), PullResult::Success);
        assert_eq!(b.join().unwrap(), PullResult::Success);
    });

    // the loser of the race found the winner's artifact installed
    assert_eq!(orchestrator.registry().transport().pull_calls(), 1);
}

#[test]
fn sequential_ensure_is_idempotent() {
    let daemon =
        FakeDaemon::new().with_pull_lines(vec![r#"{"status":"success"}"#.to_string()]);
    let orchestrator = http_orchestrator(daemon);

    assert_eq!(
        orchestrator.ensure("qwen3:0.6b", |_| Ok(()), None),
        PullResult::Success
    );
    assert_eq!(
        orchestrator.ensure("qwen3:0.6b", |_| Ok(()), None),
        PullResult::Success
    );
    assert_eq!(orchestrator.registry().transport().pull_calls(), 1);
}
