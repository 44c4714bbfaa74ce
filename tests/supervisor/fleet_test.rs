//! Tests for the worker fleet lifecycle.

use std::time::Duration;

use claude_fleet::cli::SpawnError;
use claude_fleet::config::WorkerCommand;
use claude_fleet::supervisor::{
    EventKind, HealthTier, SpawnRequest, Supervisor, SupervisorError, WorkerState,
};
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio_test::{assert_err, assert_ok};

use super::{
    drain, fleet_config, wait_for, wait_for_kind, ECHO_WORKER, SILENT_WORKER, STUBBORN_WORKER,
};

/// Announces a session, then walks through one turn on its own.
const STAGED_WORKER: &str = r#"echo '{"type":"system","subtype":"init","session_id":"sess-42"}'
sleep 0.5
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"}]}}'
sleep 0.5
echo '{"type":"result","subtype":"success","result":"all done","duration_ms":1500}'
cat > /dev/null"#;

/// Reports a session derived from the `--resume` argument, if any.
const RESUMING_WORKER: &str = r#"if [ -n "$1" ]; then sid="$1-resumed"; else sid="fresh"; fi
echo "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"$sid\"}"
cat > /dev/null"#;

#[tokio::test]
async fn spawn_returns_starting_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(fleet_config(SILENT_WORKER));

    let info = assert_ok!(supervisor.spawn(
        SpawnRequest::new("alpha")
            .team("core")
            .working_directory(dir.path())
            .task("T-1"),
    ));

    assert_eq!(info.handle, "alpha");
    assert_eq!(info.team_name, "core");
    assert_eq!(info.working_directory, dir.path());
    assert_eq!(info.state, WorkerState::Starting);
    assert_eq!(info.health, HealthTier::Healthy);
    assert_eq!(info.restart_count, 0);
    assert_eq!(info.current_task_id.as_deref(), Some("T-1"));
    assert!(info.session_token.is_none());
    assert!(info.pid.is_some());

    assert_eq!(supervisor.live_count(), 1);
    assert_eq!(supervisor.get(&info.id).unwrap().id, info.id);
    assert_eq!(supervisor.get_by_handle("alpha").unwrap().id, info.id);

    let other = assert_ok!(supervisor.spawn(SpawnRequest::new("beta")));
    assert_eq!(other.team_name, "default");
    assert_ne!(other.id, info.id);

    assert_eq!(supervisor.dismiss_all().await, 2);
}

#[tokio::test]
async fn duplicate_handle_rejected_until_dismissed() {
    let supervisor = Supervisor::new(fleet_config(SILENT_WORKER));
    let first = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));

    let err = assert_err!(supervisor.spawn(SpawnRequest::new("alpha")));
    assert!(matches!(err, SupervisorError::DuplicateHandle { ref handle } if handle == "alpha"));
    assert_eq!(supervisor.live_count(), 1);

    assert!(supervisor.dismiss("alpha").await);
    assert!(supervisor.get(&first.id).is_none());
    assert!(supervisor.get_by_handle("alpha").is_none());

    let second = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    assert_ne!(second.id, first.id);
    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn empty_handle_rejected() {
    let supervisor = Supervisor::new(fleet_config(SILENT_WORKER));
    let err = assert_err!(supervisor.spawn(SpawnRequest::new("   ")));
    assert!(matches!(err, SupervisorError::EmptyHandle));
    assert_eq!(supervisor.live_count(), 0);
}

#[tokio::test]
async fn capacity_limit_enforced() {
    let mut config = fleet_config(SILENT_WORKER);
    config.max_workers = 1;
    let supervisor = Supervisor::new(config);

    assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    let err = assert_err!(supervisor.spawn(SpawnRequest::new("beta")));
    assert!(matches!(err, SupervisorError::CapacityReached { limit: 1 }));
    assert_eq!(supervisor.live_count(), 1);
    assert!(supervisor.get_by_handle("beta").is_none());

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn spawn_failure_leaves_registry_untouched() {
    let mut config = fleet_config(SILENT_WORKER);
    config.command = WorkerCommand {
        program: "/nonexistent/claude-fleet-worker".to_string(),
        args: Vec::new(),
    };
    let supervisor = Supervisor::new(config);
    let mut events = supervisor.subscribe();

    let err = assert_err!(supervisor.spawn(SpawnRequest::new("alpha")));
    assert!(matches!(err, SupervisorError::Spawn(SpawnError::NotFound(_))));
    assert_eq!(supervisor.live_count(), 0);
    assert!(supervisor.get_by_handle("alpha").is_none());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn send_to_unknown_worker_has_no_effect() {
    let supervisor = Supervisor::new(fleet_config(SILENT_WORKER));
    let mut events = supervisor.subscribe();

    assert!(!supervisor.send("nobody", "hello"));
    assert!(drain(&mut events).is_empty());
    assert!(supervisor.recent_output("nobody").is_none());
}

#[tokio::test]
async fn lifecycle_follows_protocol_records() {
    let supervisor = Supervisor::new(fleet_config(STAGED_WORKER));
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    assert_eq!(info.state, WorkerState::Starting);

    let ready = wait_for_kind(&mut events, &info.id, "ready").await;
    assert_eq!(
        ready.kind,
        EventKind::Ready {
            session_token: "sess-42".to_string()
        }
    );
    let snapshot = supervisor.get(&info.id).unwrap();
    assert_eq!(snapshot.state, WorkerState::Ready);
    assert_eq!(snapshot.session_token.as_deref(), Some("sess-42"));

    wait_for(&mut events, |e| match &e.kind {
        EventKind::Output { record } => record["type"] == "assistant",
        _ => false,
    })
    .await;
    assert_eq!(supervisor.get(&info.id).unwrap().state, WorkerState::Working);

    let result = wait_for_kind(&mut events, &info.id, "result").await;
    assert_eq!(
        result.kind,
        EventKind::Result {
            text: "all done".to_string(),
            duration_ms: Some(1500),
            is_error: false,
        }
    );
    assert_eq!(supervisor.get(&info.id).unwrap().state, WorkerState::Ready);

    let output = supervisor.recent_output("alpha").unwrap();
    assert_eq!(output, vec!["thinking", "[result] all done (1.5s)"]);

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn output_event_precedes_ready() {
    let supervisor = Supervisor::new(fleet_config(ECHO_WORKER));
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));

    let first = wait_for(&mut events, |e| e.worker_id == info.id).await;
    match first.kind {
        EventKind::Output { record } => {
            assert_eq!(record["type"], "system");
            assert_eq!(record["session_id"], "sess-1");
        }
        other => panic!("Expected output event, got {other:?}"),
    }
    let second = wait_for(&mut events, |e| e.worker_id == info.id).await;
    assert_eq!(second.kind.name(), "ready");
    assert_eq!(second.handle, "alpha");

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn send_runs_a_turn() {
    let supervisor = Supervisor::new(fleet_config(ECHO_WORKER));
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    wait_for_kind(&mut events, &info.id, "ready").await;

    assert!(supervisor.send("alpha", "hi"));
    assert_eq!(supervisor.get(&info.id).unwrap().state, WorkerState::Working);

    let result = wait_for_kind(&mut events, &info.id, "result").await;
    assert!(matches!(result.kind, EventKind::Result { ref text, .. } if text == "done"));
    assert_eq!(supervisor.get(&info.id).unwrap().state, WorkerState::Ready);
    assert_eq!(
        supervisor.recent_output(&info.id).unwrap(),
        vec!["[user] hi", "working on it", "[result] done (0.0s)"]
    );

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn initial_message_sent_after_delay() {
    let supervisor = Supervisor::new(fleet_config(ECHO_WORKER));
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha").initial_message("start")));

    wait_for_kind(&mut events, &info.id, "result").await;
    let output = supervisor.recent_output("alpha").unwrap();
    assert_eq!(output[0], "[user] start");

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn text_and_stderr_go_to_output_buffer() {
    let script = r#"echo 'booting up'
echo 'oops' >&2
echo '{"type":"system","subtype":"init","session_id":"s"}'
cat > /dev/null"#;
    let supervisor = Supervisor::new(fleet_config(script));
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    wait_for_kind(&mut events, &info.id, "ready").await;

    let has_stderr = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let output = supervisor.recent_output("alpha").unwrap();
            if output.iter().any(|line| line == "[stderr] oops") {
                return output;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    let output = has_stderr.expect("stderr line should reach the buffer");
    assert!(output.contains(&"booting up".to_string()));

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn output_buffer_keeps_most_recent_lines() {
    let script = r#"for i in 1 2 3 4 5 6 7 8; do echo "line $i"; done
echo '{"type":"system","subtype":"init","session_id":"s"}'
cat > /dev/null"#;
    let mut config = fleet_config(script);
    config.output_capacity = 5;
    let supervisor = Supervisor::new(config);
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    wait_for_kind(&mut events, &info.id, "ready").await;

    assert_eq!(
        supervisor.recent_output("alpha").unwrap(),
        vec!["line 4", "line 5", "line 6", "line 7", "line 8"]
    );

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn unexpected_exit_is_reported() {
    let script = r#"echo '{"type":"system","subtype":"init","session_id":"s"}'
exit 3"#;
    let supervisor = Supervisor::new(fleet_config(script));
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));

    let exit = wait_for_kind(&mut events, &info.id, "exit").await;
    assert_eq!(
        exit.kind,
        EventKind::Exit {
            code: Some(3),
            signal: None,
            expected: false,
        }
    );
    assert_eq!(supervisor.live_count(), 0);
    assert!(supervisor.get_by_handle("alpha").is_none());
    assert!(!supervisor.send("alpha", "anyone there?"));
}

#[tokio::test]
async fn dismiss_reports_expected_exit() {
    let supervisor = Supervisor::new(fleet_config(ECHO_WORKER));
    let mut events = supervisor.subscribe();
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    wait_for_kind(&mut events, &info.id, "ready").await;

    assert!(!supervisor.dismiss("nobody").await);
    assert!(supervisor.dismiss(&info.id).await);

    let exit = drain(&mut events)
        .into_iter()
        .find(|e| e.kind.name() == "exit")
        .expect("exit event published before dismiss returns");
    assert!(matches!(exit.kind, EventKind::Exit { expected: true, .. }));
    assert_eq!(supervisor.live_count(), 0);
    assert!(!supervisor.dismiss(&info.id).await);
}

#[tokio::test]
async fn dismiss_all_kills_workers_ignoring_sigterm() {
    let supervisor = Supervisor::new(fleet_config(STUBBORN_WORKER));
    let mut events = supervisor.subscribe();
    for handle in ["alpha", "beta", "gamma"] {
        assert_ok!(supervisor.spawn(SpawnRequest::new(handle)));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(supervisor.dismiss_all().await, 3);
    assert_eq!(supervisor.live_count(), 0);
    assert!(supervisor.list().is_empty());

    let exits: Vec<EventKind> = drain(&mut events)
        .into_iter()
        .filter(|e| e.kind.name() == "exit")
        .map(|e| e.kind)
        .collect();
    assert_eq!(exits.len(), 3);
    for exit in exits {
        assert_eq!(
            exit,
            EventKind::Exit {
                code: None,
                signal: Some(9),
                expected: true,
            }
        );
    }
}

#[tokio::test]
async fn restart_replaces_worker() {
    let supervisor = Supervisor::new(fleet_config(ECHO_WORKER));
    let mut events = supervisor.subscribe();
    let old = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha").team("core").task("T-7")));
    wait_for_kind(&mut events, &old.id, "ready").await;

    let new = assert_ok!(supervisor.restart("alpha").await);
    assert_ne!(new.id, old.id);
    assert_eq!(new.handle, "alpha");
    assert_eq!(new.team_name, "core");
    assert_eq!(new.working_directory, old.working_directory);
    assert_eq!(new.session_token.as_deref(), Some("sess-1"));
    assert_eq!(new.current_task_id.as_deref(), Some("T-7"));
    assert_eq!(new.restart_count, 1);

    let queued = drain(&mut events);
    assert!(queued
        .iter()
        .any(|e| e.worker_id == old.id && matches!(e.kind, EventKind::Exit { expected: true, .. })));
    let restart = queued
        .iter()
        .find(|e| e.kind.name() == "restart")
        .expect("restart event");
    assert_eq!(restart.worker_id, new.id);
    assert_eq!(
        restart.kind,
        EventKind::Restart {
            previous_id: old.id.clone(),
            restart_count: 1,
        }
    );

    assert!(supervisor.get(&old.id).is_none());
    assert_eq!(supervisor.get_by_handle("alpha").unwrap().id, new.id);
    assert_eq!(supervisor.live_count(), 1);

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn restart_resumes_session() {
    let supervisor = Supervisor::new(fleet_config(RESUMING_WORKER));
    let mut events = supervisor.subscribe();
    let old = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    wait_for_kind(&mut events, &old.id, "ready").await;
    assert_eq!(
        supervisor.get(&old.id).unwrap().session_token.as_deref(),
        Some("fresh")
    );

    let new = assert_ok!(supervisor.restart(&old.id).await);
    let ready = wait_for_kind(&mut events, &new.id, "ready").await;
    assert_eq!(
        ready.kind,
        EventKind::Ready {
            session_token: "fresh-resumed".to_string()
        }
    );

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn restart_limit_enforced() {
    let mut config = fleet_config(SILENT_WORKER);
    config.max_restart_attempts = 1;
    let supervisor = Supervisor::new(config);
    assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));

    let restarted = assert_ok!(supervisor.restart("alpha").await);
    assert_eq!(restarted.restart_count, 1);

    let err = assert_err!(supervisor.restart("alpha").await);
    assert!(matches!(
        err,
        SupervisorError::RestartLimitReached { ref handle, attempts: 1 } if handle == "alpha"
    ));
    let current = supervisor.get_by_handle("alpha").unwrap();
    assert_eq!(current.id, restarted.id);
    assert_eq!(current.restart_count, 1);

    let err = assert_err!(supervisor.restart("nobody").await);
    assert!(matches!(err, SupervisorError::WorkerNotFound { .. }));

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn shutdown_refuses_new_workers() {
    let supervisor = Supervisor::new(fleet_config(ECHO_WORKER));
    assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    assert_ok!(supervisor.spawn(SpawnRequest::new("beta")));
    supervisor.start_health_monitor();

    supervisor.shutdown().await;

    assert!(supervisor.is_shutting_down());
    assert_eq!(supervisor.live_count(), 0);
    let err = assert_err!(supervisor.spawn(SpawnRequest::new("gamma")));
    assert!(matches!(err, SupervisorError::ShuttingDown));
}

#[tokio::test]
async fn queries_reflect_registry() {
    let supervisor = Supervisor::new(fleet_config(SILENT_WORKER));
    for handle in ["alpha", "beta", "gamma"] {
        assert_ok!(supervisor.spawn(SpawnRequest::new(handle)));
    }

    let handles: Vec<String> = supervisor.list().into_iter().map(|w| w.handle).collect();
    assert_eq!(handles, vec!["alpha", "beta", "gamma"]);

    assert!(supervisor.set_current_task("beta", Some("T-9".to_string())));
    assert_eq!(
        supervisor.get_by_handle("beta").unwrap().current_task_id.as_deref(),
        Some("T-9")
    );
    assert!(supervisor.set_current_task("beta", None));
    assert!(supervisor.get_by_handle("beta").unwrap().current_task_id.is_none());
    assert!(!supervisor.set_current_task("nobody", None));

    let counts = supervisor.health_counts();
    assert_eq!(counts.healthy, 3);
    assert_eq!(counts.total(), 3);

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn event_stream_yields_events() {
    let supervisor = Supervisor::new(fleet_config(ECHO_WORKER));
    let stream = supervisor.event_stream();
    tokio::pin!(stream);
    let info = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended");
    assert_eq!(first.worker_id, info.id);
    assert_eq!(first.kind.name(), "output");

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn send_to_stopping_worker_is_refused() {
    let mut config = fleet_config(STUBBORN_WORKER);
    config.dismiss_grace_ms = 1_000;
    let supervisor = Supervisor::new(config);
    assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dismisser = supervisor.clone();
    let dismissing = tokio::spawn(async move { dismisser.dismiss("alpha").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        supervisor.get_by_handle("alpha").unwrap().state,
        WorkerState::Stopping
    );

    let mut events = supervisor.subscribe();
    let before = supervisor.recent_output("alpha").unwrap();
    assert!(!supervisor.send("alpha", "hi"));
    assert_eq!(supervisor.recent_output("alpha").unwrap(), before);
    assert_eq!(
        supervisor.get_by_handle("alpha").unwrap().state,
        WorkerState::Stopping
    );
    assert!(drain(&mut events).is_empty());

    assert!(dismissing.await.unwrap());
    assert_eq!(supervisor.live_count(), 0);
}

#[tokio::test]
async fn dismiss_while_stopping_waits_for_exit() {
    let supervisor = Supervisor::new(fleet_config(STUBBORN_WORKER));
    assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut events = supervisor.subscribe();

    let dismisser = supervisor.clone();
    let dismissing = tokio::spawn(async move { dismisser.dismiss("alpha").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        supervisor.get_by_handle("alpha").unwrap().state,
        WorkerState::Stopping
    );

    assert!(supervisor.dismiss("alpha").await);
    assert_eq!(supervisor.live_count(), 0);
    assert!(dismissing.await.unwrap());

    let exits: Vec<EventKind> = drain(&mut events)
        .into_iter()
        .filter(|e| e.kind.name() == "exit")
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        exits,
        vec![EventKind::Exit {
            code: None,
            signal: Some(9),
            expected: true,
        }]
    );
}

#[tokio::test]
async fn initial_message_not_delivered_to_replacement() {
    let mut config = fleet_config(ECHO_WORKER);
    config.initial_message_delay_ms = 300;
    let supervisor = Supervisor::new(config);
    let mut events = supervisor.subscribe();

    let first = assert_ok!(
        supervisor.spawn(SpawnRequest::new("alpha").initial_message("for the first worker"))
    );
    assert!(supervisor.dismiss(&first.id).await);

    let second = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    wait_for_kind(&mut events, &second.id, "ready").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let output = supervisor.recent_output("alpha").unwrap();
    assert!(!output.iter().any(|line| line.contains("for the first worker")));
    assert!(drain(&mut events).iter().all(|e| e.kind.name() != "result"));
    assert_eq!(supervisor.get(&second.id).unwrap().state, WorkerState::Ready);

    supervisor.dismiss_all().await;
}

#[tokio::test]
async fn concurrent_restarts_run_once() {
    let supervisor = Supervisor::new(fleet_config(SILENT_WORKER));
    let original = assert_ok!(supervisor.spawn(SpawnRequest::new("alpha")));
    let mut events = supervisor.subscribe();

    let (first, second) = tokio::join!(
        supervisor.restart("alpha"),
        supervisor.restart(&original.id)
    );

    let replaced = assert_ok!(first);
    assert_eq!(replaced.restart_count, 1);
    let err = assert_err!(second);
    assert!(matches!(err, SupervisorError::RestartInProgress { ref handle } if handle == "alpha"));

    let kinds: Vec<&str> = drain(&mut events).iter().map(|e| e.kind.name()).collect();
    assert_eq!(kinds, vec!["exit", "restart"]);
    assert_eq!(supervisor.live_count(), 1);
    assert_eq!(supervisor.get_by_handle("alpha").unwrap().id, replaced.id);

    supervisor.dismiss_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spawns_respect_handles_and_capacity() {
    let mut config = fleet_config(SILENT_WORKER);
    config.max_workers = 2;
    let supervisor = Supervisor::new(config);

    let attempts: Vec<_> = ["alpha", "beta", "gamma"]
        .iter()
        .cycle()
        .take(12)
        .map(|handle| {
            let supervisor = supervisor.clone();
            let request = SpawnRequest::new(*handle);
            tokio::spawn(async move { supervisor.spawn(request) })
        })
        .collect();

    let mut spawned = Vec::new();
    for attempt in join_all(attempts).await {
        match attempt.unwrap() {
            Ok(info) => spawned.push(info.handle),
            Err(
                SupervisorError::DuplicateHandle { .. } | SupervisorError::CapacityReached { .. },
            ) => {}
            Err(other) => panic!("Unexpected spawn error: {other}"),
        }
    }

    assert_eq!(spawned.len(), 2);
    assert_ne!(spawned[0], spawned[1]);
    assert_eq!(supervisor.live_count(), 2);
    assert_eq!(supervisor.list().len(), 2);

    supervisor.dismiss_all().await;
}
