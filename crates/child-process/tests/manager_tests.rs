//! End-to-end tests against the `ipc-fixture` binary.

use std::time::Duration;

use child_process::{
    ChildProcessConfig, ChildProcessError, ChildProcessManager, FailureKind, ProcessChannel,
    ProcessState, TerminationReason,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FIXTURE: &str = env!("CARGO_BIN_EXE_ipc-fixture");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Sample {
    int_value: i64,
    string_value: String,
}

fn manager(mode: &str) -> ChildProcessManager {
    let config = ChildProcessConfig::new(FIXTURE)
        .with_args([mode])
        .with_heartbeat(Duration::from_millis(100), Duration::from_secs(1))
        .with_grace_period(Duration::from_millis(700))
        .with_start_timeout(Duration::from_secs(5))
        .with_exit_timeout(Duration::from_secs(2));
    ChildProcessManager::new(config).unwrap()
}

fn sample() -> Sample {
    Sample {
        int_value: 2347,
        string_value: "Premature optimization".to_string(),
    }
}

#[tokio::test]
async fn test_round_trip_preserves_payload() {
    let cancel = CancellationToken::new();
    let (result, report) = manager("echo")
        .run_with_report::<_, Sample>(&sample(), &cancel)
        .await;

    assert_eq!(result.unwrap(), sample());
    assert_eq!(report.final_state, ProcessState::Completed);
    assert_eq!(report.exit_code, Some(0));
    assert!(report.heartbeats >= 1);
    assert_eq!(
        report.states,
        vec![
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Completed
        ]
    );
}

#[tokio::test]
async fn test_empty_payload_is_success() {
    let cancel = CancellationToken::new();
    let result: Option<Sample> = manager("empty")
        .run_child_process(&sample(), &cancel)
        .await
        .unwrap();
    assert_eq!(result, None);
}

#[tokio::test]
async fn test_not_found_failure_is_typed() {
    let cancel = CancellationToken::new();
    let (result, report) = manager("fail-not-found")
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::NotFound));
    assert!(!err.is_retriable());
    assert!(err.to_string().contains("detector 'missing' does not exist"));
    assert_eq!(report.final_state, ProcessState::ChildReportedFailure);
    assert_eq!(report.exit_code, Some(10));
}

#[tokio::test]
async fn test_transient_failure_is_retriable() {
    let cancel = CancellationToken::new();
    let err = manager("transient")
        .run_child_process::<_, Value>(&json!({}), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::TransientDependency));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_panic_becomes_generic_failure() {
    let cancel = CancellationToken::new();
    let err = manager("panic")
        .run_child_process::<_, Value>(&json!({}), &cancel)
        .await
        .unwrap_err();

    match err {
        ChildProcessError::ChildFailure(failure) => {
            assert_eq!(failure.kind, FailureKind::Generic);
            assert_eq!(failure.message, "Premature optimization is the root of all evil");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_cooperative_cancellation_completes_before_grace() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let (result, report) = manager("cooperative")
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(report.final_state, ProcessState::CancelledGracefully);
    assert_eq!(report.exit_code, Some(3));
    // Cancelled at ~400ms; the 700ms grace period must not have been used up.
    assert!(started.elapsed() < Duration::from_millis(1100));
}

#[tokio::test]
async fn test_ignored_cancellation_is_killed_after_grace() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let (result, report) = manager("ignore-cancel")
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        ChildProcessError::TerminatedByParent {
            reason: TerminationReason::GracePeriodElapsed,
            ..
        }
    ));
    assert_eq!(err.kind(), Some(FailureKind::TerminatedByParent));
    assert_eq!(report.final_state, ProcessState::ForciblyTerminated);
    assert!(report.states.contains(&ProcessState::Cancelling));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_before_start_still_escalates() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (result, report) = manager("ignore-cancel")
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    assert!(result.unwrap_err().is_terminated_by_parent());
    assert_eq!(report.final_state, ProcessState::ForciblyTerminated);
}

#[tokio::test]
async fn test_silent_child_is_terminated() {
    let cancel = CancellationToken::new();
    let (result, report) = manager("stall")
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    assert!(matches!(
        result.unwrap_err(),
        ChildProcessError::TerminatedByParent {
            reason: TerminationReason::Unresponsive,
            ..
        }
    ));
    assert_eq!(report.final_state, ProcessState::ForciblyTerminated);
}

#[tokio::test]
async fn test_max_run_time_kills_child() {
    let config = ChildProcessConfig::new(FIXTURE)
        .with_args(["ignore-cancel"])
        .with_heartbeat(Duration::from_millis(100), Duration::from_secs(1))
        .with_grace_period(Duration::from_secs(2))
        .with_max_run_time(Some(Duration::from_millis(500)));
    let manager = ChildProcessManager::new(config).unwrap();

    let cancel = CancellationToken::new();
    let (result, report) = manager
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    assert!(matches!(
        result.unwrap_err(),
        ChildProcessError::TerminatedByParent {
            reason: TerminationReason::TimedOut,
            ..
        }
    ));
    assert_eq!(report.final_state, ProcessState::TimedOut);
}

#[tokio::test]
async fn test_unmapped_exit_is_crash() {
    let cancel = CancellationToken::new();
    let (result, report) = manager("crash")
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, ChildProcessError::Crash { exit_code: Some(42), .. }));
    assert!(!err.is_retriable());
    assert_eq!(report.final_state, ProcessState::Crashed);
}

#[tokio::test]
async fn test_stray_stdout_does_not_break_the_channel() {
    let cancel = CancellationToken::new();
    let result: Sample = manager("stray-output")
        .run_child_process(&sample(), &cancel)
        .await
        .unwrap();
    assert_eq!(result, sample());
}

#[tokio::test]
async fn test_payload_type_mismatch_is_protocol_error() {
    let cancel = CancellationToken::new();
    let (result, report) = manager("echo")
        .run_with_report::<_, String>(&sample(), &cancel)
        .await;

    assert!(matches!(result.unwrap_err(), ChildProcessError::Protocol(_)));
    assert_eq!(report.final_state, ProcessState::Crashed);
}

#[tokio::test]
async fn test_missing_executable_fails_to_spawn() {
    let config = ChildProcessConfig::new("/nonexistent/detector-child");
    let cancel = CancellationToken::new();
    let (result, report) = ChildProcessManager::new(config)
        .unwrap()
        .run_with_report::<_, Value>(&json!({}), &cancel)
        .await;

    assert!(matches!(result.unwrap_err(), ChildProcessError::Spawn(_)));
    assert_eq!(report.final_state, ProcessState::Crashed);
}

#[tokio::test]
async fn test_channel_await_result() {
    let request = child_process::wire::encode_frame(&child_process::ParentFrame::Request(
        child_process::ChildProcessInput {
            correlation_id: "corr-channel".to_string(),
            payload: json!({"x": 1}),
        },
    ))
    .unwrap();

    let mut channel = ProcessChannel::launch(
        std::path::Path::new(FIXTURE),
        &["echo", "--ipc-endpoint", "corr-channel", "--heartbeat-ms", "100"],
        "corr-channel",
        request,
    )
    .await
    .unwrap();

    match channel.await_result(Duration::from_secs(5)).await.unwrap() {
        child_process::AwaitOutcome::Response(outcome) => {
            assert_eq!(outcome.into_result().unwrap(), json!({"x": 1}));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let status = channel.await_exit(Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.and_then(|s| s.code()), Some(0));
}
