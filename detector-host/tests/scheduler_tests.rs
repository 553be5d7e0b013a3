//! Scheduler tests against a scripted executor and the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use child_process::{ChildProcessError, FailureDescriptor, TerminationReason};
use detector_host::database::{AlertRuleStore, InMemoryAlertRuleStore};
use detector_host::domain::{
    Alert, AlertRule, AlertSeverity, AnalysisRequest, ResourceIdentifier, ResourceType,
};
use detector_host::resilience::RetryPolicy;
use detector_host::scheduler::{RuleExecutor, Scheduler, SchedulerConfig};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeExecutor {
    calls: Mutex<Vec<AnalysisRequest>>,
    failure: Option<fn() -> ChildProcessError>,
    /// Restricts `failure` to requests for this detector.
    failing_detector: Option<&'static str>,
    gate: Option<CancellationToken>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started_after_cancel: AtomicUsize,
}

impl FakeExecutor {
    fn failing(failure: fn() -> ChildProcessError) -> Self {
        Self {
            failure: Some(failure),
            ..Default::default()
        }
    }

    fn failing_for(detector_id: &'static str, failure: fn() -> ChildProcessError) -> Self {
        Self {
            failure: Some(failure),
            failing_detector: Some(detector_id),
            ..Default::default()
        }
    }

    fn gated(gate: CancellationToken) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<AnalysisRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RuleExecutor for FakeExecutor {
    async fn execute(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<Alert>, ChildProcessError> {
        if cancel.is_cancelled() {
            self.started_after_cancel.fetch_add(1, Ordering::SeqCst);
        }
        let resources: Vec<_> = request.target_resources.iter().cloned().collect();
        let fails = self
            .failing_detector
            .is_none_or(|detector_id| request.detector_id == detector_id);
        self.calls.lock().push(request);

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let cancelled = match &self.gate {
            Some(gate) => tokio::select! {
                _ = gate.cancelled() => false,
                _ = cancel.cancelled() => true,
            },
            None => false,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);

        if cancelled {
            return Err(ChildProcessError::Cancelled);
        }
        if let Some(failure) = self.failure
            && fails
        {
            return Err(failure());
        }
        Ok(resources
            .into_iter()
            .map(|resource| Alert {
                title: "High CPU".to_string(),
                resource,
                severity: AlertSeverity::High,
                properties: Default::default(),
            })
            .collect())
    }
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

fn every_five_minutes(id: &str) -> AlertRule {
    AlertRule::new(id, "cpu-threshold", ResourceType::VirtualMachine, "*/5 * * * *").with_target(
        ResourceIdentifier::resource(ResourceType::VirtualMachine, "sub", "rg", "vm-01"),
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

fn scheduler(
    store: &Arc<InMemoryAlertRuleStore>,
    executor: &Arc<FakeExecutor>,
    config: SchedulerConfig,
) -> Scheduler {
    Scheduler::new(store.clone(), executor.clone(), fast_retry(), config)
}

#[tokio::test]
async fn test_first_run_and_due_times() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([every_five_minutes("r1")]));
    let executor = Arc::new(FakeExecutor::default());
    let scheduler = scheduler(&store, &executor, SchedulerConfig::default());

    let report = scheduler.tick(noon()).await.unwrap();
    assert_eq!(report.dispatched, vec!["r1".to_string()]);
    scheduler.wait_for_runs().await;

    assert_eq!(
        store.get_last_execution_time("r1").await.unwrap(),
        Some(noon())
    );
    let first = &executor.calls()[0];
    assert_eq!(first.detector_id, "cpu-threshold");
    assert_eq!(first.time_range.start, noon() - minutes(60));
    assert_eq!(first.time_range.end, noon());

    let report = scheduler.tick(noon() + minutes(4)).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.not_due, 1);

    let report = scheduler.tick(noon() + minutes(5)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    scheduler.wait_for_runs().await;

    let calls = executor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].time_range.start, noon());
    assert_eq!(calls[1].time_range.end, noon() + minutes(5));
    assert_eq!(
        store.get_last_execution_time("r1").await.unwrap(),
        Some(noon() + minutes(5))
    );
    assert_eq!(
        scheduler.execution_state("r1").last_execution_time,
        Some(noon() + minutes(5))
    );
}

#[tokio::test]
async fn test_definitive_failure_advances_without_retry() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([every_five_minutes("r1")]));
    let executor = Arc::new(FakeExecutor::failing(|| {
        ChildProcessError::ChildFailure(FailureDescriptor::not_found("cpu-threshold"))
    }));
    let scheduler = scheduler(&store, &executor, SchedulerConfig::default());

    scheduler.tick(noon()).await.unwrap();
    scheduler.wait_for_runs().await;

    assert_eq!(executor.calls().len(), 1);
    assert_eq!(
        store.get_last_execution_time("r1").await.unwrap(),
        Some(noon())
    );
}

#[tokio::test]
async fn test_terminated_child_is_definitive() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([every_five_minutes("r1")]));
    let executor = Arc::new(FakeExecutor::failing(|| {
        ChildProcessError::TerminatedByParent {
            pid: Some(4242),
            reason: TerminationReason::Unresponsive,
        }
    }));
    let scheduler = scheduler(&store, &executor, SchedulerConfig::default());

    scheduler.tick(noon()).await.unwrap();
    scheduler.wait_for_runs().await;

    assert_eq!(executor.calls().len(), 1);
    assert_eq!(
        store.get_last_execution_time("r1").await.unwrap(),
        Some(noon())
    );
}

#[tokio::test]
async fn test_transient_failure_defers_then_gives_up() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([every_five_minutes("r1")]));
    let executor = Arc::new(FakeExecutor::failing(|| {
        ChildProcessError::ChildFailure(FailureDescriptor::transient("metrics store timed out"))
    }));
    let config = SchedulerConfig {
        max_transient_deferrals: 1,
        ..Default::default()
    };
    let scheduler = scheduler(&store, &executor, config);

    // Retried three times within the tick, then left due.
    scheduler.tick(noon()).await.unwrap();
    scheduler.wait_for_runs().await;
    assert_eq!(executor.calls().len(), 4);
    assert_eq!(store.get_last_execution_time("r1").await.unwrap(), None);
    assert_eq!(scheduler.deferrals("r1"), 1);
    assert_eq!(scheduler.execution_state("r1").last_execution_time, None);

    // Still due on the next tick; this time the failure is final.
    let report = scheduler.tick(noon() + minutes(1)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    scheduler.wait_for_runs().await;
    assert_eq!(executor.calls().len(), 8);
    assert_eq!(
        store.get_last_execution_time("r1").await.unwrap(),
        Some(noon() + minutes(1))
    );
    assert_eq!(scheduler.deferrals("r1"), 0);
}

#[tokio::test]
async fn test_rule_never_runs_twice_concurrently() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([every_five_minutes("r1")]));
    let gate = CancellationToken::new();
    let executor = Arc::new(FakeExecutor::gated(gate.clone()));
    let scheduler = scheduler(&store, &executor, SchedulerConfig::default());

    let first = scheduler.tick(noon()).await.unwrap();
    assert_eq!(first.dispatched.len(), 1);
    assert_eq!(scheduler.in_flight(), vec!["r1".to_string()]);

    let second = scheduler.tick(noon() + minutes(10)).await.unwrap();
    assert!(second.dispatched.is_empty());
    assert_eq!(second.skipped_in_flight, vec!["r1".to_string()]);

    gate.cancel();
    scheduler.wait_for_runs().await;

    assert_eq!(executor.calls().len(), 1);
    assert!(scheduler.in_flight().is_empty());
    assert_eq!(
        store.get_last_execution_time("r1").await.unwrap(),
        Some(noon())
    );
}

#[tokio::test]
async fn test_process_cap_limits_concurrent_runs() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([
        every_five_minutes("r1"),
        every_five_minutes("r2"),
        every_five_minutes("r3"),
    ]));
    let gate = CancellationToken::new();
    let executor = Arc::new(FakeExecutor::gated(gate.clone()));
    let config = SchedulerConfig {
        max_concurrent_runs: 2,
        ..Default::default()
    };
    let scheduler = scheduler(&store, &executor, config);

    let report = scheduler.tick(noon()).await.unwrap();
    assert_eq!(report.dispatched.len(), 3);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(executor.calls().len(), 2);

    gate.cancel();
    scheduler.wait_for_runs().await;

    assert_eq!(executor.calls().len(), 3);
    assert_eq!(executor.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disabled_and_invalid_rules_are_skipped() {
    let invalid = AlertRule::new("bad", "noop", ResourceType::Subscription, "whenever");
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([
        every_five_minutes("off").disabled(),
        invalid,
        every_five_minutes("on"),
    ]));
    let executor = Arc::new(FakeExecutor::default());
    let scheduler = scheduler(&store, &executor, SchedulerConfig::default());

    let report = scheduler.tick(noon()).await.unwrap();
    scheduler.wait_for_runs().await;

    assert_eq!(report.dispatched, vec!["on".to_string()]);
    assert_eq!(report.disabled, 1);
    assert_eq!(report.invalid, 1);
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_without_advancing() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([every_five_minutes("r1")]));
    let executor = Arc::new(FakeExecutor::gated(CancellationToken::new()));
    let scheduler = scheduler(&store, &executor, SchedulerConfig::default());

    scheduler.tick(noon()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.shutdown();

    tokio::time::timeout(Duration::from_secs(5), scheduler.wait_for_runs())
        .await
        .expect("runs should stop after shutdown");

    assert_eq!(executor.calls().len(), 1);
    assert_eq!(store.get_last_execution_time("r1").await.unwrap(), None);
}

fn transient() -> ChildProcessError {
    ChildProcessError::ChildFailure(FailureDescriptor::transient("metrics store timed out"))
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_retry_backoff() {
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([every_five_minutes("r1")]));
    let executor = Arc::new(FakeExecutor::failing(transient));
    let scheduler = Scheduler::new(
        store.clone(),
        executor.clone(),
        RetryPolicy::default(),
        SchedulerConfig::default(),
    );

    scheduler.tick(noon()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.shutdown();

    // The first backoff is 2s; shutdown must not wait it out.
    tokio::time::timeout(Duration::from_secs(1), scheduler.wait_for_runs())
        .await
        .expect("backoff should end on shutdown");

    assert_eq!(executor.calls().len(), 1);
    assert_eq!(executor.started_after_cancel.load(Ordering::SeqCst), 0);
    assert_eq!(store.get_last_execution_time("r1").await.unwrap(), None);
    assert_eq!(scheduler.deferrals("r1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_releases_process_slot() {
    let flaky = AlertRule::new("flaky", "flaky-detector", ResourceType::VirtualMachine, "*/5 * * * *")
        .with_target(ResourceIdentifier::resource(
            ResourceType::VirtualMachine,
            "sub",
            "rg",
            "vm-02",
        ));
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([
        flaky,
        every_five_minutes("steady"),
    ]));
    let executor = Arc::new(FakeExecutor::failing_for("flaky-detector", transient));
    let config = SchedulerConfig {
        max_concurrent_runs: 1,
        ..Default::default()
    };
    let scheduler = Scheduler::new(
        store.clone(),
        executor.clone(),
        RetryPolicy::default(),
        config,
    );

    let report = scheduler.tick(noon()).await.unwrap();
    assert_eq!(report.dispatched.len(), 2);

    // Well inside the first 2s backoff of the flaky rule.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        store.get_last_execution_time("steady").await.unwrap(),
        Some(noon())
    );
    assert_eq!(scheduler.in_flight(), vec!["flaky".to_string()]);

    scheduler.wait_for_runs().await;
    let flaky_calls = executor
        .calls()
        .iter()
        .filter(|c| c.detector_id == "flaky-detector")
        .count();
    assert_eq!(flaky_calls, 4);
    assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_loop_ticks_until_shutdown() {
    // Yearly schedule: only the first tick finds the rule due.
    let rule = AlertRule::new("yearly", "noop", ResourceType::Subscription, "0 0 1 1 *")
        .with_target(ResourceIdentifier::subscription("sub"));
    let store = Arc::new(InMemoryAlertRuleStore::with_rules([rule]));
    let executor = Arc::new(FakeExecutor::default());
    let config = SchedulerConfig {
        tick_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let scheduler = Arc::new(scheduler(&store, &executor, config));

    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run loop should exit after shutdown")
        .unwrap();

    assert_eq!(executor.calls().len(), 1);
    assert!(store.get_last_execution_time("yearly").await.unwrap().is_some());
}
