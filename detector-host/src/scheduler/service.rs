//! Tick-driven dispatch of due alert rules.
//!
//! Each tick reads every rule from the store, starts a run for each due rule that is
//! not already running, and returns without waiting for the runs. Attempts are capped
//! host-wide by a semaphore, since every attempt owns one child process; a run waiting
//! out a retry backoff holds no permit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use child_process::ChildProcessError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::due::is_due;
use super::executor::RuleExecutor;
use crate::Result;
use crate::database::AlertRuleStore;
use crate::domain::{Alert, AlertRule, AnalysisRequest, ExecutionState, TimeRange};
use crate::resilience::RetryPolicy;

/// Default tick interval (60 seconds).
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Default cap on concurrently running detector processes.
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

/// Default number of ticks a rule may end in an exhausted retriable failure
/// before the failure is treated as definitive.
const DEFAULT_MAX_TRANSIENT_DEFERRALS: u32 = 3;

/// Default analysis window for a rule that never ran.
const DEFAULT_ANALYSIS_LOOKBACK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_concurrent_runs: usize,
    pub max_transient_deferrals: u32,
    pub analysis_lookback: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            max_transient_deferrals: DEFAULT_MAX_TRANSIENT_DEFERRALS,
            analysis_lookback: DEFAULT_ANALYSIS_LOOKBACK,
        }
    }
}

/// What one tick did with each rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: Vec<String>,
    pub skipped_in_flight: Vec<String>,
    pub not_due: usize,
    pub disabled: usize,
    pub invalid: usize,
}

/// Marks a rule as running until dropped.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, ()>>,
    rule_id: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<DashMap<String, ()>>, rule_id: &str) -> Option<Self> {
        match in_flight.entry(rule_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    in_flight: in_flight.clone(),
                    rule_id: rule_id.to_string(),
                })
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.rule_id);
    }
}

/// Everything a spawned run needs, detached from the scheduler's lifetime.
struct RuleRun {
    store: Arc<dyn AlertRuleStore>,
    executor: Arc<dyn RuleExecutor>,
    retry: RetryPolicy,
    states: Arc<DashMap<String, ExecutionState>>,
    permits: Arc<Semaphore>,
    max_transient_deferrals: u32,
    analysis_lookback: Duration,
    cancel: CancellationToken,
}

impl RuleRun {
    async fn run(self, rule: AlertRule, last: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let request = self.request_for(&rule, last, now);
        let dependency = format!("detector:{}", rule.detector_id);

        debug!(rule_id = %rule.id, detector_id = %rule.detector_id, "Starting rule run");
        let result = self
            .retry
            .run_with_retry_until(
                &dependency,
                &self.cancel,
                ChildProcessError::is_retriable,
                || self.attempt(&request),
            )
            .await;

        let advance = match result {
            Ok(alerts) => {
                self.reset_deferrals(&rule.id);
                info!(
                    rule_id = %rule.id,
                    detector_id = %rule.detector_id,
                    alerts = alerts.len(),
                    "Rule run completed"
                );
                for alert in &alerts {
                    info!(
                        target: "detector_host::alerts",
                        rule_id = %rule.id,
                        resource = %alert.resource,
                        severity = %alert.severity,
                        "{}",
                        alert.title
                    );
                }
                true
            }
            Err(e) if e.is_cancelled() || self.cancel.is_cancelled() => {
                info!(rule_id = %rule.id, "Rule run cancelled: {}", e);
                false
            }
            Err(e) if e.is_retriable() => {
                let deferred = {
                    let mut state = self.states.entry(rule.id.clone()).or_default();
                    state.consecutive_deferrals += 1;
                    state.consecutive_deferrals
                };
                if deferred <= self.max_transient_deferrals {
                    warn!(
                        rule_id = %rule.id,
                        deferred,
                        "Rule run failed transiently, next tick retries: {}",
                        e
                    );
                    false
                } else {
                    self.reset_deferrals(&rule.id);
                    error!(
                        rule_id = %rule.id,
                        deferred,
                        "Rule run kept failing transiently, giving up for this period: {}",
                        e
                    );
                    true
                }
            }
            Err(e) => {
                self.reset_deferrals(&rule.id);
                if e.is_terminated_by_parent() {
                    error!(rule_id = %rule.id, "Detector process was terminated: {}", e);
                } else {
                    error!(rule_id = %rule.id, kind = ?e.kind(), "Rule run failed: {}", e);
                }
                true
            }
        };

        if advance {
            match self.store.set_last_execution_time(&rule.id, now).await {
                Ok(()) => {
                    self.states.entry(rule.id.clone()).or_default().last_execution_time = Some(now);
                }
                Err(crate::Error::NotFound { .. }) => {
                    self.states.remove(&rule.id);
                    debug!(rule_id = %rule.id, "Rule was removed while running");
                }
                Err(e) => {
                    error!(rule_id = %rule.id, "Failed to record execution time: {}", e);
                }
            }
        }
    }

    fn reset_deferrals(&self, rule_id: &str) {
        if let Some(mut state) = self.states.get_mut(rule_id) {
            state.consecutive_deferrals = 0;
        }
    }

    /// One execution, holding a process slot only while the child runs.
    async fn attempt(&self, request: &AnalysisRequest) -> std::result::Result<Vec<Alert>, ChildProcessError> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ChildProcessError::Cancelled),
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(ChildProcessError::Cancelled),
            },
        };
        self.executor
            .execute(request.clone(), self.cancel.clone())
            .await
    }

    fn request_for(
        &self,
        rule: &AlertRule,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AnalysisRequest {
        let start = last
            .or_else(|| {
                chrono::Duration::from_std(self.analysis_lookback)
                    .ok()
                    .and_then(|lookback| now.checked_sub_signed(lookback))
            })
            .unwrap_or(now)
            .min(now);

        AnalysisRequest {
            detector_id: rule.detector_id.clone(),
            target_resources: rule.target_resources.clone(),
            time_range: TimeRange { start, end: now },
            settings: rule.settings.clone(),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn AlertRuleStore>,
    executor: Arc<dyn RuleExecutor>,
    retry: RetryPolicy,
    config: SchedulerConfig,
    in_flight: Arc<DashMap<String, ()>>,
    states: Arc<DashMap<String, ExecutionState>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    cancellation_token: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn AlertRuleStore>,
        executor: Arc<dyn RuleExecutor>,
        retry: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            store,
            executor,
            retry,
            config,
            in_flight: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
            permits,
            tasks: Mutex::new(JoinSet::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Rules with a run in progress.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    /// What this scheduler recorded for a rule since it started.
    pub fn execution_state(&self, rule_id: &str) -> ExecutionState {
        self.states
            .get(rule_id)
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Consecutive deferred ticks of a rule.
    pub fn deferrals(&self, rule_id: &str) -> u32 {
        self.execution_state(rule_id).consecutive_deferrals
    }

    /// Evaluate every rule against `now` and start runs for the due ones.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.reap_finished();

        let rules = self.store.get_all_alert_rules().await?;
        let mut report = TickReport::default();

        for rule in rules {
            if !rule.enabled {
                report.disabled += 1;
                continue;
            }
            let schedule = match rule.schedule() {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(rule_id = %rule.id, "Skipping rule: {}", e);
                    report.invalid += 1;
                    continue;
                }
            };
            if self.in_flight.contains_key(&rule.id) {
                report.skipped_in_flight.push(rule.id);
                continue;
            }

            let last = match self.store.get_last_execution_time(&rule.id).await {
                Ok(last) => last,
                Err(e) => {
                    error!(rule_id = %rule.id, "Failed to read execution time: {}", e);
                    continue;
                }
            };
            if !is_due(&schedule, last, now) {
                report.not_due += 1;
                continue;
            }

            let Some(guard) = InFlightGuard::acquire(&self.in_flight, &rule.id) else {
                report.skipped_in_flight.push(rule.id);
                continue;
            };

            report.dispatched.push(rule.id.clone());
            let run = self.rule_run();
            self.tasks.lock().spawn(async move {
                let _guard = guard;
                run.run(rule, last, now).await;
            });
        }

        if !report.dispatched.is_empty() {
            debug!(
                dispatched = report.dispatched.len(),
                skipped = report.skipped_in_flight.len(),
                not_due = report.not_due,
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    fn rule_run(&self) -> RuleRun {
        RuleRun {
            store: self.store.clone(),
            executor: self.executor.clone(),
            retry: self.retry.clone(),
            states: self.states.clone(),
            permits: self.permits.clone(),
            max_transient_deferrals: self.config.max_transient_deferrals,
            analysis_lookback: self.config.analysis_lookback,
            cancel: self.cancellation_token.child_token(),
        }
    }

    fn reap_finished(&self) {
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("Rule run panicked: {}", e);
            }
        }
    }

    /// Wait for every run started so far.
    pub async fn wait_for_runs(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("Rule run panicked: {}", e);
            }
        }
    }

    /// Tick until cancelled, then cancel and drain in-flight runs.
    pub async fn run(&self) {
        info!(
            "Scheduler started (tick every {:?}, max {} concurrent runs)",
            self.config.tick_interval, self.config.max_concurrent_runs
        );
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }

        info!("Scheduler stopping, waiting for {} in-flight runs", self.in_flight.len());
        self.wait_for_runs().await;
        info!("Scheduler stopped");
    }

    /// Cancel in-flight runs and stop [`Self::run`].
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}
