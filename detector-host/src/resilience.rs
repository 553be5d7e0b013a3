//! Retry with exponential backoff for outbound dependency calls.
//!
//! Every attempt is reported to a [`DependencyTracer`] independently of the retry
//! decision, so a failing dependency leaves one trace per attempt.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default backoff base. The i-th retry waits `base * 2^i`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// One attempt of a dependency call.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyTrace {
    pub name: String,
    pub duration: Duration,
    pub success: bool,
    /// 1-based attempt number.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl DependencyTrace {
    pub fn new(name: impl Into<String>, duration: Duration, success: bool) -> Self {
        Self {
            name: name.into(),
            duration,
            success,
            attempt: 1,
            error: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// Receives dependency traces.
pub trait DependencyTracer: Send + Sync {
    fn trace(&self, trace: &DependencyTrace);
}

/// Emits dependency traces as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDependencyTracer;

impl DependencyTracer for LogDependencyTracer {
    fn trace(&self, trace: &DependencyTrace) {
        let duration_ms = trace.duration.as_millis() as u64;
        let metrics = if trace.metrics.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&trace.metrics).unwrap_or_default()
        };
        if trace.success {
            info!(
                target: "detector_host::dependency",
                dependency = %trace.name,
                duration_ms,
                attempt = trace.attempt,
                success = true,
                metrics = %metrics,
                "Dependency call"
            );
        } else {
            warn!(
                target: "detector_host::dependency",
                dependency = %trace.name,
                duration_ms,
                attempt = trace.attempt,
                success = false,
                error = trace.error.as_deref().unwrap_or(""),
                metrics = %metrics,
                "Dependency call"
            );
        }
    }
}

/// Retry-with-backoff executor.
#[derive(Clone)]
pub struct RetryPolicy {
    retry_count: u32,
    base_delay: Duration,
    use_jitter: bool,
    tracer: Arc<dyn DependencyTracer>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_count", &self.retry_count)
            .field("base_delay", &self.base_delay)
            .field("use_jitter", &self.use_jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(retry_count: u32, base_delay: Duration) -> Self {
        Self {
            retry_count,
            base_delay,
            use_jitter: false,
            tracer: Arc::new(LogDependencyTracer),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn DependencyTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Add up to 25% random jitter to each delay.
    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn tracer(&self) -> &Arc<dyn DependencyTracer> {
        &self.tracer
    }

    /// Delay before the `retry`-th retry (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        if self.use_jitter {
            let jitter = delay.mul_f64(0.25 * rand::random::<f64>());
            delay.saturating_add(jitter)
        } else {
            delay
        }
    }

    /// Run `op`, retrying any failure.
    pub async fn run_with_retry<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_with_retry_if(name, |_| true, op).await
    }

    /// Run `op`, retrying only failures for which `should_retry` holds.
    ///
    /// After the last retry the final failure is returned unchanged.
    pub async fn run_with_retry_if<T, E, F, Fut, P>(
        &self,
        name: &str,
        should_retry: P,
        op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        self.run_with_retry_until(name, &CancellationToken::new(), should_retry, op)
            .await
    }

    /// Like [`Self::run_with_retry_if`], but stops retrying once `cancel` fires.
    ///
    /// Cancellation interrupts a backoff wait and returns the last failure without
    /// another attempt.
    pub async fn run_with_retry_until<T, E, F, Fut, P>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        should_retry: P,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut retry = 0u32;
        loop {
            let started = Instant::now();
            let result = op().await;

            let mut trace = DependencyTrace::new(name, started.elapsed(), result.is_ok());
            trace.attempt = retry + 1;
            if let Err(e) = &result {
                trace.error = Some(e.to_string());
            }
            self.tracer.trace(&trace);

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if retry >= self.retry_count || !should_retry(&e) {
                        if retry > 0 {
                            debug!(dependency = %name, attempts = retry + 1, "Giving up");
                        }
                        return Err(e);
                    }
                    if cancel.is_cancelled() {
                        return Err(e);
                    }

                    retry += 1;
                    let delay = self.delay_for_retry(retry);
                    debug!(
                        "{} failed: {}, retrying in {:?} (retry {}/{})",
                        name, e, delay, retry, self.retry_count
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(dependency = %name, "Retry abandoned after cancellation");
                            return Err(e);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
