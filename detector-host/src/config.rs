//! Host configuration loaded from the environment.
//!
//! Every value has a default. A `.env` file in the working directory is
//! honoured when the binary calls `dotenvy::dotenv()` before [`HostConfig::from_env`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use child_process::ChildProcessConfig;

use crate::resilience::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:detector-host.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_PACKAGES_DIR: &str = "packages";

/// Subcommand the host binary runs children with.
pub const CHILD_SUBCOMMAND: &str = "child";

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub packages_dir: PathBuf,
    pub tick_interval: Duration,
    pub max_concurrent_processes: usize,
    pub retry_count: u32,
    pub retry_base_delay: Duration,
    pub max_transient_deferrals: u32,
    pub analysis_lookback: Duration,
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub start_timeout: Duration,
    /// `None` leaves child runs unbounded.
    pub max_run_time: Option<Duration>,
    pub exit_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            packages_dir: PathBuf::from(DEFAULT_PACKAGES_DIR),
            tick_interval: Duration::from_secs(60),
            max_concurrent_processes: 4,
            retry_count: 3,
            retry_base_delay: Duration::from_millis(1000),
            max_transient_deferrals: 3,
            analysis_lookback: Duration::from_secs(60 * 60),
            grace_period: child_process::manager::DEFAULT_GRACE_PERIOD,
            heartbeat_interval: child_process::manager::DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: child_process::manager::DEFAULT_HEARTBEAT_TIMEOUT,
            start_timeout: child_process::manager::DEFAULT_START_TIMEOUT,
            max_run_time: Some(Duration::from_secs(30 * 60)),
            exit_timeout: child_process::manager::DEFAULT_EXIT_TIMEOUT,
        }
    }
}

impl HostConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };

        let max_run_secs = parse_or(
            &lookup,
            "CHILD_MAX_RUN_SECS",
            defaults.max_run_time.map(|d| d.as_secs()).unwrap_or(0),
        )?;

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            log_dir: lookup("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            packages_dir: lookup("PACKAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.packages_dir),
            tick_interval: secs("SCHEDULER_TICK_SECS", defaults.tick_interval)?,
            max_concurrent_processes: parse_or(
                &lookup,
                "MAX_CONCURRENT_PROCESSES",
                defaults.max_concurrent_processes,
            )?,
            retry_count: parse_or(&lookup, "RETRY_COUNT", defaults.retry_count)?,
            retry_base_delay: Duration::from_millis(parse_or(
                &lookup,
                "RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            max_transient_deferrals: parse_or(
                &lookup,
                "MAX_TRANSIENT_DEFERRALS",
                defaults.max_transient_deferrals,
            )?,
            analysis_lookback: secs("ANALYSIS_LOOKBACK_SECS", defaults.analysis_lookback)?,
            grace_period: secs("CHILD_GRACE_PERIOD_SECS", defaults.grace_period)?,
            heartbeat_interval: secs("CHILD_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            heartbeat_timeout: secs("CHILD_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout)?,
            start_timeout: secs("CHILD_START_TIMEOUT_SECS", defaults.start_timeout)?,
            max_run_time: (max_run_secs > 0).then(|| Duration::from_secs(max_run_secs)),
            exit_timeout: secs("CHILD_EXIT_TIMEOUT_SECS", defaults.exit_timeout)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::config("SCHEDULER_TICK_SECS must be greater than zero"));
        }
        if self.max_concurrent_processes == 0 {
            return Err(Error::config(
                "MAX_CONCURRENT_PROCESSES must be greater than zero",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::config(
                "CHILD_HEARTBEAT_INTERVAL_SECS must be greater than zero",
            ));
        }
        if self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(Error::config(
                "CHILD_HEARTBEAT_INTERVAL_SECS must be less than CHILD_HEARTBEAT_TIMEOUT_SECS",
            ));
        }
        if self.heartbeat_interval >= self.grace_period {
            return Err(Error::config(
                "CHILD_HEARTBEAT_INTERVAL_SECS must be less than CHILD_GRACE_PERIOD_SECS",
            ));
        }
        Ok(())
    }

    /// Child process settings for running detectors through `executable`.
    pub fn child_process_config(&self, executable: &Path) -> ChildProcessConfig {
        ChildProcessConfig::new(executable)
            .with_args([
                CHILD_SUBCOMMAND.into(),
                "--packages-dir".into(),
                self.packages_dir.clone().into_os_string(),
            ])
            .with_grace_period(self.grace_period)
            .with_heartbeat(self.heartbeat_interval, self.heartbeat_timeout)
            .with_start_timeout(self.start_timeout)
            .with_max_run_time(self.max_run_time)
            .with_exit_timeout(self.exit_timeout)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: self.tick_interval,
            max_concurrent_runs: self.max_concurrent_processes,
            max_transient_deferrals: self.max_transient_deferrals,
            analysis_lookback: self.analysis_lookback,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, self.retry_base_delay)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid {key} '{raw}': {e}"))),
    }
}
