mod cli;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use child_process::{ChildArgs, ChildProcessManager, run_and_listen};
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use detector_host::config::HostConfig;
use detector_host::database::{self, AlertRuleStore, SqlxAlertRuleStore};
use detector_host::detectors::PackageLoader;
use detector_host::domain::{AlertRule, DetectorRunRequest, ResolutionCheckRequest};
use detector_host::logging;
use detector_host::panic_hook;
use detector_host::runner::DetectorRunner;
use detector_host::scheduler::{ChildProcessRuleExecutor, Scheduler};

use crate::cli::{Args, Commands};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Child {
            packages_dir,
            ipc_endpoint,
            heartbeat_ms,
        } => {
            let code = run_child(packages_dir, ipc_endpoint, heartbeat_ms).await;
            process::exit(code);
        }
        command => {
            dotenvy::dotenv().ok();
            if let Err(e) = run(command).await {
                error!("{:#}", e);
                eprintln!("Error: {:#}", e);
                process::exit(1);
            }
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = HostConfig::from_env().context("Invalid configuration")?;

    if !matches!(command, Commands::Serve) {
        logging::init_stderr_logging(match &command {
            Commands::RunOnce => logging::DEFAULT_LOG_FILTER,
            _ => logging::DEFAULT_CLI_LOG_FILTER,
        })?;
    }

    match command {
        Commands::Serve => serve(config).await,
        Commands::RunOnce => run_once(config).await,
        Commands::AddRule { rule } => {
            let rule: AlertRule =
                serde_json::from_str(&read_json_arg(&rule)?).context("Invalid rule JSON")?;
            let store = open_store(&config).await?;
            store.add_or_replace_alert_rule(&rule).await?;
            println!("{}", rule.id);
            Ok(())
        }
        Commands::RemoveRule { id } => {
            let store = open_store(&config).await?;
            store.delete_alert_rule(&id).await?;
            Ok(())
        }
        Commands::ListRules => {
            let store = open_store(&config).await?;
            for rule in store.get_all_alert_rules().await? {
                let last = store.get_last_execution_time(&rule.id).await?;
                let line = json!({ "rule": rule, "last_execution_time": last });
                println!("{}", serde_json::to_string(&line)?);
            }
            Ok(())
        }
        Commands::CheckResolution { request } => {
            let request: ResolutionCheckRequest = serde_json::from_str(&read_json_arg(&request)?)
                .context("Invalid resolution check JSON")?;
            let executor = ChildProcessRuleExecutor::new(child_manager(&config)?);
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let state = executor.check_resolution(request, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Commands::Child { .. } => anyhow::bail!("child mode cannot be combined with configuration"),
    }
}

async fn serve(config: HostConfig) -> Result<()> {
    let (logging_config, _guard) = logging::init_logging(&config.log_dir)?;
    panic_hook::install(Some(config.log_dir.clone()));
    info!("detector-host {} starting", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config).await?;
    let scheduler = build_scheduler(&config, store)?;

    let shutdown = scheduler.cancellation_token();
    logging_config.start_retention_cleanup(shutdown.clone());
    cancel_on_ctrl_c(shutdown);

    scheduler.run().await;
    Ok(())
}

async fn run_once(config: HostConfig) -> Result<()> {
    panic_hook::install(None);
    let store = open_store(&config).await?;
    let scheduler = build_scheduler(&config, store)?;
    cancel_on_ctrl_c(scheduler.cancellation_token());

    let report = scheduler.tick(Utc::now()).await?;
    scheduler.wait_for_runs().await;

    println!(
        "dispatched {}, in flight {}, not due {}, disabled {}, invalid {}",
        report.dispatched.len(),
        report.skipped_in_flight.len(),
        report.not_due,
        report.disabled,
        report.invalid
    );
    Ok(())
}

async fn open_store(config: &HostConfig) -> Result<Arc<dyn AlertRuleStore>> {
    let pool = database::init_pool(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    database::run_migrations(&pool).await?;
    Ok(Arc::new(SqlxAlertRuleStore::new(pool)))
}

fn child_manager(config: &HostConfig) -> Result<ChildProcessManager> {
    let executable = std::env::current_exe().context("Cannot locate the host executable")?;
    Ok(ChildProcessManager::new(
        config.child_process_config(&executable),
    )?)
}

fn build_scheduler(config: &HostConfig, store: Arc<dyn AlertRuleStore>) -> Result<Scheduler> {
    let executor = Arc::new(ChildProcessRuleExecutor::new(child_manager(config)?));
    Ok(Scheduler::new(
        store,
        executor,
        config.retry_policy(),
        config.scheduler_config(),
    ))
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });
}

/// `@path` reads the file, anything else is taken literally.
fn read_json_arg(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))
        }
        None => Ok(arg.to_string()),
    }
}

async fn run_child(packages_dir: PathBuf, ipc_endpoint: String, heartbeat_ms: u64) -> i32 {
    if let Err(e) = logging::init_stderr_logging(logging::DEFAULT_CHILD_LOG_FILTER) {
        eprintln!("{e}");
    }
    panic_hook::install(None);

    let args = ChildArgs::new(ipc_endpoint, Duration::from_millis(heartbeat_ms));
    let runner = DetectorRunner::new(Arc::new(PackageLoader::new(packages_dir)));

    run_and_listen(&args, move |request: DetectorRunRequest, cancel| async move {
        runner.handle(request, cancel).await
    })
    .await
}
