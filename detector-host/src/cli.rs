use std::path::PathBuf;

use clap::{Parser, Subcommand};
use detector_host::config::DEFAULT_PACKAGES_DIR;

#[derive(Parser, Debug)]
#[command(
    name = "detector-host",
    version,
    about = "Runs detector packages against cloud resources on cron schedules"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Serve,

    /// Evaluate all rules once, wait for the runs and exit
    RunOnce,

    /// Add a rule, or replace the rule with the same id
    AddRule {
        /// Rule as JSON, or @path to a JSON file
        rule: String,
    },

    /// Remove a rule and its execution state
    RemoveRule { id: String },

    /// Print all rules with their last execution time
    ListRules,

    /// Ask a detector whether an alert still holds
    CheckResolution {
        /// Resolution check request as JSON, or @path to a JSON file
        request: String,
    },

    /// Serve one detector request over stdin/stdout (started by the host)
    #[command(hide = true)]
    Child {
        #[arg(long, env = "PACKAGES_DIR", default_value = DEFAULT_PACKAGES_DIR)]
        packages_dir: PathBuf,

        #[arg(long = "ipc-endpoint")]
        ipc_endpoint: String,

        #[arg(long = "heartbeat-ms", value_parser = clap::value_parser!(u64).range(1..))]
        heartbeat_ms: u64,
    },
}
