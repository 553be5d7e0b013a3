use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use detector_package::{create_package, list_entries, read_manifest};
use serde_json::json;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "detector-pack", version, about = "Build and inspect detector packages")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Zip a detector directory into <name>.package
    Package {
        /// Directory containing manifest.json
        path: PathBuf,

        /// Package name, usually the detector id
        name: String,

        /// Where to write the package
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Print a package's manifest and entries
    Inspect { package: PathBuf },
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args.command) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Package {
            path,
            name,
            output_dir,
        } => {
            debug!(source = %path.display(), %name, "Packaging detector");
            let package = create_package(&path, &name, &output_dir)
                .with_context(|| format!("Failed to package {}", path.display()))?;
            println!("{}", package.display());
        }
        Commands::Inspect { package } => {
            let manifest = read_manifest(&package)
                .with_context(|| format!("Failed to read {}", package.display()))?;
            let entries = list_entries(&package)?;
            let report = json!({ "manifest": manifest, "entries": entries });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
