//! tapdp - datapath CLI
//!
//! Runs one datapath operation per invocation. Results are printed as JSON
//! on stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tapdp_datapath::{ActivationMode, Config, Datapath, DatapathError};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Expose VHD and raw volumes as tapdisk block devices.
#[derive(Debug, Parser)]
#[command(name = "tapdp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root of the per-volume tapdisk records.
    #[arg(long, global = true)]
    metadata_dir: Option<PathBuf>,

    /// Volume activation mode (lvm or none).
    #[arg(long, global = true)]
    activation: Option<ActivationMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Activate the volume and spawn a tapdisk for it.
    Attach {
        uri: String,
        #[arg(long, default_value = "0")]
        domain: String,
    },

    /// Open the volume's image in its tapdisk.
    Activate {
        uri: String,
        #[arg(long, default_value = "0")]
        domain: String,
    },

    /// Close the volume's image.
    Deactivate {
        uri: String,
        #[arg(long, default_value = "0")]
        domain: String,
    },

    /// Destroy the volume's tapdisk and forget it.
    Detach {
        uri: String,
        #[arg(long, default_value = "0")]
        domain: String,
    },

    /// Check that the volume exists.
    Open {
        uri: String,
        #[arg(long)]
        persistent: bool,
    },

    /// Check that the volume exists.
    Close { uri: String },

    /// Print the volume's tapdisk record.
    Show { uri: String },

    /// List running tapdisks.
    List,

    /// Find the tapdisk serving a file.
    Find { path: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        print_error(&e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(dir) = cli.metadata_dir {
        config.metadata_dir = dir;
    }
    if let Some(mode) = cli.activation {
        config.activation = mode;
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!(
        tap_ctl = %config.tap_ctl.display(),
        metadata_dir = %config.metadata_dir.display(),
        activation = %config.activation,
        "Configuration loaded"
    );

    let datapath = Datapath::from_config(&config);
    match cli.command {
        Commands::Attach { uri, domain } => print_json(&datapath.attach(&uri, &domain)?),
        Commands::Activate { uri, domain } => datapath.activate(&uri, &domain)?,
        Commands::Deactivate { uri, domain } => datapath.deactivate(&uri, &domain)?,
        Commands::Detach { uri, domain } => datapath.detach(&uri, &domain)?,
        Commands::Open { uri, persistent } => datapath.open(&uri, persistent)?,
        Commands::Close { uri } => datapath.close(&uri)?,
        Commands::Show { uri } => print_json(&datapath.record(&uri)?),
        Commands::List => print_json(&datapath.tapdisks().list().map_err(DatapathError::from)?),
        Commands::Find { path } => print_json(
            &datapath
                .tapdisks()
                .find_by_file(&path)
                .map_err(DatapathError::from)?,
        ),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize output: {}", e),
    }
}

#[derive(Serialize)]
struct ErrorOutput<'a> {
    code: &'a str,
    message: String,
}

/// Print an error as `{"code", "message"}` on stderr.
fn print_error(err: &anyhow::Error) {
    let code = err
        .downcast_ref::<DatapathError>()
        .map(DatapathError::reason_code)
        .unwrap_or("internal_error");
    let output = ErrorOutput {
        code,
        message: format!("{:#}", err),
    };
    match serde_json::to_string(&output) {
        Ok(json) => eprintln!("{}", json),
        Err(_) => eprintln!("{:#}", err),
    }
}
