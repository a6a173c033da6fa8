//! benchrun CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use tracing::error;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first to get log_level
    let cli = benchrun::cli::parse_cli();
    let stamp = benchrun::cli::invocation_stamp();

    // Console priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter));

    let log_dir = cli
        .outdir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("logs");
    let (log_files, log_error) = match open_log_files(&log_dir, benchrun::cli::SCRIPT_NAME, &stamp) {
        Ok(files) => (Some(files), None),
        Err(e) => (None, Some(e)),
    };
    let (info_file, full_file) = log_files.unzip();
    let info_layer = info_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::INFO)
    });
    let full_layer = full_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::DEBUG)
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console_filter))
        .with(info_layer)
        .with(full_layer)
        .init();

    if let Some(e) = log_error {
        tracing::warn!(dir = %log_dir.display(), "Log files disabled: {e}");
    }

    match benchrun::cli::run_with_cli(cli, &stamp).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn open_log_files(dir: &Path, script: &str, stamp: &str) -> std::io::Result<(File, File)> {
    fs::create_dir_all(dir)?;
    let info = File::create(dir.join(format!("{script}_{stamp}.log")))?;
    let full = File::create(dir.join(format!("{script}_{stamp}_full.log")))?;
    Ok((info, full))
}
