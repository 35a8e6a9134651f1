//! seriarr - a cron-style RSS episode grabber
//!
//! One invocation polls the configured series feeds, hands new episodes to
//! qBittorrent, waits for them to finish and sorts the files into the media
//! library. Meant to be run from cron or a systemd timer; there is no
//! resident process.

mod config;
mod db;
mod evaluator;
mod feed;
mod library;
mod qbt;
mod runner;
mod schedule;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::runner::RunOptions;

const DEFAULT_DB_PATH: &str = "seriarr.db";

#[derive(Debug, Parser)]
#[command(name = "seriarr", version, about = "RSS episode grabber for qBittorrent")]
struct Cli {
    /// Path to the config file (default: ./config.yml, then ./config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll every series regardless of its weekly airtime window
    #[arg(long)]
    skip_time_check: bool,

    /// Ignore the per-series starting-episode floor
    #[arg(long)]
    skip_start_check: bool,

    /// Evaluate feeds and log decisions without downloading anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = resolve_config_path(cli.config)?;
    tracing::info!("loading config from {}", config_path.display());
    let loaded = config::load(&config_path)?;
    let rejected_series = loaded.rejected.len();
    let config = loaded.config;

    let db_path = config
        .database
        .clone()
        .or_else(|| std::env::var("SERIARR_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

    // Cron can fire again while a slow download is still being waited on.
    let lock_path = db_path.with_extension("lock");
    let Some(_lock) = LockFile::acquire(&lock_path)? else {
        tracing::warn!(
            "lock file {} exists, another run seems active; exiting",
            lock_path.display()
        );
        return Ok(ExitCode::SUCCESS);
    };

    db::init_connection(&db_path)?;

    let options = RunOptions {
        skip_time_check: cli.skip_time_check,
        skip_start_check: cli.skip_start_check,
        dry_run: cli.dry_run,
    };
    let report = runner::run(&config, options).await?;

    if report.failures > 0 || rejected_series > 0 {
        tracing::warn!(
            "run finished with {} failure(s) and {} invalid series config(s)",
            report.failures,
            rejected_series
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "config file {} does not exist", path.display());
        return Ok(path);
    }
    for candidate in ["config.yml", "config.yaml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }
    anyhow::bail!("no config file found, pass one with --config")
}

/// Lock file that is removed when dropped, so an aborted run does not wedge
/// every future invocation behind a stale lock.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Returns `None` when the lock is already held.
    fn acquire(path: &Path) -> Result<Option<Self>> {
        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Some(Self {
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to create lock file {}", path.display()))
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove lock file {}: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seriarr.lock");

        let first = LockFile::acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(LockFile::acquire(&path).unwrap().is_none());

        drop(first);
        assert!(!path.exists());
        assert!(LockFile::acquire(&path).unwrap().is_some());
    }

    #[test]
    fn explicit_missing_config_path_errors() {
        assert!(resolve_config_path(Some(PathBuf::from("/definitely/not/here.yml"))).is_err());
    }
}
