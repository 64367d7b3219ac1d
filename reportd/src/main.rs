//! reportd-collector - moves reported interactions from the transport into storage
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/reportd/config.toml (~/.config/reportd/config.toml)
//! - Spool and database: $XDG_DATA_HOME/reportd/ (~/.local/share/reportd/)
//! - Logs: $XDG_STATE_HOME/reportd/reportd-collector.log
//! - Pid file: $XDG_RUNTIME_DIR/reportd/reportd-collector.pid
//!
//! Runs until SIGINT or SIGTERM. Exits non-zero if the collector cannot start.

use anyhow::{Context, Result};
use clap::Parser;
use reportd_core::{Collector, Config};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "reportd-collector")]
#[command(about = "Collect reported interactions into storage")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/reportd/config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run as a daemon, holding an exclusive pid file
    #[arg(long)]
    daemon: bool,

    /// Pid file to lock in daemon mode
    #[arg(long, value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// In daemon mode, hold the pid file without detaching
    #[arg(long)]
    foreground: bool,

    /// Also log to syslog
    #[arg(long)]
    syslog: bool,

    /// Do not log to stderr
    #[arg(long)]
    no_console: bool,
}

impl Args {
    /// Command line flags take precedence over the config file.
    fn apply(&self, config: &mut Config) {
        config.logging.debug |= self.debug;
        config.logging.verbose |= self.verbose;
        config.logging.syslog |= self.syslog;
        if self.no_console {
            config.logging.console = false;
        }

        config.daemon.enabled |= self.daemon;
        config.daemon.foreground |= self.foreground;
        if let Some(pidfile) = &self.pidfile {
            config.daemon.pidfile = pidfile.clone();
        }
    }
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("reportd-collector: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let detaching = config.daemon.enabled && !config.daemon.foreground;
    let _log_guard = reportd_core::logging::init(&config.logging, detaching)
        .context("failed to initialize logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "reportd-collector starting");

    let mut collector = Collector::from_config(&config).context("failed to start collector")?;

    // The signal handler thread must be started in the process that keeps
    // running, so detach first.
    collector
        .daemonize()
        .context("failed to start collector")?;

    let handle = collector.handle();
    ctrlc::set_handler(move || {
        tracing::info!("Received termination signal");
        handle.request_shutdown();
    })
    .context("failed to set signal handler")?;

    collector.run().context("failed to start collector")?;
    collector.shutdown().context("failed to shut down collector")?;

    tracing::info!("reportd-collector stopped");
    Ok(())
}
