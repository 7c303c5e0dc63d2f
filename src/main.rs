//! Certfleet - certificate issuance and distribution daemon
//!
//! Renews certificates with certbot and pushes them to a fleet of hosts over SSH.

mod gelf;

use anyhow::{Context, Result};
use certfleet_config::{Config, GelfConfig, DEFAULT_CONFIG_FILE};
use certfleet_daemon::{CycleReport, Orchestrator};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Certfleet - issue certificates and deploy them to your hosts
#[derive(Parser, Debug)]
#[command(name = "certfleet")]
#[command(about = "Certfleet - issue certificates and deploy them to your hosts")]
#[command(version, long_version = env!("CERTFLEET_LONG_VERSION"))]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "CERTFLEET_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the renewal loop until interrupted (default)
    Run,
    /// Run a single renewal cycle and exit
    Once,
    /// Validate the configuration and exit
    Check,
}

/// Bound on waiting for queued log messages at exit
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Setup logging, forwarding to Graylog when configured
///
/// Must be called from within the tokio runtime when `gelf` is set.
fn init_logging(log_level: &str, gelf: Option<&GelfConfig>) -> Result<Option<gelf::GelfHandle>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    let (gelf_layer, gelf_handle) = match gelf {
        Some(config) => {
            let (layer, handle) =
                gelf::GelfLayer::spawn(config).context("Failed to create GELF log forwarder")?;
            (Some(layer), Some(handle))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(gelf_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(gelf_handle)
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

fn print_summary(path: &std::path::Path, config: &Config) {
    println!("Configuration OK: {}", path.display());
    println!("  email:          {}", config.system.email);
    println!("  ssh key:        {}", config.system.ssh_keyfile.display());
    println!("  renew delay:    {}s", config.system.renew_delay_seconds);
    println!("  certbot:        {}", config.certbot.command.join(" "));
    println!("  live dir:       {}", config.certbot.live_dir.display());
    match &config.gelf {
        Some(gelf) => println!("  gelf:           {}", gelf::endpoint(gelf)),
        None => println!("  gelf:           disabled"),
    }
    println!("  hosts:          {}", config.hosts.len());
    for host in &config.hosts {
        println!(
            "    {}@{}:{} ({} post command(s))",
            host.ssh_user,
            host.hostname,
            host.ssh_port,
            host.post_commands.len()
        );
    }
}

/// Exit status of `once`: 1 when any host needs attention
fn once_exit_status(report: &CycleReport) -> u8 {
    if report.has_problems() {
        1
    } else {
        0
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if command == Commands::Check {
        print_summary(&cli.config, &config);
        return Ok(ExitCode::SUCCESS);
    }

    let gelf_handle = init_logging(&cli.log_level, config.gelf.as_ref())?;

    info!(
        "Certfleet {} starting with {} host(s)",
        env!("CARGO_PKG_VERSION"),
        config.hosts.len()
    );

    let orchestrator = Orchestrator::from_config(config);

    let status = match command {
        Commands::Once => {
            let report = orchestrator.run_cycle(1).await;
            report.log_summary();
            once_exit_status(&report)
        }
        Commands::Run | Commands::Check => {
            orchestrator.run(None, shutdown_signal()).await;
            0
        }
    };

    if let Some(handle) = gelf_handle {
        if !handle.flush(LOG_FLUSH_TIMEOUT).await {
            eprintln!("certfleet: some log messages were not forwarded before exit");
        }
    }

    Ok(ExitCode::from(status))
}
