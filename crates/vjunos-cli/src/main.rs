mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use vjunos_core::ConnectionMode;

#[derive(Parser)]
#[command(name = "vjunos")]
#[command(about = "Boot and bootstrap a vJunos-switch appliance")]
#[command(version)]
struct Cli {
    /// Log everything, including raw console output
    #[arg(long, global = true)]
    trace: bool,

    /// Write logs to vjunos.log in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the appliance, configure it and keep it running
    Start {
        #[command(flatten)]
        appliance: ApplianceArgs,

        /// Directory for the health file, QMP socket and logs
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Print the health status; exits with the recorded status code
    Health {
        /// Hostname of the appliance
        #[arg(long, default_value = vjunos_core::DEFAULT_HOSTNAME)]
        hostname: String,

        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Show the saved run state of a started appliance
    Status {
        #[arg(long, default_value = vjunos_core::DEFAULT_HOSTNAME)]
        hostname: String,

        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Print the bootstrap command sequence without touching a device
    ShowBootstrap {
        #[command(flatten)]
        appliance: ApplianceArgs,
    },
}

/// Appliance settings; flags override the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct ApplianceArgs {
    /// HCL appliance definition
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub hostname: Option<String>,

    /// Account created on the appliance
    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// How data NICs attach: tc, bridge or vrxcon
    #[arg(long)]
    pub connection_mode: Option<ConnectionMode>,

    /// Configuration lines applied after bootstrap
    #[arg(long)]
    pub startup_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_guard = init_logging(cli.trace, cli.log_dir.as_deref());

    match cli.command {
        Commands::Start { appliance, run_dir } => {
            commands::start(&appliance, run_dir).await?;
        }
        Commands::Health { hostname, run_dir } => {
            let code = commands::health(&hostname, run_dir)?;
            drop(log_guard);
            std::process::exit(code);
        }
        Commands::Status { hostname, run_dir } => {
            commands::status(&hostname, run_dir)?;
        }
        Commands::ShowBootstrap { appliance } => {
            commands::show_bootstrap(&appliance)?;
        }
    }

    Ok(())
}

fn init_logging(trace: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let level = if trace {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
    {
        let log_path = log_dir.join("vjunos.log");
        if std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .is_ok()
        {
            let file_appender = rolling::never(log_dir, "vjunos.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();
            return Some(guard);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_flags() {
        let cli = Cli::try_parse_from([
            "vjunos",
            "--trace",
            "start",
            "--hostname",
            "sw1",
            "--connection-mode",
            "vrxcon",
            "--run-dir",
            "/run/sw1",
        ])
        .unwrap();

        assert!(cli.trace);
        match cli.command {
            Commands::Start { appliance, run_dir } => {
                assert_eq!(appliance.hostname.as_deref(), Some("sw1"));
                assert_eq!(appliance.connection_mode, Some(ConnectionMode::Vrxcon));
                assert_eq!(run_dir, Some(PathBuf::from("/run/sw1")));
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_unknown_connection_mode_rejected() {
        let result = Cli::try_parse_from(["vjunos", "start", "--connection-mode", "ovs"]);
        assert!(result.is_err());
    }
}
