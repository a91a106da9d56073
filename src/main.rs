use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use printhub_ops::application::*;
use printhub_ops::backup::DatastoreKind;
use printhub_ops::config::{Config, ConfigError};
use printhub_ops::error::classify;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "printhub-ops")]
#[command(about = "Backup, restore, health checks and deploy-with-rollback for PrintHub")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a verified snapshot of the datastore and uploaded files
    Backup {
        /// Datastore kind: relational (postgres) or embedded (sqlite)
        #[arg(long = "type")]
        kind: Option<DatastoreKind>,
        /// Override RETENTION_DAYS for this run
        #[arg(long)]
        retention_days: Option<u32>,
        /// Mirror the snapshot to the remote archive
        #[arg(long)]
        remote: bool,
    },
    /// Restore a snapshot by identifier, file path or remote key
    Restore {
        reference: String,
        /// Validate only; nothing is changed
        #[arg(long, conflicts_with = "force")]
        dry_run: bool,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
        /// Fetch the snapshot from the remote archive first
        #[arg(long)]
        from_remote: bool,
        /// Replay the plain SQL dump instead of the native one
        #[arg(long)]
        portable: bool,
    },
    /// Manage the recurring backup in the crontab
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Deploy with automatic rollback, or run an operator action
    #[command(group(
        ArgGroup::new("action")
            .args(["quick", "rollback", "status", "stop", "restart", "logs"])
    ))]
    Deploy {
        /// Skip the pre-deployment backup (no rollback possible)
        #[arg(long)]
        quick: bool,
        /// Restore the newest snapshot and restart services
        #[arg(long)]
        rollback: bool,
        #[arg(long)]
        status: bool,
        #[arg(long)]
        stop: bool,
        #[arg(long)]
        restart: bool,
        #[arg(long)]
        logs: bool,
        /// Log lines to show with --logs
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
    /// Probe the configured health targets
    Health {
        /// Only probe the target with this name (containers also answer to their service name)
        target: Option<String>,
    },
    /// List local snapshots
    Snapshots,
}

#[derive(Subcommand)]
enum ScheduleCommands {
    Install {
        /// hourly, daily or weekly
        #[arg(long, default_value = "daily")]
        frequency: String,
        /// HH:MM, defaults to 02:00
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    Remove {
        #[arg(long)]
        user: Option<String>,
    },
    List {
        #[arg(long)]
        user: Option<String>,
    },
}

fn init_tracing(config: Option<&Config>) {
    let (level, json) = match config {
        Some(config) => (
            config.operational.log_level.clone(),
            config.operational.log_format == "json",
        ),
        None => ("info".to_string(), false),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_tracing(config.as_ref().ok());

    match run(cli, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let class = classify(&e);
            error!("{:#}", e);
            eprintln!("{class} error: {e:#}");
            ExitCode::from(class.exit_code())
        }
    }
}

async fn run(cli: Cli, config: Result<Config, ConfigError>) -> Result<u8> {
    let mut config = config?;

    if let Commands::Backup {
        kind,
        retention_days,
        remote,
    } = &cli.command
    {
        if let Some(kind) = kind {
            config.datastore.kind = *kind;
        }
        if let Some(days) = retention_days {
            config.backup.retention_days = *days;
        }
        if *remote {
            config.backup.remote_enabled = true;
        }
    }
    config.validate()?;

    let container = Arc::new(DependencyContainer::new(config));

    match cli.command {
        Commands::Backup { .. } => {
            BackupCommandHandler::new(container).run_backup().await?;
            Ok(0)
        }
        Commands::Snapshots => {
            BackupCommandHandler::new(container).list_snapshots().await?;
            Ok(0)
        }
        Commands::Restore {
            reference,
            dry_run,
            force,
            from_remote,
            portable,
        } => {
            RestoreCommandHandler::new(container)
                .run_restore(&reference, dry_run, force, from_remote, portable)
                .await?;
            Ok(0)
        }
        Commands::Schedule { command } => {
            let handler = ScheduleCommandHandler::new(container)?;
            match command {
                ScheduleCommands::Install {
                    frequency,
                    time,
                    user,
                } => {
                    handler
                        .install(&frequency, time.as_deref(), user.as_deref())
                        .await?;
                }
                ScheduleCommands::Remove { user } => {
                    handler.remove(user.as_deref()).await?;
                }
                ScheduleCommands::List { user } => {
                    handler.list(user.as_deref()).await?;
                }
            }
            Ok(0)
        }
        Commands::Deploy {
            quick,
            rollback,
            status,
            stop,
            restart,
            logs,
            lines,
        } => {
            let handler = DeployCommandHandler::new(container);
            if rollback {
                handler.rollback().await?;
            } else if status {
                handler.status().await?;
            } else if stop {
                handler.stop().await?;
            } else if restart {
                handler.restart().await?;
            } else if logs {
                handler.logs(lines).await?;
            } else {
                handler.deploy(quick).await?;
            }
            Ok(0)
        }
        Commands::Health { target } => {
            let report = HealthCommandHandler::new(container)
                .run_health_check(target.as_deref())
                .await?;
            Ok(report.exit_code())
        }
    }
}
