//! Command line front end: run a worker or inspect a queue.
//!
//! Jobs are application code, so the binary shipped with this crate starts
//! with an empty [`JobRegistry`]; applications embed [`run`] in their own
//! `main` with their registry filled in.

use crate::config::{CourierConfig, WorkerConfig};
use crate::core::{Connection, JobRegistry, Worker};
use crate::error::{CourierError, CourierResult};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "courierq")]
#[command(about = "Run queue workers and inspect queues", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML); `COURIERQ_*` environment variables override it
    #[arg(long, global = true, default_value = "courierq.toml")]
    pub config: PathBuf,

    /// Connection to use instead of `queue.default`
    #[arg(long, global = true)]
    pub connection: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Queue inspection and setup
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Poll a queue until interrupted
    Run {
        /// Queue to watch
        queue: String,

        /// Maximum number of attempts left for any job
        #[arg(long)]
        retry: Option<u32>,

        /// Handle at most one job, then exit
        #[arg(long)]
        once: bool,

        /// Exit after handling this many jobs
        #[arg(long)]
        max_jobs: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Print the number of outstanding jobs
    Size {
        queue: String,
    },

    /// Create the jobs table of a database connection
    Install,

    /// Check that every configured connection is reachable
    Health,
}

/// Process exit code for a command result.
///
/// 0 on success, 2 for configuration errors, 1 for anything else.
pub fn exit_code(result: &CourierResult<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) if e.is_configuration() => 2,
        Err(_) => 1,
    }
}

/// Execute `cli` with the given job registry and map the result to an exit code.
pub async fn run(cli: Cli, registry: JobRegistry) -> ExitCode {
    let result = execute(cli, registry).await;
    if let Err(e) = &result {
        eprintln!("courierq: {e}");
    }
    ExitCode::from(exit_code(&result))
}

/// Execute `cli` with the given job registry.
pub async fn execute(cli: Cli, registry: JobRegistry) -> CourierResult<()> {
    let config = CourierConfig::load(&cli.config)?;
    if let Err(e) = crate::logging::init_tracing(&config.logging) {
        eprintln!("courierq: {e}");
    }

    let mut connection = Connection::from_config(&config, Arc::new(registry)).await?;
    if let Some(name) = &cli.connection {
        connection.set_connection(name.clone());
    }

    match cli.command {
        Commands::Worker {
            command:
                WorkerCommand::Run {
                    queue,
                    retry,
                    once,
                    max_jobs,
                },
        } => {
            let mut worker_config = WorkerConfig {
                queue: queue.clone(),
                ..config.worker.clone()
            };
            if let Some(max_jobs) = max_jobs {
                worker_config = worker_config.with_max_jobs(max_jobs);
            }
            if once {
                worker_config = worker_config.with_max_jobs(1).stop_when_empty();
            }
            let retry = retry.or(worker_config.retry);

            let shutdown = CancellationToken::new();
            let worker = Worker::new(connection.adapter().await?)
                .with_config(worker_config)
                .with_shutdown(shutdown.clone());
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.cancel();
            });

            let stats = worker.run(&queue, retry).await;
            tracing::info!(
                "Handled {} jobs on '{}' ({} backend errors)",
                stats.jobs_handled(),
                queue,
                stats.backend_errors
            );
        }
        Commands::Queue {
            command: QueueCommand::Size { queue },
        } => {
            println!("{}", connection.size(&queue).await?);
        }
        Commands::Queue {
            command: QueueCommand::Health,
        } => {
            let mut unhealthy = 0;
            for (name, result) in connection.health_check_all().await {
                match result {
                    Ok(()) => println!("{name}: ok"),
                    Err(e) => {
                        unhealthy += 1;
                        println!("{name}: {e}");
                    }
                }
            }
            if unhealthy > 0 {
                return Err(CourierError::queue_msg(format!(
                    "{unhealthy} connection(s) unhealthy"
                )));
            }
        }
        Commands::Queue {
            command: QueueCommand::Install,
        } => {
            install(&config, &connection).await?;
            println!("Installed jobs table for '{}'", connection.connection_name());
        }
    }

    Ok(())
}

#[cfg(feature = "database-queue")]
async fn install(config: &CourierConfig, connection: &Connection) -> CourierResult<()> {
    use crate::config::{DatabaseConfig, parse_backend_config};
    use crate::queue::DatabaseQueue;

    let name = connection.connection_name();
    let driver = config.queue.driver_of(name)?;
    if driver != "database" {
        return Err(CourierError::config(format!(
            "`queue install` needs a database connection, '{name}' uses '{driver}'"
        )));
    }

    let db: DatabaseConfig = parse_backend_config(name, config.queue.connection(name)?)?;
    let queue = DatabaseQueue::connect_lazy(db, connection.context().clone())?;
    queue.install().await
}

#[cfg(not(feature = "database-queue"))]
async fn install(_config: &CourierConfig, _connection: &Connection) -> CourierResult<()> {
    Err(CourierError::config(
        "`queue install` needs the `database-queue` feature",
    ))
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut terminate), Ok(mut interrupt), Ok(mut hangup)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) else {
        tracing::warn!("Could not install unix signal handlers, falling back to Ctrl-C");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = terminate.recv() => (),
        _ = interrupt.recv() => (),
        _ = hangup.recv() => (),
    }
    tracing::info!("Shutdown signal detected, finishing the current job");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown signal detected, finishing the current job");
    }
}
