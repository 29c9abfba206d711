/// # ooc-router CLI
///
/// Command parsing and orchestration for the `ooc-router` binary. All routing,
/// ledger and revert logic lives in `ooc-router-core`; this module loads the
/// config, builds a [`ServiceSupervisor`] and prints results.
///
/// For programmatic and integration-test use, call [`run`] with a constructed [`Cli`].
use crate::load_config::load_config;
use crate::output;
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use ooc_router_core::activity::{ActivityLog, ActivityQuery};
use ooc_router_core::config::RouterConfig;
use ooc_router_core::contract::{MoveId, PipelineKind};
use ooc_router_core::events::PipelineEvent;
use ooc_router_core::supervisor::ServiceSupervisor;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::error::RecvError;

/// How often `run` checks the config file for rule changes.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// CLI for ooc-router: route OOC uploads, job folders and loose billing files.
#[derive(Parser)]
#[clap(
    name = "ooc-router",
    version,
    about = "Route OOC uploads into job folders, out-of-charge jobs into billing, and keep a revertible move history"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the selected pipelines (default: all) until Ctrl-C
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Pipeline to run; repeat to select several
        #[clap(long = "pipeline")]
        pipelines: Vec<PipelineKind>,
    },
    /// Run exactly one cycle of a pipeline and print its report
    Scan {
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        pipeline: PipelineKind,
        #[clap(long)]
        json: bool,
    },
    /// List revertible moves, most recent first
    History {
        #[clap(long)]
        config: PathBuf,
        /// Only moves of this job
        #[clap(long)]
        job: Option<String>,
        #[clap(long)]
        json: bool,
    },
    /// Revert one move, or the latest move of a job
    Revert {
        #[clap(long)]
        config: PathBuf,
        #[clap(long, conflicts_with = "job", required_unless_present = "job")]
        move_id: Option<MoveId>,
        #[clap(long)]
        job: Option<String>,
    },
    /// Print activity log entries
    Log {
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        pipeline: Option<PipelineKind>,
        #[clap(long)]
        job: Option<String>,
        #[clap(long)]
        json: bool,
    },
    /// Print totals, skip reasons and errors from the activity log
    Report {
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        json: bool,
    },
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Run { config, pipelines } => run_service(&config, pipelines).await,
        Commands::Scan {
            config,
            pipeline,
            json,
        } => {
            let supervisor = supervisor(&load_config(&config)?).await?;
            tracing::info!(command = "scan", %pipeline, "Running one cycle");
            let report = supervisor.run_once(pipeline).await?;
            if json {
                println!("{}", output::json(&report)?);
            } else {
                print!("{}", output::cycle_report(&report));
            }
            Ok(())
        }
        Commands::History { config, job, json } => {
            let supervisor = supervisor(&load_config(&config)?).await?;
            let records = supervisor.list_revertible(job.as_deref()).await?;
            if json {
                println!("{}", output::json(&records)?);
            } else {
                print!("{}", output::records(&records));
            }
            Ok(())
        }
        Commands::Revert {
            config,
            move_id,
            job,
        } => {
            let supervisor = supervisor(&load_config(&config)?).await?;
            let result = match (move_id, job) {
                (Some(move_id), _) => supervisor.revert(move_id).await,
                (None, Some(job)) => supervisor.revert_latest(&job).await,
                (None, None) => return Err(anyhow!("either --move-id or --job is required")),
            };
            match result {
                Ok(record) => {
                    tracing::info!(command = "revert", move_id = %record.move_id, "Revert complete");
                    print!("{}", output::reverted(&record));
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "revert", code = e.code(), error = %e, "Revert failed");
                    Err(anyhow::Error::new(e))
                }
            }
        }
        Commands::Log {
            config,
            pipeline,
            job,
            json,
        } => {
            let config = load_config(&config)?;
            let entries = ActivityLog::open(&config.log_dir)?.query(&ActivityQuery {
                pipeline,
                job_id: job,
                action: None,
            })?;
            if json {
                println!("{}", output::json(&entries)?);
            } else {
                print!("{}", output::entries(&entries));
            }
            Ok(())
        }
        Commands::Report { config, json } => {
            let config = load_config(&config)?;
            let summary = ActivityLog::open(&config.log_dir)?.summary()?;
            if json {
                println!("{}", output::json(&summary)?);
            } else {
                print!("{}", output::summary(&summary));
            }
            Ok(())
        }
    }
}

async fn supervisor(config: &RouterConfig) -> Result<ServiceSupervisor> {
    ServiceSupervisor::from_config(config)
        .await
        .map_err(|e| anyhow!("Failed to initialise router: {e}"))
}

async fn run_service(config_path: &Path, pipelines: Vec<PipelineKind>) -> Result<()> {
    let config = load_config(config_path)?;
    let supervisor = supervisor(&config).await?;
    let selected = if pipelines.is_empty() {
        PipelineKind::ALL.to_vec()
    } else {
        pipelines
    };

    let mut events = supervisor.subscribe();
    for kind in &selected {
        supervisor.start(*kind)?;
    }
    tracing::info!(command = "run", pipelines = ?selected, "Router running; press Ctrl-C to stop");

    let mut last_modified = modified_at(config_path);
    let mut poll = tokio::time::interval(CONFIG_POLL_INTERVAL);
    poll.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C; shutting down");
                }
                break;
            }
            _ = poll.tick() => {
                let modified = modified_at(config_path);
                if modified != last_modified {
                    last_modified = modified;
                    reload_rules(&supervisor, config_path, &selected);
                }
            }
            event = events.recv() => match event {
                Ok(PipelineEvent::IntegrityAlert(alert)) => {
                    tracing::error!(
                        source = %alert.source.display(),
                        destination = %alert.destination.display(),
                        code = %alert.code,
                        message = %alert.message,
                        "INTEGRITY ALERT: operator attention required"
                    );
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    tracing::info!(command = "run", "Stopping pipelines after their current cycle");
    supervisor.shutdown().await;
    print!("{}", output::statuses(&supervisor.statuses()));
    Ok(())
}

fn reload_rules(supervisor: &ServiceSupervisor, config_path: &Path, selected: &[PipelineKind]) {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Config changed but could not be loaded; keeping current rules");
            return;
        }
    };
    for kind in selected {
        if let Err(e) = supervisor.reload_rules(*kind, config.rules(*kind)) {
            tracing::error!(pipeline = %kind, error = %e, "Failed to reload rules");
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
