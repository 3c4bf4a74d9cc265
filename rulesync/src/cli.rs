//! # rulesync CLI Interface
//!
//! Command parsing and orchestration for the `rulesync` binary. All
//! reconciliation logic lives in [`rulesync_core`]; this module only loads
//! configuration, wires the engine together and reports results.
//!
//! ## Commands
//! - `sync`: run one manual sync for a project and exit
//! - `schedule`: run the auto-sync scheduler until Ctrl-C
//! - `due`: list the (project, environment) pairs the scheduler would run now
//!
//! For programmatic use and integration tests call [`run`] with a constructed [`Cli`].
use crate::load_config::{load_config, CliConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rulesync_core::job::{HttpConnectorFactory, SyncController, SyncError, SyncRequest};
use rulesync_core::model::{Direction, EnvironmentKind};
use rulesync_core::scheduler::{Scheduler, SystemClock};
use rulesync_core::store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;

/// CLI for rulesync: keep Kibana detection rules and a Git repository in sync.
#[derive(Parser)]
#[clap(
    name = "rulesync",
    version,
    about = "Synchronise Kibana detection rules with a GitLab or GitHub repository"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sync for a project and print its summary
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Project id from the config file
        #[clap(long)]
        project: String,
        /// elastic_to_git (export), git_to_elastic (import) or bidirectional (both)
        #[clap(long, default_value = "elastic_to_git")]
        direction: Direction,
        /// Use this environment's branch and space (test or production)
        #[clap(long)]
        environment: Option<EnvironmentKind>,
        /// Override the Git branch
        #[clap(long)]
        branch: Option<String>,
        /// Override the Kibana space
        #[clap(long)]
        space: Option<String>,
    },
    /// Run the auto-sync scheduler until interrupted
    Schedule {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// List project environments that are due for an auto-sync
    Due {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

struct Engine {
    controller: Arc<SyncController>,
    tick: std::time::Duration,
}

async fn build_engine(config: CliConfig) -> Result<Engine> {
    let mut store = MemoryStore::new(config.records);
    if let Some(path) = config.state_file {
        store = store.with_state_file(path);
    }
    store.restore().await.context("Failed to restore state file")?;

    let controller = SyncController::new(
        Arc::new(store),
        Arc::new(HttpConnectorFactory::new(config.settings.request_timeout)),
        Arc::new(SystemClock),
        config.settings,
    );
    Ok(Engine {
        controller: Arc::new(controller),
        tick: config.tick,
    })
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync {
            config,
            project,
            direction,
            environment,
            branch,
            space,
        } => {
            let engine = build_engine(load_config(config)?).await?;
            let mut request = SyncRequest::manual(&project, direction);
            request.environment = environment;
            request.branch = branch;
            request.space = space;
            tracing::info!(command = "sync", project = %project, %direction, "Starting synchronisation");

            match engine.controller.trigger_sync(request).await {
                Ok(outcome) => {
                    let s = &outcome.summary;
                    tracing::info!(command = "sync", job_id = %outcome.job_id, "Synchronisation complete");
                    println!(
                        "job {} {:?}: exported {}, imported {}, created {}, updated {}, unchanged {}, deleted {}, errors {}",
                        outcome.job_id,
                        outcome.status,
                        s.exported(),
                        s.imported(),
                        s.created(),
                        s.updated(),
                        s.unchanged(),
                        s.deleted(),
                        s.error_count()
                    );
                    for leg in s.export.iter().chain(s.import.iter()) {
                        if let Some(reason) = &leg.aborted {
                            println!("  {:?} leg aborted: {}", leg.leg, reason);
                        }
                        for e in &leg.errors {
                            println!(
                                "  {:?} {:?} {}: {}",
                                leg.leg,
                                e.action,
                                e.stable_id.as_deref().unwrap_or("-"),
                                e.message
                            );
                        }
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "sync", error = %e, "Synchronisation failed");
                    if let SyncError::Setup { job_id, .. } = &e {
                        println!("job {job_id} Failed");
                    }
                    Err(anyhow::Error::new(e).context(format!("Sync of project '{project}' failed")))
                }
            }
        }
        Commands::Schedule { config } => {
            let engine = build_engine(load_config(config)?).await?;
            let scheduler = Arc::new(Scheduler::new(engine.controller, Arc::new(SystemClock)).with_tick(engine.tick));
            tracing::info!(command = "schedule", tick_secs = engine.tick.as_secs(), "Starting scheduler");
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    }
                })
                .await;
            Ok(())
        }
        Commands::Due { config } => {
            let engine = build_engine(load_config(config)?).await?;
            let scheduler = Scheduler::new(engine.controller, Arc::new(SystemClock));
            let due = scheduler.due_pairs().await.context("Failed to read projects")?;
            tracing::info!(command = "due", due = due.len(), "Computed due pairs");
            if due.is_empty() {
                println!("nothing due");
            }
            for pair in due {
                let last = pair
                    .last_sync
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\t{}\tinterval {}m\tlast sync {}",
                    pair.project_id, pair.environment, pair.interval_minutes, last
                );
            }
            Ok(())
        }
    }
}
