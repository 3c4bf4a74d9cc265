//! Auto-sync scheduler.
//!
//! On every tick it walks the active, auto-sync-enabled projects and their
//! environments, and runs a scheduled Elastic → Git sync for each pair whose
//! last sync is older than the project's interval. The pair's timestamp is
//! reset after the run whether it succeeded or not, so a persistently failing
//! pair is retried once per interval rather than on every tick.
//!
//! Ticks may overlap when a run is slow, so each pair is re-checked against
//! the store right before it runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::contract::{JobStore, StoreError};
use crate::job::{SyncController, SyncError, SyncRequest};
use crate::model::{EnvironmentKind, JobStatus};

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whether a pair last synced at `last` is due at `now`. An interval too
/// large to represent is never due again after the first sync.
pub fn needs_sync(now: DateTime<Utc>, last: Option<DateTime<Utc>>, interval_minutes: i64) -> bool {
    match (last, chrono::TimeDelta::try_minutes(interval_minutes)) {
        (None, _) => true,
        (Some(last), Some(interval)) => now - last >= interval,
        (Some(_), None) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuePair {
    pub project_id: String,
    pub project_name: String,
    pub environment: EnvironmentKind,
    pub last_sync: Option<DateTime<Utc>>,
    pub interval_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledOutcome {
    Completed { job_id: Uuid },
    /// The run started but could not be set up; `job_id` is `None` when the
    /// failure happened before a job was recorded.
    Failed { job_id: Option<Uuid>, message: String },
    /// Another run holds the lease; the timestamp was left alone.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRun {
    pub project_id: String,
    pub environment: EnvironmentKind,
    pub outcome: ScheduledOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub runs: Vec<ScheduledRun>,
}

impl TickReport {
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, ScheduledOutcome::Completed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ScheduledOutcome::Failed { .. }))
    }

    pub fn busy(&self) -> usize {
        self.count(|o| matches!(o, ScheduledOutcome::Busy))
    }

    fn count(&self, pred: impl Fn(&ScheduledOutcome) -> bool) -> usize {
        self.runs.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct Scheduler {
    controller: Arc<SyncController>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(controller: Arc<SyncController>, clock: Arc<dyn Clock>) -> Self {
        Scheduler {
            controller,
            clock,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        self.controller.store()
    }

    /// Pairs that would run if a tick happened now. Runs nothing.
    pub async fn due_pairs(&self) -> Result<Vec<DuePair>, StoreError> {
        let now = self.clock.now();
        let mut due = Vec::new();
        for project in self.store().list_projects().await? {
            if !project.auto_sync_eligible() {
                continue;
            }
            let environments = self.store().list_environments(&project.id).await?;
            if environments.is_empty() {
                debug!(project_id = %project.id, "[SCHED] Project has no environments; skipping");
                continue;
            }
            for env in environments {
                let last = project.last_sync(env.kind);
                if needs_sync(now, last, project.auto_sync_interval_minutes) {
                    due.push(DuePair {
                        project_id: project.id.clone(),
                        project_name: project.name.clone(),
                        environment: env.kind,
                        last_sync: last,
                        interval_minutes: project.auto_sync_interval_minutes,
                    });
                }
            }
        }
        Ok(due)
    }

    /// Re-reads the pair's project so a run finished by an overlapping tick is seen.
    async fn still_due(&self, pair: &DuePair) -> Result<bool, StoreError> {
        let Some(project) = self.store().get_project(&pair.project_id).await? else {
            return Ok(false);
        };
        Ok(project.auto_sync_eligible()
            && needs_sync(
                self.clock.now(),
                project.last_sync(pair.environment),
                project.auto_sync_interval_minutes,
            ))
    }

    /// One scheduling pass. Due pairs run sequentially.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let due = self.due_pairs().await?;
        info!(due = due.len(), "[SCHED] Tick");
        let mut report = TickReport::default();

        for pair in due {
            if !self.still_due(&pair).await? {
                debug!(project_id = %pair.project_id, environment = %pair.environment, "[SCHED] Synced since the tick started; skipping");
                continue;
            }
            let request = SyncRequest::scheduled(&pair.project_id, pair.environment);
            let outcome = match self.controller.trigger_sync(request).await {
                Ok(outcome) if outcome.status == JobStatus::Completed => ScheduledOutcome::Completed {
                    job_id: outcome.job_id,
                },
                Ok(outcome) => ScheduledOutcome::Failed {
                    job_id: Some(outcome.job_id),
                    message: format!("job ended {:?}", outcome.status),
                },
                Err(SyncError::AlreadyRunning(key)) => {
                    info!(lease = %key, "[SCHED] Pair busy; leaving timestamp untouched");
                    report.runs.push(ScheduledRun {
                        project_id: pair.project_id,
                        environment: pair.environment,
                        outcome: ScheduledOutcome::Busy,
                    });
                    continue;
                }
                Err(SyncError::Setup { job_id, source }) => ScheduledOutcome::Failed {
                    job_id: Some(job_id),
                    message: source.to_string(),
                },
                Err(e) => ScheduledOutcome::Failed {
                    job_id: None,
                    message: e.to_string(),
                },
            };
            if let ScheduledOutcome::Failed { message, .. } = &outcome {
                warn!(project_id = %pair.project_id, environment = %pair.environment, %message, "[SCHED] Scheduled sync failed");
            }

            if let Err(e) = self
                .store()
                .record_last_sync(&pair.project_id, pair.environment, self.clock.now())
                .await
            {
                error!(project_id = %pair.project_id, environment = %pair.environment, error = %e, "[SCHED] Could not record last sync");
            }
            report.runs.push(ScheduledRun {
                project_id: pair.project_id,
                environment: pair.environment,
                outcome,
            });
        }

        info!(
            completed = report.completed(),
            failed = report.failed(),
            busy = report.busy(),
            "[SCHED] Tick finished"
        );
        Ok(report)
    }

    /// Ticks on a fixed interval until `shutdown` resolves. Each tick runs on
    /// its own task; overlapping ticks are kept apart by the run leases.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut interval = tokio::time::interval(self.tick);
        tokio::pin!(shutdown);
        info!(tick_secs = self.tick.as_secs(), "[SCHED] Scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[SCHED] Shutdown requested; scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.tick().await {
                            error!(error = %e, "[SCHED][ERROR] Tick failed");
                        }
                    });
                }
            }
        }
    }
}
