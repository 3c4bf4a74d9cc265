//! Records the engine reads and writes through the [`JobStore`](crate::contract::JobStore).
//!
//! Projects link one Kibana instance to one Git repository. Environments
//! (test / production) override branch and space per project and keep their
//! own auto-sync cadence. A [`SyncJob`] is opened around every run and closed
//! exactly once.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::GitProviderKind;
use crate::reconcile::SyncSummary;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub elastic_instance_id: Option<String>,
    pub git_repository_id: Option<String>,
    pub auto_sync_enabled: bool,
    pub auto_sync_interval_minutes: i64,
    pub last_sync_test: Option<DateTime<Utc>>,
    pub last_sync_prod: Option<DateTime<Utc>>,
}

impl Project {
    pub fn last_sync(&self, environment: EnvironmentKind) -> Option<DateTime<Utc>> {
        match environment {
            EnvironmentKind::Test => self.last_sync_test,
            EnvironmentKind::Production => self.last_sync_prod,
        }
    }

    pub fn set_last_sync(&mut self, environment: EnvironmentKind, at: DateTime<Utc>) {
        match environment {
            EnvironmentKind::Test => self.last_sync_test = Some(at),
            EnvironmentKind::Production => self.last_sync_prod = Some(at),
        }
    }

    /// Whether the scheduler should look at this project at all.
    pub fn auto_sync_eligible(&self) -> bool {
        self.active && self.auto_sync_enabled && self.auto_sync_interval_minutes > 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Test,
    Production,
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentKind::Test => f.write_str("test"),
            EnvironmentKind::Production => f.write_str("production"),
        }
    }
}

impl FromStr for EnvironmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(EnvironmentKind::Test),
            "production" | "prod" => Ok(EnvironmentKind::Production),
            other => Err(format!("unknown environment '{other}' (expected test or production)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub project_id: String,
    pub kind: EnvironmentKind,
    /// Branch override; falls back to the repository's default branch.
    pub branch: Option<String>,
    /// Kibana space override; falls back to the instance's default space.
    pub space: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElasticInstance {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub default_space: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitRepository {
    pub id: String,
    pub name: String,
    pub url: String,
    pub provider: GitProviderKind,
    #[serde(skip_serializing, default)]
    pub access_token: String,
    pub default_branch: String,
    /// Directory inside the repository that holds one JSON file per rule.
    pub base_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Manual,
    Scheduled,
    Webhook,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ElasticToGit,
    GitToElastic,
    Bidirectional,
}

impl Direction {
    pub fn runs_export(self) -> bool {
        matches!(self, Direction::ElasticToGit | Direction::Bidirectional)
    }

    pub fn runs_import(self) -> bool {
        matches!(self, Direction::GitToElastic | Direction::Bidirectional)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ElasticToGit => f.write_str("elastic_to_git"),
            Direction::GitToElastic => f.write_str("git_to_elastic"),
            Direction::Bidirectional => f.write_str("bidirectional"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elastic_to_git" | "export" => Ok(Direction::ElasticToGit),
            "git_to_elastic" | "import" => Ok(Direction::GitToElastic),
            "bidirectional" | "both" => Ok(Direction::Bidirectional),
            other => Err(format!(
                "unknown direction '{other}' (expected elastic_to_git, git_to_elastic or bidirectional)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Kept for record compatibility. The reconciler is last-writer-wins and
    /// never produces it.
    Conflict,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Conflict)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncJob {
    pub id: Uuid,
    pub project_id: String,
    pub environment: Option<EnvironmentKind>,
    pub kind: JobKind,
    pub direction: Direction,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "changes_summary")]
    pub summary: Option<SyncSummary>,
    pub error_message: Option<String>,
}

/// Returned when a caller tries to move a job that already reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id} is already {status:?}")]
pub struct TerminalJob {
    pub job_id: Uuid,
    pub status: JobStatus,
}

impl SyncJob {
    /// Opens a job directly in `running`.
    pub fn start(
        project_id: &str,
        environment: Option<EnvironmentKind>,
        kind: JobKind,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> Self {
        SyncJob {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            environment,
            kind,
            direction,
            status: JobStatus::Running,
            started_at: now,
            completed_at: None,
            summary: None,
            error_message: None,
        }
    }

    pub fn complete(&mut self, summary: SyncSummary, now: DateTime<Utc>) -> Result<(), TerminalJob> {
        self.ensure_open()?;
        self.status = JobStatus::Completed;
        self.summary = Some(summary);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), TerminalJob> {
        self.ensure_open()?;
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TerminalJob> {
        if self.status.is_terminal() {
            return Err(TerminalJob {
                job_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }
}
