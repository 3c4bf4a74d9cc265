//! # contract: the seams between the reconciler and the outside world
//!
//! Three traits cover everything the engine touches:
//! - [`RuleSource`]: the Kibana detection-engine rules API for one space.
//! - [`GitStore`]: one branch-aware Git provider repository (GitLab or GitHub).
//! - [`JobStore`]: get/put access to projects, environments, linked instances
//!   and sync jobs.
//!
//! [`ConnectorFactory`] builds the first two from a resolved endpoint, so a
//! run never constructs HTTP clients itself.
//!
//! Adapters never panic or abort a run on an HTTP failure; they return an
//! [`AdapterError`] that the reconciler folds into the run summary.
//!
//! ## Mocking & Testing
//! The traits are annotated for `mockall` (behind `test-export-mocks`) so
//! integration tests in this crate and downstream crates can script exact
//! call sequences.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::config::{ElasticEndpoint, GitEndpoint, GitProviderKind};
use crate::model::{ElasticInstance, Environment, EnvironmentKind, GitRepository, Project, SyncJob};

/// Failure of a single adapter call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("not found")]
    NotFound,
    /// The target already holds an entry with this stable id.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    /// The provider answered with only part of a listing.
    #[error("incomplete listing: {0}")]
    Incomplete(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AdapterError::Decode(e.to_string())
        } else {
            AdapterError::Transport(e.to_string())
        }
    }
}

/// Failure of the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// A rule file as listed in the repository. Content is read on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitFile {
    /// Path relative to the repository root.
    pub path: String,
    /// Decoded from the filename; see [`crate::rule::stable_id_from_path`].
    pub stable_id: String,
    /// Provider blob SHA. GitHub requires it to update or delete the file.
    pub version: Option<String>,
}

/// One single-file commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub branch: String,
    pub path: String,
    pub content: Vec<u8>,
    pub message: String,
    /// Version of the file currently on the branch, `None` when creating.
    pub existing_version: Option<String>,
    /// Whether the file is already on the branch.
    pub exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
}

/// Kibana detection-engine rules for one space.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// One-page snapshot of every rule in the space.
    ///
    /// A non-2xx answer is an empty list; only transport-level failures are errors.
    async fn list_rules(&self, page_size: usize) -> Result<Vec<Value>, AdapterError>;

    /// Create a rule. [`AdapterError::Conflict`] when the `rule_id` already exists.
    async fn create_rule(&self, payload: &Value) -> Result<(), AdapterError>;

    /// Replace the rule identified by the payload's `rule_id`.
    async fn update_rule(&self, payload: &Value) -> Result<(), AdapterError>;

    /// Delete by `rule_id`.
    async fn delete_rule(&self, stable_id: &str) -> Result<(), AdapterError>;

    /// Delete by Kibana's own `id`, for rules that carry no `rule_id`.
    async fn delete_rule_by_id(&self, id: &str) -> Result<(), AdapterError>;
}

/// File and branch operations on one Git provider repository.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait GitStore: Send + Sync {
    fn provider(&self) -> GitProviderKind;

    /// `.json` files directly under `path`. A missing directory is an empty list.
    async fn list_directory(&self, branch: &str, path: &str) -> Result<Vec<GitFile>, AdapterError>;

    async fn read_file(&self, branch: &str, path: &str) -> Result<Vec<u8>, AdapterError>;

    async fn write_file(&self, write: FileWrite) -> Result<WriteOutcome, AdapterError>;

    async fn delete_file(&self, branch: &str, file: &GitFile, message: &str) -> Result<(), AdapterError>;

    async fn branch_exists(&self, branch: &str) -> Result<bool, AdapterError>;

    async fn create_branch(&self, branch: &str, from: &str) -> Result<(), AdapterError>;
}

/// Get/put access to the records a run needs.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError>;

    async fn list_environments(&self, project_id: &str) -> Result<Vec<Environment>, StoreError>;

    async fn get_elastic_instance(&self, id: &str) -> Result<Option<ElasticInstance>, StoreError>;

    async fn get_git_repository(&self, id: &str) -> Result<Option<GitRepository>, StoreError>;

    /// Insert or overwrite a job record. Last write wins.
    async fn save_job(&self, job: &SyncJob) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>, StoreError>;

    async fn record_last_sync(
        &self,
        project_id: &str,
        environment: EnvironmentKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Builds adapters for one run.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait ConnectorFactory: Send + Sync {
    fn rule_source(&self, endpoint: &ElasticEndpoint) -> Result<Box<dyn RuleSource>, AdapterError>;

    fn git_store(&self, endpoint: &GitEndpoint) -> Result<Box<dyn GitStore>, AdapterError>;
}
