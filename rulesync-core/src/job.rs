//! Sync job controller: the single entry point for running a sync.
//!
//! A run is: resolve the endpoint, lease its branch and space, open a
//! `running` job, build adapters, reconcile, close the job. Setup failures
//! close the job as `failed`; per-rule and per-leg failures end up in the
//! summary of a `completed` job. Nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{
    is_valid_branch_name, normalize_base_path, ElasticEndpoint, GitEndpoint, SyncEndpoint, SyncSettings,
};
use crate::contract::{AdapterError, ConnectorFactory, GitStore, JobStore, RuleSource, StoreError};
use crate::elastic::ElasticClient;
use crate::git::build_git_store;
use crate::lease::{LeaseKey, LeaseTable};
use crate::model::{Direction, Environment, EnvironmentKind, JobKind, JobStatus, SyncJob, TerminalJob};
use crate::reconcile::{reconcile, ReconcileOptions, SyncSummary};
use crate::scheduler::Clock;

const DEFAULT_SPACE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub project_id: String,
    pub direction: Direction,
    pub kind: JobKind,
    pub environment: Option<EnvironmentKind>,
    /// Overrides the environment's (or repository's default) branch.
    pub branch: Option<String>,
    /// Overrides the environment's (or instance's default) Kibana space.
    pub space: Option<String>,
}

impl SyncRequest {
    pub fn manual(project_id: impl Into<String>, direction: Direction) -> Self {
        SyncRequest {
            project_id: project_id.into(),
            direction,
            kind: JobKind::Manual,
            environment: None,
            branch: None,
            space: None,
        }
    }

    /// What the scheduler runs for a due (project, environment) pair.
    pub fn scheduled(project_id: impl Into<String>, environment: EnvironmentKind) -> Self {
        SyncRequest {
            kind: JobKind::Scheduled,
            environment: Some(environment),
            ..SyncRequest::manual(project_id, Direction::ElasticToGit)
        }
    }

    pub fn with_environment(mut self, environment: EnvironmentKind) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub summary: SyncSummary,
}

/// Reasons a run could not start reconciling.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),
    #[error("project '{0}' is inactive")]
    ProjectInactive(String),
    #[error("project '{0}' has no linked Elastic instance")]
    NoElasticInstance(String),
    #[error("Elastic instance '{0}' not found")]
    ElasticInstanceNotFound(String),
    #[error("project '{0}' has no linked Git repository")]
    NoGitRepository(String),
    #[error("Git repository '{0}' not found")]
    GitRepositoryNotFound(String),
    #[error("missing credential: {0}")]
    MissingCredential(String),
    #[error("invalid {what} URL '{url}': {reason}")]
    InvalidUrl {
        what: &'static str,
        url: String,
        reason: String,
    },
    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),
    #[error("could not build adapter: {0}")]
    Connector(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The only error that crosses the run boundary.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync job {job_id} failed during setup: {source}")]
    Setup {
        job_id: Uuid,
        #[source]
        source: SetupError,
    },
    #[error("{0} is already being synced")]
    AlreadyRunning(LeaseKey),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] TerminalJob),
}

/// Builds real HTTP adapters.
#[derive(Debug, Clone)]
pub struct HttpConnectorFactory {
    timeout: Duration,
}

impl HttpConnectorFactory {
    pub fn new(timeout: Duration) -> Self {
        HttpConnectorFactory { timeout }
    }
}

impl ConnectorFactory for HttpConnectorFactory {
    fn rule_source(&self, endpoint: &ElasticEndpoint) -> Result<Box<dyn RuleSource>, AdapterError> {
        Ok(Box::new(ElasticClient::new(endpoint, self.timeout)?))
    }

    fn git_store(&self, endpoint: &GitEndpoint) -> Result<Box<dyn GitStore>, AdapterError> {
        build_git_store(endpoint, self.timeout)
    }
}

struct Connectors {
    endpoint: SyncEndpoint,
    rules: Box<dyn RuleSource>,
    git: Box<dyn GitStore>,
}

pub struct SyncController {
    store: Arc<dyn JobStore>,
    connectors: Arc<dyn ConnectorFactory>,
    clock: Arc<dyn Clock>,
    leases: LeaseTable,
    settings: SyncSettings,
}

impl SyncController {
    pub fn new(
        store: Arc<dyn JobStore>,
        connectors: Arc<dyn ConnectorFactory>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        SyncController {
            store,
            connectors,
            clock,
            leases: LeaseTable::new(),
            settings,
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Runs one sync to completion and returns its closed job.
    ///
    /// The endpoint is resolved first so the run can lease the branch and
    /// space it will write to. A resolution failure is still recorded as a
    /// failed job; a busy target is rejected without one.
    pub async fn trigger_sync(&self, request: SyncRequest) -> Result<SyncOutcome, SyncError> {
        let endpoint = match self.resolve(&request).await {
            Ok(endpoint) => endpoint,
            Err(source) => {
                let job = self.open_job(&request).await?;
                return Err(self.fail_setup(job, source).await);
            }
        };

        let _leases = self
            .leases
            .try_acquire_all(LeaseKey::for_endpoint(&endpoint))
            .map_err(|key| {
                warn!(lease = %key, project_id = %request.project_id, "[SYNC] Target already being synced; rejecting trigger");
                SyncError::AlreadyRunning(key)
            })?;

        let job = self.open_job(&request).await?;
        let connectors = match self.connect(endpoint) {
            Ok(connectors) => connectors,
            Err(source) => return Err(self.fail_setup(job, source).await),
        };
        self.run_job(job, &request, connectors).await
    }

    async fn open_job(&self, request: &SyncRequest) -> Result<SyncJob, SyncError> {
        let job = SyncJob::start(
            &request.project_id,
            request.environment,
            request.kind,
            request.direction,
            self.clock.now(),
        );
        self.store.save_job(&job).await?;
        info!(
            job_id = %job.id,
            project_id = %request.project_id,
            environment = ?request.environment,
            direction = %request.direction,
            kind = ?request.kind,
            "[SYNC] Job started"
        );
        Ok(job)
    }

    async fn fail_setup(&self, mut job: SyncJob, source: SetupError) -> SyncError {
        error!(job_id = %job.id, error = %source, "[SYNC][ERROR] Setup failed");
        if let Err(e) = job.fail(source.to_string(), self.clock.now()) {
            return e.into();
        }
        if let Err(e) = self.store.save_job(&job).await {
            return e.into();
        }
        SyncError::Setup { job_id: job.id, source }
    }

    async fn run_job(
        &self,
        mut job: SyncJob,
        request: &SyncRequest,
        connectors: Connectors,
    ) -> Result<SyncOutcome, SyncError> {
        connectors.endpoint.trace_loaded();

        let options = ReconcileOptions {
            page_size: self.settings.page_size,
            skip_unchanged: self.settings.skip_unchanged,
            auto_sync: request.kind == JobKind::Scheduled,
        };
        let summary = reconcile(
            request.direction,
            connectors.rules.as_ref(),
            connectors.git.as_ref(),
            &connectors.endpoint.git,
            &options,
        )
        .await;

        job.complete(summary.clone(), self.clock.now())?;
        self.store.save_job(&job).await?;
        info!(
            job_id = %job.id,
            exported = summary.exported(),
            imported = summary.imported(),
            deleted = summary.deleted(),
            errors = summary.error_count(),
            "[SYNC] Job completed"
        );
        Ok(SyncOutcome {
            job_id: job.id,
            status: job.status,
            summary,
        })
    }

    fn connect(&self, endpoint: SyncEndpoint) -> Result<Connectors, SetupError> {
        let rules = self.connectors.rule_source(&endpoint.elastic)?;
        let git = self.connectors.git_store(&endpoint.git)?;
        Ok(Connectors { endpoint, rules, git })
    }

    /// Resolves the project's linked instance and repository into a concrete endpoint.
    pub async fn resolve(&self, request: &SyncRequest) -> Result<SyncEndpoint, SetupError> {
        let project_id = request.project_id.as_str();
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| SetupError::ProjectNotFound(project_id.to_string()))?;
        if request.kind == JobKind::Scheduled && !project.active {
            return Err(SetupError::ProjectInactive(project_id.to_string()));
        }

        let environment: Option<Environment> = match request.environment {
            Some(kind) => self
                .store
                .list_environments(project_id)
                .await?
                .into_iter()
                .find(|e| e.kind == kind),
            None => None,
        };

        let instance_id = project
            .elastic_instance_id
            .as_deref()
            .ok_or_else(|| SetupError::NoElasticInstance(project_id.to_string()))?;
        let instance = self
            .store
            .get_elastic_instance(instance_id)
            .await?
            .ok_or_else(|| SetupError::ElasticInstanceNotFound(instance_id.to_string()))?;

        let repository_id = project
            .git_repository_id
            .as_deref()
            .ok_or_else(|| SetupError::NoGitRepository(project_id.to_string()))?;
        let repository = self
            .store
            .get_git_repository(repository_id)
            .await?
            .ok_or_else(|| SetupError::GitRepositoryNotFound(repository_id.to_string()))?;

        if instance.api_key.is_empty() {
            return Err(SetupError::MissingCredential(format!("API key for Elastic instance '{}'", instance.id)));
        }
        if repository.access_token.is_empty() {
            return Err(SetupError::MissingCredential(format!("access token for Git repository '{}'", repository.id)));
        }

        let space = request
            .space
            .clone()
            .or_else(|| environment.as_ref().and_then(|e| e.space.clone()))
            .or_else(|| instance.default_space.clone())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SPACE.to_string());
        let branch = request
            .branch
            .clone()
            .or_else(|| environment.as_ref().and_then(|e| e.branch.clone()))
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| repository.default_branch.clone());
        for name in [&branch, &repository.default_branch] {
            if !is_valid_branch_name(name) {
                return Err(SetupError::InvalidBranch(name.clone()));
            }
        }

        Ok(SyncEndpoint {
            elastic: ElasticEndpoint {
                url: parse_url("Elastic", &instance.url)?,
                api_key: instance.api_key,
                space,
            },
            git: GitEndpoint {
                url: parse_url("Git repository", &repository.url)?,
                token: repository.access_token,
                provider: repository.provider,
                branch,
                default_branch: repository.default_branch,
                base_path: normalize_base_path(&repository.base_path),
            },
        })
    }
}

fn parse_url(what: &'static str, raw: &str) -> Result<Url, SetupError> {
    let invalid = |reason: String| SetupError::InvalidUrl {
        what,
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}
