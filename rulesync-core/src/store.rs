//! In-memory [`JobStore`] with optional JSON write-through.
//!
//! Projects, environments and linked instances come from configuration and
//! are held in memory. Job records and last-sync timestamps are the only
//! state the engine writes; when a state file is configured they are written
//! through to it after every change and can be reloaded with
//! [`MemoryStore::restore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contract::{JobStore, StoreError};
use crate::model::{ElasticInstance, Environment, EnvironmentKind, GitRepository, Project, SyncJob};

/// Static records a store is seeded with.
#[derive(Debug, Clone, Default)]
pub struct StoreRecords {
    pub projects: Vec<Project>,
    pub environments: Vec<Environment>,
    pub elastic_instances: Vec<ElasticInstance>,
    pub git_repositories: Vec<GitRepository>,
}

#[derive(Debug, Default)]
struct Inner {
    projects: BTreeMap<String, Project>,
    environments: Vec<Environment>,
    elastic_instances: BTreeMap<String, ElasticInstance>,
    git_repositories: BTreeMap<String, GitRepository>,
    jobs: BTreeMap<Uuid, SyncJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LastSync {
    project_id: String,
    environment: EnvironmentKind,
    at: DateTime<Utc>,
}

/// On-disk shape of the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    jobs: Vec<SyncJob>,
    #[serde(default)]
    last_sync: Vec<LastSync>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    state_file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(records: StoreRecords) -> Self {
        let inner = Inner {
            projects: records.projects.into_iter().map(|p| (p.id.clone(), p)).collect(),
            environments: records.environments,
            elastic_instances: records.elastic_instances.into_iter().map(|i| (i.id.clone(), i)).collect(),
            git_repositories: records.git_repositories.into_iter().map(|r| (r.id.clone(), r)).collect(),
            jobs: BTreeMap::new(),
        };
        MemoryStore {
            inner: RwLock::new(inner),
            state_file: None,
        }
    }

    /// Writes jobs and last-sync timestamps through to `path`.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// Loads jobs and last-sync timestamps from the state file, if one is
    /// configured and present. Timestamps for unknown projects are ignored.
    pub async fn restore(&self) -> Result<(), StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "[STORE] No state file yet");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let state: PersistedState = serde_json::from_slice(&bytes)?;

        let mut inner = self.inner.write().await;
        for entry in &state.last_sync {
            match inner.projects.get_mut(&entry.project_id) {
                Some(project) => project.set_last_sync(entry.environment, entry.at),
                None => warn!(project_id = %entry.project_id, "[STORE] Ignoring last sync for unknown project"),
            }
        }
        let jobs = state.jobs.len();
        inner.jobs.extend(state.jobs.into_iter().map(|j| (j.id, j)));
        info!(path = %path.display(), jobs, timestamps = state.last_sync.len(), "[STORE] Restored state");
        Ok(())
    }

    /// Every job record, oldest first.
    pub async fn jobs(&self) -> Vec<SyncJob> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<SyncJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    async fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let mut jobs: Vec<SyncJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        let last_sync = inner
            .projects
            .values()
            .flat_map(|p| {
                [EnvironmentKind::Test, EnvironmentKind::Production]
                    .into_iter()
                    .filter_map(move |env| {
                        p.last_sync(env).map(|at| LastSync {
                            project_id: p.id.clone(),
                            environment: env,
                            at,
                        })
                    })
            })
            .collect();
        let bytes = serde_json::to_vec_pretty(&PersistedState { jobs, last_sync })?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "[STORE] State written");
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.inner.read().await.projects.values().cloned().collect())
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.inner.read().await.projects.get(project_id).cloned())
    }

    async fn list_environments(&self, project_id: &str) -> Result<Vec<Environment>, StoreError> {
        let inner = self.inner.read().await;
        let mut envs: Vec<Environment> = inner
            .environments
            .iter()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        envs.sort_by_key(|e| e.kind);
        Ok(envs)
    }

    async fn get_elastic_instance(&self, id: &str) -> Result<Option<ElasticInstance>, StoreError> {
        Ok(self.inner.read().await.elastic_instances.get(id).cloned())
    }

    async fn get_git_repository(&self, id: &str) -> Result<Option<GitRepository>, StoreError> {
        Ok(self.inner.read().await.git_repositories.get(id).cloned())
    }

    async fn save_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone());
        self.persist(&inner).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<SyncJob>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    async fn record_last_sync(
        &self,
        project_id: &str,
        environment: EnvironmentKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let project = inner
            .projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::Other(format!("unknown project '{project_id}'")))?;
        project.set_last_sync(environment, at);
        self.persist(&inner).await
    }
}
