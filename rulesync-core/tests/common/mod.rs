#![allow(dead_code)]

//! Stateful in-memory fakes shared by the integration tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use serde_json::{json, Value};

use rulesync_core::config::{ElasticEndpoint, GitEndpoint, GitProviderKind};
use rulesync_core::contract::{
    AdapterError, ConnectorFactory, FileWrite, GitFile, GitStore, RuleSource, WriteOutcome,
};
use rulesync_core::lease::LeaseKey;
use rulesync_core::model::{ElasticInstance, Environment, EnvironmentKind, GitRepository, Project};
use rulesync_core::rule::{content_digest, stable_id_from_path};
use rulesync_core::scheduler::Clock;
use rulesync_core::store::StoreRecords;

pub fn rule(rule_id: &str, name: &str, query: &str) -> Value {
    json!({ "rule_id": rule_id, "name": name, "query": query, "type": "query" })
}

// ---------------------------------------------------------------- Kibana

#[derive(Default)]
struct RuleState {
    rules: BTreeMap<String, Value>,
    fail_writes: HashSet<String>,
    list_error: Option<AdapterError>,
    list_delay: Option<Duration>,
    created: Vec<Value>,
    updated: Vec<Value>,
    deleted: Vec<String>,
}

/// Kibana stand-in. Adds server-managed fields on write like the real API.
#[derive(Clone, Default)]
pub struct FakeRuleSource {
    state: Arc<Mutex<RuleState>>,
}

impl FakeRuleSource {
    pub fn with_rules(rules: Vec<Value>) -> Self {
        let fake = FakeRuleSource::default();
        {
            let mut state = fake.state.lock().unwrap();
            for r in rules {
                let id = r
                    .get("rule_id")
                    .or_else(|| r.get("id"))
                    .and_then(Value::as_str)
                    .unwrap()
                    .to_string();
                state.rules.insert(id, r);
            }
        }
        fake
    }

    pub fn fail_writes_for(&self, rule_id: &str) {
        self.state.lock().unwrap().fail_writes.insert(rule_id.to_string());
    }

    pub fn fail_listing(&self, error: AdapterError) {
        self.state.lock().unwrap().list_error = Some(error);
    }

    /// The next listing sleeps for `delay` before answering.
    pub fn delay_next_listing(&self, delay: Duration) {
        self.state.lock().unwrap().list_delay = Some(delay);
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().rules.keys().cloned().collect()
    }

    pub fn get(&self, rule_id: &str) -> Option<Value> {
        self.state.lock().unwrap().rules.get(rule_id).cloned()
    }

    pub fn created(&self) -> Vec<Value> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn updated(&self) -> Vec<Value> {
        self.state.lock().unwrap().updated.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn write_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.created.len() + state.updated.len() + state.deleted.len()
    }

    fn stored(payload: &Value) -> Value {
        let mut stored = payload.clone();
        let id = stored["rule_id"].as_str().unwrap_or_default().to_string();
        stored["id"] = json!(format!("kb-{id}"));
        stored["created_at"] = json!("2024-01-01T00:00:00Z");
        stored["updated_at"] = json!("2024-01-02T00:00:00Z");
        stored["revision"] = json!(1);
        stored
    }
}

#[async_trait]
impl RuleSource for FakeRuleSource {
    async fn list_rules(&self, _page_size: usize) -> Result<Vec<Value>, AdapterError> {
        let delay = self.state.lock().unwrap().list_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if let Some(e) = &state.list_error {
            return Err(e.clone());
        }
        Ok(state.rules.values().cloned().collect())
    }

    async fn create_rule(&self, payload: &Value) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        let id = payload["rule_id"].as_str().unwrap_or_default().to_string();
        if state.fail_writes.contains(&id) {
            return Err(AdapterError::Status { status: 500, body: "boom".into() });
        }
        if state.rules.contains_key(&id) {
            return Err(AdapterError::Conflict(id));
        }
        state.rules.insert(id, Self::stored(payload));
        state.created.push(payload.clone());
        Ok(())
    }

    async fn update_rule(&self, payload: &Value) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        let id = payload["rule_id"].as_str().unwrap_or_default().to_string();
        if state.fail_writes.contains(&id) {
            return Err(AdapterError::Status { status: 500, body: "boom".into() });
        }
        if !state.rules.contains_key(&id) {
            return Err(AdapterError::NotFound);
        }
        state.rules.insert(id, Self::stored(payload));
        state.updated.push(payload.clone());
        Ok(())
    }

    async fn delete_rule(&self, stable_id: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes.contains(stable_id) {
            return Err(AdapterError::Status { status: 500, body: "boom".into() });
        }
        // Kibana only matches `rule_id` here.
        match state.rules.get(stable_id) {
            Some(r) if r.get("rule_id").is_some() => {}
            _ => return Err(AdapterError::NotFound),
        }
        state.rules.remove(stable_id);
        state.deleted.push(stable_id.to_string());
        Ok(())
    }

    async fn delete_rule_by_id(&self, id: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        let key = state
            .rules
            .iter()
            .find(|(_, r)| r.get("id").and_then(Value::as_str) == Some(id))
            .map(|(k, _)| k.clone())
            .ok_or(AdapterError::NotFound)?;
        state.rules.remove(&key);
        state.deleted.push(format!("id:{id}"));
        Ok(())
    }
}

// ---------------------------------------------------------------- Git

#[derive(Default)]
struct GitState {
    branches: BTreeSet<String>,
    /// (branch, path) -> bytes
    files: BTreeMap<(String, String), Vec<u8>>,
    commits: Vec<String>,
    fail_paths: HashSet<String>,
    unreadable: HashSet<String>,
    fail_branch_create: bool,
    list_error: Option<AdapterError>,
}

/// Git provider stand-in with per-branch files and a commit log.
#[derive(Clone)]
pub struct FakeGitStore {
    state: Arc<Mutex<GitState>>,
    provider: GitProviderKind,
}

impl FakeGitStore {
    pub fn new(branches: &[&str]) -> Self {
        let state = GitState {
            branches: branches.iter().map(|b| b.to_string()).collect(),
            ..GitState::default()
        };
        FakeGitStore {
            state: Arc::new(Mutex::new(state)),
            provider: GitProviderKind::Gitlab,
        }
    }

    pub fn put(&self, branch: &str, path: &str, content: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((branch.to_string(), path.to_string()), content.into());
    }

    pub fn put_rule(&self, branch: &str, path: &str, value: &Value) {
        self.put(branch, path, serde_json::to_vec_pretty(value).unwrap());
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(branch.to_string(), path.to_string()))
            .cloned()
    }

    pub fn file_json(&self, branch: &str, path: &str) -> Option<Value> {
        self.file(branch, path).map(|b| serde_json::from_slice(&b).unwrap())
    }

    pub fn paths(&self, branch: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|(b, _)| b == branch)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn commits(&self) -> Vec<String> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state.lock().unwrap().branches.contains(branch)
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.state.lock().unwrap().fail_paths.insert(path.to_string());
    }

    pub fn make_unreadable(&self, path: &str) {
        self.state.lock().unwrap().unreadable.insert(path.to_string());
    }

    pub fn fail_listing(&self, error: AdapterError) {
        self.state.lock().unwrap().list_error = Some(error);
    }

    pub fn fail_branch_creation(&self) {
        self.state.lock().unwrap().fail_branch_create = true;
    }
}

#[async_trait]
impl GitStore for FakeGitStore {
    fn provider(&self) -> GitProviderKind {
        self.provider
    }

    async fn list_directory(&self, branch: &str, path: &str) -> Result<Vec<GitFile>, AdapterError> {
        let state = self.state.lock().unwrap();
        if let Some(e) = &state.list_error {
            return Err(e.clone());
        }
        let prefix = if path.is_empty() { String::new() } else { format!("{path}/") };
        Ok(state
            .files
            .iter()
            .filter(|((b, p), _)| b == branch && p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
            .filter_map(|((_, p), content)| {
                stable_id_from_path(p).map(|stable_id| GitFile {
                    path: p.clone(),
                    stable_id,
                    version: Some(content_digest(content)),
                })
            })
            .collect())
    }

    async fn read_file(&self, branch: &str, path: &str) -> Result<Vec<u8>, AdapterError> {
        let state = self.state.lock().unwrap();
        if state.unreadable.contains(path) {
            return Err(AdapterError::Status { status: 500, body: "unreadable".into() });
        }
        state
            .files
            .get(&(branch.to_string(), path.to_string()))
            .cloned()
            .ok_or(AdapterError::NotFound)
    }

    async fn write_file(&self, write: FileWrite) -> Result<WriteOutcome, AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_paths.contains(&write.path) {
            return Err(AdapterError::Status { status: 500, body: "boom".into() });
        }
        if !state.branches.contains(&write.branch) {
            return Err(AdapterError::Status { status: 400, body: "no such branch".into() });
        }
        let existed = state
            .files
            .insert((write.branch.clone(), write.path.clone()), write.content)
            .is_some();
        state.commits.push(write.message);
        Ok(if existed { WriteOutcome::Updated } else { WriteOutcome::Created })
    }

    async fn delete_file(&self, branch: &str, file: &GitFile, message: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_paths.contains(&file.path) {
            return Err(AdapterError::Status { status: 500, body: "boom".into() });
        }
        state
            .files
            .remove(&(branch.to_string(), file.path.clone()))
            .ok_or(AdapterError::NotFound)?;
        state.commits.push(message.to_string());
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, AdapterError> {
        Ok(self.state.lock().unwrap().branches.contains(branch))
    }

    async fn create_branch(&self, branch: &str, from: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_branch_create {
            return Err(AdapterError::Status { status: 403, body: "forbidden".into() });
        }
        if !state.branches.contains(from) {
            return Err(AdapterError::NotFound);
        }
        let copied: Vec<((String, String), Vec<u8>)> = state
            .files
            .iter()
            .filter(|((b, _), _)| b == from)
            .map(|((_, p), c)| ((branch.to_string(), p.clone()), c.clone()))
            .collect();
        state.files.extend(copied);
        state.branches.insert(branch.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------- wiring

/// Hands out clones of the same fakes and remembers the endpoints it was asked for.
#[derive(Clone)]
pub struct FakeConnectors {
    pub rules: FakeRuleSource,
    pub git: FakeGitStore,
    pub fail_elastic: bool,
    elastic_seen: Arc<Mutex<Vec<ElasticEndpoint>>>,
    git_seen: Arc<Mutex<Vec<GitEndpoint>>>,
}

impl FakeConnectors {
    pub fn new(rules: FakeRuleSource, git: FakeGitStore) -> Self {
        FakeConnectors {
            rules,
            git,
            fail_elastic: false,
            elastic_seen: Arc::default(),
            git_seen: Arc::default(),
        }
    }

    pub fn last_elastic(&self) -> Option<ElasticEndpoint> {
        self.elastic_seen.lock().unwrap().last().cloned()
    }

    pub fn last_git(&self) -> Option<GitEndpoint> {
        self.git_seen.lock().unwrap().last().cloned()
    }
}

impl ConnectorFactory for FakeConnectors {
    fn rule_source(&self, endpoint: &ElasticEndpoint) -> Result<Box<dyn RuleSource>, AdapterError> {
        if self.fail_elastic {
            return Err(AdapterError::Transport("cannot build client".into()));
        }
        self.elastic_seen.lock().unwrap().push(endpoint.clone());
        Ok(Box::new(self.rules.clone()))
    }

    fn git_store(&self, endpoint: &GitEndpoint) -> Result<Box<dyn GitStore>, AdapterError> {
        self.git_seen.lock().unwrap().push(endpoint.clone());
        Ok(Box::new(self.git.clone()))
    }
}

/// Clock the test moves by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock { now: Mutex::new(now) }
    }

    pub fn advance_minutes(&self, minutes: i64) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::minutes(minutes);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

// ---------------------------------------------------------------- records

pub const REPO_URL: &str = "https://gitlab.local/secops/detections";
pub const KIBANA_URL: &str = "https://kibana.local:5601";

/// Lease on a branch of the repository `records` links every project to.
pub fn branch_lease(branch: &str) -> LeaseKey {
    LeaseKey::branch(&Url::parse(REPO_URL).unwrap(), branch)
}

/// Lease on a space of the Kibana instance `records` links every project to.
pub fn space_lease(space: &str) -> LeaseKey {
    LeaseKey::space(&Url::parse(KIBANA_URL).unwrap(), space)
}

pub fn git_endpoint(branch: &str) -> GitEndpoint {
    GitEndpoint {
        url: Url::parse("https://gitlab.local/secops/detections").unwrap(),
        token: "token".into(),
        provider: GitProviderKind::Gitlab,
        branch: branch.into(),
        default_branch: "main".into(),
        base_path: "rules".into(),
    }
}

pub fn project(id: &str) -> Project {
    Project {
        id: id.into(),
        name: format!("Project {id}"),
        active: true,
        elastic_instance_id: Some("kibana".into()),
        git_repository_id: Some("repo".into()),
        auto_sync_enabled: true,
        auto_sync_interval_minutes: 60,
        last_sync_test: None,
        last_sync_prod: None,
    }
}

pub fn environment(project_id: &str, kind: EnvironmentKind, branch: &str, space: &str) -> Environment {
    Environment {
        project_id: project_id.into(),
        kind,
        branch: Some(branch.into()),
        space: Some(space.into()),
    }
}

pub fn records(projects: Vec<Project>, environments: Vec<Environment>) -> StoreRecords {
    StoreRecords {
        projects,
        environments,
        elastic_instances: vec![ElasticInstance {
            id: "kibana".into(),
            name: "SOC Kibana".into(),
            url: KIBANA_URL.into(),
            api_key: "api-key".into(),
            default_space: None,
        }],
        git_repositories: vec![GitRepository {
            id: "repo".into(),
            name: "detections".into(),
            url: REPO_URL.into(),
            provider: GitProviderKind::Gitlab,
            access_token: "token".into(),
            default_branch: "main".into(),
            base_path: "rules".into(),
        }],
    }
}
