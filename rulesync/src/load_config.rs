/// `load_config` module: Loads the YAML deployment file and maps it to the
/// engine's records and settings, injecting secrets from the environment.
///
/// This module is the only place where user-supplied YAML is parsed.
///
/// # Responsibilities
/// - Parse the YAML file into intermediate (YAML-side) structs
/// - Map them to `rulesync-core` records: projects, environments, Elastic
///   instances and Git repositories
/// - Resolve secrets by environment-variable name (`api_key_env`, `token_env`)
/// - Reject references to unknown instances/repositories and duplicate ids
///
/// Secrets never live in the YAML file. A variable that is not set leaves
/// the credential empty; runs against that instance or repository then fail
/// during setup instead of the whole file failing to load.
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{anyhow, bail, Context, Result};
use rulesync_core::config::{GitProviderKind, SyncSettings};
use rulesync_core::model::{ElasticInstance, Environment, EnvironmentKind, GitRepository, Project};
use rulesync_core::store::StoreRecords;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Fully loaded CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub settings: SyncSettings,
    pub tick: Duration,
    pub state_file: Option<PathBuf>,
    pub records: StoreRecords,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsSection {
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default = "default_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_true")]
    skip_unchanged: bool,
    #[serde(default = "default_tick_secs")]
    tick_secs: u64,
    #[serde(default)]
    state_file: Option<PathBuf>,
}

impl Default for SettingsSection {
    fn default() -> Self {
        SettingsSection {
            page_size: default_page_size(),
            request_timeout_secs: default_timeout_secs(),
            skip_unchanged: true,
            tick_secs: default_tick_secs(),
            state_file: None,
        }
    }
}

fn default_page_size() -> usize {
    10_000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_tick_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_space() -> Option<String> {
    Some("default".to_string())
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize)]
struct ElasticInstanceYaml {
    id: String,
    #[serde(default)]
    name: Option<String>,
    url: String,
    api_key_env: String,
    #[serde(default = "default_space")]
    default_space: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitRepositoryYaml {
    id: String,
    #[serde(default)]
    name: Option<String>,
    url: String,
    provider: GitProviderKind,
    token_env: String,
    #[serde(default = "default_branch")]
    default_branch: String,
    #[serde(default)]
    base_path: String,
}

#[derive(Debug, Default, Deserialize)]
struct AutoSyncYaml {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_interval")]
    interval_minutes: i64,
}

fn default_interval() -> i64 {
    60
}

/// One year.
const MAX_INTERVAL_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Default, Deserialize)]
struct EnvironmentYaml {
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    space: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectYaml {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    active: bool,
    elastic_instance: Option<String>,
    git_repository: Option<String>,
    #[serde(default)]
    auto_sync: AutoSyncYaml,
    #[serde(default)]
    environments: EnvironmentsYaml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentsYaml {
    test: Option<EnvironmentYaml>,
    production: Option<EnvironmentYaml>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    settings: SettingsSection,
    #[serde(default)]
    elastic_instances: Vec<ElasticInstanceYaml>,
    #[serde(default)]
    git_repositories: Vec<GitRepositoryYaml>,
    #[serde(default)]
    projects: Vec<ProjectYaml>,
}

fn secret_from_env(var: &str, owner: &str) -> String {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => {
            info!(owner, env_var = var, secret_len = value.len(), "Injected secret from environment");
            value
        }
        _ => {
            warn!(owner, env_var = var, "Secret environment variable not set; runs using it will fail");
            String::new()
        }
    }
}

fn ensure_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            bail!("duplicate {kind} id '{id}'");
        }
    }
    Ok(())
}

/// Loads a YAML config file (no secrets) and injects secrets from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let raw: RawConfig = serde_yaml::from_str(&config_content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow!("Failed to parse config YAML: {e}")
    })?;
    info!(config_path = ?path_ref, "Parsed config YAML successfully");

    let config = map_config(raw).with_context(|| format!("Invalid configuration in {:?}", path_ref))?;
    info!(
        projects = config.records.projects.len(),
        environments = config.records.environments.len(),
        elastic_instances = config.records.elastic_instances.len(),
        git_repositories = config.records.git_repositories.len(),
        "Configuration loaded"
    );
    Ok(config)
}

fn map_config(raw: RawConfig) -> Result<CliConfig> {
    let s = &raw.settings;
    if s.page_size == 0 {
        bail!("settings.page_size must be positive");
    }
    if s.request_timeout_secs == 0 {
        bail!("settings.request_timeout_secs must be positive");
    }
    if s.tick_secs == 0 {
        bail!("settings.tick_secs must be positive");
    }

    ensure_unique("elastic instance", raw.elastic_instances.iter().map(|i| i.id.as_str()))?;
    ensure_unique("git repository", raw.git_repositories.iter().map(|r| r.id.as_str()))?;
    ensure_unique("project", raw.projects.iter().map(|p| p.id.as_str()))?;

    let elastic_instances: Vec<ElasticInstance> = raw
        .elastic_instances
        .into_iter()
        .map(|i| ElasticInstance {
            api_key: secret_from_env(&i.api_key_env, &i.id),
            name: i.name.unwrap_or_else(|| i.id.clone()),
            id: i.id,
            url: i.url,
            default_space: i.default_space,
        })
        .collect();

    let git_repositories: Vec<GitRepository> = raw
        .git_repositories
        .into_iter()
        .map(|r| GitRepository {
            access_token: secret_from_env(&r.token_env, &r.id),
            name: r.name.unwrap_or_else(|| r.id.clone()),
            id: r.id,
            url: r.url,
            provider: r.provider,
            default_branch: r.default_branch,
            base_path: r.base_path,
        })
        .collect();

    let mut projects = Vec::new();
    let mut environments = Vec::new();
    for p in raw.projects {
        if let Some(instance) = &p.elastic_instance {
            if !elastic_instances.iter().any(|i| &i.id == instance) {
                bail!("project '{}' references unknown elastic instance '{}'", p.id, instance);
            }
        }
        if let Some(repository) = &p.git_repository {
            if !git_repositories.iter().any(|r| &r.id == repository) {
                bail!("project '{}' references unknown git repository '{}'", p.id, repository);
            }
        }
        if p.auto_sync.interval_minutes < 0 {
            bail!("project '{}' has a negative auto_sync.interval_minutes", p.id);
        }
        if p.auto_sync.interval_minutes > MAX_INTERVAL_MINUTES {
            bail!(
                "project '{}' has auto_sync.interval_minutes above {MAX_INTERVAL_MINUTES}",
                p.id
            );
        }

        let envs = [
            (EnvironmentKind::Test, p.environments.test),
            (EnvironmentKind::Production, p.environments.production),
        ];
        for (kind, env) in envs {
            if let Some(env) = env {
                environments.push(Environment {
                    project_id: p.id.clone(),
                    kind,
                    branch: env.branch,
                    space: env.space,
                });
            }
        }

        projects.push(Project {
            name: p.name.unwrap_or_else(|| p.id.clone()),
            id: p.id,
            active: p.active,
            elastic_instance_id: p.elastic_instance,
            git_repository_id: p.git_repository,
            auto_sync_enabled: p.auto_sync.enabled,
            auto_sync_interval_minutes: p.auto_sync.interval_minutes,
            last_sync_test: None,
            last_sync_prod: None,
        });
    }

    let settings = SyncSettings {
        page_size: raw.settings.page_size,
        request_timeout: Duration::from_secs(raw.settings.request_timeout_secs),
        skip_unchanged: raw.settings.skip_unchanged,
    };
    settings.trace_loaded();

    Ok(CliConfig {
        settings,
        tick: Duration::from_secs(raw.settings.tick_secs),
        state_file: raw.settings.state_file,
        records: StoreRecords {
            projects,
            environments,
            elastic_instances,
            git_repositories,
        },
    })
}
