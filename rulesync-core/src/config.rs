use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Engine-wide knobs shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    /// `per_page` for the single rules `_find` call.
    pub page_size: usize,
    /// Per-HTTP-call timeout.
    pub request_timeout: Duration,
    /// Skip writes whose rendered content already matches the target.
    pub skip_unchanged: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            request_timeout: Duration::from_secs(30),
            skip_unchanged: true,
        }
    }
}

impl SyncSettings {
    pub fn trace_loaded(&self) {
        info!(
            page_size = self.page_size,
            timeout_secs = self.request_timeout.as_secs(),
            skip_unchanged = self.skip_unchanged,
            "Loaded sync settings"
        );
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GitProviderKind {
    Gitlab,
    Github,
}

impl fmt::Display for GitProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitProviderKind::Gitlab => f.write_str("gitlab"),
            GitProviderKind::Github => f.write_str("github"),
        }
    }
}

/// Everything needed to talk to one Kibana space.
#[derive(Clone)]
pub struct ElasticEndpoint {
    pub url: Url,
    pub api_key: String,
    pub space: String,
}

impl fmt::Debug for ElasticEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticEndpoint")
            .field("url", &self.url.as_str())
            .field("api_key_len", &self.api_key.len())
            .field("space", &self.space)
            .finish()
    }
}

/// Everything needed to read and write rule files on one branch.
#[derive(Clone)]
pub struct GitEndpoint {
    pub url: Url,
    pub token: String,
    pub provider: GitProviderKind,
    pub branch: String,
    pub default_branch: String,
    pub base_path: String,
}

impl fmt::Debug for GitEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitEndpoint")
            .field("url", &self.url.as_str())
            .field("token_len", &self.token.len())
            .field("provider", &self.provider)
            .field("branch", &self.branch)
            .field("default_branch", &self.default_branch)
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// Resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct SyncEndpoint {
    pub elastic: ElasticEndpoint,
    pub git: GitEndpoint,
}

impl SyncEndpoint {
    pub fn trace_loaded(&self) {
        info!(
            elastic_url = %self.elastic.url,
            space = %self.elastic.space,
            git_url = %self.git.url,
            provider = %self.git.provider,
            branch = %self.git.branch,
            base_path = %self.git.base_path,
            "Resolved sync endpoint"
        );
        debug!(?self, "Sync endpoint (full debug)");
    }
}

fn branch_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._/-]+$").expect("branch pattern is a valid regex")
    })
}

/// Conservative subset of git's ref-name rules: no spaces or control
/// characters, no `..`, no leading `/` or `-`, no trailing `/` or `.lock`.
pub fn is_valid_branch_name(name: &str) -> bool {
    branch_pattern().is_match(name)
        && !name.contains("..")
        && !name.contains("//")
        && !name.starts_with('/')
        && !name.starts_with('-')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
}

/// Normalises a configured base path: no leading/trailing slashes, `""` for the repo root.
pub fn normalize_base_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}
