//! Git provider adapters behind the [`GitStore`] trait.
//!
//! The provider is chosen from the stored repository configuration, and the
//! repository path is parsed once when the adapter is built.

pub mod github;
pub mod gitlab;

use std::time::Duration;

use reqwest::Url;

use crate::config::{GitEndpoint, GitProviderKind};
use crate::contract::{AdapterError, GitFile, GitStore};
use crate::rule::stable_id_from_path;

pub use github::GithubStore;
pub use gitlab::GitlabStore;

/// Builds the adapter matching `endpoint.provider`.
pub fn build_git_store(endpoint: &GitEndpoint, timeout: Duration) -> Result<Box<dyn GitStore>, AdapterError> {
    match endpoint.provider {
        GitProviderKind::Gitlab => Ok(Box::new(GitlabStore::new(&endpoint.url, &endpoint.token, timeout)?)),
        GitProviderKind::Github => Ok(Box::new(GithubStore::new(&endpoint.url, &endpoint.token, timeout)?)),
    }
}

/// `group/sub/project` from a repository web or clone URL.
pub(crate) fn repository_path(url: &Url) -> Result<String, AdapterError> {
    let path = url.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    if path.is_empty() || !path.contains('/') {
        return Err(AdapterError::Transport(format!(
            "repository URL '{url}' does not name an owner and a repository"
        )));
    }
    Ok(path.to_string())
}

/// Scheme, host and port of `url`, with an empty path.
pub(crate) fn origin_url(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

/// Rule file entry for `path`, or `None` when the path is not a rule file.
pub(crate) fn rule_file(path: &str, version: Option<String>) -> Option<GitFile> {
    let stable_id = stable_id_from_path(path)?;
    Some(GitFile {
        path: path.to_string(),
        stable_id,
        version,
    })
}
