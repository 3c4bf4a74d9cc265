//! GitHub REST API. Works against github.com and GitHub Enterprise.
//!
//! Directories are listed through the Git trees API, walking one level per
//! path segment from the branch head. The contents API caps directory
//! listings at 1,000 entries, so it is only used for single files.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GitProviderKind;
use crate::contract::{AdapterError, FileWrite, GitFile, GitStore, WriteOutcome};
use crate::http::{client_builder, ensure_success, join_segments, status_error};

use super::{origin_url, repository_path, rule_file};

const PUBLIC_HOST: &str = "github.com";
const PUBLIC_API: &str = "https://api.github.com";

pub struct GithubStore {
    client: Client,
    /// `{api}/repos/{owner}/{repo}`
    repo_url: Url,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    /// Relative to the tree being listed.
    path: String,
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Tree {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct FileContent {
    sha: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct PutBody<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeleteBody<'a> {
    message: &'a str,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateRef<'a> {
    #[serde(rename = "ref")]
    reference: String,
    sha: &'a str,
}

/// API root for a repository URL: api.github.com for github.com, `/api/v3` otherwise.
fn api_root(repository_url: &Url) -> Result<Url, AdapterError> {
    match repository_url.host_str() {
        Some(host) if host.eq_ignore_ascii_case(PUBLIC_HOST) || host.eq_ignore_ascii_case("www.github.com") => {
            Url::parse(PUBLIC_API).map_err(|e| AdapterError::Transport(e.to_string()))
        }
        Some(_) => join_segments(&origin_url(repository_url), ["api", "v3"]),
        None => Err(AdapterError::Transport(format!("repository URL '{repository_url}' has no host"))),
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl GithubStore {
    pub fn new(repository_url: &Url, token: &str, timeout: Duration) -> Result<Self, AdapterError> {
        let repository = repository_path(repository_url)?;
        let repo_url = join_segments(
            &api_root(repository_url)?,
            std::iter::once("repos").chain(split_path(&repository)),
        )?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| AdapterError::Transport("GitHub token is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static("2022-11-28"));
        let client = client_builder(timeout)?.default_headers(headers).build()?;

        info!(repository = %repository, url = %repo_url, "[GITHUB] Store initialised");
        Ok(GithubStore { client, repo_url })
    }

    pub fn repo_url(&self) -> &Url {
        &self.repo_url
    }

    fn contents_url(&self, path: &str) -> Result<Url, AdapterError> {
        join_segments(&self.repo_url, std::iter::once("contents").chain(split_path(path)))
    }

    /// Commit SHA at the head of `branch`, `None` when the branch does not exist.
    async fn head_sha(&self, branch: &str) -> Result<Option<String>, AdapterError> {
        let url = join_segments(&self.repo_url, ["git", "ref", "heads"].into_iter().chain(split_path(branch)))?;
        let resp = self.client.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let head: RefResponse = ensure_success(resp).await?.json().await?;
        Ok(Some(head.object.sha))
    }

    /// One level of a tree. A truncated answer is an error: a partial
    /// listing would turn every missing entry into a deletion.
    async fn tree(&self, sha: &str, path: &str) -> Result<Vec<TreeEntry>, AdapterError> {
        let url = join_segments(&self.repo_url, ["git", "trees", sha])?;
        let resp = ensure_success(self.client.get(url).send().await?).await?;
        let tree: Tree = resp.json().await?;
        if tree.truncated {
            return Err(AdapterError::Incomplete(format!(
                "GitHub truncated the tree listing for '{path}'"
            )));
        }
        Ok(tree.tree)
    }

    async fn fetch_file(&self, branch: &str, path: &str) -> Result<FileContent, AdapterError> {
        let resp = self
            .client
            .get(self.contents_url(path)?)
            .query(&[("ref", branch)])
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl GitStore for GithubStore {
    fn provider(&self) -> GitProviderKind {
        GitProviderKind::Github
    }

    async fn list_directory(&self, branch: &str, path: &str) -> Result<Vec<GitFile>, AdapterError> {
        let Some(head) = self.head_sha(branch).await? else {
            debug!(branch, path, "[GITHUB] Branch not found; treating directory as empty");
            return Ok(Vec::new());
        };

        let mut entries = self.tree(&head, "").await?;
        let mut walked: Vec<&str> = Vec::new();
        for segment in split_path(path) {
            walked.push(segment);
            let Some(dir) = entries.iter().find(|e| e.kind == "tree" && e.path == segment) else {
                debug!(branch, path, "[GITHUB] Directory not found; treating as empty");
                return Ok(Vec::new());
            };
            let sha = dir.sha.clone();
            entries = self.tree(&sha, &walked.join("/")).await?;
        }

        let prefix = walked.join("/");
        let files: Vec<GitFile> = entries
            .into_iter()
            .filter(|e| e.kind == "blob")
            .filter_map(|e| {
                let full = if prefix.is_empty() { e.path } else { format!("{prefix}/{}", e.path) };
                rule_file(&full, Some(e.sha))
            })
            .collect();
        info!(branch, path, count = files.len(), "[GITHUB] Listed rule files");
        Ok(files)
    }

    async fn read_file(&self, branch: &str, path: &str) -> Result<Vec<u8>, AdapterError> {
        let file = self.fetch_file(branch, path).await?;
        // The API wraps base64 content at 60 columns.
        let compact: String = file.content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD
            .decode(compact)
            .map_err(|e| AdapterError::Decode(format!("{path}: {e}")))
    }

    async fn write_file(&self, write: FileWrite) -> Result<WriteOutcome, AdapterError> {
        let sha = match (&write.existing_version, write.exists) {
            (Some(sha), _) => Some(sha.clone()),
            (None, true) => Some(self.fetch_file(&write.branch, &write.path).await?.sha),
            (None, false) => None,
        };
        let body = PutBody {
            message: &write.message,
            content: STANDARD.encode(&write.content),
            branch: &write.branch,
            sha: sha.as_deref(),
        };
        let resp = self.client.put(self.contents_url(&write.path)?).json(&body).send().await?;
        let outcome = match resp.status() {
            StatusCode::CREATED => WriteOutcome::Created,
            s if s.is_success() => WriteOutcome::Updated,
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = resp.text().await.unwrap_or_default();
                return Err(AdapterError::Conflict(body));
            }
            _ => return Err(status_error(resp).await),
        };
        debug!(path = %write.path, branch = %write.branch, ?outcome, "[GITHUB] Committed file");
        Ok(outcome)
    }

    async fn delete_file(&self, branch: &str, file: &GitFile, message: &str) -> Result<(), AdapterError> {
        let sha = match &file.version {
            Some(sha) => sha.clone(),
            None => self.fetch_file(branch, &file.path).await?.sha,
        };
        let body = DeleteBody {
            message,
            sha: &sha,
            branch,
        };
        let resp = self.client.delete(self.contents_url(&file.path)?).json(&body).send().await?;
        ensure_success(resp).await?;
        debug!(path = %file.path, branch, "[GITHUB] Deleted file");
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, AdapterError> {
        let url = join_segments(&self.repo_url, ["branches", branch])?;
        let resp = self.client.get(url).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(resp).await),
        }
    }

    async fn create_branch(&self, branch: &str, from: &str) -> Result<(), AdapterError> {
        let base = self.head_sha(from).await?.ok_or(AdapterError::NotFound)?;

        let body = CreateRef {
            reference: format!("refs/heads/{branch}"),
            sha: &base,
        };
        let resp = self
            .client
            .post(join_segments(&self.repo_url, ["git", "refs"])?)
            .json(&body)
            .send()
            .await?;
        if resp.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Conflict(body));
        }
        ensure_success(resp).await?;
        info!(branch, from, sha = %base, "[GITHUB] Created branch");
        Ok(())
    }
}
