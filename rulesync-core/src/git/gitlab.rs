//! GitLab REST v4 repository files API.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GitProviderKind;
use crate::contract::{AdapterError, FileWrite, GitFile, GitStore, WriteOutcome};
use crate::http::{client_builder, ensure_success, join_segments, status_error};

use super::{origin_url, repository_path, rule_file};

const PER_PAGE: &str = "100";

pub struct GitlabStore {
    client: Client,
    /// `{origin}/api/v4/projects/{url-encoded project path}`
    project_url: Url,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    id: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct FileBody<'a> {
    branch: &'a str,
    content: String,
    encoding: &'static str,
    commit_message: &'a str,
}

#[derive(Debug, Serialize)]
struct DeleteBody<'a> {
    branch: &'a str,
    commit_message: &'a str,
}

impl GitlabStore {
    pub fn new(repository_url: &Url, token: &str, timeout: Duration) -> Result<Self, AdapterError> {
        let project = repository_path(repository_url)?;
        let project_url = join_segments(&origin_url(repository_url), ["api", "v4", "projects", project.as_str()])?;

        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(token)
            .map_err(|_| AdapterError::Transport("GitLab token is not a valid header value".into()))?;
        headers.insert("PRIVATE-TOKEN", token);
        let client = client_builder(timeout)?.default_headers(headers).build()?;

        info!(project = %project, url = %project_url, "[GITLAB] Store initialised");
        Ok(GitlabStore { client, project_url })
    }

    pub fn project_url(&self) -> &Url {
        &self.project_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        join_segments(&self.project_url, segments.iter().copied())
    }
}

#[async_trait]
impl GitStore for GitlabStore {
    fn provider(&self) -> GitProviderKind {
        GitProviderKind::Gitlab
    }

    async fn list_directory(&self, branch: &str, path: &str) -> Result<Vec<GitFile>, AdapterError> {
        let url = self.url(&["repository", "tree"])?;
        let mut files = Vec::new();
        let mut page = String::from("1");

        loop {
            let mut query = vec![("ref", branch), ("per_page", PER_PAGE), ("page", page.as_str())];
            if !path.is_empty() {
                query.push(("path", path));
            }
            let resp = self.client.get(url.clone()).query(&query).send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                debug!(branch, path, "[GITLAB] Directory not found; treating as empty");
                return Ok(Vec::new());
            }
            let resp = ensure_success(resp).await?;
            let next_page = resp
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);

            let entries: Vec<TreeEntry> = resp.json().await?;
            files.extend(
                entries
                    .into_iter()
                    .filter(|e| e.kind == "blob")
                    .filter_map(|e| rule_file(&e.path, Some(e.id))),
            );

            match next_page {
                Some(next) => page = next,
                None => break,
            }
        }

        info!(branch, path, count = files.len(), "[GITLAB] Listed rule files");
        Ok(files)
    }

    async fn read_file(&self, branch: &str, path: &str) -> Result<Vec<u8>, AdapterError> {
        let url = self.url(&["repository", "files", path, "raw"])?;
        let resp = self.client.get(url).query(&[("ref", branch)]).send().await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write_file(&self, write: FileWrite) -> Result<WriteOutcome, AdapterError> {
        let url = self.url(&["repository", "files", write.path.as_str()])?;
        let body = FileBody {
            branch: &write.branch,
            content: STANDARD.encode(&write.content),
            encoding: "base64",
            commit_message: &write.message,
        };
        let (request, outcome) = if write.exists {
            (self.client.put(url), WriteOutcome::Updated)
        } else {
            (self.client.post(url), WriteOutcome::Created)
        };
        let resp = request.json(&body).send().await?;
        ensure_success(resp).await?;
        debug!(path = %write.path, branch = %write.branch, ?outcome, "[GITLAB] Committed file");
        Ok(outcome)
    }

    async fn delete_file(&self, branch: &str, file: &GitFile, message: &str) -> Result<(), AdapterError> {
        let url = self.url(&["repository", "files", file.path.as_str()])?;
        let body = DeleteBody {
            branch,
            commit_message: message,
        };
        let resp = self.client.delete(url).json(&body).send().await?;
        ensure_success(resp).await?;
        debug!(path = %file.path, branch, "[GITLAB] Deleted file");
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, AdapterError> {
        let url = self.url(&["repository", "branches", branch])?;
        let resp = self.client.get(url).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(resp).await),
        }
    }

    async fn create_branch(&self, branch: &str, from: &str) -> Result<(), AdapterError> {
        let url = self.url(&["repository", "branches"])?;
        let resp = self
            .client
            .post(url)
            .query(&[("branch", branch), ("ref", from)])
            .send()
            .await?;
        ensure_success(resp).await?;
        info!(branch, from, "[GITLAB] Created branch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_path_is_a_single_encoded_segment() {
        let url = Url::parse("https://gitlab.local/secops/detections.git").unwrap();
        let store = GitlabStore::new(&url, "token", Duration::from_secs(5)).unwrap();
        assert_eq!(store.project_url().path(), "/api/v4/projects/secops%2Fdetections");
    }
}
