//! Kibana detection-engine rules API client.
//!
//! Implements [`RuleSource`] for one Kibana space. The default space
//! (`default` or empty) is addressed without the `/s/{space}` prefix.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ElasticEndpoint;
use crate::contract::{AdapterError, RuleSource};
use crate::http::{client_builder, ensure_success, join_segments};

pub struct ElasticClient {
    client: Client,
    rules_url: Url,
    space: String,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    data: Vec<Value>,
}

fn is_default_space(space: &str) -> bool {
    space.is_empty() || space == "default"
}

impl ElasticClient {
    pub fn new(endpoint: &ElasticEndpoint, timeout: Duration) -> Result<Self, AdapterError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("ApiKey {}", endpoint.api_key))
            .map_err(|_| AdapterError::Transport("Elastic API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert("kbn-xsrf", HeaderValue::from_static("true"));

        let client = client_builder(timeout)?.default_headers(headers).build()?;

        let mut segments: Vec<&str> = Vec::new();
        if !is_default_space(&endpoint.space) {
            segments.extend(["s", endpoint.space.as_str()]);
        }
        segments.extend(["api", "detection_engine", "rules"]);
        let rules_url = join_segments(&endpoint.url, segments)?;

        info!(url = %rules_url, space = %endpoint.space, "[ELASTIC] Client initialised");
        Ok(ElasticClient {
            client,
            rules_url,
            space: endpoint.space.clone(),
        })
    }

    pub fn rules_url(&self) -> &Url {
        &self.rules_url
    }

    async fn delete_where(&self, field: &str, value: &str) -> Result<(), AdapterError> {
        let resp = self
            .client
            .delete(self.rules_url.clone())
            .query(&[(field, value)])
            .send()
            .await?;
        ensure_success(resp).await?;
        debug!(field, value, "[ELASTIC] Deleted rule");
        Ok(())
    }
}

#[async_trait]
impl RuleSource for ElasticClient {
    async fn list_rules(&self, page_size: usize) -> Result<Vec<Value>, AdapterError> {
        let url = join_segments(&self.rules_url, ["_find"])?;
        let per_page = page_size.to_string();
        let resp = self
            .client
            .get(url.clone())
            .query(&[("page", "1"), ("per_page", per_page.as_str())])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, url = %url, space = %self.space, body = %body, "[ELASTIC] Rule listing failed; treating as empty");
            return Ok(Vec::new());
        }

        let found: FindResponse = resp.json().await?;
        info!(count = found.data.len(), space = %self.space, "[ELASTIC] Listed rules");
        Ok(found.data)
    }

    async fn create_rule(&self, payload: &Value) -> Result<(), AdapterError> {
        let resp = self.client.post(self.rules_url.clone()).json(payload).send().await?;
        ensure_success(resp).await?;
        debug!(rule_id = ?payload.get("rule_id"), "[ELASTIC] Created rule");
        Ok(())
    }

    async fn update_rule(&self, payload: &Value) -> Result<(), AdapterError> {
        let resp = self.client.put(self.rules_url.clone()).json(payload).send().await?;
        ensure_success(resp).await?;
        debug!(rule_id = ?payload.get("rule_id"), "[ELASTIC] Updated rule");
        Ok(())
    }

    async fn delete_rule(&self, stable_id: &str) -> Result<(), AdapterError> {
        self.delete_where("rule_id", stable_id).await
    }

    async fn delete_rule_by_id(&self, id: &str) -> Result<(), AdapterError> {
        self.delete_where("id", id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(space: &str) -> ElasticEndpoint {
        ElasticEndpoint {
            url: Url::parse("https://kibana.local:5601").unwrap(),
            api_key: "key".into(),
            space: space.into(),
        }
    }

    #[test]
    fn default_space_has_no_prefix() {
        let client = ElasticClient::new(&endpoint("default"), Duration::from_secs(5)).unwrap();
        assert_eq!(client.rules_url().path(), "/api/detection_engine/rules");

        let client = ElasticClient::new(&endpoint(""), Duration::from_secs(5)).unwrap();
        assert_eq!(client.rules_url().path(), "/api/detection_engine/rules");
    }

    #[test]
    fn named_space_is_prefixed() {
        let client = ElasticClient::new(&endpoint("soc-test"), Duration::from_secs(5)).unwrap();
        assert_eq!(client.rules_url().path(), "/s/soc-test/api/detection_engine/rules");
    }
}
