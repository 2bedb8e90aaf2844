use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{BackendError, BackendResult, MatchKey, RemoteBackend};

/// Row operations against the backend's auto-generated REST surface
/// (`{base}/rest/v1/{resource}` with PostgREST filter syntax).
#[derive(Clone)]
pub struct RestBackend {
    http: Client,
    base_url: Url,
    api_key: String,
    access_token: Option<String>,
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl RestBackend {
    pub fn new(base_url: Url, api_key: impl Into<String>) -> BackendResult<Self> {
        Self::with_timeout(base_url, api_key, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Every request, including `health`, is abandoned after `timeout`.
    pub fn with_timeout(
        base_url: Url,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> BackendResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self, resource: &str) -> BackendResult<Url> {
        if resource.is_empty() || resource.contains('/') {
            return Err(BackendError::InvalidPayload(format!(
                "invalid resource name `{resource}`"
            )));
        }
        self.base_url
            .join(&format!("rest/v1/{resource}"))
            .map_err(|err| BackendError::InvalidPayload(format!("invalid table url: {err}")))
    }

    fn keyed_url(&self, resource: &str, key: &MatchKey) -> BackendResult<Url> {
        let mut url = self.table_url(resource)?;
        url.query_pairs_mut()
            .append_pair(&key.column, &format!("eq.{}", key.value_text()));
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
            .header("Prefer", "return=minimal")
    }

    async fn expect_success(res: Response) -> BackendResult<()> {
        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(BackendError::UnexpectedStatus { status, body })
        }
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn insert(&self, resource: &str, record: &Value) -> BackendResult<()> {
        let url = self.table_url(resource)?;
        debug!(target = "backend.rest", resource, "insert");
        let res = self.authorize(self.http.post(url)).json(record).send().await?;
        Self::expect_success(res).await
    }

    async fn update(&self, resource: &str, patch: &Value, key: &MatchKey) -> BackendResult<()> {
        let url = self.keyed_url(resource, key)?;
        debug!(target = "backend.rest", resource, column = %key.column, "update");
        let res = self.authorize(self.http.patch(url)).json(patch).send().await?;
        Self::expect_success(res).await
    }

    async fn delete(&self, resource: &str, key: &MatchKey) -> BackendResult<()> {
        let url = self.keyed_url(resource, key)?;
        debug!(target = "backend.rest", resource, column = %key.column, "delete");
        let res = self.authorize(self.http.delete(url)).send().await?;
        Self::expect_success(res).await
    }

    async fn health(&self) -> BackendResult<()> {
        let url = self
            .base_url
            .join("rest/v1/")
            .map_err(|err| BackendError::InvalidPayload(err.to_string()))?;
        let res = self
            .http
            .get(url)
            .header("apikey", &self.api_key)
            .send()
            .await?;
        if res.status().is_server_error() {
            return Err(BackendError::Unavailable(res.status().to_string()));
        }
        Ok(())
    }
}
