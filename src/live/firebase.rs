//! Live store over the realtime database REST API.
//!
//! Every path maps to `{base_url}/{root}/{path}.json`. Reads of missing
//! nodes return `null`. Conditional writes use the `X-Firebase-ETag`
//! request header to obtain a version and `if-match` to apply it; a stale
//! version is answered with HTTP 412.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value};
use tracing::debug;

use super::{join, LiveStore, Versioned, WriteOutcome};
use crate::error::LiveStoreError;

const ETAG_REQUEST_HEADER: &str = "X-Firebase-ETag";

#[derive(Debug, Clone)]
pub struct FirebaseLiveStore {
    client: Client,
    base_url: String,
    root: String,
    auth_token: Option<String>,
}

impl FirebaseLiveStore {
    pub fn new(
        base_url: &str,
        root: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LiveStoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(FirebaseLiveStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            root: root.trim_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, path: &str) -> String {
        let full = join(&self.root, path);
        if full.is_empty() {
            format!("{}/.json", self.base_url)
        } else {
            format!("{}/{}.json", self.base_url, full)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    async fn check(response: Response, path: &str) -> Result<Response, LiveStoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LiveStoreError::Status {
            status: status.as_u16(),
            path: path.to_string(),
            body,
        })
    }

    async fn read_json(response: Response, path: &str) -> Result<Option<Value>, LiveStoreError> {
        let bytes = response.bytes().await?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|source| LiveStoreError::Decode {
            path: path.to_string(),
            source,
        })?;
        Ok(if value.is_null() { None } else { Some(value) })
    }
}

#[async_trait]
impl LiveStore for FirebaseLiveStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, LiveStoreError> {
        let response = self.request(Method::GET, path).send().await?;
        let response = Self::check(response, path).await?;
        Self::read_json(response, path).await
    }

    async fn get_versioned(&self, path: &str) -> Result<Versioned, LiveStoreError> {
        let response = self
            .request(Method::GET, path)
            .header(ETAG_REQUEST_HEADER, "true")
            .send()
            .await?;
        let response = Self::check(response, path).await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let value = Self::read_json(response, path).await?;
        Ok(Versioned { value, etag })
    }

    async fn shallow_keys(&self, path: &str) -> Result<Vec<String>, LiveStoreError> {
        let response = self
            .request(Method::GET, path)
            .query(&[("shallow", "true")])
            .send()
            .await?;
        let response = Self::check(response, path).await?;
        Ok(match Self::read_json(response, path).await? {
            Some(Value::Object(map)) => map.into_iter().map(|(k, _)| k).collect(),
            _ => Vec::new(),
        })
    }

    async fn query_ordered(
        &self,
        path: &str,
        child: &str,
        start_at: Option<&str>,
    ) -> Result<Map<String, Value>, LiveStoreError> {
        // Query parameters are JSON literals.
        let order_by = Value::String(child.to_string()).to_string();
        let mut builder = self
            .request(Method::GET, path)
            .query(&[("orderBy", order_by.as_str())]);
        if let Some(start) = start_at {
            let start = Value::String(start.to_string()).to_string();
            builder = builder.query(&[("startAt", start.as_str())]);
        }
        let response = Self::check(builder.send().await?, path).await?;
        Ok(match Self::read_json(response, path).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        })
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), LiveStoreError> {
        let response = self
            .request(Method::PUT, path)
            .query(&[("print", "silent")])
            .json(value)
            .send()
            .await?;
        Self::check(response, path).await?;
        Ok(())
    }

    async fn update(&self, path: &str, values: &Map<String, Value>) -> Result<(), LiveStoreError> {
        if values.is_empty() {
            return Ok(());
        }
        debug!(path, keys = values.len(), "live-store multi-path update");
        let response = self
            .request(Method::PATCH, path)
            .query(&[("print", "silent")])
            .json(values)
            .send()
            .await?;
        Self::check(response, path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), LiveStoreError> {
        let response = self.request(Method::DELETE, path).send().await?;
        Self::check(response, path).await?;
        Ok(())
    }

    async fn set_if_unchanged(
        &self,
        path: &str,
        value: &Value,
        etag: &str,
    ) -> Result<WriteOutcome, LiveStoreError> {
        let response = self
            .request(Method::PUT, path)
            .header(reqwest::header::IF_MATCH, etag)
            .json(value)
            .send()
            .await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(WriteOutcome::Conflict);
        }
        Self::check(response, path).await?;
        Ok(WriteOutcome::Committed)
    }
}
