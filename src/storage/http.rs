// SPDX-License-Identifier: MIT
//! Object-store backend over a blob HTTP service.
//!
//! Maps the capability set onto plain REST verbs against a base URL:
//! `GET /{key}`, `PUT /{key}`, `DELETE /{key}`, and `GET /?prefix=` which
//! returns a JSON array of keys. Optional bearer token for stores that sit
//! behind a gateway.

use super::{ObjectStore, StoreError, StoreResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Backend(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{key}", self.base_url)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn transport_err(key: &str, e: reqwest::Error) -> StoreError {
    StoreError::Backend(format!("{key}: {e}"))
}

fn status_err(key: &str, status: StatusCode) -> StoreError {
    if status == StatusCode::NOT_FOUND {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Backend(format!("{key}: http {status}"))
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let resp = self
            .authed(self.client.get(self.url_for(key)))
            .send()
            .await
            .map_err(|e| transport_err(key, e))?;
        if !resp.status().is_success() {
            return Err(status_err(key, resp.status()));
        }
        let bytes = resp.bytes().await.map_err(|e| transport_err(key, e))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let resp = self
            .authed(self.client.put(self.url_for(key)))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| transport_err(key, e))?;
        if !resp.status().is_success() {
            return Err(status_err(key, resp.status()));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let resp = self
            .authed(self.client.get(format!("{}/", self.base_url)))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|e| transport_err(prefix, e))?;
        if !resp.status().is_success() {
            return Err(status_err(prefix, resp.status()));
        }
        resp.json::<Vec<String>>()
            .await
            .map_err(|e| transport_err(prefix, e))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let resp = self
            .authed(self.client.delete(self.url_for(key)))
            .send()
            .await
            .map_err(|e| transport_err(key, e))?;
        // Deleting a missing key is a no-op, matching the other backends.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(status_err(key, resp.status()));
        }
        Ok(())
    }
}
