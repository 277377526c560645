//! Remote state-service client backend.
//!
//! In multi-process deployments a separate service owns persistence; this
//! adapter speaks its JSON protocol: one document per entity, PUT of the full
//! document for create/full-replace, PATCH of a diff-only document (changed
//! fields and nothing else) for partial update.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;

use crate::error::{Result, StateError};
use crate::models::{record_diff, FieldSet, StateRecord};
use crate::services::state_store::StateStore;

/// Remote state service client configuration
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Base URL of the state service
    pub base_url: String,
    /// Bearer token (optional)
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_token: None,
            timeout_secs: 30,
        }
    }
}

/// HTTP client adapter for the remote state service. One instance serves all
/// entity kinds; the resource segment comes from the record type.
pub struct RestStateStore {
    client: Client,
    config: RestClientConfig,
}

impl RestStateStore {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, resource: &str, key: &str) -> String {
        // AU keys routinely contain '&' and '|'; encode the whole segment.
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC);
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            resource,
            encoded
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl<R: StateRecord> StateStore<R> for RestStateStore {
    async fn find(&self, key: &str) -> Result<Option<R>> {
        let url = self.endpoint(R::RESOURCE, key);
        let response = self.authorize(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<R>().await?)),
            status => Err(StateError::Store(format!(
                "GET {url} returned {status}"
            ))),
        }
    }

    async fn update(&self, key: &str, record: &R, changed: &FieldSet) -> Result<String> {
        let url = self.endpoint(R::RESOURCE, key);
        let (method, response) = if changed.is_full() {
            let document = serde_json::to_value(record)?;
            let response = self
                .authorize(self.client.put(&url))
                .json(&document)
                .send()
                .await?;
            ("PUT", response)
        } else {
            let diff = record_diff(record, changed)?;
            let response = self
                .authorize(self.client.patch(&url))
                .json(&Value::Object(diff))
                .send()
                .await?;
            ("PATCH", response)
        };
        let status = response.status();
        if !status.is_success() {
            return Err(StateError::Store(format!(
                "{method} {url} returned {status}"
            )));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_au_keys() {
        let store = RestStateStore::new(RestClientConfig {
            base_url: "http://state-svc:24620/".into(),
            ..Default::default()
        })
        .unwrap();
        let url = store.endpoint("austates", "org|plugin&base_url~http%3A%2F%2Fx");
        assert!(url.starts_with("http://state-svc:24620/austates/"));
        assert!(!url["http://".len()..].contains('|'));
        assert!(!url["http://".len()..].contains('&'));
    }
}
