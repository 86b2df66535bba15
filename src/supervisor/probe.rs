//! Startup readiness probe
//!
//! A freshly launched bot process is only `Running` once its own HTTP API
//! answers. The probe is a seam so lifecycle tests don't need a real bot
//! listening on loopback.

use async_trait::async_trait;
use std::time::Duration;

use crate::types::Endpoint;

/// Asks a just-launched instance whether its API is up yet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn ready(&self, endpoint: &Endpoint) -> bool;
}

/// Probes the bot's `/ping` endpoint over loopback HTTP.
pub struct HttpReadinessProbe {
    client: reqwest::Client,
}

impl HttpReadinessProbe {
    pub fn new(probe_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn ready(&self, endpoint: &Endpoint) -> bool {
        let url = format!("{}/ping", endpoint.base_url());
        let result = self
            .client
            .get(&url)
            .basic_auth(
                &endpoint.credential.username,
                Some(&endpoint.credential.password),
            )
            .send()
            .await;

        match result {
            // Any well-formed answer means the API server is accepting
            // requests; 5xx during warmup still counts as not ready.
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }
}
