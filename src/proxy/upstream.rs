//! Upstream forwarding client
//!
//! Performs the actual loopback HTTP call to a tenant's bot process with
//! the identity translated to the instance's Basic-Auth credential. The
//! response is re-assembled from parsed JSON, so no upstream header (and
//! nothing that names the internal address) ever reaches the client.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::SupervisorError;
use crate::supervisor::Supervisor;
use crate::types::TenantId;

/// HTTP client for instance-bound calls, shared across tenants.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Forward `method path` to the tenant's instance and return the
    /// upstream status code and parsed body.
    ///
    /// The supervisor lock is not held across this call; a slow instance
    /// never stalls another tenant's control-plane operations. A transport
    /// failure triggers an immediate liveness re-check so a dead process
    /// is detected instead of retried forever.
    pub async fn request(
        &self,
        supervisor: &Supervisor,
        tenant: &TenantId,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), SupervisorError> {
        let endpoint = supervisor.endpoint(tenant).await?;
        let url = format!("{}{}", endpoint.base_url(), path);

        let mut request = self.client.request(method, &url).basic_auth(
            &endpoint.credential.username,
            Some(&endpoint.credential.password),
        );
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(tenant = %tenant, error = %err, "upstream call failed");
                supervisor.check_liveness(tenant).await;
                return Err(SupervisorError::UpstreamUnavailable);
            }
        };

        let status = response.status().as_u16();
        let data = match response.text().await {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .unwrap_or_else(|_| json!({ "detail": text })),
            Err(err) => {
                tracing::warn!(tenant = %tenant, error = %err, "upstream body read failed");
                supervisor.check_liveness(tenant).await;
                return Err(SupervisorError::UpstreamUnavailable);
            }
        };

        supervisor.mark_activity(tenant).await;
        Ok((status, data))
    }
}
