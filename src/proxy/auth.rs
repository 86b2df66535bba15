//! Identity boundary
//!
//! Session issuance and token minting live outside this crate; the proxy
//! only needs something that turns a bearer token into a verified tenant
//! id, and it trusts the answer.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::TenantId;

/// Verifies an inbound bearer token and yields the tenant it belongs to.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<TenantId>;
}

/// Token -> tenant map, loaded once at startup. Stands in for the external
/// session service in deployments where tokens are pre-issued.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, TenantId>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, tenant: TenantId) {
        self.tokens.insert(token.into(), tenant);
    }

    /// Parse `token=tenant[,token=tenant...]` from the `BOTFLEET_TOKENS`
    /// environment variable.
    pub fn from_env() -> Self {
        let mut verifier = Self::new();
        if let Ok(raw) = std::env::var("BOTFLEET_TOKENS") {
            for entry in raw.split(',') {
                if let Some((token, tenant)) = entry.split_once('=') {
                    let token = token.trim();
                    let tenant = tenant.trim();
                    if !token.is_empty() && !tenant.is_empty() {
                        verifier.insert(token, TenantId::from(tenant));
                    }
                }
            }
        }
        verifier
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<TenantId> {
        self.tokens.get(token).cloned()
    }
}
