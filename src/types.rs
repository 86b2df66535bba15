//! Core types used throughout BotFleet
//!
//! Defines tenant identity, credentials, provisioning parameters and the
//! per-instance state machine shared by the supervisor, watchdog and proxy.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Opaque stable tenant identifier supplied by the identity verifier.
///
/// The supervisor never parses it; it is the primary key for every lookup
/// and doubles as the Basic-Auth username of the tenant's bot process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Basic-Auth pair (plus the JWT secret the bot's own API server requires),
/// generated once per instance lifetime and rotated on every restart.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Basic-Auth username (the tenant id)
    pub username: String,
    /// Basic-Auth password, random per instance lifetime
    pub password: String,
    /// JWT secret injected into the bot's API server config
    pub jwt_secret: String,
}

impl Credential {
    /// Generate a fresh credential pair for a tenant.
    pub fn generate(tenant: &TenantId) -> Self {
        Self {
            username: tenant.as_str().to_string(),
            password: random_token(18),
            jwt_secret: random_token(24),
        }
    }
}

// Secrets must never reach logs, so Debug prints the username only.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("jwt_secret", &"<redacted>")
            .finish()
    }
}

/// URL-safe base64 of `n` random bytes, no padding.
fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parameters supplied by the caller when an instance is first started.
///
/// Retained on the instance so crash relaunches reuse them and the proxy
/// can enforce the pair whitelist without re-reading the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningParams {
    /// Starting dry-run wallet balance
    pub initial_balance: f64,
    /// Pairs the tenant is allowed to trade
    pub pair_whitelist: Vec<String>,
    /// Strategy name passed to the bot process (None = launcher default)
    pub strategy: Option<String>,
}

impl Default for ProvisioningParams {
    fn default() -> Self {
        Self {
            initial_balance: 1000.0,
            pair_whitelist: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            strategy: None,
        }
    }
}

impl ProvisioningParams {
    /// Whitelist membership check used by the proxy before forwarding any
    /// request that names a trading pair. An empty whitelist allows nothing.
    pub fn pair_allowed(&self, pair: &str) -> bool {
        self.pair_whitelist.iter().any(|p| p == pair)
    }
}

/// Per-tenant state machine driven by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// No instance exists for the tenant
    Absent,
    /// Resources allocated, process launched, liveness probe in flight
    Starting,
    /// Process healthy and reachable on its loopback port
    Running,
    /// Graceful termination in progress
    Stopping,
    /// Process died unexpectedly; a relaunch is pending (backoff)
    Crashed,
    /// Restart budget exhausted; cleared only by an explicit stop
    PermanentlyFailed,
}

impl InstanceState {
    /// Whether an instance in this state currently owns a port and credential.
    /// A crashed process has already exited, so its lease is returned before
    /// the relaunch re-acquires one.
    pub fn holds_resources(&self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Absent => write!(f, "absent"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Crashed => write!(f, "crashed"),
            InstanceState::PermanentlyFailed => write!(f, "permanently_failed"),
        }
    }
}

/// Loopback endpoint + credential the proxy forwards with.
///
/// Only ever crosses the supervisor/proxy boundary in-process; none of its
/// fields may be serialized into a client response.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub port: u16,
    pub credential: Credential,
}

impl Endpoint {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/api/v1", self.port)
    }
}

/// Opaque handle to a launched OS process, owned by the supervisor.
///
/// The launcher that produced it is the only component that interprets it.
/// `external` handles carry no child and exist for launchers that track
/// liveness out-of-band (tests, remote runners).
#[derive(Clone)]
pub struct ProcessHandle {
    id: Uuid,
    pid: Option<u32>,
    child: Option<Arc<Mutex<Child>>>,
}

impl ProcessHandle {
    /// Handle backed by a locally spawned `tokio::process::Child`.
    pub fn local(child: Child) -> Self {
        let pid = child.id();
        Self {
            id: Uuid::new_v4(),
            pid,
            child: Some(Arc::new(Mutex::new(child))),
        }
    }

    /// Handle for a process the launcher tracks itself.
    pub fn external() -> Self {
        Self {
            id: Uuid::new_v4(),
            pid: None,
            child: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The underlying child, when this handle owns one.
    pub fn child(&self) -> Option<Arc<Mutex<Child>>> {
        self.child.clone()
    }
}

// Debug shows the handle id and pid; the child itself is not useful output.
impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .finish()
    }
}
