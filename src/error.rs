//! Control-plane error taxonomy
//!
//! Typed failures surfaced by the allocator and supervisor. The proxy maps
//! these to client-visible statuses through an allow-list; none of the
//! variants carry ports, credentials or pids in their display output.

use thiserror::Error;

/// Allocator failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The configured port pool has no free port left
    #[error("no free ports available in configured range")]
    Exhausted,
    /// The tenant already holds a port; lifetimes must not overlap
    #[error("tenant already holds an allocation")]
    AlreadyAllocated,
}

/// Supervisor and proxy-visible control-plane failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Port pool exhausted; reported to the caller, never retried here
    #[error("no capacity for a new instance")]
    ResourceExhausted,

    /// Process launched but never became healthy within the bound
    #[error("instance failed to become healthy in time")]
    StartupTimeout,

    /// Provisioning or launch failed before the liveness wait began; the
    /// cause is logged, never serialized outward
    #[error("instance failed to start")]
    FailedToStart(anyhow::Error),

    /// Restart budget exhausted; cleared only by an explicit stop
    #[error("instance has permanently failed; stop it to reset")]
    PermanentlyFailed,

    /// Operation requires a running instance and there is none
    #[error("instance is not running")]
    InstanceNotRunning,

    /// The instance was believed running but the proxied call failed
    #[error("upstream instance did not respond")]
    UpstreamUnavailable,
}

impl From<AllocError> for SupervisorError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::Exhausted => SupervisorError::ResourceExhausted,
            // An overlapping allocation means supervisor bookkeeping is out
            // of sync with the allocator; surface it as a failed start.
            AllocError::AlreadyAllocated => {
                SupervisorError::FailedToStart(anyhow::anyhow!("allocation already held"))
            }
        }
    }
}
