//! Allocator - port pool and credential assignment
//!
//! Hands out a currently-unused loopback port from a fixed pool together
//! with a freshly generated credential pair. Purely in-memory bookkeeping;
//! the supervisor releases a lease only after the owning OS process has
//! been confirmed dead, so a port never has two overlapping owners.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::AllocError;
use crate::types::{Credential, TenantId};

/// A port + credential granted to exactly one tenant at a time.
#[derive(Debug, Clone)]
pub struct Lease {
    pub port: u16,
    pub credential: Credential,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Tenant -> granted port
    allocated: HashMap<TenantId, u16>,
    /// Every port currently granted
    in_use: BTreeSet<u16>,
}

/// Owns the port pool and credential generation.
pub struct Allocator {
    port_base: u16,
    port_max: u16,
    state: Mutex<PoolState>,
}

impl Allocator {
    pub fn new(port_base: u16, port_max: u16) -> Self {
        Self {
            port_base,
            port_max,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Grant the lowest free port and a fresh credential to `tenant`.
    pub fn acquire(&self, tenant: &TenantId) -> Result<Lease, AllocError> {
        let mut state = self.state.lock().expect("allocator lock poisoned");

        if state.allocated.contains_key(tenant) {
            return Err(AllocError::AlreadyAllocated);
        }

        let port = (self.port_base..=self.port_max)
            .find(|p| !state.in_use.contains(p))
            .ok_or(AllocError::Exhausted)?;

        state.allocated.insert(tenant.clone(), port);
        state.in_use.insert(port);

        Ok(Lease {
            port,
            credential: Credential::generate(tenant),
        })
    }

    /// Return the tenant's port to the pool. Idempotent; a tenant with no
    /// allocation is a no-op.
    pub fn release(&self, tenant: &TenantId) {
        let mut state = self.state.lock().expect("allocator lock poisoned");
        if let Some(port) = state.allocated.remove(tenant) {
            state.in_use.remove(&port);
        }
    }

    /// Port currently held by the tenant, if any.
    pub fn allocated_port(&self, tenant: &TenantId) -> Option<u16> {
        self.state
            .lock()
            .expect("allocator lock poisoned")
            .allocated
            .get(tenant)
            .copied()
    }

    /// Number of outstanding leases.
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .expect("allocator lock poisoned")
            .in_use
            .len()
    }
}
