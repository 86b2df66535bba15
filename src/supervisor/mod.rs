//! Instance Supervisor - per-tenant process lifecycle
//!
//! Owns the process table and drives each tenant through
//! `Absent -> Starting -> Running -> Stopping -> Absent`, with
//! `Running -> Crashed -> Starting` as the recovery edge and
//! `Starting -> FailedToStart -> Absent` as the terminal failure edge.
//! Exactly one start/stop/restart is in flight per tenant at a time;
//! distinct tenants proceed fully in parallel.

pub mod launcher;
pub mod probe;
pub mod provisioner;

pub use launcher::{CommandLauncher, ProcessLauncher};
pub use probe::{HttpReadinessProbe, ReadinessProbe};
pub use provisioner::{ConfigProvisioner, JsonConfigProvisioner};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::Instant;

use crate::allocator::Allocator;
use crate::config::FleetConfig;
use crate::error::SupervisorError;
use crate::types::{
    Credential, Endpoint, InstanceState, ProcessHandle, ProvisioningParams, TenantId,
};

/// Poll step while waiting for a signaled process to actually exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Bound on the wait for a force-killed process to disappear.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime record for a tenant whose process holds resources.
#[derive(Debug)]
struct Instance {
    port: u16,
    credential: Credential,
    process: ProcessHandle,
    started_at: DateTime<Utc>,
    started_mono: Instant,
    last_activity_at: Instant,
}

/// Everything known about one tenant, guarded by the slot's cell lock.
#[derive(Debug)]
struct CellState {
    state: InstanceState,
    instance: Option<Instance>,
    /// Sticky across crash relaunches; refreshed on explicit start.
    params: Option<ProvisioningParams>,
    restart_count: u32,
    /// Bumped on every transition; stale restart tasks check it and bail.
    epoch: u64,
}

impl CellState {
    fn new() -> Self {
        Self {
            state: InstanceState::Absent,
            instance: None,
            params: None,
            restart_count: 0,
            epoch: 0,
        }
    }

    fn transition(&mut self, next: InstanceState) {
        self.state = next;
        self.epoch += 1;
    }
}

/// Per-tenant slot: one async op lock (single-flight) plus the cheaply
/// readable cell for status/endpoint/activity lookups.
struct TenantSlot {
    op_lock: AsyncMutex<()>,
    cell: std::sync::Mutex<CellState>,
}

impl TenantSlot {
    fn new() -> Self {
        Self {
            op_lock: AsyncMutex::new(()),
            cell: std::sync::Mutex::new(CellState::new()),
        }
    }
}

/// Public snapshot of a tenant's instance for the status surface.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

struct Inner {
    fleet: FleetConfig,
    allocator: Arc<Allocator>,
    launcher: Arc<dyn ProcessLauncher>,
    provisioner: Arc<dyn ConfigProvisioner>,
    probe: Arc<dyn ReadinessProbe>,
    slots: RwLock<HashMap<TenantId, Arc<TenantSlot>>>,
}

/// Owns the process table; depends on the allocator for resources and on
/// the launcher/provisioner/probe collaborators for everything OS-shaped.
/// Cheap to clone; all clones share one process table.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        fleet: FleetConfig,
        allocator: Arc<Allocator>,
        launcher: Arc<dyn ProcessLauncher>,
        provisioner: Arc<dyn ConfigProvisioner>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fleet,
                allocator,
                launcher,
                provisioner,
                probe,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Fleet-level knobs, shared with the watchdog and proxy.
    pub fn fleet_config(&self) -> &FleetConfig {
        &self.inner.fleet
    }

    async fn slot(&self, tenant: &TenantId) -> Arc<TenantSlot> {
        if let Some(slot) = self.inner.slots.read().await.get(tenant) {
            return slot.clone();
        }
        let mut slots = self.inner.slots.write().await;
        slots
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(TenantSlot::new()))
            .clone()
    }

    async fn existing_slot(&self, tenant: &TenantId) -> Option<Arc<TenantSlot>> {
        self.inner.slots.read().await.get(tenant).cloned()
    }

    /// Make sure the tenant has a healthy instance and return its endpoint.
    ///
    /// Idempotent: a `Running` tenant gets its existing endpoint back.
    /// Concurrent callers for the same tenant collapse into one launch and
    /// all observe the same result.
    pub async fn ensure_running(
        &self,
        tenant: &TenantId,
        params: ProvisioningParams,
    ) -> Result<Endpoint, SupervisorError> {
        let slot = self.slot(tenant).await;
        let _op = slot.op_lock.lock().await;

        {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            match cell.state {
                InstanceState::Running => {
                    let instance = cell.instance.as_ref().expect("running without instance");
                    return Ok(Endpoint {
                        port: instance.port,
                        credential: instance.credential.clone(),
                    });
                }
                InstanceState::PermanentlyFailed => {
                    return Err(SupervisorError::PermanentlyFailed);
                }
                // Absent, or Crashed with an explicit start racing the
                // delayed relaunch; both fall through to a fresh launch.
                _ => {}
            }
            // An explicit start supersedes retained crash params and any
            // pending relaunch task.
            cell.params = Some(params.clone());
            cell.transition(InstanceState::Starting);
        }

        let result = self.launch_locked(&slot, tenant, &params).await;
        if result.is_err() {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            cell.instance = None;
            cell.transition(InstanceState::Absent);
        }
        result
    }

    /// Launch + readiness wait. Caller holds the op lock and has already
    /// set the cell to `Starting`; on error the caller rolls the cell back.
    async fn launch_locked(
        &self,
        slot: &TenantSlot,
        tenant: &TenantId,
        params: &ProvisioningParams,
    ) -> Result<Endpoint, SupervisorError> {
        let lease = self.inner.allocator.acquire(tenant)?;
        let port = lease.port;
        let credential = lease.credential;

        let config_path = match self
            .inner
            .provisioner
            .provision(tenant, port, &credential, params)
            .await
        {
            Ok(path) => path,
            Err(err) => {
                self.inner.allocator.release(tenant);
                tracing::warn!(tenant = %tenant, error = %err, "config provisioning failed");
                return Err(SupervisorError::FailedToStart(err));
            }
        };

        let strategy = params
            .strategy
            .clone()
            .unwrap_or_else(|| self.inner.fleet.default_strategy.clone());

        let handle = match self.inner.launcher.launch(&config_path, &strategy).await {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.allocator.release(tenant);
                tracing::warn!(tenant = %tenant, error = %err, "process launch failed");
                return Err(SupervisorError::FailedToStart(err));
            }
        };

        let endpoint = Endpoint {
            port,
            credential: credential.clone(),
        };

        {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            cell.instance = Some(Instance {
                port,
                credential,
                process: handle.clone(),
                started_at: Utc::now(),
                started_mono: Instant::now(),
                last_activity_at: Instant::now(),
            });
        }

        // Readiness wait: the instance is Running once its API answers.
        let deadline = Instant::now() + self.inner.fleet.startup_timeout();
        loop {
            if self.inner.probe.ready(&endpoint).await {
                break;
            }
            if !self.inner.launcher.is_alive(&handle).await {
                tracing::warn!(tenant = %tenant, "process exited before becoming healthy");
                self.inner.allocator.release(tenant);
                return Err(SupervisorError::FailedToStart(anyhow::anyhow!(
                    "process exited during startup"
                )));
            }
            if Instant::now() >= deadline {
                tracing::warn!(tenant = %tenant, "startup liveness probe timed out");
                self.kill_and_confirm(&handle).await;
                self.inner.allocator.release(tenant);
                return Err(SupervisorError::StartupTimeout);
            }
            tokio::time::sleep(self.inner.fleet.startup_probe_interval()).await;
        }

        {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            cell.transition(InstanceState::Running);
        }

        tracing::info!(tenant = %tenant, port, "instance running");
        Ok(endpoint)
    }

    /// Gracefully stop the tenant's instance. Idempotent: `Absent` is a
    /// no-op, and a `PermanentlyFailed` marker is cleared (manual reset).
    /// Returns whether a process was actually stopped.
    pub async fn stop(&self, tenant: &TenantId) -> bool {
        let Some(slot) = self.existing_slot(tenant).await else {
            return false;
        };
        let _op = slot.op_lock.lock().await;

        let (state, process) = {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            match cell.state {
                InstanceState::Absent => return false,
                InstanceState::PermanentlyFailed | InstanceState::Crashed => {
                    // Nothing running; drop the record and reset the budget.
                    cell.instance = None;
                    cell.restart_count = 0;
                    cell.transition(InstanceState::Absent);
                    self.inner.allocator.release(tenant);
                    return false;
                }
                state => {
                    let process = cell
                        .instance
                        .as_ref()
                        .map(|i| i.process.clone())
                        .expect("active state without instance");
                    cell.transition(InstanceState::Stopping);
                    (state, process)
                }
            }
        };

        tracing::info!(tenant = %tenant, from = %state, "stopping instance");

        self.inner.launcher.signal_terminate(&process).await;
        let grace_deadline = Instant::now() + self.inner.fleet.stop_grace();
        while self.inner.launcher.is_alive(&process).await {
            if Instant::now() >= grace_deadline {
                tracing::warn!(tenant = %tenant, "grace period expired, force killing");
                self.kill_and_confirm(&process).await;
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        // The port is reclaimed only now, with the process confirmed dead.
        {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            cell.instance = None;
            cell.restart_count = 0;
            cell.transition(InstanceState::Absent);
        }
        self.inner.allocator.release(tenant);
        tracing::info!(tenant = %tenant, "instance stopped");
        true
    }

    /// Force kill and wait (bounded) until the launcher stops reporting the
    /// process alive, so a reclaimed port can never race a dying owner.
    async fn kill_and_confirm(&self, process: &ProcessHandle) {
        self.inner.launcher.force_kill(process).await;
        let deadline = Instant::now() + KILL_CONFIRM_TIMEOUT;
        while self.inner.launcher.is_alive(process).await && Instant::now() < deadline {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Record a proxied request for idle accounting.
    pub async fn mark_activity(&self, tenant: &TenantId) {
        if let Some(slot) = self.existing_slot(tenant).await {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            if let Some(instance) = cell.instance.as_mut() {
                instance.last_activity_at = Instant::now();
            }
        }
    }

    /// Current forwarding endpoint, only when the instance is `Running`.
    pub async fn endpoint(&self, tenant: &TenantId) -> Result<Endpoint, SupervisorError> {
        let Some(slot) = self.existing_slot(tenant).await else {
            return Err(SupervisorError::InstanceNotRunning);
        };
        let cell = slot.cell.lock().expect("cell lock poisoned");
        match cell.state {
            InstanceState::Running => {
                let instance = cell.instance.as_ref().expect("running without instance");
                Ok(Endpoint {
                    port: instance.port,
                    credential: instance.credential.clone(),
                })
            }
            InstanceState::PermanentlyFailed => Err(SupervisorError::PermanentlyFailed),
            _ => Err(SupervisorError::InstanceNotRunning),
        }
    }

    /// Status snapshot for the client-facing surface.
    pub async fn status(&self, tenant: &TenantId) -> InstanceStatus {
        let Some(slot) = self.existing_slot(tenant).await else {
            return InstanceStatus {
                state: InstanceState::Absent,
                started_at: None,
                restart_count: 0,
            };
        };
        let cell = slot.cell.lock().expect("cell lock poisoned");
        InstanceStatus {
            state: cell.state,
            started_at: cell.instance.as_ref().map(|i| i.started_at),
            restart_count: cell.restart_count,
        }
    }

    /// Provisioning params retained for the tenant (whitelist checks).
    pub async fn params(&self, tenant: &TenantId) -> Option<ProvisioningParams> {
        let slot = self.existing_slot(tenant).await?;
        let cell = slot.cell.lock().expect("cell lock poisoned");
        cell.params.clone()
    }

    /// Tenants currently `Running`, with their process handles, for the
    /// watchdog's liveness sweep.
    pub async fn running_instances(&self) -> Vec<(TenantId, ProcessHandle)> {
        let slots = self.inner.slots.read().await;
        let mut out = Vec::new();
        for (tenant, slot) in slots.iter() {
            let cell = slot.cell.lock().expect("cell lock poisoned");
            if cell.state == InstanceState::Running {
                if let Some(instance) = cell.instance.as_ref() {
                    out.push((tenant.clone(), instance.process.clone()));
                }
            }
        }
        out
    }

    /// Poll OS-level liveness of every `Running` process. A check that
    /// fails or exceeds its bound is a crash signal, never silently
    /// ignored.
    pub async fn sweep_liveness(&self) {
        for (tenant, process) in self.running_instances().await {
            let alive = tokio::time::timeout(
                self.inner.fleet.liveness_check_timeout(),
                self.inner.launcher.is_alive(&process),
            )
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(tenant = %tenant, "liveness check timed out, treating as dead");
                false
            });

            if !alive {
                // Spawned so one tenant's in-flight stop/start never stalls
                // the rest of the sweep; on_process_exit re-checks state
                // under the tenant lock, so a duplicate signal is harmless.
                let supervisor = self.clone();
                tokio::spawn(async move {
                    supervisor.on_process_exit(&tenant).await;
                });
            }
        }
    }

    /// Stop every `Running` instance idle for longer than the threshold.
    pub async fn reap_idle(&self) {
        let idle_timeout = self.inner.fleet.idle_timeout();
        let mut idle = Vec::new();
        {
            let slots = self.inner.slots.read().await;
            for (tenant, slot) in slots.iter() {
                let cell = slot.cell.lock().expect("cell lock poisoned");
                if cell.state == InstanceState::Running {
                    if let Some(instance) = cell.instance.as_ref() {
                        if instance.last_activity_at.elapsed() > idle_timeout {
                            idle.push(tenant.clone());
                        }
                    }
                }
            }
        }

        for tenant in idle {
            tracing::info!(tenant = %tenant, "idle threshold exceeded, stopping");
            let supervisor = self.clone();
            tokio::spawn(async move {
                supervisor.stop(&tenant).await;
            });
        }
    }

    /// A `Running` process terminated without being asked to. Within the
    /// restart budget this schedules a relaunch (fresh credential) after an
    /// exponential backoff; past it the tenant is parked as
    /// `PermanentlyFailed` until an explicit stop resets it.
    pub async fn on_process_exit(&self, tenant: &TenantId) {
        let Some(slot) = self.existing_slot(tenant).await else {
            return;
        };
        let _op = slot.op_lock.lock().await;

        let (process, uptime) = {
            let cell = slot.cell.lock().expect("cell lock poisoned");
            if cell.state != InstanceState::Running {
                // A concurrent stop or restart already settled this.
                return;
            }
            let instance = cell.instance.as_ref().expect("running without instance");
            (instance.process.clone(), instance.started_mono.elapsed())
        };

        // Re-check under the op lock: the watchdog may race a process that
        // was alive again by the time we got here.
        if self.inner.launcher.is_alive(&process).await {
            return;
        }

        // The process is gone; its port is reclaimable immediately.
        self.inner.allocator.release(tenant);

        let (restart_count, epoch) = {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            cell.instance = None;
            if uptime > self.inner.fleet.crash_window() {
                // Stable for long enough that this exit is not part of a
                // crash storm.
                cell.restart_count = 0;
            }
            if cell.restart_count >= self.inner.fleet.max_restarts {
                cell.transition(InstanceState::PermanentlyFailed);
                tracing::error!(
                    tenant = %tenant,
                    restarts = cell.restart_count,
                    "restart budget exhausted, instance permanently failed"
                );
                return;
            }
            let count = cell.restart_count;
            cell.restart_count += 1;
            cell.transition(InstanceState::Crashed);
            (count, cell.epoch)
        };

        let delay = self.inner.fleet.restart_backoff(restart_count);
        tracing::warn!(
            tenant = %tenant,
            restart = restart_count + 1,
            delay_ms = delay.as_millis() as u64,
            "unexpected process exit, scheduling relaunch"
        );

        let supervisor = self.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.relaunch_after_crash(&tenant, epoch).await;
        });
    }

    /// Delayed crash relaunch. Skips silently when the tenant was stopped
    /// or explicitly restarted while the backoff timer ran.
    async fn relaunch_after_crash(&self, tenant: &TenantId, expected_epoch: u64) {
        let Some(slot) = self.existing_slot(tenant).await else {
            return;
        };
        let _op = slot.op_lock.lock().await;

        let params = {
            let mut cell = slot.cell.lock().expect("cell lock poisoned");
            if cell.state != InstanceState::Crashed || cell.epoch != expected_epoch {
                return;
            }
            let Some(params) = cell.params.clone() else {
                cell.transition(InstanceState::Absent);
                return;
            };
            cell.transition(InstanceState::Starting);
            params
        };

        match self.launch_locked(&slot, tenant, &params).await {
            Ok(_) => {}
            Err(err) => {
                tracing::error!(tenant = %tenant, error = %err, "crash relaunch failed");
                let mut cell = slot.cell.lock().expect("cell lock poisoned");
                cell.instance = None;
                cell.transition(InstanceState::Absent);
            }
        }
    }

    /// The proxy saw an upstream failure from an instance believed healthy.
    /// Re-check OS liveness right away; a dead process takes the crash
    /// path instead of being retried forever.
    pub async fn check_liveness(&self, tenant: &TenantId) {
        let Some(slot) = self.existing_slot(tenant).await else {
            return;
        };
        let process = {
            let cell = slot.cell.lock().expect("cell lock poisoned");
            if cell.state != InstanceState::Running {
                return;
            }
            cell.instance
                .as_ref()
                .map(|i| i.process.clone())
                .expect("running without instance")
        };
        if !self.inner.launcher.is_alive(&process).await {
            self.on_process_exit(tenant).await;
        }
    }

    /// Stop every instance; used for process shutdown.
    pub async fn shutdown(&self) {
        let tenants: Vec<TenantId> = {
            let slots = self.inner.slots.read().await;
            slots.keys().cloned().collect()
        };
        let mut handles = Vec::new();
        for tenant in tenants {
            let supervisor = self.clone();
            handles.push(tokio::spawn(async move {
                supervisor.stop(&tenant).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}
