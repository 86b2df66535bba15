//! Shared fakes for integration tests
//!
//! In-memory stand-ins for the process launcher, config provisioner and
//! readiness probe so lifecycle tests run without OS processes or sockets.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use botfleet::allocator::Allocator;
use botfleet::config::FleetConfig;
use botfleet::supervisor::{
    ConfigProvisioner, ProcessLauncher, ReadinessProbe, Supervisor,
};
use botfleet::types::{Credential, Endpoint, ProcessHandle, ProvisioningParams, TenantId};

/// Launcher whose "processes" are just liveness flags.
pub struct FakeLauncher {
    procs: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    launches: AtomicU32,
    /// Whether a terminate signal actually stops the process.
    graceful: bool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            procs: Mutex::new(HashMap::new()),
            launches: AtomicU32::new(0),
            graceful: true,
        })
    }

    /// A launcher whose processes ignore the terminate signal and only die
    /// on force kill.
    pub fn stubborn() -> Arc<Self> {
        Arc::new(Self {
            procs: Mutex::new(HashMap::new()),
            launches: AtomicU32::new(0),
            graceful: false,
        })
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulate every process dying unexpectedly.
    pub fn kill_all(&self) {
        for flag in self.procs.lock().unwrap().values() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn flag(&self, handle: &ProcessHandle) -> Option<Arc<AtomicBool>> {
        self.procs.lock().unwrap().get(&handle.id()).cloned()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, _config_path: &Path, _strategy: &str) -> Result<ProcessHandle> {
        let handle = ProcessHandle::external();
        self.procs
            .lock()
            .unwrap()
            .insert(handle.id(), Arc::new(AtomicBool::new(true)));
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn signal_terminate(&self, handle: &ProcessHandle) {
        if self.graceful {
            if let Some(flag) = self.flag(handle) {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.flag(handle)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn force_kill(&self, handle: &ProcessHandle) {
        if let Some(flag) = self.flag(handle) {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Records every provisioned (tenant, port, password) without touching disk.
#[derive(Default)]
pub struct RecordingProvisioner {
    pub calls: Mutex<Vec<(String, u16, String)>>,
}

impl RecordingProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn passwords_for(&self, tenant: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == tenant)
            .map(|(_, _, password)| password.clone())
            .collect()
    }
}

#[async_trait]
impl ConfigProvisioner for RecordingProvisioner {
    async fn provision(
        &self,
        tenant: &TenantId,
        port: u16,
        credential: &Credential,
        _params: &ProvisioningParams,
    ) -> Result<PathBuf> {
        self.calls.lock().unwrap().push((
            tenant.as_str().to_string(),
            port,
            credential.password.clone(),
        ));
        Ok(PathBuf::from("/tmp/fake-config.json"))
    }
}

/// Probe that reports ready as soon as the process is launched.
pub struct AlwaysReadyProbe;

#[async_trait]
impl ReadinessProbe for AlwaysReadyProbe {
    async fn ready(&self, _endpoint: &Endpoint) -> bool {
        true
    }
}

/// Fleet knobs tuned for fast, clock-paused tests.
pub fn test_fleet() -> FleetConfig {
    FleetConfig {
        port_base: 19000,
        port_max: 19049,
        platform_dir: "/tmp".into(),
        bot_command: "bot".into(),
        bot_args: vec!["--config".into(), "{config}".into()],
        default_strategy: "SampleStrategy".into(),
        idle_timeout_secs: 1800,
        max_restarts: 3,
        restart_backoff_ms: 100,
        restart_backoff_cap_ms: 5000,
        crash_window_secs: 300,
        startup_timeout_secs: 5,
        startup_probe_interval_ms: 50,
        stop_grace_secs: 2,
        watchdog_interval_secs: 1,
        liveness_check_timeout_ms: 500,
        upstream_timeout_secs: 1,
    }
}

pub fn build_supervisor(
    fleet: FleetConfig,
    launcher: Arc<FakeLauncher>,
    provisioner: Arc<RecordingProvisioner>,
) -> Supervisor {
    let allocator = Arc::new(Allocator::new(fleet.port_base, fleet.port_max));
    Supervisor::new(
        fleet,
        allocator,
        launcher,
        provisioner,
        Arc::new(AlwaysReadyProbe),
    )
}
