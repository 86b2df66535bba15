//! Process Launcher collaborator
//!
//! The supervisor drives OS processes only through this narrow contract;
//! how a bot actually runs (local child, container, remote runner) is the
//! launcher's business.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::FleetConfig;
use crate::types::ProcessHandle;

/// Contract between the supervisor and whatever spawns bot processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn a bot process configured by the materialized config file.
    async fn launch(&self, config_path: &Path, strategy: &str) -> Result<ProcessHandle>;

    /// Ask the process to shut down gracefully.
    async fn signal_terminate(&self, handle: &ProcessHandle);

    /// Whether the process is still running. Must return promptly; the
    /// watchdog treats a slow or failed check as a crash signal.
    async fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// Hard-kill the process. Called after the stop grace period expires.
    async fn force_kill(&self, handle: &ProcessHandle);
}

/// Launches bot processes as local children via `tokio::process::Command`.
pub struct CommandLauncher {
    command: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandLauncher {
    pub fn new(fleet: &FleetConfig) -> Self {
        Self {
            command: fleet.bot_command.clone(),
            args: fleet.bot_args.clone(),
            workdir: PathBuf::from(&fleet.platform_dir),
        }
    }

    /// Expand `{config}` / `{strategy}` placeholders in the arg template.
    fn render_args(&self, config_path: &Path, strategy: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{config}", &config_path.to_string_lossy())
                    .replace("{strategy}", strategy)
            })
            .collect()
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, config_path: &Path, strategy: &str) -> Result<ProcessHandle> {
        let args = self.render_args(config_path, strategy);

        tracing::debug!(command = %self.command, ?args, "spawning bot process");

        let child = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.workdir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn bot process `{}`", self.command))?;

        Ok(ProcessHandle::local(child))
    }

    async fn signal_terminate(&self, handle: &ProcessHandle) {
        #[cfg(unix)]
        if let Some(pid) = handle.pid() {
            // SIGTERM first; force_kill escalates after the grace period.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }

        // No pid (already reaped) or non-unix target: escalate directly.
        self.force_kill(handle).await;
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let Some(child) = handle.child() else {
            return false;
        };
        let mut child = child.lock().await;
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(err) => {
                tracing::warn!(error = %err, "liveness check failed, treating as dead");
                false
            }
        }
    }

    async fn force_kill(&self, handle: &ProcessHandle) {
        let Some(child) = handle.child() else {
            return;
        };
        let mut child = child.lock().await;
        if let Err(err) = child.kill().await {
            tracing::debug!(error = %err, "force kill failed (process likely already gone)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet_with_command(command: &str, args: &[&str]) -> FleetConfig {
        FleetConfig {
            port_base: 19000,
            port_max: 19010,
            platform_dir: "/tmp".into(),
            bot_command: command.into(),
            bot_args: args.iter().map(|s| s.to_string()).collect(),
            default_strategy: "SampleStrategy".into(),
            idle_timeout_secs: 1800,
            max_restarts: 3,
            restart_backoff_ms: 500,
            restart_backoff_cap_ms: 30_000,
            crash_window_secs: 300,
            startup_timeout_secs: 30,
            startup_probe_interval_ms: 250,
            stop_grace_secs: 10,
            watchdog_interval_secs: 5,
            liveness_check_timeout_ms: 2000,
            upstream_timeout_secs: 15,
        }
    }

    #[test]
    fn renders_placeholders_into_args() {
        let fleet = fleet_with_command(
            "freqtrade",
            &["trade", "--config", "{config}", "--strategy", "{strategy}"],
        );
        let launcher = CommandLauncher::new(&fleet);
        let args = launcher.render_args(Path::new("/data/u1/config.json"), "Momentum");

        assert_eq!(
            args,
            vec![
                "trade",
                "--config",
                "/data/u1/config.json",
                "--strategy",
                "Momentum"
            ]
        );
    }

    #[tokio::test]
    async fn launch_and_liveness_roundtrip() {
        let fleet = fleet_with_command("sleep", &["30"]);
        let launcher = CommandLauncher::new(&fleet);

        let handle = launcher
            .launch(Path::new("/dev/null"), "SampleStrategy")
            .await
            .unwrap();
        assert!(launcher.is_alive(&handle).await);

        launcher.force_kill(&handle).await;
        assert!(!launcher.is_alive(&handle).await);
    }

    #[tokio::test]
    async fn terminate_signal_stops_child() {
        let fleet = fleet_with_command("sleep", &["30"]);
        let launcher = CommandLauncher::new(&fleet);

        let handle = launcher
            .launch(Path::new("/dev/null"), "SampleStrategy")
            .await
            .unwrap();
        launcher.signal_terminate(&handle).await;

        // SIGTERM delivery is asynchronous; poll briefly.
        for _ in 0..50 {
            if !launcher.is_alive(&handle).await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("child survived SIGTERM");
    }

    #[tokio::test]
    async fn detached_handle_reports_dead() {
        let fleet = fleet_with_command("sleep", &["30"]);
        let launcher = CommandLauncher::new(&fleet);
        let handle = ProcessHandle::external();
        assert!(!launcher.is_alive(&handle).await);
    }
}
