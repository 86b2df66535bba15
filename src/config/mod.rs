//! Configuration management for BotFleet
//!
//! Loads from TOML/YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub fleet: FleetConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Front-door listen port
    pub listen_port: u16,
    /// Bind address for the front door
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// First port handed out to instances
    pub port_base: u16,
    /// Last port handed out to instances (inclusive)
    pub port_max: u16,
    /// Root directory for per-tenant working directories
    pub platform_dir: String,
    /// Executable used to launch a bot process
    pub bot_command: String,
    /// Arguments for the bot process; `{config}` expands to the config path,
    /// `{strategy}` to the tenant's strategy name
    pub bot_args: Vec<String>,
    /// Strategy used when the tenant does not name one
    pub default_strategy: String,
    /// Stop an instance after this long without a proxied request
    pub idle_timeout_secs: u64,
    /// Consecutive unexpected exits tolerated before giving up
    pub max_restarts: u32,
    /// Base delay before a crash relaunch; doubles per consecutive crash
    pub restart_backoff_ms: u64,
    /// Upper bound on the crash relaunch delay
    pub restart_backoff_cap_ms: u64,
    /// Uptime after which a crash is no longer "consecutive" and the
    /// restart budget resets
    pub crash_window_secs: u64,
    /// How long a launched process may take to answer its health probe
    pub startup_timeout_secs: u64,
    /// Pause between health-probe attempts during startup
    pub startup_probe_interval_ms: u64,
    /// Grace period between terminate signal and force kill
    pub stop_grace_secs: u64,
    /// Watchdog sweep interval
    pub watchdog_interval_secs: u64,
    /// Per-check bound on an OS liveness probe inside the sweep
    pub liveness_check_timeout_ms: u64,
    /// Timeout for proxied calls to an instance
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Start/stop calls allowed per window per tenant
    pub control_per_window: u32,
    /// Trade-action calls allowed per window per tenant
    pub trade_per_window: u32,
    /// Rate-limit window length
    pub window_secs: u64,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Server defaults
            .set_default("server.listen_port", 8080)?
            .set_default("server.listen_addr", "0.0.0.0")?
            // Fleet defaults
            .set_default("fleet.port_base", 18880)?
            .set_default("fleet.port_max", 19999)?
            .set_default("fleet.platform_dir", "./fleet-data")?
            .set_default("fleet.bot_command", "freqtrade")?
            .set_default(
                "fleet.bot_args",
                vec!["trade", "--config", "{config}", "--strategy", "{strategy}"],
            )?
            .set_default("fleet.default_strategy", "SampleStrategy")?
            .set_default("fleet.idle_timeout_secs", 1800)?
            .set_default("fleet.max_restarts", 3)?
            .set_default("fleet.restart_backoff_ms", 500)?
            .set_default("fleet.restart_backoff_cap_ms", 30_000)?
            .set_default("fleet.crash_window_secs", 300)?
            .set_default("fleet.startup_timeout_secs", 30)?
            .set_default("fleet.startup_probe_interval_ms", 250)?
            .set_default("fleet.stop_grace_secs", 10)?
            .set_default("fleet.watchdog_interval_secs", 5)?
            .set_default("fleet.liveness_check_timeout_ms", 2000)?
            .set_default("fleet.upstream_timeout_secs", 15)?
            // Rate-limit defaults
            .set_default("limits.control_per_window", 5)?
            .set_default("limits.trade_per_window", 10)?
            .set_default("limits.window_secs", 60)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (BOTFLEET_*)
            .add_source(Environment::with_prefix("BOTFLEET").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject configurations the supervisor cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.fleet.port_base > self.fleet.port_max {
            bail!(
                "fleet.port_base ({}) must not exceed fleet.port_max ({})",
                self.fleet.port_base,
                self.fleet.port_max
            );
        }
        if self.fleet.restart_backoff_cap_ms < self.fleet.restart_backoff_ms {
            bail!("fleet.restart_backoff_cap_ms must not be below fleet.restart_backoff_ms");
        }
        if self.fleet.bot_command.trim().is_empty() {
            bail!("fleet.bot_command must not be empty");
        }
        if self.limits.window_secs == 0 {
            bail!("limits.window_secs must be positive");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "listen={}:{} ports={}..={} idle_timeout={}s max_restarts={} watchdog={}s",
            self.server.listen_addr,
            self.server.listen_port,
            self.fleet.port_base,
            self.fleet.port_max,
            self.fleet.idle_timeout_secs,
            self.fleet.max_restarts,
            self.fleet.watchdog_interval_secs,
        )
    }
}

impl FleetConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn startup_probe_interval(&self) -> Duration {
        Duration::from_millis(self.startup_probe_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn liveness_check_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_check_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Delay before relaunching after the `restart_count`-th consecutive
    /// crash: `restart_backoff_ms * 2^restart_count`, capped.
    pub fn restart_backoff(&self, restart_count: u32) -> Duration {
        let base = self.restart_backoff_ms.max(1);
        let factor = 1u64.checked_shl(restart_count).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        Duration::from_millis(delay.min(self.restart_backoff_cap_ms))
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
