//! Config Provisioner collaborator
//!
//! Materializes the per-tenant bot config file the launcher points the
//! process at. The bundled implementation keeps one working directory per
//! tenant (`users/{tenant}/user_data/`), seeded from a template on first
//! use, and rewrites `config.json` with the allocated port and credential
//! on every start.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::types::{Credential, ProvisioningParams, TenantId};

/// Contract between the supervisor and config materialization.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigProvisioner: Send + Sync {
    /// Write the tenant's config for a fresh instance lifetime and return
    /// its path. Any failure here means the instance failed to start.
    async fn provision(
        &self,
        tenant: &TenantId,
        port: u16,
        credential: &Credential,
        params: &ProvisioningParams,
    ) -> Result<PathBuf>;
}

/// File-backed provisioner reproducing the platform's on-disk layout.
pub struct JsonConfigProvisioner {
    users_dir: PathBuf,
    template_dir: PathBuf,
}

impl JsonConfigProvisioner {
    pub fn new(platform_dir: impl Into<PathBuf>) -> Self {
        let platform_dir = platform_dir.into();
        Self {
            users_dir: platform_dir.join("users"),
            template_dir: platform_dir.join("user_data_template"),
        }
    }

    fn user_dir(&self, tenant: &TenantId) -> PathBuf {
        self.users_dir.join(tenant.as_str()).join("user_data")
    }

    fn config_path(&self, tenant: &TenantId) -> PathBuf {
        self.user_dir(tenant).join("config.json")
    }

    /// Seed the template directory with a minimal dry-run config when the
    /// operator has not provided one.
    async fn ensure_template(&self) -> Result<()> {
        fs::create_dir_all(&self.template_dir)
            .await
            .context("failed to create template directory")?;

        let template_cfg = self.template_dir.join("config.json");
        if fs::try_exists(&template_cfg).await.unwrap_or(false) {
            return Ok(());
        }

        let config = json!({
            "max_open_trades": 3,
            "stake_currency": "USDT",
            "stake_amount": "unlimited",
            "dry_run": true,
            "dry_run_wallet": 1000,
            "force_entry_enable": true,
            "timeframe": "5m",
            "api_server": {
                "enabled": true,
                "listen_ip": "127.0.0.1",
                "port": 0,
                "username": "",
                "password": "",
                "jwt_secret_key": "",
                "enable_openapi": false,
            },
            "exchange": {
                "name": "binance",
                "key": "",
                "secret": "",
                "pair_whitelist": ["BTC/USDT", "ETH/USDT"],
                "pair_blacklist": [],
            },
            "pairlists": [{"method": "StaticPairList"}],
        });

        fs::write(&template_cfg, serde_json::to_vec_pretty(&config)?)
            .await
            .context("failed to write template config")?;
        Ok(())
    }

    /// Create `users/{tenant}/user_data/` from the template if missing.
    async fn ensure_user_dir(&self, tenant: &TenantId) -> Result<()> {
        let target = self.user_dir(tenant);
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(());
        }
        self.ensure_template().await?;
        copy_dir_recursive(&self.template_dir, &target)
            .await
            .context("failed to seed tenant working directory")?;
        fs::create_dir_all(target.join("strategies"))
            .await
            .context("failed to create strategies directory")?;
        Ok(())
    }

    async fn read_existing(&self, path: &Path) -> Map<String, Value> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            Err(_) => Map::new(),
        }
    }
}

#[async_trait]
impl ConfigProvisioner for JsonConfigProvisioner {
    async fn provision(
        &self,
        tenant: &TenantId,
        port: u16,
        credential: &Credential,
        params: &ProvisioningParams,
    ) -> Result<PathBuf> {
        self.ensure_user_dir(tenant).await?;

        let cfg_path = self.config_path(tenant);
        let mut config = self.read_existing(&cfg_path).await;

        // Tenant-tunable fields keep whatever is already on disk.
        config
            .entry("max_open_trades".to_string())
            .or_insert(json!(3));
        config
            .entry("stake_currency".to_string())
            .or_insert(json!("USDT"));
        config
            .entry("stake_amount".to_string())
            .or_insert(json!("unlimited"));
        config
            .entry("force_entry_enable".to_string())
            .or_insert(json!(true));
        config.entry("timeframe".to_string()).or_insert(json!("5m"));

        // Supervisor-owned fields are overwritten every lifetime.
        config.insert("dry_run".to_string(), json!(true));
        config.insert("dry_run_wallet".to_string(), json!(params.initial_balance));
        config.insert(
            "api_server".to_string(),
            json!({
                "enabled": true,
                "listen_ip": "127.0.0.1",
                "port": port,
                "username": credential.username,
                "password": credential.password,
                "jwt_secret_key": credential.jwt_secret,
                "enable_openapi": false,
            }),
        );

        let exchange = config
            .entry("exchange".to_string())
            .or_insert_with(|| json!({}));
        if let Some(exchange) = exchange.as_object_mut() {
            exchange.entry("name".to_string()).or_insert(json!("binance"));
            exchange.entry("key".to_string()).or_insert(json!(""));
            exchange.entry("secret".to_string()).or_insert(json!(""));
            exchange
                .entry("pair_blacklist".to_string())
                .or_insert(json!([]));
            exchange.insert(
                "pair_whitelist".to_string(),
                json!(params.pair_whitelist),
            );
        }

        fs::write(&cfg_path, serde_json::to_vec_pretty(&Value::Object(config))?)
            .await
            .with_context(|| format!("failed to write config for tenant {tenant}"))?;

        Ok(cfg_path)
    }
}

/// Minimal recursive directory copy (the template tree is tiny).
fn copy_dir_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let ty = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if ty.is_dir() {
                copy_dir_recursive(&entry.path(), &target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params_with_pairs(pairs: &[&str]) -> ProvisioningParams {
        ProvisioningParams {
            initial_balance: 2500.0,
            pair_whitelist: pairs.iter().map(|p| p.to_string()).collect(),
            strategy: None,
        }
    }

    #[tokio::test]
    async fn provision_writes_api_server_and_whitelist() {
        let dir = TempDir::new().unwrap();
        let provisioner = JsonConfigProvisioner::new(dir.path());
        let tenant = TenantId::from("tenant-a");
        let cred = Credential::generate(&tenant);

        let path = provisioner
            .provision(&tenant, 18881, &cred, &params_with_pairs(&["SOL/USDT"]))
            .await
            .unwrap();

        let cfg: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(cfg["dry_run"], json!(true));
        assert_eq!(cfg["dry_run_wallet"], json!(2500.0));
        assert_eq!(cfg["api_server"]["port"], json!(18881));
        assert_eq!(cfg["api_server"]["listen_ip"], json!("127.0.0.1"));
        assert_eq!(cfg["api_server"]["username"], json!("tenant-a"));
        assert_eq!(cfg["api_server"]["password"], json!(cred.password));
        assert_eq!(cfg["exchange"]["pair_whitelist"], json!(["SOL/USDT"]));
    }

    #[tokio::test]
    async fn reprovision_rotates_credential_but_keeps_tenant_fields() {
        let dir = TempDir::new().unwrap();
        let provisioner = JsonConfigProvisioner::new(dir.path());
        let tenant = TenantId::from("tenant-a");

        let first = Credential::generate(&tenant);
        let path = provisioner
            .provision(&tenant, 18881, &first, &params_with_pairs(&["BTC/USDT"]))
            .await
            .unwrap();

        // Simulate a tenant-tuned field between lifetimes.
        let mut cfg: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        cfg["max_open_trades"] = json!(7);
        std::fs::write(&path, serde_json::to_vec_pretty(&cfg).unwrap()).unwrap();

        let second = Credential::generate(&tenant);
        provisioner
            .provision(&tenant, 18882, &second, &params_with_pairs(&["BTC/USDT"]))
            .await
            .unwrap();

        let cfg: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(cfg["max_open_trades"], json!(7));
        assert_eq!(cfg["api_server"]["port"], json!(18882));
        assert_eq!(cfg["api_server"]["password"], json!(second.password));
        assert_ne!(first.password, second.password);
    }

    #[tokio::test]
    async fn seeds_user_dir_from_template_once() {
        let dir = TempDir::new().unwrap();
        let provisioner = JsonConfigProvisioner::new(dir.path());
        let tenant = TenantId::from("tenant-a");
        let cred = Credential::generate(&tenant);

        provisioner
            .provision(&tenant, 18881, &cred, &ProvisioningParams::default())
            .await
            .unwrap();

        assert!(dir.path().join("user_data_template/config.json").exists());
        assert!(dir
            .path()
            .join("users/tenant-a/user_data/strategies")
            .exists());
    }
}
