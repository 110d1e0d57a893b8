mod file_config;

pub use file_config::FileConfig;

use crate::access::{ExistingPrincipalPolicy, HashCost, Secret};
use crate::bootstrap::{BootstrapPlan, PrincipalSpec};
use crate::data_store::{Scope, StoreOptions};
use crate::expiry::DEFAULT_REAP_INTERVAL;
use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// CLI arguments that can be used for config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub store_path: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub scope: Option<String>,
    pub admin_user: Option<String>,
    pub admin_pass: Option<Secret>,
    pub app_user: Option<String>,
    pub app_pass: Option<Secret>,
    pub strict_principals: bool,
    pub reap_interval_secs: Option<u64>,
}

/// Settings shared by every command. The scope and the principals are only needed
/// to bootstrap, so they stay optional until `bootstrap_plan` asks for them.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_path: PathBuf,
    pub timeout: Duration,
    pub scope: Option<Scope>,
    pub admin_user: Option<String>,
    pub admin_pass: Option<Secret>,
    pub app_user: Option<String>,
    pub app_pass: Option<Secret>,
    pub policy: ExistingPrincipalPolicy,
    pub reap_interval: Duration,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_empty_secret(secret: Option<&Secret>) -> Option<Secret> {
    secret.filter(|secret| !secret.is_empty()).cloned()
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let store_path = file
            .store_path
            .map(PathBuf::from)
            .or_else(|| cli.store_path.clone())
            .ok_or_else(|| {
                anyhow!("store path must be specified via --store-path, DOCK_STORE_PATH or the config file")
            })?;
        if store_path.is_dir() {
            bail!("store path is a directory: {:?}", store_path);
        }

        let timeout_ms = file
            .timeout_ms
            .or(cli.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            bail!("timeout must be positive");
        }

        let scope = non_empty(file.scope.or_else(|| cli.scope.clone()))
            .map(Scope::new)
            .transpose()?;
        if scope.as_ref().is_some_and(Scope::is_admin) {
            bail!("the application scope cannot be {}", Scope::ADMIN);
        }

        let policy = if file.strict_principals.unwrap_or(cli.strict_principals) {
            ExistingPrincipalPolicy::Fail
        } else {
            ExistingPrincipalPolicy::Ignore
        };

        let reap_interval = file
            .reap_interval_secs
            .or(cli.reap_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REAP_INTERVAL);
        if reap_interval.is_zero() {
            bail!("reap interval must be positive");
        }

        Ok(Self {
            store_path,
            timeout: Duration::from_millis(timeout_ms),
            scope,
            admin_user: non_empty(file.admin_user.or_else(|| cli.admin_user.clone())),
            admin_pass: non_empty_secret(cli.admin_pass.as_ref()),
            app_user: non_empty(file.app_user.or_else(|| cli.app_user.clone())),
            app_pass: non_empty_secret(cli.app_pass.as_ref()),
            policy,
            reap_interval,
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            timeout: self.timeout,
        }
    }

    /// Fails when a setting only the bootstrap needs is missing. The application
    /// principal falls back to the admin credentials.
    pub fn bootstrap_plan(&self) -> Result<BootstrapPlan> {
        let app_scope = self
            .scope
            .clone()
            .ok_or_else(|| anyhow!("scope must be specified via --scope, DOCK_DB or the config file"))?;
        let admin_user = self.admin_user.clone().ok_or_else(|| {
            anyhow!("admin user must be specified via --admin-user, DOCK_ADMIN_USER or the config file")
        })?;
        let admin_pass = self
            .admin_pass
            .clone()
            .ok_or_else(|| anyhow!("admin secret must be specified via --admin-pass or DOCK_ADMIN_PASS"))?;

        Ok(BootstrapPlan {
            app_scope,
            app: PrincipalSpec {
                name: self.app_user.clone().unwrap_or_else(|| admin_user.clone()),
                secret: self.app_pass.clone().unwrap_or_else(|| admin_pass.clone()),
            },
            admin: PrincipalSpec {
                name: admin_user,
                secret: admin_pass,
            },
            policy: self.policy,
            hash_cost: HashCost::default(),
        })
    }
}
