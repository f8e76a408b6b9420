//! Worker configuration: one TOML document plus `NBSQL_*` overrides.
//!
//! ```toml
//! [pool]
//! max_per_profile = 5
//!
//! [monitor]
//! profile = "local"
//!
//! [[connections]]
//! id = "local"
//! host = "localhost"
//! database = "app"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use nbsql_core::{CoreConfig, CorePaths, MonitorConfig, PipelineConfig};
use nbsql_db::{ConnectionProfile, MemoryProfileStore, PgDriverConfig, PoolConfig, SafetyProfile};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolSection {
    pub max_per_profile: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub probe_after_ms: u64,
    pub probe_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// 0 disables the idle sweeper.
    pub sweep_interval_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_per_profile: 5,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 300_000,
            probe_after_ms: 0,
            probe_timeout_ms: 2_000,
            connect_timeout_ms: 5_000,
            sweep_interval_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionSection {
    pub cancel_grace_ms: u64,
    /// 0 means no default statement timeout.
    pub default_timeout_ms: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 2_000,
            default_timeout_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorSection {
    pub profile: Option<String>,
    /// 0 disables polling; `refresh` still works.
    pub interval_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            profile: None,
            interval_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsSection {
    pub export_dir: PathBuf,
    pub scripts_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        let paths = CorePaths::default();
        Self {
            export_dir: paths.export_dir,
            scripts_dir: paths.scripts_dir,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostgresSection {
    pub application_name: String,
    pub ssl_root_cert: Option<PathBuf>,
}

impl Default for PostgresSection {
    fn default() -> Self {
        Self {
            application_name: "nbsql".to_string(),
            ssl_root_cert: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool: PoolSection,
    pub execution: ExecutionSection,
    pub monitor: MonitorSection,
    pub paths: PathsSection,
    pub postgres: PostgresSection,
    pub connections: Vec<ConnectionProfile>,
    pub safety_profiles: Vec<SafetyProfile>,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: String) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{name}: cannot parse '{value}'"))
}

impl WorkerConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid worker configuration")
    }

    /// Reads `path` (or starts from defaults), applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(value) = lookup("NBSQL_POOL_MAX") {
            self.pool.max_per_profile = parse_env("NBSQL_POOL_MAX", value)?;
        }
        if let Some(value) = lookup("NBSQL_DEFAULT_TIMEOUT_MS") {
            self.execution.default_timeout_ms = parse_env("NBSQL_DEFAULT_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("NBSQL_MONITOR_PROFILE") {
            let value = value.trim().to_string();
            self.monitor.profile = (!value.is_empty()).then_some(value);
        }
        if let Some(value) = lookup("NBSQL_MONITOR_INTERVAL_MS") {
            self.monitor.interval_ms = parse_env("NBSQL_MONITOR_INTERVAL_MS", value)?;
        }
        if let Some(value) = lookup("NBSQL_EXPORT_DIR") {
            self.paths.export_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("NBSQL_SCRIPTS_DIR") {
            self.paths.scripts_dir = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.max_per_profile == 0 {
            bail!("pool.max_per_profile must be at least 1");
        }
        if let Some(profile) = &self.monitor.profile {
            if !self.connections.iter().any(|c| &c.id == profile) {
                bail!("monitor.profile '{profile}' is not a configured connection");
            }
        }
        Ok(())
    }

    pub fn profile_store(&self) -> anyhow::Result<MemoryProfileStore> {
        MemoryProfileStore::new(self.connections.clone(), self.safety_profiles.clone())
            .context("invalid profiles")
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            pool: PoolConfig {
                max_per_profile: self.pool.max_per_profile,
                acquire_timeout: millis(self.pool.acquire_timeout_ms),
                idle_timeout: millis(self.pool.idle_timeout_ms),
                probe_after: millis(self.pool.probe_after_ms),
                probe_timeout: millis(self.pool.probe_timeout_ms),
                connect_timeout: millis(self.pool.connect_timeout_ms),
            },
            pipeline: PipelineConfig {
                cancel_grace: millis(self.execution.cancel_grace_ms),
                default_timeout: (self.execution.default_timeout_ms > 0)
                    .then(|| millis(self.execution.default_timeout_ms)),
            },
            monitor: MonitorConfig {
                profile: self.monitor.profile.clone(),
                interval: millis(self.monitor.interval_ms),
            },
            paths: CorePaths {
                export_dir: self.paths.export_dir.clone(),
                scripts_dir: self.paths.scripts_dir.clone(),
            },
            sweep_interval: millis(self.pool.sweep_interval_ms),
        }
    }

    pub fn pg_driver_config(&self) -> PgDriverConfig {
        PgDriverConfig {
            connect_timeout: millis(self.pool.connect_timeout_ms),
            application_name: self.postgres.application_name.clone(),
            ssl_root_cert: self.postgres.ssl_root_cert.clone(),
        }
    }
}
