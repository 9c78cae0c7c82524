//! FleetStack settings
//!
//! Tool-level settings (state location, timeouts, sidecar images). Stack
//! graphs themselves are not configured here.

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATH_ENV: &str = "FLEETSTACK_CONFIG_PATH";
const DEPLOY_TIMEOUT_ENV: &str = "FLEETSTACK_DEPLOY_TIMEOUT";
const INIT_JOB_TIMEOUT_ENV: &str = "FLEETSTACK_INIT_JOB_TIMEOUT";

const CANDIDATES: [&str; 4] = [
    "fleetstack.local.yaml",
    ".fleetstack.local.yaml",
    "fleetstack.yaml",
    ".fleetstack.yaml",
];

/// Tool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Directory holding state and published exports
    pub state_dir: PathBuf,

    /// Cloud project the simulated engine pretends to run in
    pub project: String,

    /// Upper bound on one stack's deploy
    pub deploy_timeout_secs: u64,

    /// Upper bound on one init job, independent of the deploy timeout
    pub init_job_timeout_secs: u64,

    /// Lifetime ceiling of the throwaway proxy inside an init job
    pub proxy_ceiling_secs: u64,

    /// Cloud SQL Auth Proxy image
    pub cloudsql_proxy_image: String,

    /// Image running psql inside init jobs
    pub postgres_client_image: String,

    /// Resources of one stack provisioned at the same time
    pub max_concurrent_resources: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".fleetstack"),
            project: "fleetstack-sim".to_string(),
            deploy_timeout_secs: 1800,
            init_job_timeout_secs: 300,
            proxy_ceiling_secs: 240,
            cloudsql_proxy_image: "gcr.io/cloud-sql-connectors/cloud-sql-proxy:2.11.4"
                .to_string(),
            postgres_client_image: "postgres:16-alpine".to_string(),
            max_concurrent_resources: 8,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    fn from_yaml(content: &str) -> std::result::Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    /// Apply `FLEETSTACK_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(secs) = env_secs(DEPLOY_TIMEOUT_ENV)? {
            self.deploy_timeout_secs = secs;
        }
        if let Some(secs) = env_secs(INIT_JOB_TIMEOUT_ENV)? {
            self.init_job_timeout_secs = secs;
        }
        Ok(())
    }

    /// Reject values no deploy could work with
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("deployTimeoutSecs", self.deploy_timeout_secs),
            ("initJobTimeoutSecs", self.init_job_timeout_secs),
            ("proxyCeilingSecs", self.proxy_ceiling_secs),
            ("maxConcurrentResources", self.max_concurrent_resources as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    pub fn init_job_timeout(&self) -> Duration {
        Duration::from_secs(self.init_job_timeout_secs)
    }

    pub fn proxy_ceiling(&self) -> Duration {
        Duration::from_secs(self.proxy_ceiling_secs)
    }
}

fn env_secs(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// FleetStack's global config directory
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("fleetstack"))
}

/// Find the settings file.
///
/// Search order:
/// 1. `FLEETSTACK_CONFIG_PATH`
/// 2. current directory: fleetstack.local.yaml, .fleetstack.local.yaml, fleetstack.yaml, .fleetstack.yaml
/// 3. `./.fleetstack/` with the same candidates
/// 4. `<config dir>/fleetstack/fleetstack.yaml`
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        tracing::warn!("{} points to missing file {}", CONFIG_PATH_ENV, path.display());
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    let state_dir = current_dir.join(".fleetstack");
    if state_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = state_dir.join(filename);
            if path.exists() {
                return Ok(Some(path));
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("fleetstack").join("fleetstack.yaml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

/// Discover, load and validate settings.
///
/// Without a settings file the defaults apply.
pub fn load_settings() -> Result<Settings> {
    let mut settings = match find_config_file()? {
        Some(path) => {
            tracing::debug!("Loading settings from {}", path.display());
            Settings::from_file(&path)?
        }
        None => {
            tracing::debug!("No settings file found, using defaults");
            Settings::default()
        }
    };
    settings.apply_env_overrides()?;
    settings.validate()?;
    Ok(settings)
}
