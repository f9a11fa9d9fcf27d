// SPDX-License-Identifier: PolyForm-Shield-1.0

//! TOML configuration for the easel host.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8000"
//! observe = "127.0.0.1:8001"
//! cors_origins = ["http://localhost:3000", "https://*.vercel.app"]
//!
//! [lifecycle]
//! load_timeout_secs = 900
//! on_busy = "wait"
//! busy_wait_secs = 60
//!
//! [models.flux-dev.worker]
//! command = "python3"
//! args = ["workers/diffusers_worker.py"]
//! endpoint = "http://127.0.0.1:9101"
//! ```
//!
//! Every section is optional; a missing file yields the defaults.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use protocol::{ModelConfig, ModelName};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("[models.{0}] does not name a known model")]
    UnknownModel(String),

    #[error("[models.{0}] is a two-stage model and needs a [models.{0}.refiner] worker")]
    MissingRefiner(ModelName),

    #[error("invalid [{section}] value: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Observe websocket listener; disabled when unset.
    pub observe: Option<SocketAddr>,
    /// Allowed CORS origins. Empty allows any; one `*` per entry is a wildcard.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            observe: None,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnBusy {
    FailFast,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub load_timeout_secs: u64,
    pub render_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub teardown_timeout_secs: u64,
    pub on_busy: OnBusy,
    pub busy_wait_secs: u64,
    pub busy_poll_ms: u64,
    /// Route every model switch through one lock.
    pub serialize_switches: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: 900,
            render_timeout_secs: 600,
            drain_timeout_secs: 30,
            teardown_timeout_secs: 120,
            on_busy: OnBusy::FailFast,
            busy_wait_secs: 60,
            busy_poll_ms: 250,
            serialize_switches: false,
        }
    }
}

impl LifecycleConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    pub fn busy_wait(&self) -> Duration {
        Duration::from_secs(self.busy_wait_secs)
    }

    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub ready_poll_ms: u64,
    pub ready_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            ready_poll_ms: 500,
            ready_timeout_secs: 600,
        }
    }
}

impl WorkerSection {
    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EaselConfig {
    pub server: ServerConfig,
    pub lifecycle: LifecycleConfig,
    pub worker: WorkerSection,
    /// Keyed by model name as written in the file; see [`EaselConfig::models`].
    #[serde(rename = "models")]
    pub raw_models: BTreeMap<String, ModelConfig>,
}

impl EaselConfig {
    pub fn from_toml_str(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let config: EaselConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lifecycle.on_busy == OnBusy::Wait && self.lifecycle.busy_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                section: "lifecycle",
                reason: "busy_poll_ms must be positive when on_busy = \"wait\"".into(),
            });
        }
        if self.worker.ready_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                section: "worker",
                reason: "ready_poll_ms must be positive".into(),
            });
        }
        self.models().map(|_| ())
    }

    /// Model table keyed by parsed name.
    pub fn models(&self) -> Result<HashMap<ModelName, ModelConfig>, ConfigError> {
        self.raw_models
            .iter()
            .map(|(name, cfg)| {
                let model: ModelName = name
                    .parse()
                    .map_err(|_| ConfigError::UnknownModel(name.clone()))?;
                if model.is_two_stage() && cfg.refiner.is_none() {
                    return Err(ConfigError::MissingRefiner(model));
                }
                Ok((model, cfg.clone()))
            })
            .collect()
    }
}

/// Load configuration from `path`. A missing file is not an error.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<EaselConfig, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => EaselConfig::from_toml_str(path, &contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EaselConfig::default()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
