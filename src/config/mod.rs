use crate::gating::GatingState;
use crate::network::MonitorMode;
use crate::supervisor::Timing;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "RETRIEVAL_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
    #[error("config file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("config i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("config serialization failed: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub push: PushConfig,
    pub supervisor: SupervisorConfig,
    pub network: NetworkConfig,
}

/// Seed values for the registration and websocket gates.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AccountConfig {
    pub registered: bool,
    pub websocket_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PushConfig {
    pub channel_disabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub read_timeout_secs: u64,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_max_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 60,
            reconnect_backoff_initial_ms: 1000,
            reconnect_backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub monitor: MonitorMode,
    pub probe_enabled: bool,
    pub probe_target: String,
    pub probe_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorMode::Auto,
            probe_enabled: true,
            probe_target: "1.1.1.1:443".to_string(),
            probe_interval_ms: 2000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "config file unreadable; using defaults");
                }
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(format!("{}{}", ENV_PREFIX, name)).ok());
    }

    /// `lookup` receives variable names without the prefix. Unparsable
    /// values are logged and ignored.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "REGISTERED", &mut self.account.registered);
        override_parsed(&lookup, "WEBSOCKET_ENABLED", &mut self.account.websocket_enabled);
        override_parsed(&lookup, "PUSH_DISABLED", &mut self.push.channel_disabled);

        override_parsed(&lookup, "READ_TIMEOUT_SECS", &mut self.supervisor.read_timeout_secs);
        override_parsed(
            &lookup,
            "BACKOFF_INITIAL_MS",
            &mut self.supervisor.reconnect_backoff_initial_ms,
        );
        override_parsed(&lookup, "BACKOFF_MAX_MS", &mut self.supervisor.reconnect_backoff_max_ms);

        override_parsed(&lookup, "NETWORK_MONITOR", &mut self.network.monitor);
        override_parsed(&lookup, "PROBE_ENABLED", &mut self.network.probe_enabled);
        if let Some(val) = lookup("PROBE_TARGET") {
            self.network.probe_target = val;
        }
        override_parsed(&lookup, "PROBE_INTERVAL_MS", &mut self.network.probe_interval_ms);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if s.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.read_timeout_secs must be > 0".into(),
            ));
        }
        if s.reconnect_backoff_initial_ms < 10 {
            return Err(ConfigError::Invalid(
                "supervisor.reconnect_backoff_initial_ms must be >= 10".into(),
            ));
        }
        if s.reconnect_backoff_max_ms < s.reconnect_backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "supervisor.reconnect_backoff_max_ms must be >= reconnect_backoff_initial_ms"
                    .into(),
            ));
        }
        if self.network.probe_enabled {
            self.probe_target()?;
            if self.network.probe_interval_ms < 100 {
                return Err(ConfigError::Invalid(
                    "network.probe_interval_ms must be >= 100".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn probe_target(&self) -> Result<SocketAddr, ConfigError> {
        self.network.probe_target.trim().parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "network.probe_target must be an ip:port address, got {:?}",
                self.network.probe_target
            ))
        })
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.network.probe_interval_ms)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            read_timeout: Duration::from_secs(self.supervisor.read_timeout_secs),
            backoff_initial: Duration::from_millis(self.supervisor.reconnect_backoff_initial_ms),
            backoff_max: Duration::from_millis(self.supervisor.reconnect_backoff_max_ms),
        }
    }

    /// Gate seeds. Reachability starts false until a connectivity source
    /// reports a network.
    pub fn initial_gating_state(&self) -> GatingState {
        GatingState {
            registered: self.account.registered,
            websocket_enabled: self.account.websocket_enabled,
            push_channel_disabled: self.push.channel_disabled,
            ..Default::default()
        }
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(val) = lookup(name) {
        match val.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => {
                tracing::warn!(var = %format!("{}{}", ENV_PREFIX, name), value = %val, "ignoring unparsable override");
            }
        }
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join("MessageRetrieval").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
