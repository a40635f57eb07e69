//! Typed application configuration, loaded from a TOML file with optional
//! environment overrides, validated at construction, covering every key
//! enumerated in `spec.md` §6.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::PollIntervalSecs;
use crate::gateway::{BridgeConfig, GatewayConfig};

/// Errors building or validating an [`AppConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The path that failed to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The TOML file's contents could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// The path whose contents failed to parse.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: Box<toml::de::Error>,
    },
    /// `gateway.token` was missing or empty.
    #[error("gateway.token must be set to a non-empty value")]
    MissingGatewayToken,
    /// A configured `allowed_cwd` prefix could not be resolved to a real
    /// path at load time.
    #[error("bridge '{bridge}' allowed_cwd entry '{entry}' could not be resolved: {source}")]
    UnresolvableCwd {
        /// The bridge the entry belongs to.
        bridge: String,
        /// The configured prefix.
        entry: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Scheduler configuration (`scheduler.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Gates whether the scheduler loop runs at all.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Cycle delay in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_scheduler_enabled() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    30
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Raw, pre-canonicalization bridge configuration as read from TOML
/// (`gateway.bridges.<name>.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Permitted command basenames.
    pub allowed_commands: Vec<String>,
    /// Allowed working-directory prefixes, resolved to real paths at load
    /// time.
    #[serde(default)]
    pub allowed_cwd: Vec<String>,
}

/// Gateway configuration (`gateway.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Bearer secret; absent or empty aborts startup.
    #[serde(default)]
    pub token: String,
    /// Named bridges.
    #[serde(default)]
    pub bridges: HashMap<String, BridgeSettings>,
    /// Fallback timeout seconds when a client request supplies none.
    #[serde(default = "default_gateway_timeout")]
    pub default_timeout: u64,
    /// Address the gateway server binds to.
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_timeout() -> u64 {
    30
}
fn default_gateway_bind() -> String {
    "127.0.0.1:8088".to_string()
}

/// Bridge-manager configuration (the CLI bridge, not the gateway's own
/// `bridges` allowlists).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeManagerSettings {
    /// Path to the external CLI binary.
    pub cli_binary: String,
    /// Directory containing the CLI's per-project session files.
    pub session_dir: PathBuf,
    /// Optional permission-mode flag value.
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Optional overall timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// The gateway bridge name this CLI is reachable under.
    pub gateway_bridge_name: String,
}

/// Router configuration (trigger prefix and per-channel allowlists).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Case-insensitive group-chat trigger prefix.
    #[serde(default = "default_trigger_prefix")]
    pub trigger_prefix: String,
    /// Per-channel allowed user ids; an absent or empty list allows all.
    #[serde(default)]
    pub allowed_user_ids: HashMap<String, Vec<String>>,
}

fn default_trigger_prefix() -> String {
    "/ai".to_string()
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            trigger_prefix: default_trigger_prefix(),
            allowed_user_ids: HashMap::new(),
        }
    }
}

/// Storage paths for the four persisted stores (§6 "Persistence layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Path to the task-store JSON file.
    #[serde(default = "default_tasks_path")]
    pub tasks_path: PathBuf,
    /// Path to the user-state JSON file.
    #[serde(default = "default_user_state_path")]
    pub user_state_path: PathBuf,
    /// Path to the session-counters JSON file.
    #[serde(default = "default_counters_path")]
    pub counters_path: PathBuf,
    /// Directory holding per-thread turn-log JSONL files.
    #[serde(default = "default_turn_log_dir")]
    pub turn_log_dir: PathBuf,
}

fn default_tasks_path() -> PathBuf {
    PathBuf::from("data/tasks.json")
}
fn default_user_state_path() -> PathBuf {
    PathBuf::from("data/user_state.json")
}
fn default_counters_path() -> PathBuf {
    PathBuf::from("data/session_counters.json")
}
fn default_turn_log_dir() -> PathBuf {
    PathBuf::from("data/turns")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            tasks_path: default_tasks_path(),
            user_state_path: default_user_state_path(),
            counters_path: default_counters_path(),
            turn_log_dir: default_turn_log_dir(),
        }
    }
}

/// The full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Gateway settings.
    pub gateway: GatewaySettings,
    /// Bridge-manager settings; absent means the bridge feature is unused.
    #[serde(default)]
    pub bridge: Option<BridgeManagerSettings>,
    /// Router settings.
    #[serde(default)]
    pub router: RouterSettings,
    /// Storage paths.
    #[serde(default)]
    pub storage: StorageSettings,
}

impl AppConfig {
    /// Loads and validates configuration from a TOML file at `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.token.trim().is_empty() {
            return Err(ConfigError::MissingGatewayToken);
        }
        for (name, bridge) in &self.gateway.bridges {
            for entry in &bridge.allowed_cwd {
                std::fs::canonicalize(entry).map_err(|source| ConfigError::UnresolvableCwd {
                    bridge: name.clone(),
                    entry: entry.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Builds the resolved [`GatewayConfig`] used by the gateway server from
    /// this configuration's `gateway.*` section. Allowed-cwd prefixes are
    /// canonicalized here; call after [`AppConfig::load`], which already
    /// validated they exist.
    pub fn to_gateway_config(&self) -> Result<GatewayConfig, ConfigError> {
        let mut bridges = HashMap::new();
        for (name, bridge) in &self.gateway.bridges {
            let mut allowed_cwd = Vec::new();
            for entry in &bridge.allowed_cwd {
                let real = std::fs::canonicalize(entry).map_err(|source| {
                    ConfigError::UnresolvableCwd {
                        bridge: name.clone(),
                        entry: entry.clone(),
                        source,
                    }
                })?;
                allowed_cwd.push(real);
            }
            bridges.insert(
                name.clone(),
                BridgeConfig {
                    allowed_commands: bridge.allowed_commands.iter().cloned().collect(),
                    allowed_cwd,
                },
            );
        }
        Ok(GatewayConfig {
            token: self.gateway.token.clone(),
            bridges,
            default_timeout: self.gateway.default_timeout,
            recursion_guard_vars: crate::gateway::server::DEFAULT_RECURSION_GUARD_VARS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    /// The scheduler's poll interval as a validated domain type, clamped to
    /// a minimum of 1 second per §4.3.
    #[must_use]
    pub fn poll_interval(&self) -> PollIntervalSecs {
        PollIntervalSecs::try_new(self.scheduler.poll_interval.max(1))
            .expect("max(1) guarantees >= 1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_fails_validation() {
        let config = AppConfig {
            scheduler: SchedulerSettings::default(),
            gateway: GatewaySettings {
                token: String::new(),
                bridges: HashMap::new(),
                default_timeout: 30,
                bind: default_gateway_bind(),
            },
            bridge: None,
            router: RouterSettings::default(),
            storage: StorageSettings::default(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingGatewayToken)
        ));
    }

    #[test]
    fn load_parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway]\ntoken = \"secret\"\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.gateway.token, "secret");
        assert_eq!(config.scheduler.poll_interval, 30);
        assert_eq!(config.router.trigger_prefix, "/ai");
    }

    #[test]
    fn poll_interval_is_clamped_to_at_least_one() {
        let mut scheduler = SchedulerSettings::default();
        scheduler.poll_interval = 0;
        let config = AppConfig {
            scheduler,
            gateway: GatewaySettings {
                token: "t".into(),
                bridges: HashMap::new(),
                default_timeout: 30,
                bind: default_gateway_bind(),
            },
            bridge: None,
            router: RouterSettings::default(),
            storage: StorageSettings::default(),
        };
        assert_eq!(config.poll_interval().into_inner(), 1);
    }
}
