//! Work Agent Configuration
//!
//! Loaded from the mounted ConfigMap file. Every field has a default so a
//! partial file (or no file at all) still yields a usable agent.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default location of the mounted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "WORK_AGENT_CONFIG";

/// Main agent configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Identity of this agent instance
    #[serde(default)]
    pub agent: AgentIdentity,

    /// Worker pool sizes
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Retry backoff for requeued keys
    #[serde(default)]
    pub queue: QueueConfig,

    /// Deadlines for remote calls
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Periodic full resync
    #[serde(default)]
    pub resync: ResyncConfig,

    /// How often a conflicting record write is re-read and retried in place
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    /// Name of the managed cluster, which is also the work namespace on the hub
    #[serde(default)]
    pub cluster_name: String,

    /// Overrides the hash derived from the hub server URL
    #[serde(default)]
    pub hub_hash: Option<String>,

    /// Free-form instance id attached to log output
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Workers draining the finalization queue
    #[serde(default = "default_finalize_workers")]
    pub finalize: usize,

    /// Workers draining the apply queue
    #[serde(default = "default_apply_workers")]
    pub apply: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Delay before the first retry of a failing key
    #[serde(default = "default_base_delay_millis")]
    pub base_delay_millis: u64,

    /// Upper bound for the exponential backoff
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Deadline for a single API server request
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncConfig {
    #[serde(default = "default_resync_seconds")]
    pub interval_seconds: u64,
}

fn default_conflict_retries() -> u32 {
    5
}

fn default_finalize_workers() -> usize {
    4
}

fn default_apply_workers() -> usize {
    4
}

fn default_base_delay_millis() -> u64 {
    5
}

fn default_max_delay_seconds() -> u64 {
    1000
}

fn default_request_seconds() -> u64 {
    30
}

fn default_resync_seconds() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            agent: AgentIdentity::default(),
            workers: WorkerConfig::default(),
            queue: QueueConfig::default(),
            timeouts: TimeoutConfig::default(),
            resync: ResyncConfig::default(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            finalize: default_finalize_workers(),
            apply: default_apply_workers(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            base_delay_millis: default_base_delay_millis(),
            max_delay_seconds: default_max_delay_seconds(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            request_seconds: default_request_seconds(),
        }
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        ResyncConfig {
            interval_seconds: default_resync_seconds(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_millis)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_seconds)
    }
}

impl AgentConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_seconds)
    }

    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync.interval_seconds)
    }

    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.agent.cluster_name.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "agent.clusterName must be set (or passed with --cluster-name)"
            ));
        }

        if self.workers.finalize == 0 || self.workers.apply == 0 {
            return Err(anyhow::anyhow!(
                "workers.finalize and workers.apply must both be at least 1"
            ));
        }

        if self.queue.base_delay() > self.queue.max_delay() {
            return Err(anyhow::anyhow!(format!(
                "queue.baseDelayMillis ({}ms) exceeds queue.maxDelaySeconds ({}s)",
                self.queue.base_delay_millis, self.queue.max_delay_seconds
            )));
        }

        if self.timeouts.request_seconds == 0 || self.resync.interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "timeouts.requestSeconds and resync.intervalSeconds must be positive"
            ));
        }

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: AgentConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }

    /// Resolve the config path (explicit flag, then env, then the mounted default)
    /// and load it, falling back to defaults when the file cannot be read.
    #[must_use]
    pub fn load(explicit_path: Option<&str>) -> Self {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok();
        let config_path = explicit_path
            .or(env_path.as_deref())
            .filter(|path| Path::new(path).exists())
            .unwrap_or(DEFAULT_CONFIG_PATH);

        match Self::from_mounted_file(config_path) {
            Ok(cfg) => {
                info!("Loaded agent configuration from {}", config_path);
                cfg
            }
            Err(err) => {
                warn!(
                    "Failed to load configuration from {}: {}. Using defaults.",
                    config_path, err
                );
                AgentConfig::default()
            }
        }
    }
}
