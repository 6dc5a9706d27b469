/// Configuration management for the flowrelay coordinator
///
/// Handles server binding, the database location, execution tunables and
/// worker sizing. Every value can be overridden through `FLOWRELAY_*`
/// environment variables.

use crate::runtime::{coordinator::CoordinatorSettings, kv::MAX_TTL};
use crate::workflow::types::DispatchCategory;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Run execution tunables
    pub execution: ExecutionConfig,
    /// Worker pool sizing
    pub workers: WorkerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding flowrelay.db (definitions and run records)
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// TTL of every ephemeral per-run key
    pub state_ttl_secs: u64,
    pub wait_poll_interval_ms: u64,
    pub default_wait_timeout_ms: u64,
    /// Payload field carrying a bearer credential
    pub credential_field: String,
    /// How often expired state keys are purged
    pub sweep_interval_secs: u64,
}

/// One dispatch partition (and one worker) per unit of parallelism
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub core_parallelism: usize,
    pub ai_parallelism: usize,
    /// Bound of each partition and of the completion channel
    pub queue_capacity: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWRELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWRELAY_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("FLOWRELAY_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
            },
            execution: ExecutionConfig {
                state_ttl_secs: env_or("FLOWRELAY_STATE_TTL_SECS", 86_400),
                wait_poll_interval_ms: env_or("FLOWRELAY_WAIT_POLL_MS", 1_000),
                default_wait_timeout_ms: env_or("FLOWRELAY_WAIT_TIMEOUT_MS", 300_000),
                credential_field: std::env::var("FLOWRELAY_CREDENTIAL_FIELD")
                    .unwrap_or_else(|_| "access_token".to_string()),
                sweep_interval_secs: env_or("FLOWRELAY_SWEEP_INTERVAL_SECS", 60),
            },
            workers: WorkerConfig {
                core_parallelism: env_or("FLOWRELAY_CORE_WORKERS", 3),
                ai_parallelism: env_or("FLOWRELAY_AI_WORKERS", 3),
                queue_capacity: env_or("FLOWRELAY_QUEUE_CAPACITY", 1024),
            },
        }
    }
}

impl ExecutionConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs).min(MAX_TTL)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            credential_field: self.credential_field.clone(),
            wait_poll_interval: Duration::from_millis(self.wait_poll_interval_ms.max(1)),
            default_wait_timeout: Duration::from_millis(self.default_wait_timeout_ms),
        }
    }
}

impl WorkerConfig {
    pub fn parallelism(&self) -> HashMap<DispatchCategory, usize> {
        HashMap::from([
            (DispatchCategory::Core, self.core_parallelism.max(1)),
            (DispatchCategory::Ai, self.ai_parallelism.max(1)),
        ])
    }
}
