use crate::{FoundryError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_TASK_RETRY_BUDGET, GC_DEFAULT_MAX_AGE_MS, GC_TICK_INTERVAL,
    GRACEFUL_STOP_TIMEOUT_MS, SHUTDOWN_DEADLINE_MS, SPAWN_HANDSHAKE_TIMEOUT_MS,
    TICK_PERIOD_MS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub daemon: DaemonConfig,
    pub workspace: WorkspaceConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite path; `:memory:` is supported.
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub tick_period_ms: u64,
    /// 0 disables session reaping.
    pub max_session_duration_ms: u64,
    /// Abnormal exits reopen a task this many times before tombstone.
    pub task_retry_budget: u32,
    /// GC runs every Nth tick.
    pub gc_tick_interval: u64,
    pub gc_max_age_ms: i64,
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Git repository root that hosts `.worktrees/`.
    pub root: PathBuf,
    /// Base ref new worktree branches start from.
    pub base_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// The external agent CLI.
    pub binary: String,
    pub base_args: Vec<String>,
    pub handshake_timeout_ms: u64,
    pub graceful_stop_timeout_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::debug!("loaded .env from {path:?}"),
            Err(_) => tracing::debug!("no .env file"),
        }

        let agent_binary = env::var("FOUNDRY_AGENT_BINARY").map_err(|_| {
            FoundryError::ConfigurationError(
                "FOUNDRY_AGENT_BINARY environment variable is required".to_string(),
            )
        })?;
        if agent_binary.trim().is_empty() {
            return Err(FoundryError::ConfigurationError(
                "FOUNDRY_AGENT_BINARY cannot be empty".to_string(),
            ));
        }

        let base_ref = env::var("FOUNDRY_BASE_REF").unwrap_or_else(|_| "main".to_string());
        if base_ref.trim().is_empty() {
            return Err(FoundryError::ConfigurationError(
                "FOUNDRY_BASE_REF cannot be empty".to_string(),
            ));
        }

        let tick_period_ms = env_parse("FOUNDRY_TICK_MS", TICK_PERIOD_MS);
        if tick_period_ms == 0 {
            return Err(FoundryError::ConfigurationError(
                "FOUNDRY_TICK_MS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            storage: StorageConfig {
                db_path: env::var("FOUNDRY_DB_PATH")
                    .unwrap_or_else(|_| "foundry.db".to_string()),
            },
            daemon: DaemonConfig {
                tick_period_ms,
                max_session_duration_ms: env_parse("FOUNDRY_MAX_SESSION_DURATION_MS", 0),
                task_retry_budget: env_parse(
                    "FOUNDRY_TASK_RETRY_BUDGET",
                    DEFAULT_TASK_RETRY_BUDGET,
                ),
                gc_tick_interval: env_parse("FOUNDRY_GC_INTERVAL_TICKS", GC_TICK_INTERVAL)
                    .max(1),
                gc_max_age_ms: env_parse("FOUNDRY_GC_MAX_AGE_MS", GC_DEFAULT_MAX_AGE_MS),
                shutdown_grace_ms: env_parse("FOUNDRY_SHUTDOWN_GRACE_MS", SHUTDOWN_DEADLINE_MS),
            },
            workspace: WorkspaceConfig {
                root: PathBuf::from(
                    env::var("FOUNDRY_WORKSPACE_ROOT").unwrap_or_else(|_| ".".to_string()),
                ),
                base_ref,
            },
            agent: AgentConfig {
                binary: agent_binary,
                base_args: env::var("FOUNDRY_AGENT_ARGS")
                    .map(|raw| {
                        raw.split_whitespace()
                            .map(|s| s.to_string())
                            .collect()
                    })
                    .unwrap_or_default(),
                handshake_timeout_ms: env_parse(
                    "FOUNDRY_HANDSHAKE_TIMEOUT_MS",
                    SPAWN_HANDSHAKE_TIMEOUT_MS,
                ),
                graceful_stop_timeout_ms: env_parse(
                    "FOUNDRY_GRACEFUL_STOP_MS",
                    GRACEFUL_STOP_TIMEOUT_MS,
                ),
            },
        })
    }
}

/// Parse an env var, falling back (with a logged warning) on absent or
/// malformed values.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("invalid {key}={raw}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests;
