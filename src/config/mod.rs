use crate::{constants, Result, StrandError};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[cfg(test)]
mod tests;

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub health: HealthConfig,
    pub registry: RegistryConfig,
    pub process: ProcessConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard cap on concurrently active agents.
    pub max_agents: usize,
    /// Soft bound on queued tasks, advisory relative to `max_agents`.
    pub task_queue_size: usize,
    /// How long shutdown waits for agents to drain before force-killing.
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Expected heartbeat period for agents without a template override.
    pub heartbeat_interval_secs: u64,
    /// Period of the health scoring loop.
    pub check_interval_secs: u64,
    /// Whether unhealthy agents are restarted automatically.
    pub auto_restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory for the file-backed registry; `None` keeps records in memory.
    pub state_dir: Option<PathBuf>,
    /// Bounded staleness for cached reads.
    pub cache_staleness_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Grace period between soft-terminate and hard-kill.
    pub stop_timeout_secs: u64,
    /// How long a spawned agent has to signal readiness.
    pub startup_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base delay for the exponential retry policy.
    pub retry_base_ms: u64,
    /// Cap for the exponential retry policy.
    pub retry_cap_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig {
                max_agents: 32,
                task_queue_size: 1000,
                shutdown_timeout_secs: 30,
            },
            health: HealthConfig {
                heartbeat_interval_secs: 10,
                check_interval_secs: 30,
                auto_restart: true,
            },
            registry: RegistryConfig {
                state_dir: None,
                cache_staleness_secs: constants::REGISTRY_CACHE_STALENESS_SECS,
            },
            process: ProcessConfig {
                stop_timeout_secs: constants::PROCESS_STOP_TIMEOUT_SECS,
                startup_timeout_secs: 30,
            },
            engine: EngineConfig {
                retry_base_ms: constants::RETRY_BASE_MS,
                retry_cap_ms: constants::RETRY_CAP_MS,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file when present
        match dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file loaded"),
        }

        let defaults = Config::default();

        let runtime = RuntimeConfig {
            max_agents: env_parse("STRAND_MAX_AGENTS", defaults.runtime.max_agents)?,
            task_queue_size: env_parse("STRAND_TASK_QUEUE_SIZE", defaults.runtime.task_queue_size)?,
            shutdown_timeout_secs: env_parse(
                "STRAND_SHUTDOWN_TIMEOUT_SECS",
                defaults.runtime.shutdown_timeout_secs,
            )?,
        };

        let health = HealthConfig {
            heartbeat_interval_secs: env_parse(
                "STRAND_HEARTBEAT_INTERVAL_SECS",
                defaults.health.heartbeat_interval_secs,
            )?,
            check_interval_secs: env_parse(
                "STRAND_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health.check_interval_secs,
            )?,
            auto_restart: env_parse("STRAND_AUTO_RESTART", defaults.health.auto_restart)?,
        };

        let registry = RegistryConfig {
            state_dir: env::var("STRAND_STATE_DIR").ok().map(PathBuf::from),
            cache_staleness_secs: env_parse(
                "STRAND_CACHE_STALENESS_SECS",
                defaults.registry.cache_staleness_secs,
            )?,
        };

        let process = ProcessConfig {
            stop_timeout_secs: env_parse(
                "STRAND_PROCESS_STOP_TIMEOUT_SECS",
                defaults.process.stop_timeout_secs,
            )?,
            startup_timeout_secs: env_parse(
                "STRAND_STARTUP_TIMEOUT_SECS",
                defaults.process.startup_timeout_secs,
            )?,
        };

        let engine = EngineConfig {
            retry_base_ms: env_parse("STRAND_RETRY_BASE_MS", defaults.engine.retry_base_ms)?,
            retry_cap_ms: env_parse("STRAND_RETRY_CAP_MS", defaults.engine.retry_cap_ms)?,
        };

        let config = Config {
            runtime,
            health,
            registry,
            process,
            engine,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_agents == 0 {
            return Err(StrandError::InvalidArgument(
                "STRAND_MAX_AGENTS must be at least 1".to_string(),
            ));
        }

        if self.health.heartbeat_interval_secs == 0 {
            return Err(StrandError::InvalidArgument(
                "STRAND_HEARTBEAT_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        if self.engine.retry_cap_ms < self.engine.retry_base_ms {
            return Err(StrandError::InvalidArgument(
                "STRAND_RETRY_CAP_MS must be >= STRAND_RETRY_BASE_MS".to_string(),
            ));
        }

        // Advisory only: the queue can be smaller, it just risks starving dispatch.
        if self.runtime.task_queue_size < self.runtime.max_agents * 10 {
            tracing::warn!(
                "task_queue_size ({}) is below 10x max_agents ({}); dispatch may stall under load",
                self.runtime.task_queue_size,
                self.runtime.max_agents
            );
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| {
            StrandError::InvalidArgument(format!("{key} has an unparseable value: {raw}"))
        }),
        Err(_) => Ok(default),
    }
}
