//! The root object of the runtime.
//!
//! Everything process-wide lives here: the orchestrator constructs the
//! event bus, registry, supervisor, lifecycle manager, health monitor,
//! pool controller, and workflow engine at startup and hands out handles.
//! There are no globals; subsystems receive their collaborators by
//! injection and signal each other over the bus.

use crate::config::Config;
use crate::events::EventBus;
use crate::health::{HealthMonitor, MonitorSettings};
use crate::lifecycle::{AgentManager, ManagerSettings};
use crate::pool::PoolManager;
use crate::process::{ProcessSignal, ProcessSupervisor};
use crate::registry::{
    FileBackend, MemoryBackend, Registry, RegistryBackend, RegistrySettings,
};
use crate::workflow::{EngineSettings, WorkflowEngine};
use crate::{Result, StrandError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Aggregate snapshot for external surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// Agent counts keyed by status name.
    pub agents: HashMap<String, usize>,
    pub agent_count: usize,
    /// Per-pool sizing and backlog, keyed by pool id.
    pub pools: HashMap<String, PoolStatus>,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub name: String,
    pub template: String,
    pub current_size: usize,
    pub available: usize,
    pub busy: usize,
    /// Acquirers waiting for a release.
    pub queue_depth: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Config,
    bus: EventBus,
    registry: Registry,
    supervisor: ProcessSupervisor,
    manager: AgentManager,
    health: HealthMonitor,
    pools: PoolManager,
    engine: WorkflowEngine,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl Orchestrator {
    /// Construct and wire every subsystem; restores persisted agents so a
    /// restart is transparent.
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing orchestrator");
        let bus = EventBus::new();

        let backend: Arc<dyn RegistryBackend> = match &config.registry.state_dir {
            Some(dir) => {
                info!("registry state directory: {dir:?}");
                Arc::new(FileBackend::new(dir))
            }
            None => Arc::new(MemoryBackend::new()),
        };
        let registry = Registry::new(
            backend,
            bus.clone(),
            RegistrySettings {
                cache_staleness: Duration::from_secs(config.registry.cache_staleness_secs),
                ..Default::default()
            },
        );

        let supervisor = ProcessSupervisor::new(
            bus.clone(),
            Duration::from_secs(config.process.stop_timeout_secs),
        );

        let manager = AgentManager::new(
            registry.clone(),
            supervisor.clone(),
            bus.clone(),
            ManagerSettings {
                max_agents: config.runtime.max_agents,
                default_startup_timeout: Duration::from_secs(config.process.startup_timeout_secs),
                ..Default::default()
            },
        );
        manager.wire_events().await;
        manager.restore().await?;

        let shutdown = CancellationToken::new();

        let health = HealthMonitor::new(
            manager.clone(),
            MonitorSettings {
                heartbeat_interval: Duration::from_secs(config.health.heartbeat_interval_secs),
                check_interval: Duration::from_secs(config.health.check_interval_secs),
                auto_restart: config.health.auto_restart,
            },
        );

        let pools = PoolManager::new(manager.clone(), bus.clone(), shutdown.clone());

        let engine = WorkflowEngine::new(
            registry.clone(),
            bus.clone(),
            EngineSettings {
                retry_base: Duration::from_millis(config.engine.retry_base_ms),
                retry_cap: Duration::from_millis(config.engine.retry_cap_ms),
            },
        );

        Ok(Self {
            config,
            bus,
            registry,
            supervisor,
            manager,
            health,
            pools,
            engine,
            shutdown,
            started_at: Instant::now(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn agents(&self) -> &AgentManager {
        &self.manager
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// The root cancel signal; cancelling it initiates shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the periodic loops until shutdown is requested, then drain.
    pub async fn run(&self) -> Result<()> {
        info!("orchestrator running");

        let health_loop = {
            let health = self.health.clone();
            let token = self.shutdown.child_token();
            tokio::spawn(async move { health.run(token).await })
        };
        let pool_loop = {
            let pools = self.pools.clone();
            let token = self.shutdown.child_token();
            tokio::spawn(async move { pools.run(token).await })
        };

        self.shutdown.cancelled().await;
        info!("shutdown requested; draining");

        let _ = health_loop.await;
        let _ = pool_loop.await;

        self.drain().await;
        info!("orchestrator stopped");
        Ok(())
    }

    /// Request shutdown. New work is refused immediately; `run` drains and
    /// returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop all pools and agents within the configured timeout, then
    /// force-kill whatever is left.
    async fn drain(&self) {
        let timeout = Duration::from_secs(self.config.runtime.shutdown_timeout_secs);
        let graceful = async {
            self.pools.drain().await;
            for agent in self.manager.list_agents().await {
                if !agent.status.is_terminal() {
                    if let Err(e) = self.manager.stop_agent(&agent.id, "shutdown").await {
                        warn!("stop of agent {} during shutdown failed: {e}", agent.id);
                    }
                }
            }
        };

        if tokio::time::timeout(timeout, graceful).await.is_err() {
            warn!("graceful drain exceeded {timeout:?}; force-killing residual agents");
            for agent in self.manager.list_agents().await {
                if !agent.status.is_terminal() {
                    let _ = self
                        .supervisor
                        .signal(&agent.id, ProcessSignal::Kill)
                        .await;
                }
            }
        }
    }

    pub async fn system_status(&self) -> SystemStatus {
        let agents = self.manager.list_agents().await;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for agent in &agents {
            let key = serde_json::to_value(agent.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            *by_status.entry(key).or_insert(0) += 1;
        }

        let mut pools = HashMap::new();
        for record in self.pools.list_pools().await {
            let queue_depth = self.pools.queue_depth(&record.id).await.unwrap_or(0);
            pools.insert(
                record.id.clone(),
                PoolStatus {
                    name: record.name,
                    template: record.template,
                    current_size: record.current_size,
                    available: record.available.len(),
                    busy: record.busy.len(),
                    queue_depth,
                },
            );
        }

        SystemStatus {
            agent_count: agents.len(),
            agents: by_status,
            pools,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Fails when the runtime is shutting down; gate for external intake.
    pub fn ensure_accepting(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(StrandError::Cancelled("orchestrator is shutting down".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentStatus;

    #[tokio::test]
    async fn constructs_with_defaults_and_reports_status() {
        let orchestrator = Orchestrator::new(Config::default()).await.unwrap();
        let status = orchestrator.system_status().await;
        assert_eq!(status.agent_count, 0);
        assert!(status.pools.is_empty());
        assert!(orchestrator.ensure_accepting().is_ok());
    }

    #[tokio::test]
    async fn run_returns_after_shutdown() {
        let orchestrator = Orchestrator::new(Config::default()).await.unwrap();
        let runner = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.shutdown();
        runner.await.unwrap().unwrap();
        assert!(orchestrator.ensure_accepting().is_err());
    }

    #[tokio::test]
    async fn restart_restores_agents_offline() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.registry.state_dir = Some(dir.path().to_path_buf());

        let first = Orchestrator::new(config.clone()).await.unwrap();
        let agent_id = first
            .agents()
            .create_agent("researcher", Default::default())
            .await
            .unwrap();
        drop(first);

        let second = Orchestrator::new(config).await.unwrap();
        let restored = second.agents().agent(&agent_id).await.unwrap();
        assert_eq!(restored.status, AgentStatus::Offline);
    }
}
