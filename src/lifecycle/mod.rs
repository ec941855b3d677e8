//! Agent lifecycle management.
//!
//! The manager is the sole mutator of agent records: template-driven
//! creation, start/stop/restart against the process supervisor, heartbeat
//! bookkeeping, workload tracking from task events, and the bounded error
//! history. Everything it learns is written through to the registry so a
//! restarted orchestrator can pick up where it left off.

mod templates;

pub use templates::{default_templates, AgentTemplate};

use crate::events::{EventBus, EventTopic};
use crate::models::{
    AgentCapabilities, AgentConfig, AgentEnvironment, AgentErrorEntry, AgentErrorKind, AgentRecord,
    AgentStatus, ErrorSeverity, TaskHistoryEntry,
};
use crate::process::{ProcessSpec, ProcessSupervisor};
use crate::registry::{Namespace, Registry};
use crate::{constants, Result, StrandError};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Manager tunables, derived from the runtime config.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_agents: usize,
    pub default_startup_timeout: Duration,
    pub restart_min_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_agents: 32,
            default_startup_timeout: Duration::from_secs(30),
            restart_min_interval: Duration::from_secs(constants::RESTART_MIN_INTERVAL_SECS),
        }
    }
}

/// Caller-supplied deviations from a template at creation time.
#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub name: Option<String>,
    pub capabilities: Option<AgentCapabilities>,
    pub config: Option<AgentConfig>,
    pub environment: Option<AgentEnvironment>,
}

#[derive(Clone)]
pub struct AgentManager {
    registry: Registry,
    supervisor: ProcessSupervisor,
    bus: EventBus,
    templates: Arc<RwLock<HashMap<String, AgentTemplate>>>,
    agents: Arc<RwLock<HashMap<String, AgentRecord>>>,
    instance_counters: Arc<Mutex<HashMap<String, u32>>>,
    last_restarts: Arc<Mutex<HashMap<String, Instant>>>,
    settings: ManagerSettings,
}

impl AgentManager {
    pub fn new(
        registry: Registry,
        supervisor: ProcessSupervisor,
        bus: EventBus,
        settings: ManagerSettings,
    ) -> Self {
        let mut initial = HashMap::new();
        for template in default_templates() {
            initial.insert(template.name.clone(), template);
        }

        Self {
            registry,
            supervisor,
            bus,
            templates: Arc::new(RwLock::new(initial)),
            agents: Arc::new(RwLock::new(HashMap::new())),
            instance_counters: Arc::new(Mutex::new(HashMap::new())),
            last_restarts: Arc::new(Mutex::new(HashMap::new())),
            settings,
        }
    }

    /// Subscribe to the bus topics that drive workload and liveness
    /// bookkeeping. Handlers only hand off; the work runs on its own task.
    pub async fn wire_events(&self) {
        let manager = self.clone();
        self.bus
            .subscribe(EventTopic::AgentHeartbeat, move |event| {
                let manager = manager.clone();
                let payload = event.payload.clone();
                tokio::spawn(async move {
                    if let Some(agent_id) = payload["agentId"].as_str() {
                        let metrics = payload.get("metrics").cloned();
                        if let Err(e) = manager.record_heartbeat(agent_id, metrics).await {
                            debug!("heartbeat for unknown agent: {e}");
                        }
                    }
                });
            })
            .await;

        let manager = self.clone();
        self.bus
            .subscribe(EventTopic::TaskAssigned, move |event| {
                let manager = manager.clone();
                let payload = event.payload.clone();
                tokio::spawn(async move {
                    if let Some(agent_id) = payload["agentId"].as_str() {
                        if let Err(e) = manager.note_task_assigned(agent_id).await {
                            debug!("task assignment bookkeeping failed: {e}");
                        }
                    }
                });
            })
            .await;

        for (topic, success) in [(EventTopic::TaskCompleted, true), (EventTopic::TaskFailed, false)]
        {
            let manager = self.clone();
            self.bus
                .subscribe(topic, move |event| {
                    let manager = manager.clone();
                    let payload = event.payload.clone();
                    tokio::spawn(async move {
                        let Some(agent_id) = payload["agentId"].as_str() else {
                            return;
                        };
                        let task_id = payload["taskId"].as_str().unwrap_or_default().to_string();
                        let execution_ms = payload
                            .get("metrics")
                            .and_then(|m| m.get("executionMs"))
                            .and_then(Value::as_u64);
                        if let Err(e) = manager
                            .note_task_finished(agent_id, &task_id, success, execution_ms)
                            .await
                        {
                            debug!("task completion bookkeeping failed: {e}");
                        }
                    });
                })
                .await;
        }

        let manager = self.clone();
        self.bus
            .subscribe(EventTopic::ProcessExit, move |event| {
                let manager = manager.clone();
                let payload = event.payload.clone();
                tokio::spawn(async move {
                    let Some(agent_id) = payload["agentId"].as_str() else {
                        return;
                    };
                    let exit_code = payload["exitCode"].as_i64().unwrap_or(-1);
                    manager.note_process_exit(agent_id, exit_code).await;
                });
            })
            .await;
    }

    // Templates

    /// Register an additional template; names are immutable once taken.
    pub async fn register_template(&self, template: AgentTemplate) -> Result<()> {
        let mut templates = self.templates.write().await;
        if templates.contains_key(&template.name) {
            return Err(StrandError::InvalidArgument(format!(
                "template {} already registered",
                template.name
            )));
        }
        info!("registered template {}", template.name);
        templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub async fn template(&self, name: &str) -> Option<AgentTemplate> {
        let templates = self.templates.read().await;
        templates.get(name).cloned()
    }

    // Creation and teardown

    /// Instantiate an agent from a template.
    ///
    /// Persists the record in `initializing` and emits `agent:created`.
    /// Fails with `LimitExceeded` once the active-agent cap is reached.
    pub async fn create_agent(
        &self,
        template_name: &str,
        overrides: AgentOverrides,
    ) -> Result<String> {
        let template = self
            .template(template_name)
            .await
            .ok_or_else(|| StrandError::NotFound(format!("template {template_name}")))?;

        {
            let agents = self.agents.read().await;
            let active = agents.values().filter(|a| a.status.is_active()).count();
            if active >= self.settings.max_agents {
                return Err(StrandError::LimitExceeded(format!(
                    "active agent cap of {} reached",
                    self.settings.max_agents
                )));
            }
        }

        let instance = {
            let mut counters = self.instance_counters.lock().await;
            let counter = counters.entry(template.name.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let name = overrides
            .name
            .unwrap_or_else(|| format!("{}-{}", template.name, instance));

        let mut record = AgentRecord::new(&template.name, &template.agent_type, name);
        record.capabilities = overrides.capabilities.unwrap_or(template.capabilities);
        record.config = overrides.config.unwrap_or(template.config);
        record.environment = overrides.environment.unwrap_or(template.environment);

        let agent_id = record.id.clone();
        self.persist(&record).await?;
        {
            let mut agents = self.agents.write().await;
            agents.insert(agent_id.clone(), record);
        }

        self.bus
            .publish(
                EventTopic::AgentCreated,
                json!({"agentId": agent_id, "template": template.name}),
            )
            .await;
        info!("created agent {agent_id} from template {}", template.name);
        Ok(agent_id)
    }

    /// Spawn the agent's process and wait for its ready signal.
    pub async fn start_agent(&self, agent_id: &str) -> Result<()> {
        let record = self
            .agent(agent_id)
            .await
            .ok_or_else(|| StrandError::NotFound(format!("agent {agent_id}")))?;
        let template = self
            .template(&record.template)
            .await
            .ok_or_else(|| StrandError::NotFound(format!("template {}", record.template)))?;

        self.transition(agent_id, AgentStatus::Initializing).await?;

        // Arm the readiness watch before the child can possibly signal.
        let id_for_watch = agent_id.to_string();
        let ready = self
            .bus
            .watch(EventTopic::AgentReady, move |payload| {
                payload["agentId"] == id_for_watch.as_str()
            })
            .await;

        let spec = ProcessSpec {
            agent_id: record.id.clone(),
            agent_type: record.agent_type.clone(),
            agent_name: record.name.clone(),
            program: template.startup_program.clone(),
            args: template.startup_args.clone(),
            env: HashMap::new(),
            working_dir: record.environment.working_dir.clone(),
            log_dir: record.environment.log_dir.clone(),
            config: Some(serde_json::to_value(&record.config)?),
        };

        let startup_timeout = if template.startup_timeout.is_zero() {
            self.settings.default_startup_timeout
        } else {
            template.startup_timeout
        };

        let spawn_result = self.supervisor.spawn(spec).await;
        let outcome = match spawn_result {
            Ok(pid) => {
                self.update(agent_id, |agent| agent.pid = Some(pid)).await?;
                self.bus.wait(ready, startup_timeout).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.update(agent_id, |agent| {
                    agent.status = AgentStatus::Idle;
                    agent.last_heartbeat_at = Some(Utc::now());
                    agent.touch();
                })
                .await?;
                self.bus
                    .publish(EventTopic::AgentStarted, json!({"agentId": agent_id}))
                    .await;
                info!("agent {agent_id} started");
                Ok(())
            }
            Err(e) => {
                let message = format!("startup failed: {e}");
                self.update(agent_id, |agent| {
                    agent.status = AgentStatus::Error;
                    agent.push_error(AgentErrorEntry::new(
                        AgentErrorKind::StartupFailed,
                        &message,
                        ErrorSeverity::Critical,
                    ));
                })
                .await?;
                self.bus
                    .publish(
                        EventTopic::AgentError,
                        json!({
                            "agentId": agent_id,
                            "kind": "startup_failed",
                            "message": message,
                        }),
                    )
                    .await;
                // Reap whatever was spawned; the record stays inspectable.
                let _ = self.supervisor.stop(agent_id).await;
                Err(StrandError::ProcessFailed {
                    message,
                    exit_code: None,
                })
            }
        }
    }

    /// Stop an agent: soft-terminate, hard-kill fallback, then mark
    /// terminated. Stopping an already-terminated agent is a no-op.
    pub async fn stop_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        let record = self
            .agent(agent_id)
            .await
            .ok_or_else(|| StrandError::NotFound(format!("agent {agent_id}")))?;

        if record.status == AgentStatus::Terminated {
            return Ok(());
        }

        self.transition(agent_id, AgentStatus::Terminating).await?;
        self.supervisor.stop(agent_id).await?;

        self.update(agent_id, |agent| {
            agent.status = AgentStatus::Terminated;
            agent.workload = 0;
            agent.pid = None;
            agent.touch();
        })
        .await?;

        self.bus
            .publish(
                EventTopic::AgentStopped,
                json!({"agentId": agent_id, "reason": reason}),
            )
            .await;
        info!("agent {agent_id} stopped ({reason})");
        Ok(())
    }

    /// Stop-then-start, rate-limited to one restart per agent per window.
    pub async fn restart_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        {
            let mut restarts = self.last_restarts.lock().await;
            if let Some(last) = restarts.get(agent_id) {
                if last.elapsed() < self.settings.restart_min_interval {
                    return Err(StrandError::LimitExceeded(format!(
                        "agent {agent_id} restarted less than {:?} ago",
                        self.settings.restart_min_interval
                    )));
                }
            }
            restarts.insert(agent_id.to_string(), Instant::now());
        }

        info!("restarting agent {agent_id} ({reason})");
        self.stop_agent(agent_id, reason).await?;
        self.start_agent(agent_id).await
    }

    /// Stop the agent if needed and delete it, preserving history in the
    /// archive.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        let record = self
            .agent(agent_id)
            .await
            .ok_or_else(|| StrandError::NotFound(format!("agent {agent_id}")))?;

        if record.status != AgentStatus::Terminated {
            self.stop_agent(agent_id, "removed").await?;
        }

        self.registry
            .delete(Namespace::Agents, agent_id, true)
            .await?;
        let mut agents = self.agents.write().await;
        agents.remove(agent_id);
        info!("agent {agent_id} removed");
        Ok(())
    }

    // Liveness

    /// Record a heartbeat. A heartbeat lifts an agent out of `error`.
    pub async fn record_heartbeat(&self, agent_id: &str, metrics: Option<Value>) -> Result<()> {
        let mut recovered = false;
        self.update(agent_id, |agent| {
            agent.last_heartbeat_at = Some(Utc::now());
            if agent.status == AgentStatus::Error {
                agent.status = if agent.workload > 0 {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Idle
                };
                recovered = true;
                for entry in agent.error_history.iter_mut() {
                    entry.resolved = true;
                }
            }
            if let Some(metrics) = &metrics {
                if let Ok(usage) = serde_json::from_value(metrics.clone()) {
                    agent.resources = Some(usage);
                }
            }
        })
        .await?;

        if recovered {
            self.publish_status(agent_id).await;
            info!("agent {agent_id} recovered via heartbeat");
        }
        Ok(())
    }

    /// Mark an agent as having missed too many heartbeats.
    pub async fn record_heartbeat_timeout(&self, agent_id: &str) -> Result<()> {
        self.update(agent_id, |agent| {
            agent.status = AgentStatus::Error;
            agent.push_error(AgentErrorEntry::new(
                AgentErrorKind::HeartbeatTimeout,
                "missed heartbeats beyond the timeout window",
                ErrorSeverity::High,
            ));
        })
        .await?;

        self.publish_status(agent_id).await;
        self.bus
            .publish(
                EventTopic::AgentHeartbeatTimeout,
                json!({"agentId": agent_id}),
            )
            .await;
        warn!("agent {agent_id} heartbeat timeout");
        Ok(())
    }

    /// Record an arbitrary agent error in the bounded history.
    pub async fn record_error(&self, agent_id: &str, entry: AgentErrorEntry) -> Result<()> {
        let critical = entry.severity == ErrorSeverity::Critical;
        let kind = entry.kind;
        let message = entry.message.clone();
        self.update(agent_id, |agent| {
            if critical {
                agent.status = AgentStatus::Error;
            }
            agent.push_error(entry);
        })
        .await?;

        if critical {
            self.publish_status(agent_id).await;
        }
        self.bus
            .publish(
                EventTopic::AgentError,
                json!({"agentId": agent_id, "kind": kind, "message": message}),
            )
            .await;
        Ok(())
    }

    // Workload tracking

    async fn note_task_assigned(&self, agent_id: &str) -> Result<()> {
        self.update(agent_id, |agent| {
            let cap = agent.capabilities.max_concurrent_tasks;
            if agent.workload >= cap {
                warn!("agent {} workload already at cap {cap}", agent.id);
            } else {
                agent.workload += 1;
            }
            if agent.status == AgentStatus::Idle {
                agent.status = AgentStatus::Busy;
            }
            agent.touch();
        })
        .await?;
        self.publish_status(agent_id).await;
        Ok(())
    }

    async fn note_task_finished(
        &self,
        agent_id: &str,
        task_id: &str,
        success: bool,
        execution_ms: Option<u64>,
    ) -> Result<()> {
        self.update(agent_id, |agent| {
            agent.workload = agent.workload.saturating_sub(1);
            if agent.workload == 0 && agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Idle;
            }
            let elapsed = execution_ms.unwrap_or(0);
            if success {
                agent.metrics.record_completion(elapsed);
            } else {
                agent.metrics.record_failure();
            }
            agent.push_task_history(TaskHistoryEntry {
                task_id: task_id.to_string(),
                completed_at: Utc::now(),
                success,
                execution_ms: elapsed,
            });
            agent.touch();
        })
        .await?;
        self.publish_status(agent_id).await;
        Ok(())
    }

    async fn note_process_exit(&self, agent_id: &str, exit_code: i64) {
        let Some(record) = self.agent(agent_id).await else {
            return;
        };
        // Expected during stop; only an unsolicited exit is an error.
        if matches!(
            record.status,
            AgentStatus::Terminating | AgentStatus::Terminated
        ) {
            return;
        }

        let result = self
            .update(agent_id, |agent| {
                agent.status = AgentStatus::Error;
                agent.pid = None;
                agent.push_error(
                    AgentErrorEntry::new(
                        AgentErrorKind::ProcessExit,
                        format!("process exited with code {exit_code}"),
                        if exit_code == 0 {
                            ErrorSeverity::Medium
                        } else {
                            ErrorSeverity::Critical
                        },
                    )
                    .with_context("exitCode", exit_code.to_string()),
                );
            })
            .await;
        if result.is_ok() {
            self.publish_status(agent_id).await;
        }
        self.supervisor.forget(agent_id).await;
    }

    // Queries

    pub async fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        let agents = self.agents.read().await;
        agents.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        let agents = self.agents.read().await;
        agents.values().filter(|a| a.status.is_active()).count()
    }

    /// Reload persisted agents after an orchestrator restart. Agents whose
    /// processes died with the previous orchestrator come back `offline`;
    /// their template provenance makes a subsequent `start_agent` exact.
    pub async fn restore(&self) -> Result<usize> {
        let records = self
            .registry
            .query(Namespace::Agents, &Default::default())
            .await?;

        let mut restored = 0;
        for stored in records {
            match serde_json::from_value::<AgentRecord>(stored.payload.clone()) {
                Ok(mut agent) => {
                    if !agent.status.is_terminal() {
                        agent.status = AgentStatus::Offline;
                        agent.pid = None;
                    }
                    self.persist(&agent).await?;
                    let mut agents = self.agents.write().await;
                    agents.insert(agent.id.clone(), agent);
                    restored += 1;
                }
                Err(e) => warn!("skipping unreadable agent record {}: {e}", stored.id),
            }
        }
        if restored > 0 {
            info!("restored {restored} agent record(s) from the registry");
        }
        Ok(restored)
    }

    // Internals

    async fn transition(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        self.update(agent_id, |agent| {
            agent.status = status;
            agent.touch();
        })
        .await?;
        self.publish_status(agent_id).await;
        Ok(())
    }

    async fn publish_status(&self, agent_id: &str) {
        if let Some(agent) = self.agent(agent_id).await {
            self.bus
                .publish(
                    EventTopic::AgentStatusChanged,
                    json!({"agentId": agent_id, "status": agent.status}),
                )
                .await;
        }
    }

    /// Fold a freshly computed health score into the record.
    pub async fn set_health(&self, agent_id: &str, health: f64) -> Result<()> {
        self.update(agent_id, |agent| agent.health = health.clamp(0.0, 1.0))
            .await
    }

    /// Apply a mutation to the cached record and write it through.
    pub(crate) async fn update<F>(&self, agent_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut AgentRecord),
    {
        let record = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| StrandError::NotFound(format!("agent {agent_id}")))?;
            mutate(agent);
            agent.updated_at = Utc::now();
            agent.clone()
        };
        self.persist(&record).await
    }

    async fn persist(&self, record: &AgentRecord) -> Result<()> {
        self.registry
            .put(
                Namespace::Agents,
                &record.id,
                "agent",
                serde_json::to_value(record)?,
                vec![
                    format!("type:{}", record.agent_type),
                    format!("template:{}", record.template),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSupervisor;

    fn manager_with(settings: ManagerSettings) -> (AgentManager, EventBus) {
        let bus = EventBus::new();
        let registry = Registry::in_memory(bus.clone());
        let supervisor = ProcessSupervisor::new(bus.clone(), Duration::from_secs(2));
        (
            AgentManager::new(registry, supervisor, bus.clone(), settings),
            bus,
        )
    }

    fn test_manager() -> (AgentManager, EventBus) {
        manager_with(ManagerSettings::default())
    }

    /// Template whose process is a shell sleep; readiness is signalled by
    /// the test itself, standing in for the agent's IPC binding.
    fn sleeper_template(name: &str) -> AgentTemplate {
        let mut template = AgentTemplate::new(name, "tester", "/bin/sh")
            .with_args(vec!["-c".to_string(), "sleep 60".to_string()])
            .with_startup_timeout(Duration::from_secs(5));
        template.environment.working_dir = std::env::temp_dir();
        template.environment.log_dir = std::env::temp_dir().join("strand-test-logs");
        template
    }

    #[tokio::test]
    async fn create_agent_respects_cap() {
        let (manager, _) = manager_with(ManagerSettings {
            max_agents: 2,
            ..Default::default()
        });

        manager
            .create_agent("researcher", AgentOverrides::default())
            .await
            .unwrap();
        manager
            .create_agent("researcher", AgentOverrides::default())
            .await
            .unwrap();
        let result = manager
            .create_agent("researcher", AgentOverrides::default())
            .await;
        assert!(matches!(result, Err(StrandError::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn create_agent_unknown_template() {
        let (manager, _) = test_manager();
        let result = manager
            .create_agent("no-such-template", AgentOverrides::default())
            .await;
        assert!(matches!(result, Err(StrandError::NotFound(_))));
    }

    #[tokio::test]
    async fn created_agents_get_stable_instance_names() {
        let (manager, _) = test_manager();
        let a = manager
            .create_agent("coder", AgentOverrides::default())
            .await
            .unwrap();
        let b = manager
            .create_agent("coder", AgentOverrides::default())
            .await
            .unwrap();
        assert_eq!(manager.agent(&a).await.unwrap().name, "coder-1");
        assert_eq!(manager.agent(&b).await.unwrap().name, "coder-2");
    }

    #[tokio::test]
    async fn duplicate_template_registration_rejected() {
        let (manager, _) = test_manager();
        let result = manager
            .register_template(AgentTemplate::new("coder", "coder", "x"))
            .await;
        assert!(matches!(result, Err(StrandError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn start_agent_reaches_idle_on_ready_signal() {
        let (manager, bus) = test_manager();
        manager.register_template(sleeper_template("sleeper")).await.unwrap();
        let agent_id = manager
            .create_agent("sleeper", AgentOverrides::default())
            .await
            .unwrap();

        // Simulate the child's ready signal arriving shortly after spawn.
        {
            let bus = bus.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                bus.publish(EventTopic::AgentReady, json!({"agentId": agent_id}))
                    .await;
            });
        }

        manager.start_agent(&agent_id).await.unwrap();
        let record = manager.agent(&agent_id).await.unwrap();
        assert_eq!(record.status, AgentStatus::Idle);
        assert!(record.pid.is_some());

        manager.stop_agent(&agent_id, "test done").await.unwrap();
    }

    #[tokio::test]
    async fn start_agent_without_ready_signal_fails() {
        let (manager, _) = test_manager();
        let template = sleeper_template("mute").with_startup_timeout(Duration::from_millis(200));
        manager.register_template(template).await.unwrap();
        let agent_id = manager
            .create_agent("mute", AgentOverrides::default())
            .await
            .unwrap();

        let result = manager.start_agent(&agent_id).await;
        assert!(matches!(result, Err(StrandError::ProcessFailed { .. })));

        let record = manager.agent(&agent_id).await.unwrap();
        assert_eq!(record.status, AgentStatus::Error);
        assert_eq!(
            record.error_history.last().unwrap().kind,
            AgentErrorKind::StartupFailed
        );
        assert_eq!(
            record.error_history.last().unwrap().severity,
            ErrorSeverity::Critical
        );
    }

    #[tokio::test]
    async fn stop_agent_is_idempotent() {
        let (manager, _) = test_manager();
        let agent_id = manager
            .create_agent("analyst", AgentOverrides::default())
            .await
            .unwrap();

        manager.stop_agent(&agent_id, "first").await.unwrap();
        manager.stop_agent(&agent_id, "second").await.unwrap();
        assert_eq!(
            manager.agent(&agent_id).await.unwrap().status,
            AgentStatus::Terminated
        );
    }

    #[tokio::test]
    async fn heartbeat_recovers_errored_agent() {
        let (manager, _) = test_manager();
        let agent_id = manager
            .create_agent("tester", AgentOverrides::default())
            .await
            .unwrap();

        manager.record_heartbeat_timeout(&agent_id).await.unwrap();
        assert_eq!(
            manager.agent(&agent_id).await.unwrap().status,
            AgentStatus::Error
        );

        manager.record_heartbeat(&agent_id, None).await.unwrap();
        let record = manager.agent(&agent_id).await.unwrap();
        assert_eq!(record.status, AgentStatus::Idle);
        assert!(record.error_history.iter().all(|e| e.resolved));
    }

    #[tokio::test]
    async fn workload_tracks_assignments_and_completions() {
        let (manager, _) = test_manager();
        let agent_id = manager
            .create_agent("coder", AgentOverrides::default())
            .await
            .unwrap();
        manager
            .update(&agent_id, |a| a.status = AgentStatus::Idle)
            .await
            .unwrap();

        manager.note_task_assigned(&agent_id).await.unwrap();
        let record = manager.agent(&agent_id).await.unwrap();
        assert_eq!(record.workload, 1);
        assert_eq!(record.status, AgentStatus::Busy);

        manager
            .note_task_finished(&agent_id, "t-1", true, Some(1200))
            .await
            .unwrap();
        let record = manager.agent(&agent_id).await.unwrap();
        assert_eq!(record.workload, 0);
        assert_eq!(record.status, AgentStatus::Idle);
        assert_eq!(record.metrics.tasks_completed, 1);
        assert_eq!(record.task_history.len(), 1);
    }

    #[tokio::test]
    async fn workload_never_goes_negative() {
        let (manager, _) = test_manager();
        let agent_id = manager
            .create_agent("coder", AgentOverrides::default())
            .await
            .unwrap();

        manager
            .note_task_finished(&agent_id, "t-1", false, None)
            .await
            .unwrap();
        assert_eq!(manager.agent(&agent_id).await.unwrap().workload, 0);
    }

    #[tokio::test]
    async fn restart_is_rate_limited() {
        let (manager, _) = manager_with(ManagerSettings {
            restart_min_interval: Duration::from_secs(60),
            ..Default::default()
        });
        let agent_id = manager
            .create_agent("researcher", AgentOverrides::default())
            .await
            .unwrap();

        // First restart fails at start (no ready signal) but consumes the slot.
        let _ = manager.restart_agent(&agent_id, "test").await;
        let second = manager.restart_agent(&agent_id, "test").await;
        assert!(matches!(second, Err(StrandError::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn remove_agent_archives_record() {
        let (manager, _) = test_manager();
        let agent_id = manager
            .create_agent("analyst", AgentOverrides::default())
            .await
            .unwrap();
        manager.remove_agent(&agent_id).await.unwrap();

        assert!(manager.agent(&agent_id).await.is_none());
        let archived = manager
            .registry
            .get(Namespace::Archived, &agent_id)
            .await
            .unwrap();
        assert!(archived.is_some());
    }

    #[tokio::test]
    async fn restore_marks_survivors_offline() {
        let bus = EventBus::new();
        let registry = Registry::in_memory(bus.clone());
        let supervisor = ProcessSupervisor::new(bus.clone(), Duration::from_secs(2));
        let manager = AgentManager::new(
            registry.clone(),
            supervisor.clone(),
            bus.clone(),
            ManagerSettings::default(),
        );

        let agent_id = manager
            .create_agent("researcher", AgentOverrides::default())
            .await
            .unwrap();

        // A fresh manager over the same registry simulates a restart.
        let reborn = AgentManager::new(registry, supervisor, bus, ManagerSettings::default());
        let restored = reborn.restore().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(
            reborn.agent(&agent_id).await.unwrap().status,
            AgentStatus::Offline
        );
    }
}
