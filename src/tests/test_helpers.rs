//! Shared fixtures for scenario tests.

use crate::config::Config;
use crate::events::{EventBus, EventTopic};
use crate::lifecycle::AgentTemplate;
use crate::orchestrator::Orchestrator;
use serde_json::json;
use std::time::Duration;

/// Build an orchestrator on the in-memory backend with test-sized limits.
pub async fn test_orchestrator(max_agents: usize) -> Orchestrator {
    let mut config = Config::default();
    config.runtime.max_agents = max_agents;
    config.runtime.task_queue_size = max_agents * 10;
    Orchestrator::new(config).await.unwrap()
}

/// A template whose process is a long shell sleep; tests stand in for the
/// agent's IPC binding on the bus.
pub fn sleeper_template(name: &str, heartbeat: Duration) -> AgentTemplate {
    let mut template = AgentTemplate::new(name, "worker", "/bin/sh")
        .with_args(vec!["-c".to_string(), "sleep 120".to_string()])
        .with_heartbeat_interval(heartbeat)
        .with_startup_timeout(Duration::from_secs(5));
    template.environment.working_dir = std::env::temp_dir();
    template.environment.log_dir = std::env::temp_dir().join("strand-scenario-logs");
    template
}

/// Answer every `initializing` transition with a ready signal, the way a
/// real agent process would over its IPC binding.
pub async fn install_auto_ready(bus: &EventBus) {
    let publisher = bus.clone();
    bus.subscribe(EventTopic::AgentStatusChanged, move |event| {
        if event.payload["status"] == "initializing" {
            if let Some(agent_id) = event.payload["agentId"].as_str() {
                let bus = publisher.clone();
                let agent_id = agent_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    bus.publish(EventTopic::AgentReady, json!({"agentId": agent_id}))
                        .await;
                });
            }
        }
    })
    .await;
}

/// Complete every assigned task after a short delay, echoing its input.
pub async fn install_echo_worker(bus: &EventBus) {
    let publisher = bus.clone();
    bus.subscribe(EventTopic::TaskAssigned, move |event| {
        let bus = publisher.clone();
        let payload = event.payload.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus.publish(
                EventTopic::TaskCompleted,
                json!({
                    "taskId": payload["taskId"],
                    "agentId": payload["agentId"],
                    "output": {"echo": payload["input"]},
                    "metrics": {"executionMs": 20},
                }),
            )
            .await;
        });
    })
    .await;
}
