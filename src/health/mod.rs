//! Periodic health enforcement.
//!
//! Two loops run against the agent population: a heartbeat loop that marks
//! agents in error once their heartbeat age passes three intervals, and a
//! health loop that scores each agent across four dimensions and issues
//! restart decisions when the overall score collapses.

use crate::constants;
use crate::lifecycle::AgentManager;
use crate::models::{AgentRecord, AgentStatus, ErrorSeverity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthComponent {
    Responsiveness,
    Performance,
    Reliability,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    Improving,
    Stable,
    Degrading,
}

/// A component score that fell below its threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub component: HealthComponent,
    pub severity: ErrorSeverity,
    pub message: String,
}

/// One scoring pass over one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub agent_id: String,
    pub responsiveness: f64,
    pub performance: f64,
    pub reliability: f64,
    pub resource: f64,
    pub overall: f64,
    pub issues: Vec<HealthIssue>,
    pub trend: HealthTrend,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Fallback heartbeat period for agents whose template has none.
    pub heartbeat_interval: Duration,
    pub check_interval: Duration,
    pub auto_restart: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            check_interval: Duration::from_secs(30),
            auto_restart: true,
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    manager: AgentManager,
    settings: MonitorSettings,
    histories: Arc<Mutex<HashMap<String, VecDeque<f64>>>>,
}

impl HealthMonitor {
    pub fn new(manager: AgentManager, settings: MonitorSettings) -> Self {
        Self {
            manager,
            settings,
            histories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run both loops until the token cancels.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("health monitor running");
        let heartbeat = {
            let monitor = self.clone();
            let cancel = cancel.clone();
            async move {
                let mut ticker = tokio::time::interval(monitor.settings.heartbeat_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => monitor.check_heartbeats().await,
                    }
                }
            }
        };
        let health = {
            let monitor = self.clone();
            async move {
                let mut ticker = tokio::time::interval(monitor.settings.check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => { monitor.check_health().await; },
                    }
                }
            }
        };
        tokio::join!(heartbeat, health);
        info!("health monitor stopped");
    }

    /// One pass of the heartbeat loop over every running agent.
    pub async fn check_heartbeats(&self) {
        let now = Utc::now();
        for agent in self.manager.list_agents().await {
            if !matches!(agent.status, AgentStatus::Idle | AgentStatus::Busy) {
                continue;
            }

            let interval = self.heartbeat_interval_for(&agent).await;
            let age = match agent.last_heartbeat_at {
                Some(ts) => (now - ts).to_std().unwrap_or_default(),
                None => continue,
            };

            if age > interval * constants::HEARTBEAT_TIMEOUT_MULTIPLIER {
                warn!(
                    "agent {} heartbeat is {age:?} old (interval {interval:?})",
                    agent.id
                );
                if let Err(e) = self.manager.record_heartbeat_timeout(&agent.id).await {
                    debug!("heartbeat timeout bookkeeping failed: {e}");
                    continue;
                }
                if self.settings.auto_restart && self.template_auto_restart(&agent).await {
                    self.schedule_restart(&agent.id, "heartbeat timeout").await;
                }
            }
        }
    }

    /// One pass of the health loop; returns the per-agent reports.
    pub async fn check_health(&self) -> Vec<HealthReport> {
        let mut reports = Vec::new();
        for agent in self.manager.list_agents().await {
            if matches!(
                agent.status,
                AgentStatus::Terminated | AgentStatus::Terminating | AgentStatus::Offline
            ) {
                continue;
            }

            let interval = self.heartbeat_interval_for(&agent).await;
            let mut report = self.score(&agent, interval);

            report.trend = {
                let mut histories = self.histories.lock().await;
                let history = histories.entry(agent.id.clone()).or_default();
                history.push_back(report.overall);
                while history.len() > constants::MAX_HEALTH_HISTORY {
                    history.pop_front();
                }
                trend_of(history)
            };

            if let Err(e) = self.manager.set_health(&agent.id, report.overall).await {
                debug!("health write for {} failed: {e}", agent.id);
            }

            if report.overall < constants::RESTART_HEALTH_THRESHOLD && self.settings.auto_restart {
                warn!(
                    "agent {} overall health {:.2} below restart threshold",
                    agent.id, report.overall
                );
                self.schedule_restart(&agent.id, "health collapsed").await;
            }

            reports.push(report);
        }
        reports
    }

    /// Score one agent across the four health dimensions.
    pub fn score(&self, agent: &AgentRecord, heartbeat_interval: Duration) -> HealthReport {
        let responsiveness = match agent.last_heartbeat_at {
            Some(ts) => {
                let age = (Utc::now() - ts).to_std().unwrap_or_default();
                if age <= heartbeat_interval {
                    1.0
                } else if age <= heartbeat_interval * 2 {
                    0.5
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let performance = if agent.metrics.avg_execution_ms <= 0.0 {
            1.0
        } else {
            (agent.metrics.baseline_execution_ms / agent.metrics.avg_execution_ms).clamp(0.0, 1.0)
        };

        let reliability = agent.metrics.success_rate();

        let resource = match &agent.resources {
            Some(usage) => {
                let ratios = [
                    headroom(usage.memory_used_bytes as f64, usage.memory_limit_bytes as f64),
                    headroom(usage.cpu_used, usage.cpu_limit),
                    headroom(usage.disk_used_bytes as f64, usage.disk_limit_bytes as f64),
                ];
                ratios.iter().sum::<f64>() / ratios.len() as f64
            }
            None => 1.0,
        };

        let overall = (responsiveness + performance + reliability + resource) / 4.0;

        let mut issues = Vec::new();
        if responsiveness < constants::RESPONSIVENESS_ISSUE_THRESHOLD {
            issues.push(issue(
                HealthComponent::Responsiveness,
                responsiveness,
                constants::RESPONSIVENESS_ISSUE_THRESHOLD,
                "heartbeats are stale",
            ));
        }
        if performance < constants::PERFORMANCE_ISSUE_THRESHOLD {
            issues.push(issue(
                HealthComponent::Performance,
                performance,
                constants::PERFORMANCE_ISSUE_THRESHOLD,
                "execution time is drifting above baseline",
            ));
        }
        if resource < constants::RESOURCE_ISSUE_THRESHOLD {
            issues.push(issue(
                HealthComponent::Resource,
                resource,
                constants::RESOURCE_ISSUE_THRESHOLD,
                "resource headroom is nearly exhausted",
            ));
        }

        HealthReport {
            agent_id: agent.id.clone(),
            responsiveness,
            performance,
            reliability,
            resource,
            overall,
            issues,
            trend: HealthTrend::Stable,
            checked_at: Utc::now(),
        }
    }

    async fn heartbeat_interval_for(&self, agent: &AgentRecord) -> Duration {
        match self.manager.template(&agent.template).await {
            Some(template) if !template.heartbeat_interval.is_zero() => {
                template.heartbeat_interval
            }
            _ => self.settings.heartbeat_interval,
        }
    }

    async fn template_auto_restart(&self, agent: &AgentRecord) -> bool {
        self.manager
            .template(&agent.template)
            .await
            .map(|t| t.auto_restart)
            .unwrap_or(false)
    }

    /// Hand the restart to its own task; the manager enforces the
    /// per-agent rate limit.
    async fn schedule_restart(&self, agent_id: &str, reason: &str) {
        let manager = self.manager.clone();
        let agent_id = agent_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            match manager.restart_agent(&agent_id, &reason).await {
                Ok(()) => info!("agent {agent_id} restarted ({reason})"),
                Err(e) => debug!("restart of {agent_id} skipped: {e}"),
            }
        });
    }
}

fn headroom(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        1.0
    } else {
        (1.0 - used / limit).clamp(0.0, 1.0)
    }
}

fn issue(
    component: HealthComponent,
    value: f64,
    threshold: f64,
    message: &str,
) -> HealthIssue {
    HealthIssue {
        component,
        severity: severity_below(value, threshold),
        message: message.to_string(),
    }
}

/// Severity grows with the relative distance below the threshold.
fn severity_below(value: f64, threshold: f64) -> ErrorSeverity {
    let ratio = if threshold <= 0.0 { 0.0 } else { value / threshold };
    if ratio >= 0.75 {
        ErrorSeverity::Low
    } else if ratio >= 0.5 {
        ErrorSeverity::Medium
    } else if ratio >= 0.25 {
        ErrorSeverity::High
    } else {
        ErrorSeverity::Critical
    }
}

/// Three-way slope classification over the bounded score history.
fn trend_of(history: &VecDeque<f64>) -> HealthTrend {
    if history.len() < 3 {
        return HealthTrend::Stable;
    }

    // Least-squares slope over (index, score).
    let n = history.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = history.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in history.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let slope = if den == 0.0 { 0.0 } else { num / den };

    const SLOPE_EPSILON: f64 = 0.005;
    if slope > SLOPE_EPSILON {
        HealthTrend::Improving
    } else if slope < -SLOPE_EPSILON {
        HealthTrend::Degrading
    } else {
        HealthTrend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::lifecycle::{AgentOverrides, AgentTemplate, ManagerSettings};
    use crate::models::ResourceUsage;
    use crate::process::ProcessSupervisor;
    use crate::registry::Registry;

    fn monitor_fixture(settings: MonitorSettings) -> (HealthMonitor, AgentManager, EventBus) {
        let bus = EventBus::new();
        let registry = Registry::in_memory(bus.clone());
        let supervisor = ProcessSupervisor::new(bus.clone(), Duration::from_secs(2));
        let manager = AgentManager::new(
            registry,
            supervisor,
            bus.clone(),
            ManagerSettings::default(),
        );
        let monitor = HealthMonitor::new(manager.clone(), settings);
        (monitor, manager, bus)
    }

    fn fresh_agent() -> AgentRecord {
        let mut agent = AgentRecord::new("tester", "tester", "t-1".to_string());
        agent.status = AgentStatus::Idle;
        agent.last_heartbeat_at = Some(Utc::now());
        agent
    }

    #[tokio::test]
    async fn healthy_agent_scores_one() {
        let (monitor, _, _) = monitor_fixture(MonitorSettings::default());
        let agent = fresh_agent();

        let report = monitor.score(&agent, Duration::from_secs(10));
        assert_eq!(report.responsiveness, 1.0);
        assert_eq!(report.performance, 1.0);
        assert_eq!(report.reliability, 1.0);
        assert_eq!(report.resource, 1.0);
        assert_eq!(report.overall, 1.0);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn stale_heartbeat_scores_zero_responsiveness() {
        let (monitor, _, _) = monitor_fixture(MonitorSettings::default());
        let mut agent = fresh_agent();
        agent.last_heartbeat_at = Some(Utc::now() - chrono::Duration::seconds(60));

        let report = monitor.score(&agent, Duration::from_secs(10));
        assert_eq!(report.responsiveness, 0.0);
        assert!(report
            .issues
            .iter()
            .any(|i| i.component == HealthComponent::Responsiveness
                && i.severity == ErrorSeverity::Critical));
    }

    #[tokio::test]
    async fn slow_agent_gets_performance_issue() {
        let (monitor, _, _) = monitor_fixture(MonitorSettings::default());
        let mut agent = fresh_agent();
        agent.metrics.baseline_execution_ms = 1_000.0;
        agent.metrics.avg_execution_ms = 4_000.0;
        agent.metrics.tasks_completed = 4;

        let report = monitor.score(&agent, Duration::from_secs(10));
        assert!((report.performance - 0.25).abs() < 1e-9);
        assert!(report
            .issues
            .iter()
            .any(|i| i.component == HealthComponent::Performance));
    }

    #[tokio::test]
    async fn exhausted_resources_get_resource_issue() {
        let (monitor, _, _) = monitor_fixture(MonitorSettings::default());
        let mut agent = fresh_agent();
        agent.resources = Some(ResourceUsage {
            memory_used_bytes: 950,
            memory_limit_bytes: 1000,
            cpu_used: 0.95,
            cpu_limit: 1.0,
            disk_used_bytes: 90,
            disk_limit_bytes: 100,
        });

        let report = monitor.score(&agent, Duration::from_secs(10));
        assert!(report.resource < constants::RESOURCE_ISSUE_THRESHOLD);
        assert!(report
            .issues
            .iter()
            .any(|i| i.component == HealthComponent::Resource));
    }

    #[test]
    fn trend_classification() {
        let improving: VecDeque<f64> = (0..10).map(|i| 0.5 + i as f64 * 0.05).collect();
        assert_eq!(trend_of(&improving), HealthTrend::Improving);

        let degrading: VecDeque<f64> = (0..10).map(|i| 1.0 - i as f64 * 0.05).collect();
        assert_eq!(trend_of(&degrading), HealthTrend::Degrading);

        let stable: VecDeque<f64> = std::iter::repeat(0.8).take(10).collect();
        assert_eq!(trend_of(&stable), HealthTrend::Stable);

        let short: VecDeque<f64> = vec![0.1, 0.9].into();
        assert_eq!(trend_of(&short), HealthTrend::Stable);
    }

    #[test]
    fn severity_scales_with_deficit() {
        assert_eq!(severity_below(0.45, 0.5), ErrorSeverity::Low);
        assert_eq!(severity_below(0.3, 0.5), ErrorSeverity::Medium);
        assert_eq!(severity_below(0.15, 0.5), ErrorSeverity::High);
        assert_eq!(severity_below(0.0, 0.5), ErrorSeverity::Critical);
    }

    #[tokio::test]
    async fn heartbeat_timeout_marks_agent_error() {
        let (monitor, manager, bus) = monitor_fixture(MonitorSettings::default());

        // Fast-heartbeat template so three intervals pass quickly.
        manager
            .register_template(
                AgentTemplate::new("rapid", "tester", "/bin/true")
                    .with_heartbeat_interval(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        let agent_id = manager
            .create_agent("rapid", AgentOverrides::default())
            .await
            .unwrap();
        manager
            .update(&agent_id, |agent| {
                agent.status = AgentStatus::Idle;
                agent.last_heartbeat_at = Some(Utc::now() - chrono::Duration::seconds(5));
            })
            .await
            .unwrap();

        let timeout_watch = bus
            .watch(crate::events::EventTopic::AgentHeartbeatTimeout, |_| true)
            .await;

        monitor.check_heartbeats().await;

        bus.wait(timeout_watch, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            manager.agent(&agent_id).await.unwrap().status,
            AgentStatus::Error
        );
    }

    #[tokio::test]
    async fn check_health_writes_scores_through() {
        let (monitor, manager, _) = monitor_fixture(MonitorSettings::default());
        let agent_id = manager
            .create_agent("researcher", AgentOverrides::default())
            .await
            .unwrap();
        manager
            .update(&agent_id, |agent| {
                agent.status = AgentStatus::Idle;
                agent.last_heartbeat_at = Some(Utc::now());
            })
            .await
            .unwrap();

        let reports = monitor.check_health().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].overall, 1.0);
        assert_eq!(manager.agent(&agent_id).await.unwrap().health, 1.0);
    }
}
