use crate::constants;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle state of an agent.
///
/// `Terminated` is absorbing; any state may drop to `Error`, and a
/// successful heartbeat lifts `Error` back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Idle,
    Busy,
    Error,
    Terminating,
    Terminated,
    Offline,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Terminated)
    }

    /// Active agents count against the configured agent cap.
    pub fn is_active(&self) -> bool {
        !matches!(self, AgentStatus::Terminated | AgentStatus::Offline)
    }
}

/// Semantic capability bag used for task matching and scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub domains: Vec<String>,
    pub tools: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub max_memory_bytes: u64,
    pub max_execution_ms: u64,
    /// Baseline scores in [0, 1].
    pub reliability: f64,
    pub speed: f64,
    pub quality: f64,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            languages: Vec::new(),
            frameworks: Vec::new(),
            domains: Vec::new(),
            tools: Vec::new(),
            max_concurrent_tasks: 4,
            max_memory_bytes: 512 * 1024 * 1024,
            max_execution_ms: 300_000,
            reliability: 0.8,
            speed: 0.8,
            quality: 0.8,
        }
    }
}

impl AgentCapabilities {
    /// All capability labels this agent advertises, for match scoring.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.languages
            .iter()
            .chain(self.frameworks.iter())
            .chain(self.domains.iter())
            .chain(self.tools.iter())
            .map(String::as_str)
    }

    /// Fraction of `required` labels this agent satisfies; 1.0 when nothing
    /// is required.
    pub fn match_fraction(&self, required: &[String]) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let matched = required
            .iter()
            .filter(|req| self.labels().any(|have| have == req.as_str()))
            .count();
        matched as f64 / required.len() as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Autonomy level in [0, 1]; higher means fewer approval gates.
    pub autonomy_level: f64,
    pub learning_enabled: bool,
    pub adaptation_enabled: bool,
    pub max_tasks_per_hour: u32,
    pub timeout_ms: u64,
    pub permissions: Vec<String>,
    /// Expertise weights by domain label.
    pub expertise: HashMap<String, f64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            autonomy_level: 0.5,
            learning_enabled: false,
            adaptation_enabled: false,
            max_tasks_per_hour: 60,
            timeout_ms: 300_000,
            permissions: Vec::new(),
            expertise: HashMap::new(),
        }
    }
}

/// Where and how the agent process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEnvironment {
    pub runtime: String,
    pub working_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,
    pub available_tools: Vec<String>,
    pub api_endpoints: HashMap<String, String>,
}

impl Default for AgentEnvironment {
    fn default() -> Self {
        Self {
            runtime: "process".to_string(),
            working_dir: PathBuf::from("."),
            temp_dir: std::env::temp_dir(),
            log_dir: PathBuf::from("logs"),
            available_tools: Vec::new(),
            api_endpoints: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    StartupFailed,
    ProcessExit,
    HeartbeatTimeout,
    TaskFailed,
    Internal,
}

/// One entry in an agent's bounded error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: AgentErrorKind,
    pub message: String,
    pub context: HashMap<String, String>,
    pub severity: ErrorSeverity,
    pub resolved: bool,
}

impl AgentErrorEntry {
    pub fn new(kind: AgentErrorKind, message: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            context: HashMap::new(),
            severity,
            resolved: false,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub execution_ms: u64,
}

/// Rolling execution metrics folded in from task completion reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_execution_ms: f64,
    /// Reference execution time the performance score compares against.
    pub baseline_execution_ms: f64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            avg_execution_ms: 0.0,
            baseline_execution_ms: 10_000.0,
        }
    }
}

impl AgentMetrics {
    pub fn record_completion(&mut self, execution_ms: u64) {
        self.tasks_completed += 1;
        let n = self.tasks_completed + self.tasks_failed;
        self.avg_execution_ms =
            (self.avg_execution_ms * (n - 1) as f64 + execution_ms as f64) / n as f64;
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
    }

    /// `completed / (completed + failed)`; 1.0 before any history exists.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// Last reported resource consumption against the agent's limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_used: f64,
    pub cpu_limit: f64,
    pub disk_used_bytes: u64,
    pub disk_limit_bytes: u64,
}

/// Authoritative record for one agent.
///
/// The id is stable across restarts; template provenance makes a restart
/// after a crash deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub template: String,
    pub status: AgentStatus,
    pub capabilities: AgentCapabilities,
    pub config: AgentConfig,
    pub environment: AgentEnvironment,
    /// Count of in-flight tasks; never exceeds `capabilities.max_concurrent_tasks`.
    pub workload: u32,
    pub health: f64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub error_history: Vec<AgentErrorEntry>,
    pub task_history: Vec<TaskHistoryEntry>,
    pub metrics: AgentMetrics,
    pub resources: Option<ResourceUsage>,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(template: impl Into<String>, agent_type: impl Into<String>, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            agent_type: agent_type.into(),
            template: template.into(),
            status: AgentStatus::Initializing,
            capabilities: AgentCapabilities::default(),
            config: AgentConfig::default(),
            environment: AgentEnvironment::default(),
            workload: 0,
            health: 1.0,
            last_heartbeat_at: None,
            last_activity_at: now,
            error_history: Vec::new(),
            task_history: Vec::new(),
            metrics: AgentMetrics::default(),
            resources: None,
            pid: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an error, evicting the oldest entry past the history cap.
    pub fn push_error(&mut self, entry: AgentErrorEntry) {
        self.error_history.push(entry);
        if self.error_history.len() > constants::MAX_ERROR_HISTORY {
            self.error_history.remove(0);
        }
    }

    pub fn push_task_history(&mut self, entry: TaskHistoryEntry) {
        self.task_history.push(entry);
        if self.task_history.len() > constants::MAX_TASK_HISTORY {
            self.task_history.remove(0);
        }
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_activity_at = now;
        self.updated_at = now;
    }
}
