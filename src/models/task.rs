use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task in the workflow pipeline.
///
/// Transitions are totally ordered per task id: `pending → ready →
/// assigned → running → (completed | failed | cancelled)`. A failed task
/// with retries left re-enters `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

/// Execution metrics reported by an agent alongside a task outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub execution_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// A unit of work inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    /// Higher priority dispatches earlier within a ready wave.
    pub priority: i32,
    /// Ids of tasks in the same workflow that must complete first.
    pub dependencies: Vec<String>,
    /// Hard assignment to a declared agent id.
    pub assign_to: Option<String>,
    /// Capability labels used for agent selection when unassigned.
    pub required_capabilities: Vec<String>,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub retries_left: u32,
    pub timeout_ms: Option<u64>,
    pub assigned_agent: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            description: description.into(),
            priority: 0,
            dependencies: Vec::new(),
            assign_to: None,
            required_capabilities: Vec::new(),
            status: TaskStatus::Pending,
            input: serde_json::Value::Null,
            output: None,
            error: None,
            retries_left: 0,
            timeout_ms: None,
            assigned_agent: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
