use super::task::TaskRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    #[default]
    None,
    Immediate,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    FailFast,
    Continue,
    Ignore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Concurrent dispatch bound; treated as 1 when unset.
    pub max_concurrency: Option<usize>,
    /// Wall-clock deadline for the whole workflow, in milliseconds.
    pub timeout: Option<u64>,
    pub retry_policy: RetryPolicy,
    pub failure_policy: FailurePolicy,
}

/// Aggregate counters; `completed + failed` never exceeds `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// An agent declared by a workflow document, resolvable via `assignTo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredAgent {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub name: Option<String>,
    pub config: Option<serde_json::Value>,
}

/// A validated DAG of tasks with execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub variables: HashMap<String, serde_json::Value>,
    pub tasks: Vec<TaskRecord>,
    pub agents: Vec<DeclaredAgent>,
    pub settings: WorkflowSettings,
    pub status: WorkflowStatus,
    pub progress: WorkflowProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskRecord>) -> Self {
        let total = tasks.len();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            variables: HashMap::new(),
            tasks,
            agents: Vec::new(),
            settings: WorkflowSettings::default(),
            status: WorkflowStatus::Pending,
            progress: WorkflowProgress {
                total,
                completed: 0,
                failed: 0,
            },
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }
}
