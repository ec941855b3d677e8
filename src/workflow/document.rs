use crate::models::{
    DeclaredAgent, FailurePolicy, RetryPolicy, TaskRecord, WorkflowRecord, WorkflowSettings,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Workflow input document as submitted by callers.
///
/// Fields that validation is responsible for (task type, description) are
/// lenient here so a malformed document parses and then fails validation
/// with a precise message instead of a serde error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub agents: Vec<AgentDeclaration>,
    #[serde(default)]
    pub tasks: Vec<TaskDeclaration>,
    #[serde(default)]
    pub settings: SettingsDeclaration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeclaration {
    pub id: String,
    #[serde(rename = "type", default)]
    pub agent_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDeclaration {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assign_to: Option<String>,
    #[serde(default, alias = "dependencies")]
    pub depends: Vec<String>,
    #[serde(default)]
    pub input: Value,
    /// Per-task deadline in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Reserved; conditions are evaluated by an outer adapter.
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDeclaration {
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl WorkflowDocument {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Convert a validated document into the executable record.
    pub fn into_record(self) -> WorkflowRecord {
        let tasks: Vec<TaskRecord> = self
            .tasks
            .into_iter()
            .map(|decl| {
                let mut task = TaskRecord::new(decl.task_type, decl.description)
                    .with_id(decl.id)
                    .with_dependencies(decl.depends)
                    .with_priority(decl.priority.unwrap_or(0));
                task.assign_to = decl.assign_to;
                task.input = decl.input;
                task.timeout_ms = decl.timeout;
                task.retries_left = decl.retries.unwrap_or(0);
                task.required_capabilities = decl.required_capabilities;
                task
            })
            .collect();

        let mut workflow = WorkflowRecord::new(self.name, tasks);
        workflow.variables = self.variables;
        workflow.agents = self
            .agents
            .into_iter()
            .map(|decl| DeclaredAgent {
                id: decl.id,
                agent_type: decl.agent_type,
                name: decl.name,
                config: decl.config,
            })
            .collect();
        workflow.settings = WorkflowSettings {
            max_concurrency: self.settings.max_concurrency,
            timeout: self.settings.timeout,
            retry_policy: self.settings.retry_policy,
            failure_policy: self.settings.failure_policy,
        };
        workflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_document() {
        let raw = r#"{
            "name": "build-and-test",
            "version": "1.0",
            "variables": {"target": "release"},
            "agents": [{"id": "builder", "type": "coder"}],
            "tasks": [
                {"id": "build", "type": "shell", "description": "compile", "input": {"mode": "${target}"}},
                {"id": "test", "type": "shell", "description": "run tests", "depends": ["build"], "timeout": 60000, "retries": 2}
            ],
            "settings": {"maxConcurrency": 2, "retryPolicy": "exponential", "failurePolicy": "continue"}
        }"#;

        let doc = WorkflowDocument::from_json(raw).unwrap();
        assert_eq!(doc.name, "build-and-test");
        assert_eq!(doc.tasks.len(), 2);
        assert_eq!(doc.tasks[1].depends, vec!["build"]);
        assert_eq!(doc.settings.max_concurrency, Some(2));
        assert_eq!(doc.settings.retry_policy, RetryPolicy::Exponential);
        assert_eq!(doc.settings.failure_policy, FailurePolicy::Continue);

        let record = doc.into_record();
        assert_eq!(record.progress.total, 2);
        assert_eq!(record.tasks[1].retries_left, 2);
        assert_eq!(record.tasks[1].timeout_ms, Some(60_000));
    }

    #[test]
    fn dependencies_alias_is_accepted() {
        let raw = r#"{
            "name": "alias",
            "tasks": [
                {"id": "a", "type": "t", "description": "d"},
                {"id": "b", "type": "t", "description": "d", "dependencies": ["a"]}
            ]
        }"#;
        let doc = WorkflowDocument::from_json(raw).unwrap();
        assert_eq!(doc.tasks[1].depends, vec!["a"]);
    }

    #[test]
    fn missing_fields_parse_and_defer_to_validation() {
        let raw = r#"{"name": "sparse", "tasks": [{"id": "a"}]}"#;
        let doc = WorkflowDocument::from_json(raw).unwrap();
        assert!(doc.tasks[0].task_type.is_empty());
        assert!(doc.tasks[0].description.is_empty());
    }
}
