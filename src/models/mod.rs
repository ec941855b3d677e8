//! Core data models shared by every runtime component.
//!
//! Records here are closed, enumerated structures. The lifecycle manager
//! exclusively owns agent records, the workflow engine owns task and
//! workflow records; everything else reads them through the registry.

mod agent;
mod pool;
mod task;
mod workflow;

pub use agent::{
    AgentCapabilities, AgentConfig, AgentEnvironment, AgentErrorEntry, AgentErrorKind,
    AgentMetrics, AgentRecord, AgentStatus, ErrorSeverity, ResourceUsage, TaskHistoryEntry,
};
pub use pool::{PoolMetric, PoolRecord, RuleComparison, ScaleAction, ScalingRule};
pub use task::{TaskMetrics, TaskRecord, TaskStatus};
pub use workflow::{
    DeclaredAgent, FailurePolicy, RetryPolicy, WorkflowProgress, WorkflowRecord, WorkflowSettings,
    WorkflowStatus,
};
