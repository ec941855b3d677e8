//! # Strand Core
//!
//! Strand Core is an agent orchestration runtime: it owns the lifecycle of
//! long-running worker processes ("agents"), dispatches dependency-aware
//! task graphs to them, enforces liveness through heartbeats and health
//! scoring, scales homogeneous agent pools on demand, and persists all of
//! it so a restart is transparent.
//!
//! ## Architecture
//!
//! - **Event Bus**: the sole in-process signaling channel between components
//! - **Registry**: durable, indexed store of agent/task/workflow records
//! - **Process Supervisor**: spawns and reaps one OS process per agent
//! - **Health Monitor**: heartbeat enforcement and four-dimension scoring
//! - **Lifecycle Manager**: template-driven agent creation and state
//! - **Pool Controller**: elastic min/max sizing with acquire/release
//! - **Workflow Engine**: validated DAG execution with retries and policies
//!
//! The root [`orchestrator::Orchestrator`] constructs all of the above at
//! startup and hands out handles; there is no global state.

/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Typed in-process publish/subscribe
pub mod events;
/// Periodic health scoring and heartbeat enforcement
pub mod health;
/// Agent lifecycle management and templates
pub mod lifecycle;
/// Core data models
pub mod models;
/// Root orchestrator object
pub mod orchestrator;
/// Elastic agent pools
pub mod pool;
/// Child process supervision
pub mod process;
/// Durable record store with scoring
pub mod registry;
/// Workflow validation and execution
pub mod workflow;

#[cfg(test)]
mod tests;

pub use error::{Result, StrandError};
