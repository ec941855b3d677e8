//! Durable, indexed store of agent, task, and workflow records.
//!
//! The registry owns the authoritative persisted copy of every record;
//! component-local maps are caches with write-through semantics. Reads may
//! be served from an in-memory cache with bounded staleness; writes retry
//! against the backend with capped exponential backoff before surfacing
//! `BackendUnavailable`.

mod backend;

pub use backend::{FileBackend, MemoryBackend, RegistryBackend};

use crate::events::{EventBus, EventTopic};
use crate::models::AgentRecord;
use crate::{constants, Result, StrandError};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Partitioned namespaces of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Agents,
    Tasks,
    Workflows,
    Archived,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Agents => "agents",
            Namespace::Tasks => "tasks",
            Namespace::Workflows => "workflows",
            Namespace::Archived => "archived",
        }
    }

    fn update_topic(&self) -> EventTopic {
        match self {
            Namespace::Agents => EventTopic::AgentsUpdated,
            Namespace::Tasks => EventTopic::TasksUpdated,
            Namespace::Workflows => EventTopic::WorkflowsUpdated,
            Namespace::Archived => EventTopic::ArchivedUpdated,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Self-describing persisted document; round-trips bit-stably through
/// the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: String,
    pub kind: String,
    pub version: u32,
    pub payload: Value,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Value, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind: kind.into(),
            version: 1,
            payload,
            tags,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Structured query predicate. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub tag: Option<String>,
    pub name_pattern: Option<String>,
    pub min_health: Option<f64>,
    pub created_after: Option<DateTime<Utc>>,
    pub last_active_after: Option<DateTime<Utc>>,
}

impl RecordQuery {
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn with_min_health(mut self, health: f64) -> Self {
        self.min_health = Some(health);
        self
    }

    fn matches(&self, record: &StoredRecord) -> Result<bool> {
        if let Some(kind) = &self.kind {
            if record.kind != *kind {
                return Ok(false);
            }
        }
        if let Some(tag) = &self.tag {
            if !record.tags.contains(tag) {
                return Ok(false);
            }
        }
        if let Some(status) = &self.status {
            if record.payload.get("status").and_then(Value::as_str) != Some(status.as_str()) {
                return Ok(false);
            }
        }
        if let Some(pattern) = &self.name_pattern {
            let regex = Regex::new(pattern)
                .map_err(|e| StrandError::InvalidArgument(format!("bad name pattern: {e}")))?;
            let name = record
                .payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !regex.is_match(name) {
                return Ok(false);
            }
        }
        if let Some(min) = self.min_health {
            let health = record
                .payload
                .get("health")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            if health < min {
                return Ok(false);
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at <= after {
                return Ok(false);
            }
        }
        if let Some(after) = self.last_active_after {
            let last_active = record
                .payload
                .get("lastActivityAt")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok());
            match last_active {
                Some(ts) if ts > after => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// Tunables; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub cache_staleness: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_write_attempts: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            cache_staleness: Duration::from_secs(constants::REGISTRY_CACHE_STALENESS_SECS),
            backoff_base: Duration::from_millis(constants::REGISTRY_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(constants::REGISTRY_BACKOFF_CAP_MS),
            max_write_attempts: constants::REGISTRY_MAX_WRITE_ATTEMPTS,
        }
    }
}

struct CacheEntry {
    record: StoredRecord,
    fetched_at: Instant,
}

#[derive(Clone)]
pub struct Registry {
    backend: Arc<dyn RegistryBackend>,
    bus: EventBus,
    cache: Arc<RwLock<HashMap<(Namespace, String), CacheEntry>>>,
    settings: RegistrySettings,
}

impl Registry {
    pub fn new(backend: Arc<dyn RegistryBackend>, bus: EventBus, settings: RegistrySettings) -> Self {
        Self {
            backend,
            bus,
            cache: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }
    }

    pub fn in_memory(bus: EventBus) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), bus, RegistrySettings::default())
    }

    /// Durable write-through. Version and creation time are carried over
    /// from any prior record with the same id; emits `{namespace}:updated`.
    pub async fn put(
        &self,
        namespace: Namespace,
        id: &str,
        kind: &str,
        payload: Value,
        tags: Vec<String>,
    ) -> Result<()> {
        let previous = self.get(namespace, id).await.ok().flatten();
        let mut record = StoredRecord::new(id, kind, payload, tags);
        if let Some(prev) = previous {
            record.version = prev.version + 1;
            record.created_at = prev.created_at;
        }

        self.store_with_retry(namespace, &record).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(
                (namespace, id.to_string()),
                CacheEntry {
                    record,
                    fetched_at: Instant::now(),
                },
            );
        }

        self.bus
            .publish(
                namespace.update_topic(),
                json!({"namespace": namespace.as_str(), "id": id}),
            )
            .await;
        Ok(())
    }

    /// Read, preferring a cache entry younger than the staleness bound.
    pub async fn get(&self, namespace: Namespace, id: &str) -> Result<Option<StoredRecord>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&(namespace, id.to_string())) {
                if entry.fetched_at.elapsed() < self.settings.cache_staleness {
                    return Ok(Some(entry.record.clone()));
                }
            }
        }

        let record = self.backend.load(namespace, id).await?;
        if let Some(record) = &record {
            let mut cache = self.cache.write().await;
            cache.insert(
                (namespace, id.to_string()),
                CacheEntry {
                    record: record.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(record)
    }

    /// Remove a record; with `preserve_history` the record moves to the
    /// `archived` namespace stamped with its archival time.
    pub async fn delete(&self, namespace: Namespace, id: &str, preserve_history: bool) -> Result<()> {
        let existing = self.get(namespace, id).await?;
        let Some(mut record) = existing else {
            return Err(StrandError::NotFound(format!("{namespace}/{id}")));
        };

        if preserve_history {
            record.tags.push(format!("archived-from:{namespace}"));
            record.updated_at = Utc::now();
            self.store_with_retry(Namespace::Archived, &record).await?;
            self.bus
                .publish(
                    Namespace::Archived.update_topic(),
                    json!({"namespace": "archived", "id": id}),
                )
                .await;
        }

        self.backend.remove(namespace, id).await?;
        {
            let mut cache = self.cache.write().await;
            cache.remove(&(namespace, id.to_string()));
        }
        self.bus
            .publish(
                namespace.update_topic(),
                json!({"namespace": namespace.as_str(), "id": id}),
            )
            .await;
        Ok(())
    }

    /// Evaluate a structured predicate over a namespace.
    pub async fn query(&self, namespace: Namespace, query: &RecordQuery) -> Result<Vec<StoredRecord>> {
        let records = self.backend.list(namespace).await?;
        let mut matched = Vec::new();
        for record in records {
            if query.matches(&record)? {
                matched.push(record);
            }
        }
        // Stable output order regardless of backend iteration order.
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    /// Deterministic assignment score for an agent against a capability
    /// requirement.
    pub fn score(agent: &AgentRecord, required_capabilities: &[String]) -> f64 {
        let max_concurrent = agent.capabilities.max_concurrent_tasks.max(1) as f64;
        let availability = 1.0 - (agent.workload as f64 / max_concurrent).min(1.0);
        40.0 * agent.health
            + 30.0 * agent.metrics.success_rate()
            + 20.0 * availability
            + 10.0 * agent.capabilities.match_fraction(required_capabilities)
    }

    /// Pick the best agent for a task: `assign_to` is a hard constraint,
    /// otherwise the highest-scoring agent with spare workload wins. Ties
    /// break toward the lower `last_activity_at`, then lexicographic id.
    pub async fn select_agent(
        &self,
        required_capabilities: &[String],
        assign_to: Option<&str>,
    ) -> Result<Option<AgentRecord>> {
        let records = self.backend.list(Namespace::Agents).await?;
        let mut candidates: Vec<AgentRecord> = Vec::new();
        for record in records {
            match serde_json::from_value::<AgentRecord>(record.payload.clone()) {
                Ok(agent) => candidates.push(agent),
                Err(e) => warn!("skipping malformed agent record {}: {e}", record.id),
            }
        }

        candidates.retain(|agent| {
            let accepts_work = matches!(
                agent.status,
                crate::models::AgentStatus::Idle | crate::models::AgentStatus::Busy
            ) && agent.workload < agent.capabilities.max_concurrent_tasks;
            match assign_to {
                Some(id) => agent.id == id && accepts_work,
                None => accepts_work,
            }
        });

        candidates.sort_by(|a, b| {
            let score_a = Self::score(a, required_capabilities);
            let score_b = Self::score(b, required_capabilities);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.last_activity_at.cmp(&b.last_activity_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(candidates.into_iter().next())
    }

    async fn store_with_retry(&self, namespace: Namespace, record: &StoredRecord) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.backend.store(namespace, record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= self.settings.max_write_attempts => {
                    return Err(StrandError::BackendUnavailable(format!(
                        "write {}/{} failed after {} attempts: {e}",
                        namespace,
                        record.id,
                        attempt + 1
                    )));
                }
                Err(e) => {
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        "registry write {}/{} failed (attempt {}): {e}; retrying in {:?}",
                        namespace, record.id, attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff_base.as_millis() as f64;
        let cap = self.settings.backoff_cap.as_millis() as f64;
        let raw = (base * 2f64.powi(attempt as i32)).min(cap);
        let jitter = rand::thread_rng()
            .gen_range(-constants::REGISTRY_BACKOFF_JITTER..=constants::REGISTRY_BACKOFF_JITTER);
        Duration::from_millis((raw * (1.0 + jitter)).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_registry() -> Registry {
        Registry::in_memory(EventBus::new())
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let registry = test_registry();
        let payload = json!({"name": "agent-1", "status": "idle", "health": 0.9});

        registry
            .put(Namespace::Agents, "a-1", "agent", payload.clone(), vec![])
            .await
            .unwrap();

        let record = registry.get(Namespace::Agents, "a-1").await.unwrap().unwrap();
        assert_eq!(record.payload, payload);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn put_increments_version() {
        let registry = test_registry();
        registry
            .put(Namespace::Agents, "a-1", "agent", json!({"n": 1}), vec![])
            .await
            .unwrap();
        registry
            .put(Namespace::Agents, "a-1", "agent", json!({"n": 2}), vec![])
            .await
            .unwrap();

        let record = registry.get(Namespace::Agents, "a-1").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload["n"], 2);
    }

    #[tokio::test]
    async fn delete_preserving_history_archives() {
        let registry = test_registry();
        registry
            .put(Namespace::Agents, "a-1", "agent", json!({"name": "x"}), vec![])
            .await
            .unwrap();

        registry.delete(Namespace::Agents, "a-1", true).await.unwrap();

        assert!(registry.get(Namespace::Agents, "a-1").await.unwrap().is_none());
        let archived = registry
            .get(Namespace::Archived, "a-1")
            .await
            .unwrap()
            .unwrap();
        assert!(archived
            .tags
            .iter()
            .any(|t| t == "archived-from:agents"));
    }

    #[tokio::test]
    async fn delete_of_unknown_id_is_not_found() {
        let registry = test_registry();
        let result = registry.delete(Namespace::Tasks, "missing", false).await;
        assert!(matches!(result, Err(StrandError::NotFound(_))));
    }

    #[tokio::test]
    async fn query_filters_by_status_and_tag() {
        let registry = test_registry();
        registry
            .put(
                Namespace::Agents,
                "a-1",
                "agent",
                json!({"name": "fast-worker", "status": "idle", "health": 0.9}),
                vec!["pool:alpha".to_string()],
            )
            .await
            .unwrap();
        registry
            .put(
                Namespace::Agents,
                "a-2",
                "agent",
                json!({"name": "slow-worker", "status": "busy", "health": 0.4}),
                vec!["pool:alpha".to_string()],
            )
            .await
            .unwrap();

        let idle = registry
            .query(Namespace::Agents, &RecordQuery::default().with_status("idle"))
            .await
            .unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, "a-1");

        let tagged = registry
            .query(
                Namespace::Agents,
                &RecordQuery::default().with_tag("pool:alpha"),
            )
            .await
            .unwrap();
        assert_eq!(tagged.len(), 2);

        let healthy = registry
            .query(
                Namespace::Agents,
                &RecordQuery::default().with_min_health(0.5),
            )
            .await
            .unwrap();
        assert_eq!(healthy.len(), 1);

        let named = registry
            .query(
                Namespace::Agents,
                &RecordQuery::default().with_name_pattern("^fast-"),
            )
            .await
            .unwrap();
        assert_eq!(named.len(), 1);
    }

    #[tokio::test]
    async fn score_is_deterministic_and_weighted() {
        let mut agent = AgentRecord::new("researcher", "researcher", "r-1".to_string());
        agent.health = 1.0;
        agent.workload = 0;

        // Perfect agent, no requirements: 40 + 30 + 20 + 10
        let score = Registry::score(&agent, &[]);
        assert!((score - 100.0).abs() < 1e-9);

        agent.workload = agent.capabilities.max_concurrent_tasks;
        let loaded = Registry::score(&agent, &[]);
        assert!((loaded - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn select_agent_honors_hard_assignment() {
        let registry = test_registry();
        for (id, health) in [("a-1", 0.5), ("a-2", 1.0)] {
            let mut agent = AgentRecord::new("coder", "coder", id.to_string());
            agent.id = id.to_string();
            agent.status = AgentStatus::Idle;
            agent.health = health;
            registry
                .put(
                    Namespace::Agents,
                    id,
                    "agent",
                    serde_json::to_value(&agent).unwrap(),
                    vec![],
                )
                .await
                .unwrap();
        }

        // Best score would be a-2, but assignment pins a-1.
        let picked = registry.select_agent(&[], Some("a-1")).await.unwrap().unwrap();
        assert_eq!(picked.id, "a-1");

        let best = registry.select_agent(&[], None).await.unwrap().unwrap();
        assert_eq!(best.id, "a-2");
    }

    #[tokio::test]
    async fn select_agent_skips_saturated_agents() {
        let registry = test_registry();
        let mut agent = AgentRecord::new("coder", "coder", "a-1".to_string());
        agent.id = "a-1".to_string();
        agent.status = AgentStatus::Busy;
        agent.workload = agent.capabilities.max_concurrent_tasks;
        registry
            .put(
                Namespace::Agents,
                "a-1",
                "agent",
                serde_json::to_value(&agent).unwrap(),
                vec![],
            )
            .await
            .unwrap();

        assert!(registry.select_agent(&[], None).await.unwrap().is_none());
    }

    struct FlakyBackend {
        inner: MemoryBackend,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl RegistryBackend for FlakyBackend {
        async fn store(&self, namespace: Namespace, record: &StoredRecord) -> Result<()> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 { Some(n - 1) } else { None }
            }).is_ok()
            {
                return Err(StrandError::BackendUnavailable("injected".to_string()));
            }
            self.inner.store(namespace, record).await
        }

        async fn load(&self, namespace: Namespace, id: &str) -> Result<Option<StoredRecord>> {
            self.inner.load(namespace, id).await
        }

        async fn remove(&self, namespace: Namespace, id: &str) -> Result<()> {
            self.inner.remove(namespace, id).await
        }

        async fn list(&self, namespace: Namespace) -> Result<Vec<StoredRecord>> {
            self.inner.list(namespace).await
        }
    }

    #[tokio::test]
    async fn writes_retry_with_backoff_then_succeed() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(),
            failures_left: AtomicU32::new(2),
        });
        let settings = RegistrySettings {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            ..Default::default()
        };
        let registry = Registry::new(backend, EventBus::new(), settings);

        registry
            .put(Namespace::Tasks, "t-1", "task", json!({}), vec![])
            .await
            .unwrap();
        assert!(registry.get(Namespace::Tasks, "t-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_backend_unavailable() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(),
            failures_left: AtomicU32::new(100),
        });
        let settings = RegistrySettings {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            max_write_attempts: 3,
            ..Default::default()
        };
        let registry = Registry::new(backend, EventBus::new(), settings);

        let result = registry
            .put(Namespace::Tasks, "t-1", "task", json!({}), vec![])
            .await;
        assert!(matches!(result, Err(StrandError::BackendUnavailable(_))));
    }
}
