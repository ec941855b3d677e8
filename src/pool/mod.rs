//! Elastic agent pools.
//!
//! A pool is a homogeneous set of agents instantiated from one template.
//! Membership is mutated under a per-pool lock so that
//! `current_size == |available| + |busy|` holds at every step. Acquire
//! blocks with a timeout when the pool is saturated; the autoscaler and
//! the maintenance sweep run on the shared pool loop.

use crate::events::{EventBus, EventTopic};
use crate::lifecycle::{AgentManager, AgentOverrides};
use crate::models::{
    AgentStatus, PoolMetric, PoolRecord, RuleComparison, ScaleAction, ScalingRule,
};
use crate::{constants, Result, StrandError};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool shape supplied at creation.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub auto_scale: bool,
    pub scale_up_at: f64,
    pub scale_down_at: f64,
    pub recycle_after: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            auto_scale: false,
            scale_up_at: 0.8,
            scale_down_at: 0.2,
            recycle_after: 100,
        }
    }
}

struct MemberState {
    use_count: u32,
    last_activity: DateTime<Utc>,
}

struct PoolWaiter {
    id: u64,
    tx: oneshot::Sender<String>,
}

struct PoolState {
    record: PoolRecord,
    members: HashMap<String, MemberState>,
    waiters: VecDeque<PoolWaiter>,
    rules: Vec<ScalingRule>,
    /// Growths reserved but not yet admitted, counted against `max_size`.
    pending_grows: usize,
    last_scale_action: Option<Instant>,
    next_waiter_id: u64,
}

impl PoolState {
    /// Take the most recently active available agent.
    fn pop_available(&mut self) -> Option<String> {
        let freshest = self
            .record
            .available
            .iter()
            .enumerate()
            .max_by_key(|(_, id)| {
                self.members
                    .get(*id)
                    .map(|m| m.last_activity)
                    .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
            })
            .map(|(index, _)| index)?;
        Some(self.record.available.remove(freshest))
    }

    fn mark_busy(&mut self, agent_id: &str) {
        self.record.busy.push(agent_id.to_string());
        if let Some(member) = self.members.get_mut(agent_id) {
            member.use_count += 1;
            member.last_activity = Utc::now();
        }
    }

    fn forget_member(&mut self, agent_id: &str) {
        self.members.remove(agent_id);
        self.record.available.retain(|id| id != agent_id);
        self.record.busy.retain(|id| id != agent_id);
        self.record.current_size = self.members.len();
    }
}

#[derive(Clone)]
pub struct PoolManager {
    manager: AgentManager,
    bus: EventBus,
    pools: Arc<RwLock<HashMap<String, Arc<Mutex<PoolState>>>>>,
    shutdown: CancellationToken,
    scale_cooldown: Duration,
    stale_idle_after: Duration,
}

impl PoolManager {
    pub fn new(manager: AgentManager, bus: EventBus, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            bus,
            pools: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            scale_cooldown: Duration::from_secs(constants::POOL_SCALE_COOLDOWN_SECS),
            stale_idle_after: Duration::from_secs(constants::POOL_STALE_IDLE_SECS),
        }
    }

    /// Create a pool and start its `min_size` agents.
    pub async fn create_pool(
        &self,
        name: &str,
        template: &str,
        options: PoolOptions,
    ) -> Result<String> {
        if options.min_size > options.max_size {
            return Err(StrandError::InvalidArgument(format!(
                "min_size {} exceeds max_size {}",
                options.min_size, options.max_size
            )));
        }
        if self.manager.template(template).await.is_none() {
            return Err(StrandError::NotFound(format!("template {template}")));
        }

        let mut record = PoolRecord::new(name, template);
        record.min_size = options.min_size;
        record.max_size = options.max_size;
        record.auto_scale = options.auto_scale;
        record.scale_up_at = options.scale_up_at;
        record.scale_down_at = options.scale_down_at;
        record.recycle_after = options.recycle_after;
        let pool_id = record.id.clone();

        let rules = vec![
            ScalingRule {
                metric: PoolMetric::PoolUtilization,
                comparison: RuleComparison::Above,
                threshold: options.scale_up_at,
                action: ScaleAction::ScaleUp,
                amount: 1,
            },
            ScalingRule {
                metric: PoolMetric::PoolUtilization,
                comparison: RuleComparison::Below,
                threshold: options.scale_down_at,
                action: ScaleAction::ScaleDown,
                amount: 1,
            },
        ];

        let state = Arc::new(Mutex::new(PoolState {
            record,
            members: HashMap::new(),
            waiters: VecDeque::new(),
            rules,
            pending_grows: 0,
            last_scale_action: None,
            next_waiter_id: 1,
        }));

        {
            let mut pools = self.pools.write().await;
            pools.insert(pool_id.clone(), state);
        }

        for _ in 0..options.min_size {
            let agent_id = self.spawn_member(&pool_id).await?;
            self.admit(&pool_id, agent_id, false).await;
        }

        self.bus
            .publish(
                EventTopic::PoolCreated,
                json!({
                    "poolId": pool_id,
                    "name": name,
                    "template": template,
                    "size": options.min_size,
                }),
            )
            .await;
        info!("pool {name} ({pool_id}) created with {} agent(s)", options.min_size);
        Ok(pool_id)
    }

    /// Snapshot every pool's record.
    pub async fn list_pools(&self) -> Vec<PoolRecord> {
        let states: Vec<Arc<Mutex<PoolState>>> = {
            let pools = self.pools.read().await;
            pools.values().cloned().collect()
        };
        let mut records = Vec::with_capacity(states.len());
        for state in states {
            records.push(state.lock().await.record.clone());
        }
        records
    }

    /// Number of acquirers currently queued behind releases.
    pub async fn queue_depth(&self, pool_id: &str) -> Result<usize> {
        let state = self.state(pool_id).await?;
        let state = state.lock().await;
        Ok(state.waiters.len())
    }

    pub async fn pool(&self, pool_id: &str) -> Option<PoolRecord> {
        let pools = self.pools.read().await;
        match pools.get(pool_id) {
            Some(state) => Some(state.lock().await.record.clone()),
            None => None,
        }
    }

    /// Take an agent from the pool, waiting up to `timeout` when saturated.
    pub async fn acquire(&self, pool_id: &str, timeout: Duration) -> Result<String> {
        if self.shutdown.is_cancelled() {
            return Err(StrandError::Cancelled("pool manager is shutting down".into()));
        }

        let state = self.state(pool_id).await?;

        // Fast path: a free agent, or headroom to grow.
        let (claimed, grow) = {
            let mut state = state.lock().await;
            if let Some(agent_id) = state.pop_available() {
                state.mark_busy(&agent_id);
                (Some(agent_id), false)
            } else {
                let headroom = state.record.current_size + state.pending_grows
                    < state.record.max_size;
                if state.record.auto_scale && headroom {
                    state.pending_grows += 1;
                    (None, true)
                } else {
                    (None, false)
                }
            }
        };

        if let Some(agent_id) = claimed {
            debug!("pool {pool_id}: acquired {agent_id}");
            return Ok(agent_id);
        }

        if grow {
            match self.spawn_member(pool_id).await {
                Ok(agent_id) => {
                    let mut state = state.lock().await;
                    state.pending_grows -= 1;
                    state
                        .members
                        .insert(agent_id.clone(), MemberState {
                            use_count: 0,
                            last_activity: Utc::now(),
                        });
                    state.record.current_size = state.members.len();
                    state.mark_busy(&agent_id);
                    debug!("pool {pool_id}: grew by one, acquired {agent_id}");
                    return Ok(agent_id);
                }
                Err(e) => {
                    let mut state = state.lock().await;
                    state.pending_grows -= 1;
                    warn!("pool {pool_id}: grow failed: {e}");
                    // A release may have landed while the grow was running.
                    if let Some(agent_id) = state.pop_available() {
                        state.mark_busy(&agent_id);
                        return Ok(agent_id);
                    }
                }
            }
        }

        // Slow path: queue behind releases.
        let (waiter_id, rx) = {
            let mut state = state.lock().await;
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(PoolWaiter { id, tx });
            (id, rx)
        };

        tokio::select! {
            result = rx => result.map_err(|_| {
                StrandError::NoCapacity(format!("pool {pool_id}: waiter dropped"))
            }),
            _ = tokio::time::sleep(timeout) => {
                let mut state = state.lock().await;
                state.waiters.retain(|w| w.id != waiter_id);
                Err(StrandError::NoCapacity(format!(
                    "pool {pool_id}: no agent released within {timeout:?}"
                )))
            }
            _ = self.shutdown.cancelled() => {
                let mut state = state.lock().await;
                state.waiters.retain(|w| w.id != waiter_id);
                Err(StrandError::Cancelled("pool manager is shutting down".into()))
            }
        }
    }

    /// Return an agent to the pool. Exhausted or dead agents are destroyed
    /// and, when that drops the pool under `min_size`, replaced.
    pub async fn release(&self, pool_id: &str, agent_id: &str) -> Result<()> {
        let state = self.state(pool_id).await?;

        let recycle = {
            let mut state = state.lock().await;
            if !state.record.busy.iter().any(|id| id == agent_id) {
                return Err(StrandError::InvalidArgument(format!(
                    "agent {agent_id} is not checked out of pool {pool_id}"
                )));
            }
            state.record.busy.retain(|id| id != agent_id);

            let exhausted = state
                .members
                .get(agent_id)
                .map(|m| m.use_count >= state.record.recycle_after)
                .unwrap_or(true);
            let alive = matches!(
                self.manager.agent(agent_id).await.map(|a| a.status),
                Some(AgentStatus::Idle) | Some(AgentStatus::Busy)
            );

            if exhausted || !alive {
                state.forget_member(agent_id);
                true
            } else {
                if let Some(member) = state.members.get_mut(agent_id) {
                    member.last_activity = Utc::now();
                }
                state.record.available.push(agent_id.to_string());
                false
            }
        };

        if recycle {
            debug!("pool {pool_id}: recycling {agent_id}");
            if let Err(e) = self.manager.stop_agent(agent_id, "recycled").await {
                warn!("pool {pool_id}: stop of recycled {agent_id} failed: {e}");
            }
            let under_min = {
                let state = state.lock().await;
                state.record.current_size < state.record.min_size
            };
            if under_min {
                match self.spawn_member(pool_id).await {
                    Ok(replacement) => self.admit(pool_id, replacement, false).await,
                    Err(e) => warn!("pool {pool_id}: replacement spawn failed: {e}"),
                }
            }
        }

        self.dispense(&state).await;
        Ok(())
    }

    /// Scale the pool to exactly `target` agents.
    ///
    /// Growth follows template order with stable instance numbering;
    /// shrinkage removes least-recently-active available agents.
    pub async fn scale_pool(&self, pool_id: &str, target: usize) -> Result<()> {
        let state = self.state(pool_id).await?;
        let (current, min_size, max_size) = {
            let state = state.lock().await;
            (
                state.record.current_size,
                state.record.min_size,
                state.record.max_size,
            )
        };

        if target < min_size || target > max_size {
            return Err(StrandError::LimitExceeded(format!(
                "target {target} outside pool bounds [{min_size}, {max_size}]"
            )));
        }

        if target > current {
            for _ in current..target {
                let agent_id = self.spawn_member(pool_id).await?;
                self.admit(pool_id, agent_id, false).await;
            }
        } else if target < current {
            let victims = {
                let mut state = state.lock().await;
                let mut available: Vec<String> = state.record.available.clone();
                available.sort_by_key(|id| {
                    state
                        .members
                        .get(id)
                        .map(|m| m.last_activity)
                        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
                });
                let count = (current - target).min(available.len());
                let victims: Vec<String> = available.into_iter().take(count).collect();
                for id in &victims {
                    state.forget_member(id);
                }
                victims
            };
            for agent_id in victims {
                if let Err(e) = self.manager.stop_agent(&agent_id, "scaled down").await {
                    warn!("pool {pool_id}: stop during scale-down failed: {e}");
                }
            }
        }

        let new_size = {
            let state = state.lock().await;
            state.record.current_size
        };
        self.bus
            .publish(
                EventTopic::PoolScaled,
                json!({"poolId": pool_id, "from": current, "to": new_size}),
            )
            .await;
        info!("pool {pool_id} scaled {current} -> {new_size}");

        self.dispense(&state).await;
        Ok(())
    }

    /// Run the maintenance and autoscale sweep until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("pool maintenance loop running");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(constants::POOL_MAINTENANCE_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
        info!("pool maintenance loop stopped");
    }

    /// One maintenance pass over every pool: drop dead members, replenish
    /// to minimum, recycle stale idlers, then evaluate scaling rules.
    pub async fn sweep(&self) {
        let pool_ids: Vec<String> = {
            let pools = self.pools.read().await;
            pools.keys().cloned().collect()
        };
        for pool_id in pool_ids {
            if let Err(e) = self.maintain(&pool_id).await {
                warn!("maintenance of pool {pool_id} failed: {e}");
            }
            if let Err(e) = self.evaluate_rules(&pool_id).await {
                warn!("autoscale evaluation of pool {pool_id} failed: {e}");
            }
        }
    }

    async fn maintain(&self, pool_id: &str) -> Result<()> {
        let state = self.state(pool_id).await?;

        // Dead members: gone from the manager or terminated.
        let member_ids: Vec<String> = {
            let state = state.lock().await;
            state.members.keys().cloned().collect()
        };
        for agent_id in member_ids {
            let dead = match self.manager.agent(&agent_id).await {
                None => true,
                Some(agent) => matches!(
                    agent.status,
                    AgentStatus::Terminated | AgentStatus::Offline
                ),
            };
            if dead {
                let mut state = state.lock().await;
                debug!("pool {pool_id}: removing dead member {agent_id}");
                state.forget_member(&agent_id);
            }
        }

        // Stale idlers above the minimum get recycled.
        let stale: Vec<String> = {
            let state = state.lock().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.stale_idle_after).unwrap_or_default();
            let headroom = state.record.current_size.saturating_sub(state.record.min_size);
            state
                .record
                .available
                .iter()
                .filter(|id| {
                    state
                        .members
                        .get(*id)
                        .map(|m| m.last_activity < cutoff)
                        .unwrap_or(false)
                })
                .take(headroom)
                .cloned()
                .collect()
        };
        for agent_id in stale {
            {
                let mut state = state.lock().await;
                state.forget_member(&agent_id);
            }
            debug!("pool {pool_id}: recycling stale idle agent {agent_id}");
            if let Err(e) = self.manager.stop_agent(&agent_id, "stale idle").await {
                warn!("pool {pool_id}: stale recycle of {agent_id} failed: {e}");
            }
        }

        // Replenish to the floor.
        loop {
            let needed = {
                let state = state.lock().await;
                state.record.current_size + state.pending_grows < state.record.min_size
            };
            if !needed {
                break;
            }
            let agent_id = self.spawn_member(pool_id).await?;
            self.admit(pool_id, agent_id, false).await;
        }

        self.dispense(&state).await;
        Ok(())
    }

    /// Evaluate scaling rules top-to-bottom; the first match within an
    /// expired cooldown window fires, and only one action per window.
    async fn evaluate_rules(&self, pool_id: &str) -> Result<()> {
        let state = self.state(pool_id).await?;
        let action = {
            let mut state = state.lock().await;
            if !state.record.auto_scale {
                return Ok(());
            }
            if let Some(last) = state.last_scale_action {
                if last.elapsed() < self.scale_cooldown {
                    return Ok(());
                }
            }

            let utilization = state.record.utilization();
            let queue_depth = state.waiters.len() as f64;
            let mut fired = None;
            for rule in &state.rules {
                let value = match rule.metric {
                    PoolMetric::PoolUtilization => utilization,
                    PoolMetric::QueueDepth => queue_depth,
                };
                if rule.matches(value) {
                    fired = Some((rule.action, rule.amount));
                    break;
                }
            }

            if let Some((action, amount)) = fired {
                state.last_scale_action = Some(Instant::now());
                let current = state.record.current_size;
                let target = match action {
                    ScaleAction::ScaleUp => (current + amount).min(state.record.max_size),
                    ScaleAction::ScaleDown => {
                        current.saturating_sub(amount).max(state.record.min_size)
                    }
                };
                if target != current {
                    Some(target)
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(target) = action {
            self.scale_pool(pool_id, target).await?;
        }
        Ok(())
    }

    /// Remove an agent from every pool that holds it; used when the
    /// lifecycle manager reports it gone.
    pub async fn evict_agent(&self, agent_id: &str) {
        let pools: Vec<Arc<Mutex<PoolState>>> = {
            let pools = self.pools.read().await;
            pools.values().cloned().collect()
        };
        for state in pools {
            let mut state = state.lock().await;
            if state.members.contains_key(agent_id) {
                state.forget_member(agent_id);
            }
        }
    }

    /// Stop every pool member; used during orchestrator shutdown.
    pub async fn drain(&self) {
        let pool_ids: Vec<String> = {
            let pools = self.pools.read().await;
            pools.keys().cloned().collect()
        };
        for pool_id in pool_ids {
            let Ok(state) = self.state(&pool_id).await else {
                continue;
            };
            let members: Vec<String> = {
                let mut state = state.lock().await;
                let ids: Vec<String> = state.members.keys().cloned().collect();
                for id in &ids {
                    state.forget_member(id);
                }
                state.waiters.clear();
                ids
            };
            for agent_id in members {
                if let Err(e) = self.manager.stop_agent(&agent_id, "shutdown").await {
                    warn!("drain of pool {pool_id}: stop {agent_id} failed: {e}");
                }
            }
        }
    }

    // Internals

    async fn state(&self, pool_id: &str) -> Result<Arc<Mutex<PoolState>>> {
        let pools = self.pools.read().await;
        pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| StrandError::NotFound(format!("pool {pool_id}")))
    }

    async fn spawn_member(&self, pool_id: &str) -> Result<String> {
        let template = {
            let state = self.state(pool_id).await?;
            let state = state.lock().await;
            state.record.template.clone()
        };
        let agent_id = self
            .manager
            .create_agent(&template, AgentOverrides::default())
            .await?;
        if let Err(e) = self.manager.start_agent(&agent_id).await {
            // The errored record stays behind for inspection.
            return Err(e);
        }
        Ok(agent_id)
    }

    /// Add a started agent to the pool, available or busy.
    async fn admit(&self, pool_id: &str, agent_id: String, busy: bool) {
        let Ok(state) = self.state(pool_id).await else {
            return;
        };
        let mut state = state.lock().await;
        state.members.insert(
            agent_id.clone(),
            MemberState {
                use_count: 0,
                last_activity: Utc::now(),
            },
        );
        if busy {
            state.record.busy.push(agent_id);
        } else {
            state.record.available.push(agent_id);
        }
        state.record.current_size = state.members.len();
    }

    /// Hand available agents to queued waiters, oldest waiter first.
    async fn dispense(&self, state: &Arc<Mutex<PoolState>>) {
        let mut state = state.lock().await;
        while !state.waiters.is_empty() {
            let Some(agent_id) = state.pop_available() else {
                break;
            };
            let mut handed_off = false;
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.tx.send(agent_id.clone()) {
                    Ok(()) => {
                        state.mark_busy(&agent_id);
                        handed_off = true;
                        break;
                    }
                    // Receiver timed out; try the next waiter.
                    Err(_) => continue,
                }
            }
            if !handed_off {
                state.record.available.push(agent_id);
                break;
            }
        }
    }
}
