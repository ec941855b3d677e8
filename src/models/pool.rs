use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A homogeneous, elastic set of agents sharing one template.
///
/// Invariant: `current_size == available.len() + busy.len()`, and every
/// member id appears in exactly one of the two sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRecord {
    pub id: String,
    pub name: String,
    pub template: String,
    pub min_size: usize,
    pub max_size: usize,
    pub current_size: usize,
    pub available: Vec<String>,
    pub busy: Vec<String>,
    pub auto_scale: bool,
    /// Utilization above which the autoscaler grows the pool.
    pub scale_up_at: f64,
    /// Utilization below which the autoscaler shrinks the pool.
    pub scale_down_at: f64,
    /// Acquisitions after which an agent is destroyed on release.
    pub recycle_after: u32,
    pub created_at: DateTime<Utc>,
}

impl PoolRecord {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            template: template.into(),
            min_size: 1,
            max_size: 4,
            current_size: 0,
            available: Vec::new(),
            busy: Vec::new(),
            auto_scale: false,
            scale_up_at: 0.8,
            scale_down_at: 0.2,
            recycle_after: 100,
            created_at: Utc::now(),
        }
    }

    /// `busy / current_size`; 0.0 for an empty pool.
    pub fn utilization(&self) -> f64 {
        if self.current_size == 0 {
            0.0
        } else {
            self.busy.len() as f64 / self.current_size as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolMetric {
    PoolUtilization,
    QueueDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleComparison {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
}

/// One autoscaler rule; rules run top-to-bottom and at most one action
/// fires per cooldown window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingRule {
    pub metric: PoolMetric,
    pub comparison: RuleComparison,
    pub threshold: f64,
    pub action: ScaleAction,
    pub amount: usize,
}

impl ScalingRule {
    pub fn matches(&self, value: f64) -> bool {
        match self.comparison {
            RuleComparison::Above => value > self.threshold,
            RuleComparison::Below => value < self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_of_empty_pool_is_zero() {
        let pool = PoolRecord::new("workers", "coder");
        assert_eq!(pool.utilization(), 0.0);
    }

    #[test]
    fn rule_matching() {
        let rule = ScalingRule {
            metric: PoolMetric::PoolUtilization,
            comparison: RuleComparison::Above,
            threshold: 0.8,
            action: ScaleAction::ScaleUp,
            amount: 1,
        };
        assert!(rule.matches(0.9));
        assert!(!rule.matches(0.8));
        assert!(!rule.matches(0.5));
    }
}
