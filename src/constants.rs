//! System-wide constants shared across the runtime components.

// Record bounds
/// Maximum number of entries retained in an agent's error history.
pub const MAX_ERROR_HISTORY: usize = 50;

/// Maximum number of entries retained in an agent's task history.
pub const MAX_TASK_HISTORY: usize = 100;

/// Maximum number of health scores kept per agent for trend analysis.
pub const MAX_HEALTH_HISTORY: usize = 100;

// Registry
/// Staleness bound for registry cache reads.
pub const REGISTRY_CACHE_STALENESS_SECS: u64 = 60;

/// Base delay for registry write retries.
pub const REGISTRY_BACKOFF_BASE_MS: u64 = 100;

/// Cap for registry write retry delays.
pub const REGISTRY_BACKOFF_CAP_MS: u64 = 5_000;

/// Jitter applied to every backoff delay, as a fraction of the delay.
pub const REGISTRY_BACKOFF_JITTER: f64 = 0.2;

/// Write attempts before a backend failure is surfaced to the caller.
pub const REGISTRY_MAX_WRITE_ATTEMPTS: u32 = 5;

// Health
/// Heartbeats older than this multiple of the interval mark the agent in error.
pub const HEARTBEAT_TIMEOUT_MULTIPLIER: u32 = 3;

/// Component score thresholds below which a health issue is attached.
pub const RESPONSIVENESS_ISSUE_THRESHOLD: f64 = 0.5;
pub const PERFORMANCE_ISSUE_THRESHOLD: f64 = 0.6;
pub const RESOURCE_ISSUE_THRESHOLD: f64 = 0.4;

/// Overall score below which an auto-restart is issued.
pub const RESTART_HEALTH_THRESHOLD: f64 = 0.3;

/// Minimum interval between restarts of the same agent.
pub const RESTART_MIN_INTERVAL_SECS: u64 = 30;

// Pools
/// Cooldown between autoscaler actions on a pool.
pub const POOL_SCALE_COOLDOWN_SECS: u64 = 300;

/// Idle agents older than this are marked for recycling.
pub const POOL_STALE_IDLE_SECS: u64 = 300;

/// Period of the pool maintenance sweep.
pub const POOL_MAINTENANCE_INTERVAL_SECS: u64 = 30;

// Process supervision
/// Grace period between soft-terminate and hard-kill.
pub const PROCESS_STOP_TIMEOUT_SECS: u64 = 30;

// Workflow engine
/// Concurrency used when a workflow declares none.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

/// Exponential retry policy defaults; jitter reuses the registry fraction.
pub const RETRY_BASE_MS: u64 = 500;
pub const RETRY_CAP_MS: u64 = 30_000;

/// Grace period granted to running tasks when a workflow fails fast.
pub const FAIL_FAST_GRACE_MS: u64 = 1_000;
