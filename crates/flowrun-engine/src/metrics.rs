//! Process-local engine metrics
//!
//! Named counters and gauges, labelled by tenant, with a snapshot API for
//! monitoring endpoints and tests. Exporters (Prometheus, OTLP, …) are an
//! external concern; they read the snapshot.

use dashmap::DashMap;

/// Well-known metric names
pub mod names {
    pub const WORKFLOW_STARTED: &str = "workflow.started.total";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed.total";
    pub const WORKFLOW_FAILED: &str = "workflow.failed.total";
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled.total";
    pub const WORKFLOW_PAUSED: &str = "workflow.paused.total";
    pub const WORKFLOW_ACTIVE: &str = "workflow.active.count";
    pub const NODE_EXECUTION_DURATION: &str = "workflow.node.execution.duration";
    pub const NODE_SKIPPED: &str = "workflow.node.skipped.total";
    pub const GATEWAY_EVALUATED: &str = "workflow.gateway.evaluated.total";
    pub const LOCK_ACQUIRED: &str = "workflow.lock.acquired.total";
    pub const LOCK_CONTENTION: &str = "workflow.lock.contention.total";
    pub const RETRY: &str = "workflow.retry.total";
    pub const COMPENSATION: &str = "workflow.compensation.total";
    pub const ROLLBACK: &str = "workflow.rollback.total";
}

/// Counter/gauge registry keyed by (metric name, tenant)
#[derive(Debug, Default)]
pub struct EngineMetrics {
    values: DashMap<(String, String), i64>,

    /// Sum and count per (name, tenant) for duration-style metrics
    durations: DashMap<(String, String), (i64, i64)>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    pub fn incr(&self, name: &str, tenant_id: &str) {
        self.add(name, tenant_id, 1);
    }

    /// Add a delta to a counter (or gauge; negative deltas allowed)
    pub fn add(&self, name: &str, tenant_id: &str, delta: i64) {
        *self
            .values
            .entry((name.to_string(), tenant_id.to_string()))
            .or_insert(0) += delta;
    }

    /// Record one duration observation in milliseconds
    pub fn record_duration(&self, name: &str, tenant_id: &str, millis: i64) {
        let mut entry = self
            .durations
            .entry((name.to_string(), tenant_id.to_string()))
            .or_insert((0, 0));
        entry.0 += millis;
        entry.1 += 1;
    }

    /// Current value of a counter/gauge
    pub fn get(&self, name: &str, tenant_id: &str) -> i64 {
        self.values
            .get(&(name.to_string(), tenant_id.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// (total millis, observation count) for a duration metric
    pub fn duration(&self, name: &str, tenant_id: &str) -> (i64, i64) {
        self.durations
            .get(&(name.to_string(), tenant_id.to_string()))
            .map(|v| *v)
            .unwrap_or((0, 0))
    }

    /// Snapshot of all counters, sorted by key
    pub fn snapshot(&self) -> Vec<((String, String), i64)> {
        let mut entries: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
