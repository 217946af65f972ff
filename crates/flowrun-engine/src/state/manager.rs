//! The state manager: owner of all instance and node-execution writes
//!
//! Every state-changing operation is atomic in the store and writes an
//! audit entry with before/after snapshots. The manager also owns the
//! process identity used as the lease-owner value, and the lease TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::TenantContext;
use crate::error::EngineError;
use crate::instance::{
    AuditEntry, InstanceState, NodeExecution, NodeExecutionState, WorkflowInstance,
};
use crate::metrics::{names, EngineMetrics};
use crate::persistence::{StoreError, WorkflowStore, DEFAULT_LEASE_TTL};
use flowrun_graph::{GraphNode, Variables};

/// How many times a conflicted instance update is retried with a fresh row
const UPDATE_RETRIES: usize = 3;

/// Configuration for the state manager
#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    /// Lease time-to-live; a stale lease is reclaimable by any replica
    pub lease_ttl: Duration,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

/// Owns reads and writes of [`WorkflowInstance`] and [`NodeExecution`]
pub struct StateManager {
    store: Arc<dyn WorkflowStore>,
    metrics: Arc<EngineMetrics>,
    config: StateManagerConfig,

    /// `{host}-{suffix}`, the lease-owner value for this process
    identity: String,
}

impl StateManager {
    pub fn new(store: Arc<dyn WorkflowStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self::with_config(store, metrics, StateManagerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        metrics: Arc<EngineMetrics>,
        config: StateManagerConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            config,
            identity: process_identity(),
        }
    }

    /// This process's lease-owner identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn lease_ttl(&self) -> Duration {
        self.config.lease_ttl
    }

    /// Create a new instance in PENDING
    #[instrument(skip(self, ctx, variables), fields(tenant_id = %ctx.tenant_id))]
    pub async fn create_instance(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
        version: i64,
        variables: Variables,
    ) -> Result<WorkflowInstance, EngineError> {
        let execution_id = Uuid::now_v7();
        let instance = WorkflowInstance::new(
            execution_id,
            workflow_id,
            version,
            ctx.tenant_id.clone(),
            variables,
        );

        self.store.insert_instance(instance.clone()).await?;
        self.audit(&instance, "instance.created", None, ctx.correlation_id.clone())
            .await?;

        info!(%execution_id, workflow_id, version, "created instance");
        Ok(instance)
    }

    pub async fn instance(&self, execution_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        match self.store.instance(execution_id).await {
            Ok(instance) => Ok(instance),
            Err(StoreError::InstanceNotFound(id)) => Err(EngineError::InstanceNotFound(id)),
            Err(other) => Err(other.into()),
        }
    }

    /// Try to claim the instance lease for this process.
    ///
    /// Returns `false` when another live replica holds it — not an error.
    #[instrument(skip(self))]
    pub async fn acquire_lease(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let acquired = self
            .store
            .try_acquire_lease(execution_id, &self.identity, self.config.lease_ttl)
            .await?;

        let instance = self.store.instance(execution_id).await?;
        if acquired {
            self.metrics.incr(names::LOCK_ACQUIRED, &instance.tenant_id);
            self.audit(&instance, "lease.acquired", None, None).await?;
            debug!(%execution_id, owner = %self.identity, "lease acquired");
        } else {
            self.metrics.incr(names::LOCK_CONTENTION, &instance.tenant_id);
            debug!(
                %execution_id,
                holder = instance.lease_owner.as_deref().unwrap_or("unknown"),
                "lease unavailable"
            );
        }
        Ok(acquired)
    }

    #[instrument(skip(self))]
    pub async fn release_lease(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.store
            .release_lease(execution_id, &self.identity)
            .await?;
        Ok(())
    }

    /// Transition PENDING → RUNNING; already-running instances pass
    /// through unchanged (the resume path)
    pub async fn start_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        let current = self.instance(execution_id).await?;
        if current.state == InstanceState::Running {
            return Ok(current);
        }

        let instance = self
            .transition(execution_id, InstanceState::Running, "execution.started", |i| {
                i.started_at = Some(Utc::now());
            })
            .await?;

        self.metrics.incr(names::WORKFLOW_STARTED, &instance.tenant_id);
        self.metrics.add(names::WORKFLOW_ACTIVE, &instance.tenant_id, 1);
        Ok(instance)
    }

    /// Transition PAUSED → RUNNING
    pub async fn resume_workflow(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .transition(execution_id, InstanceState::Running, "execution.resumed", |_| {})
            .await?;
        self.metrics.add(names::WORKFLOW_ACTIVE, &instance.tenant_id, 1);
        Ok(instance)
    }

    pub async fn update_current_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<(), EngineError> {
        self.mutate(execution_id, "node.entered", |i| {
            i.current_node_id = Some(node_id.to_string());
        })
        .await?;
        Ok(())
    }

    pub async fn update_variables(
        &self,
        execution_id: Uuid,
        variables: Variables,
    ) -> Result<(), EngineError> {
        self.mutate(execution_id, "variables.updated", |i| {
            i.variables = variables.clone();
        })
        .await?;
        Ok(())
    }

    /// Insert a RUNNING node-execution row for a fresh attempt
    #[instrument(skip(self, node, input), fields(node_id = %node.id))]
    pub async fn record_node_start(
        &self,
        execution_id: Uuid,
        node: &GraphNode,
        attempt_number: i32,
        input: &Variables,
    ) -> Result<NodeExecution, EngineError> {
        let record = NodeExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type.as_str().to_string(),
            state: NodeExecutionState::Running,
            attempt_number,
            executed_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            input_variables: Some(Value::Object(input.clone())),
            output_variables: None,
            error_message: None,
            executed_by: self.identity.clone(),
        };
        self.store.insert_node_execution(record.clone()).await?;
        Ok(record)
    }

    /// Transition a node-execution row to COMPLETED and fill its duration
    pub async fn record_node_complete(
        &self,
        mut record: NodeExecution,
        output: Option<Value>,
    ) -> Result<NodeExecution, EngineError> {
        let completed_at = Utc::now();
        record.state = NodeExecutionState::Completed;
        record.completed_at = Some(completed_at);
        record.duration_ms = Some(
            completed_at
                .signed_duration_since(record.executed_at)
                .num_milliseconds(),
        );
        record.output_variables = output;
        self.store.update_node_execution(record.clone()).await?;
        Ok(record)
    }

    /// Transition a node-execution row to FAILED
    pub async fn record_node_failure(
        &self,
        mut record: NodeExecution,
        message: &str,
    ) -> Result<NodeExecution, EngineError> {
        let completed_at = Utc::now();
        record.state = NodeExecutionState::Failed;
        record.completed_at = Some(completed_at);
        record.duration_ms = Some(
            completed_at
                .signed_duration_since(record.executed_at)
                .num_milliseconds(),
        );
        record.error_message = Some(message.to_string());
        self.store.update_node_execution(record.clone()).await?;
        Ok(record)
    }

    /// Terminal COMPLETED; clears the lease
    #[instrument(skip(self))]
    pub async fn complete_workflow(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .transition(execution_id, InstanceState::Completed, "workflow.completed", |i| {
                i.completed_at = Some(Utc::now());
                i.lease_owner = None;
                i.lease_acquired_at = None;
            })
            .await?;

        self.metrics.incr(names::WORKFLOW_COMPLETED, &instance.tenant_id);
        self.metrics.add(names::WORKFLOW_ACTIVE, &instance.tenant_id, -1);
        info!(%execution_id, "workflow completed");
        Ok(instance)
    }

    /// Terminal FAILED; records failure info and clears the lease
    #[instrument(skip(self, message))]
    pub async fn fail_workflow(
        &self,
        execution_id: Uuid,
        message: &str,
        node_id: Option<&str>,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .transition(execution_id, InstanceState::Failed, "workflow.failed", |i| {
                i.completed_at = Some(Utc::now());
                i.failure_message = Some(message.to_string());
                i.failed_node_id = node_id.map(Into::into);
                i.lease_owner = None;
                i.lease_acquired_at = None;
            })
            .await?;

        self.metrics.incr(names::WORKFLOW_FAILED, &instance.tenant_id);
        self.metrics.add(names::WORKFLOW_ACTIVE, &instance.tenant_id, -1);
        warn!(%execution_id, ?node_id, message, "workflow failed");
        Ok(instance)
    }

    /// RUNNING → PAUSED (user tasks); clears the lease so another replica
    /// can resume later
    #[instrument(skip(self))]
    pub async fn pause_workflow(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .transition(execution_id, InstanceState::Paused, "workflow.paused", |i| {
                i.lease_owner = None;
                i.lease_acquired_at = None;
            })
            .await?;

        self.metrics.incr(names::WORKFLOW_PAUSED, &instance.tenant_id);
        self.metrics.add(names::WORKFLOW_ACTIVE, &instance.tenant_id, -1);
        info!(%execution_id, "workflow paused");
        Ok(instance)
    }

    /// Terminal CANCELLED; clears the lease
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        let was_active = {
            let current = self.instance(execution_id).await?;
            current.state == InstanceState::Running
        };

        let instance = self
            .transition(execution_id, InstanceState::Cancelled, "workflow.cancelled", |i| {
                i.completed_at = Some(Utc::now());
                i.lease_owner = None;
                i.lease_acquired_at = None;
            })
            .await?;

        self.metrics.incr(names::WORKFLOW_CANCELLED, &instance.tenant_id);
        if was_active {
            self.metrics.add(names::WORKFLOW_ACTIVE, &instance.tenant_id, -1);
        }
        info!(%execution_id, "workflow cancelled");
        Ok(instance)
    }

    /// True iff any attempt of the node has state COMPLETED
    pub async fn has_node_been_executed(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<bool, EngineError> {
        let rows = self
            .store
            .node_executions_for_node(execution_id, node_id)
            .await?;
        Ok(rows
            .iter()
            .any(|r| r.state == NodeExecutionState::Completed))
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Apply a state transition with legality check, audit and
    /// conflict-retry
    async fn transition(
        &self,
        execution_id: Uuid,
        to: InstanceState,
        action: &str,
        apply: impl Fn(&mut WorkflowInstance),
    ) -> Result<WorkflowInstance, EngineError> {
        for attempt in 0..UPDATE_RETRIES {
            let mut instance = self.instance(execution_id).await?;
            let before = serde_json::to_value(&instance).ok();

            if !instance.state.can_transition_to(to) {
                return Err(EngineError::IllegalTransition {
                    execution_id,
                    from: instance.state.to_string(),
                    to: to.to_string(),
                });
            }

            instance.state = to;
            apply(&mut instance);

            match self.store.update_instance(instance).await {
                Ok(updated) => {
                    self.audit_with_before(&updated, action, before).await?;
                    return Ok(updated);
                }
                Err(StoreError::ConcurrencyConflict { .. }) if attempt + 1 < UPDATE_RETRIES => {
                    debug!(%execution_id, action, "stale row, retrying transition");
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
        unreachable!("transition retry loop always returns")
    }

    /// Apply a non-transition mutation (variables, current node) with
    /// audit and conflict-retry
    async fn mutate(
        &self,
        execution_id: Uuid,
        action: &str,
        apply: impl Fn(&mut WorkflowInstance),
    ) -> Result<WorkflowInstance, EngineError> {
        for attempt in 0..UPDATE_RETRIES {
            let mut instance = self.instance(execution_id).await?;
            let before = serde_json::to_value(&instance).ok();
            apply(&mut instance);

            match self.store.update_instance(instance).await {
                Ok(updated) => {
                    self.audit_with_before(&updated, action, before).await?;
                    return Ok(updated);
                }
                Err(StoreError::ConcurrencyConflict { .. }) if attempt + 1 < UPDATE_RETRIES => {
                    debug!(%execution_id, action, "stale row, retrying mutation");
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
        unreachable!("mutation retry loop always returns")
    }

    async fn audit(
        &self,
        instance: &WorkflowInstance,
        action: &str,
        before: Option<Value>,
        correlation_id: Option<String>,
    ) -> Result<(), EngineError> {
        let entry = AuditEntry {
            id: Uuid::now_v7(),
            execution_id: instance.execution_id,
            tenant_id: instance.tenant_id.clone(),
            actor: self.identity.clone(),
            action: action.to_string(),
            timestamp: Utc::now(),
            before_snapshot: before,
            after_snapshot: serde_json::to_value(instance).ok(),
            correlation_id,
        };
        self.store.record_audit(entry).await?;
        Ok(())
    }

    async fn audit_with_before(
        &self,
        instance: &WorkflowInstance,
        action: &str,
        before: Option<Value>,
    ) -> Result<(), EngineError> {
        self.audit(instance, action, before, None).await
    }
}

/// Host name plus a random suffix, e.g. `worker-7.prod-k3x9q2`
fn process_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{host}-{suffix}")
}
