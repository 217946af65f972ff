//! Store trait definitions
//!
//! The contract every backend must honor:
//!
//! - every mutating operation is atomic (the Postgres implementation uses
//!   serializable transactions and row-level locks; the in-memory one a
//!   process-wide write lock)
//! - event appends derive the per-instance sequence number atomically with
//!   the insert and treat an idempotency-key collision as a hit, returning
//!   the existing row unchanged
//! - instance updates are guarded by an optimistic row-version counter

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::event::{EventDraft, EventStatus, ExecutionEvent};
use crate::instance::{AuditEntry, DeployedDefinition, NodeExecution, WorkflowInstance};

/// Default lease time-to-live; a stale lease is reclaimable after this
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// No definition row matches
    #[error("definition not found: {workflow_id} (version {version:?})")]
    DefinitionNotFound {
        workflow_id: String,
        version: Option<i64>,
    },

    /// Event not found
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Node-execution row not found
    #[error("node execution not found: {0}")]
    NodeExecutionNotFound(Uuid),

    /// `mark_completed`/`mark_failed` on an event already in a terminal
    /// status
    #[error("event {0} is already terminal")]
    EventAlreadyTerminal(Uuid),

    /// Optimistic row-version check failed
    #[error("concurrency conflict: expected row version {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// A definition with the same (workflow_id, version, tenant) exists
    #[error("definition {workflow_id} version {version} already deployed")]
    DefinitionAlreadyExists { workflow_id: String, version: i64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Store for deployed workflow definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Insert a definition row; fails if the identity triple exists
    async fn insert_definition(&self, definition: DeployedDefinition) -> Result<(), StoreError>;

    /// Fetch one exact version
    async fn definition(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        version: i64,
    ) -> Result<DeployedDefinition, StoreError>;

    /// Fetch the highest active version
    async fn latest_active(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<DeployedDefinition, StoreError>;

    /// Next free version number (1 when the workflow is new)
    async fn next_version(&self, tenant_id: &str, workflow_id: &str) -> Result<i64, StoreError>;

    /// All definitions for a tenant, newest first
    async fn list_definitions(&self, tenant_id: &str) -> Result<Vec<DeployedDefinition>, StoreError>;
}

/// Store for instance rows, node-execution attempts and the audit log
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: WorkflowInstance) -> Result<(), StoreError>;

    async fn instance(&self, execution_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Update an instance row.
    ///
    /// The incoming `row_version` must match the stored one; on success the
    /// counter is bumped and the updated row returned.
    async fn update_instance(
        &self,
        instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Try to claim the instance lease.
    ///
    /// Atomically (row lock): succeeds iff the lease is unset, expired
    /// (older than `ttl`), or already held by `owner`; on success the lease
    /// fields are set to `owner`/now.
    async fn try_acquire_lease(
        &self,
        execution_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Clear the lease if `owner` still holds it; a stale release is a
    /// no-op
    async fn release_lease(&self, execution_id: Uuid, owner: &str) -> Result<(), StoreError>;

    async fn insert_node_execution(&self, record: NodeExecution) -> Result<(), StoreError>;

    async fn update_node_execution(&self, record: NodeExecution) -> Result<(), StoreError>;

    /// All attempts for an instance, oldest first
    async fn node_executions(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError>;

    /// All attempts of one node, oldest first
    async fn node_executions_for_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Vec<NodeExecution>, StoreError>;

    /// Append an audit entry
    async fn record_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Audit entries for an instance, oldest first
    async fn audit_trail(&self, execution_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Append-only event store
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event.
    ///
    /// Atomically with the insert: derive `sequence_number` as
    /// `1 + max(existing)`, compute the canonical idempotency key unless
    /// the draft supplies one, and — if a row with that key already exists
    /// — return it unchanged instead of inserting.
    async fn append(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        draft: EventDraft,
    ) -> Result<ExecutionEvent, StoreError>;

    /// Full timeline, ascending by sequence
    async fn timeline(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError>;

    /// Inclusive sequence range, ascending
    async fn timeline_range(
        &self,
        execution_id: Uuid,
        start: i64,
        end: i64,
    ) -> Result<Vec<ExecutionEvent>, StoreError>;

    /// Highest-sequence event, if any
    async fn last_event(&self, execution_id: Uuid)
        -> Result<Option<ExecutionEvent>, StoreError>;

    /// Events anchored to one node, ascending
    async fn events_by_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Vec<ExecutionEvent>, StoreError>;

    /// Events in one status, ascending
    async fn events_by_status(
        &self,
        execution_id: Uuid,
        status: EventStatus,
    ) -> Result<Vec<ExecutionEvent>, StoreError>;

    /// Fetch one event by id
    async fn event(&self, event_id: Uuid) -> Result<ExecutionEvent, StoreError>;

    async fn exists_by_idempotency_key(&self, key: &str) -> Result<bool, StoreError>;

    /// Set terminal success fields on an in-progress event. Fails with
    /// [`StoreError::EventAlreadyTerminal`] if the event is already
    /// terminal.
    async fn mark_completed(
        &self,
        event_id: Uuid,
        duration_ms: i64,
        output_snapshot: Option<Value>,
    ) -> Result<ExecutionEvent, StoreError>;

    /// Set terminal failure fields on an in-progress event
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error_message: &str,
        error_snapshot: Option<Value>,
    ) -> Result<ExecutionEvent, StoreError>;

    /// Mark a completed event as compensated, linking the compensation
    /// event that undid it. Only valid on events in `completed` status.
    async fn mark_compensated(
        &self,
        event_id: Uuid,
        compensation_event_id: Uuid,
    ) -> Result<ExecutionEvent, StoreError>;
}

/// The combined store surface the engine components are wired with
pub trait WorkflowStore: DefinitionStore + InstanceStore + EventStore {}

impl<T: DefinitionStore + InstanceStore + EventStore> WorkflowStore for T {}
