//! Execution events: the append-only log that is the sole source of truth
//!
//! Events are never updated or deleted; the only permitted mutations set an
//! event's terminal fields exactly once (`mark_completed`, `mark_failed`,
//! and — for compensation bookkeeping — `mark_compensated`). Everything
//! the engine knows about an execution can be reconstructed by folding its
//! events in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use flowrun_graph::GraphNode;

/// Kind of an execution event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowRolledBack,
    NodeEntered,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    VariableSet,
    VariableUpdated,
    GatewayBranchTaken,
    TransactionStarted,
    TransactionCommitted,
    TransactionRolledBack,
    CompensationInitiated,
    CompensationCompleted,
    CompensationFailed,
    RollbackInitiated,
    RollbackCompleted,
    RollbackFailed,
    CheckpointCreated,
}

impl EventType {
    /// The wire name, e.g. `NODE_COMPLETED`
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "WORKFLOW_STARTED",
            EventType::WorkflowCompleted => "WORKFLOW_COMPLETED",
            EventType::WorkflowFailed => "WORKFLOW_FAILED",
            EventType::WorkflowRolledBack => "WORKFLOW_ROLLED_BACK",
            EventType::NodeEntered => "NODE_ENTERED",
            EventType::NodeStarted => "NODE_STARTED",
            EventType::NodeCompleted => "NODE_COMPLETED",
            EventType::NodeFailed => "NODE_FAILED",
            EventType::NodeSkipped => "NODE_SKIPPED",
            EventType::VariableSet => "VARIABLE_SET",
            EventType::VariableUpdated => "VARIABLE_UPDATED",
            EventType::GatewayBranchTaken => "GATEWAY_BRANCH_TAKEN",
            EventType::TransactionStarted => "TRANSACTION_STARTED",
            EventType::TransactionCommitted => "TRANSACTION_COMMITTED",
            EventType::TransactionRolledBack => "TRANSACTION_ROLLED_BACK",
            EventType::CompensationInitiated => "COMPENSATION_INITIATED",
            EventType::CompensationCompleted => "COMPENSATION_COMPLETED",
            EventType::CompensationFailed => "COMPENSATION_FAILED",
            EventType::RollbackInitiated => "ROLLBACK_INITIATED",
            EventType::RollbackCompleted => "ROLLBACK_COMPLETED",
            EventType::RollbackFailed => "ROLLBACK_FAILED",
            EventType::CheckpointCreated => "CHECKPOINT_CREATED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the fact an event records.
///
/// Most events are appended already `Completed` — they record something
/// that happened. NODE_STARTED is appended `InProgress` and transitions via
/// `mark_completed`/`mark_failed`; NODE_COMPLETED transitions to
/// `Compensated` when its side effect is undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    InProgress,
    Completed,
    Failed,
    Compensated,
}

impl EventStatus {
    /// Terminal statuses refuse further `mark_*` mutations
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only record about an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,

    /// Per-instance, strictly monotonic, starts at 1, no gaps
    pub sequence_number: i64,

    pub event_type: EventType,
    pub status: EventStatus,
    pub node_id: Option<String>,

    /// The node's binding key: service name for service tasks, ruleflow
    /// group for rule tasks, the node-type wire name otherwise. This is
    /// the key compensation handlers are resolved by.
    pub node_type: Option<String>,

    /// Edge id for GATEWAY_BRANCH_TAKEN
    pub edge_taken: Option<String>,

    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub input_snapshot: Option<Value>,
    pub output_snapshot: Option<Value>,
    pub variables_snapshot: Option<Value>,
    pub error_message: Option<String>,
    pub error_snapshot: Option<Value>,

    /// Condition text or branch decision for gateway events
    pub decision_result: Option<String>,

    pub transaction_id: Option<String>,

    /// Globally unique; canonical form `{execution_id}:{sequence}:{type}`
    pub idempotency_key: String,

    /// Id of the COMPENSATION_COMPLETED event that undid this one
    pub compensated_by: Option<Uuid>,
}

impl ExecutionEvent {
    /// The canonical idempotency key for a given slot
    pub fn canonical_key(execution_id: Uuid, sequence: i64, event_type: EventType) -> String {
        format!("{execution_id}:{sequence}:{}", event_type.as_str())
    }
}

/// Builder for the caller-supplied part of an event.
///
/// The store assigns id, sequence number, timestamp and the canonical
/// idempotency key (unless one is supplied here).
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub event_type: Option<EventType>,
    pub status: Option<EventStatus>,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub edge_taken: Option<String>,
    pub duration_ms: Option<i64>,
    pub input_snapshot: Option<Value>,
    pub output_snapshot: Option<Value>,
    pub variables_snapshot: Option<Value>,
    pub error_message: Option<String>,
    pub error_snapshot: Option<Value>,
    pub decision_result: Option<String>,
    pub transaction_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Default::default()
        }
    }

    /// The event type; drafts built through [`EventDraft::new`] always
    /// carry one
    pub fn event_type(&self) -> EventType {
        self.event_type.unwrap_or(EventType::NodeEntered)
    }

    /// Append in `in_progress` rather than the default `completed`
    pub fn in_progress(mut self) -> Self {
        self.status = Some(EventStatus::InProgress);
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Anchor the event to a graph node, recording its binding key
    pub fn for_node(mut self, node: &GraphNode) -> Self {
        self.node_id = Some(node.id.clone());
        self.node_type = Some(crate::compensation::binding_key(node));
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_edge_taken(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_taken = Some(edge_id.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_snapshot = Some(input);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output_snapshot = Some(output);
        self
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables_snapshot = Some(variables);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_error_snapshot(mut self, snapshot: Value) -> Self {
        self.error_snapshot = Some(snapshot);
        self
    }

    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decision_result = Some(decision.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Override the canonical idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
