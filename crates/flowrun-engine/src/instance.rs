//! Instance-side records: workflow instances, node-execution attempts,
//! audit entries and deployed definitions
//!
//! These are the rows the engine projects out of the event log. They exist
//! so queries ("is this node already completed?", "who holds the lease?")
//! do not require a replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use flowrun_graph::{parse_definition_value, DefinitionError, Variables, WorkflowGraph};

/// State machine of a workflow instance.
///
/// `Pending → Running → {Completed | Failed | Cancelled}`, with
/// `Running ⇄ Paused` allowed in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::Failed | InstanceState::Cancelled
        )
    }

    /// Whether the state machine permits `self → next`.
    ///
    /// CANCELLED is reachable from the other terminal states too: a
    /// rollback of a completed or failed workflow ends there.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Paused, Failed)
                | (Completed, Cancelled)
                | (Failed, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Paused => "paused",
            InstanceState::Completed => "completed",
            InstanceState::Failed => "failed",
            InstanceState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running (or finished) instance of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Globally unique execution id
    pub execution_id: Uuid,

    pub workflow_id: String,
    pub version: i64,
    pub tenant_id: String,

    pub state: InstanceState,
    pub current_node_id: Option<String>,
    pub variables: Variables,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub failure_message: Option<String>,
    pub failed_node_id: Option<String>,
    pub retry_count: i32,

    /// Process identity of the replica currently driving this instance
    pub lease_owner: Option<String>,
    pub lease_acquired_at: Option<DateTime<Utc>>,

    /// Optimistic-concurrency counter, bumped on every update
    pub row_version: i64,
}

impl WorkflowInstance {
    pub fn new(
        execution_id: Uuid,
        workflow_id: impl Into<String>,
        version: i64,
        tenant_id: impl Into<String>,
        variables: Variables,
    ) -> Self {
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            version,
            tenant_id: tenant_id.into(),
            state: InstanceState::Pending,
            current_node_id: None,
            variables,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_message: None,
            failed_node_id: None,
            retry_count: 0,
            lease_owner: None,
            lease_acquired_at: None,
            row_version: 0,
        }
    }
}

/// State of a single node attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeExecutionState::Pending => "pending",
            NodeExecutionState::Running => "running",
            NodeExecutionState::Completed => "completed",
            NodeExecutionState::Failed => "failed",
            NodeExecutionState::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of one node within an instance.
///
/// The idempotency query "has node N ever completed for instance E?" runs
/// against these rows, which is what makes crash-mid-workflow resumable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub state: NodeExecutionState,

    /// 1-based attempt counter per (execution, node)
    pub attempt_number: i32,

    pub executed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input_variables: Option<Value>,
    pub output_variables: Option<Value>,
    pub error_message: Option<String>,

    /// Process identity of the replica that ran the attempt
    pub executed_by: String,
}

/// Append-only compliance log entry, written on every instance mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub actor: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub before_snapshot: Option<Value>,
    pub after_snapshot: Option<Value>,
    pub correlation_id: Option<String>,
}

/// A deployed workflow definition.
///
/// Identity is `(workflow_id, version, tenant_id)`. Rows are immutable:
/// a new version is a new row, never an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedDefinition {
    pub id: Uuid,
    pub workflow_id: String,
    pub version: i64,
    pub tenant_id: String,
    pub name: String,

    /// The raw definition document, verbatim
    pub document: Value,

    pub active: bool,
    pub deployed_at: DateTime<Utc>,
}

impl DeployedDefinition {
    /// Re-derive the executable graph from the stored document.
    ///
    /// The graph is a cacheable projection; callers that execute hot paths
    /// should cache it rather than re-deriving per instance.
    pub fn build_graph(&self) -> Result<WorkflowGraph, DefinitionError> {
        Ok(parse_definition_value(&self.document)?.build_graph())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use InstanceState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(InstanceState::Completed.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(InstanceState::Cancelled.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
        assert!(!InstanceState::Paused.is_terminal());
        assert!(!InstanceState::Pending.is_terminal());
    }

    #[test]
    fn test_new_instance_defaults() {
        let instance = WorkflowInstance::new(
            Uuid::now_v7(),
            "orders",
            1,
            "default",
            Variables::new(),
        );
        assert_eq!(instance.state, InstanceState::Pending);
        assert!(instance.lease_owner.is_none());
        assert_eq!(instance.row_version, 0);
        assert!(instance.current_node_id.is_none());
    }
}
