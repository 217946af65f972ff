//! Engine error taxonomy
//!
//! One enum for the whole execution core. Handlers may fail freely; the
//! node executor wraps their error into [`EngineError::NodeExecution`] and
//! the workflow executor converts that into a FAILED instance — errors are
//! persisted, not raised, once an execution is underway.

use uuid::Uuid;

use crate::persistence::StoreError;
use flowrun_graph::{DefinitionError, ValidationResult};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The definition document could not be parsed
    #[error("definition malformed: {0}")]
    DefinitionMalformed(#[from] DefinitionError),

    /// The validator rejected the definition; warnings do not block
    #[error("definition invalid: {} error(s)", .result.errors.len())]
    DefinitionInvalid { result: ValidationResult },

    /// No deployed definition matches
    #[error("definition not found: {workflow_id}")]
    DefinitionNotFound { workflow_id: String },

    /// Unknown execution id
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// An XOR/OR gateway found no edge to take
    #[error("no branch satisfied at gateway `{node_id}`")]
    NoBranchSatisfied { node_id: String },

    /// A node referenced during traversal is missing from the graph
    #[error("node `{0}` is not part of the graph")]
    NodeNotFound(String),

    /// The graph has no start event to begin from
    #[error("graph has no start event")]
    NoStartEvent,

    /// A handler or transactional failure inside a node
    #[error("node `{node_id}` failed: {source}")]
    NodeExecution {
        node_id: String,
        #[source]
        source: Box<EngineError>,
    },

    /// A handler-level failure with no more specific shape
    #[error("{0}")]
    Handler(String),

    /// A service task named a callable that was never registered
    #[error("service `{0}` is not registered")]
    ServiceNotRegistered(String),

    /// The transaction manager aborted the operation
    #[error("transaction failed: {0}")]
    TransactionFailure(String),

    /// Pre-commit validation or a forbidden null result
    #[error("transaction validation failed: {0}")]
    TransactionValidation(String),

    /// Rolled back on request (force-rollback marking)
    #[error("transaction rolled back: {0}")]
    TransactionRollback(String),

    /// A 2PC commit failed and its compensation failed too — the only
    /// escalation beyond ordinary failure
    #[error("compensation failed: {0}")]
    CompensationFailure(String),

    /// An instance state transition the state machine does not allow
    #[error("illegal transition for {execution_id}: {from} -> {to}")]
    IllegalTransition {
        execution_id: Uuid,
        from: String,
        to: String,
    },

    /// Traversal exceeded the configured step budget
    #[error("execution exceeded the step budget of {0}")]
    StepBudgetExceeded(usize),

    /// Storage-layer failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// The node id a failure is attributable to, when there is one
    pub fn failed_node_id(&self) -> Option<&str> {
        match self {
            EngineError::NodeExecution { node_id, .. } => Some(node_id),
            EngineError::NoBranchSatisfied { node_id } => Some(node_id),
            _ => None,
        }
    }
}
