//! State reconstruction from the event log
//!
//! Replay is a pure fold over the ordered events of one execution: no
//! handler invocation, no network, no clock reads. Any replica that can
//! read the log reconstructs the same state, which is what makes crash
//! recovery deterministic across pods.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::{EventType, ExecutionEvent};
use crate::instance::InstanceState;
use crate::persistence::WorkflowStore;
use flowrun_graph::Variables;

/// Execution state rebuilt from events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedState {
    pub execution_id: Uuid,
    pub state: InstanceState,
    pub current_node_id: Option<String>,
    pub variables: Variables,

    /// De-duplicated, order-preserving
    pub completed_nodes: Vec<String>,

    /// Nodes with a NODE_STARTED but no NODE_COMPLETED yet
    pub active_nodes: Vec<String>,

    /// node id → error message
    pub failed_nodes: HashMap<String, String>,

    /// Edge ids in traversal order
    pub edge_traversals: Vec<String>,

    /// checkpoint sequence → name
    pub checkpoints: BTreeMap<i64, String>,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,

    /// Sequence of the last folded event; 0 when the log is empty
    pub last_sequence_number: i64,
}

impl ReconstructedState {
    fn empty(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            state: InstanceState::Pending,
            current_node_id: None,
            variables: Variables::new(),
            completed_nodes: Vec::new(),
            active_nodes: Vec::new(),
            failed_nodes: HashMap::new(),
            edge_traversals: Vec::new(),
            checkpoints: BTreeMap::new(),
            start_time: None,
            end_time: None,
            error: None,
            last_sequence_number: 0,
        }
    }
}

/// Where a resumed execution picks up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub execution_id: Uuid,
    pub resume_node_id: String,
    pub last_sequence_number: i64,
    pub variables: Variables,
    pub completed_nodes: Vec<String>,
}

/// Reconstructs execution state by folding events
pub struct ReplayEngine {
    store: Arc<dyn WorkflowStore>,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Fold the event log into a [`ReconstructedState`], optionally only
    /// up to (and including) a sequence number
    #[instrument(skip(self))]
    pub async fn reconstruct_state(
        &self,
        execution_id: Uuid,
        upto_sequence: Option<i64>,
    ) -> Result<ReconstructedState, EngineError> {
        let events = match upto_sequence {
            Some(upto) => self.store.timeline_range(execution_id, 1, upto).await?,
            None => self.store.timeline(execution_id).await?,
        };

        let mut state = ReconstructedState::empty(execution_id);
        let mut completed_set: HashSet<String> = HashSet::new();
        let mut active_set: Vec<String> = Vec::new();

        for event in &events {
            state.last_sequence_number = event.sequence_number;
            apply(&mut state, &mut completed_set, &mut active_set, event);
        }

        state.active_nodes = active_set;
        Ok(state)
    }

    /// True iff the reconstructed state is RUNNING with a current node
    pub async fn can_resume(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let state = self.reconstruct_state(execution_id, None).await?;
        Ok(state.state == InstanceState::Running && state.current_node_id.is_some())
    }

    /// The resume point for a resumable execution; `None` when replay says
    /// there is nothing to resume
    pub async fn resume_point(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ResumePoint>, EngineError> {
        let state = self.reconstruct_state(execution_id, None).await?;
        if state.state != InstanceState::Running {
            return Ok(None);
        }
        let Some(resume_node_id) = state.current_node_id.clone() else {
            return Ok(None);
        };
        Ok(Some(ResumePoint {
            execution_id,
            resume_node_id,
            last_sequence_number: state.last_sequence_number,
            variables: state.variables,
            completed_nodes: state.completed_nodes,
        }))
    }

    /// Self-test: reconstruct twice and compare the replay-relevant
    /// fields. A mismatch means the fold is not deterministic.
    pub async fn validate_replay_consistency(
        &self,
        execution_id: Uuid,
    ) -> Result<bool, EngineError> {
        let first = self.reconstruct_state(execution_id, None).await?;
        let second = self.reconstruct_state(execution_id, None).await?;
        Ok(first.state == second.state
            && first.current_node_id == second.current_node_id
            && first.completed_nodes == second.completed_nodes
            && first.variables == second.variables)
    }
}

fn apply(
    state: &mut ReconstructedState,
    completed_set: &mut HashSet<String>,
    active_set: &mut Vec<String>,
    event: &ExecutionEvent,
) {
    match event.event_type {
        EventType::WorkflowStarted => {
            state.state = InstanceState::Running;
            state.start_time = Some(event.timestamp);
            if let Some(serde_json::Value::Object(vars)) = &event.variables_snapshot {
                state.variables = vars.clone();
            }
        }

        EventType::WorkflowCompleted => {
            state.state = InstanceState::Completed;
            state.end_time = Some(event.timestamp);
        }

        EventType::WorkflowFailed => {
            state.state = InstanceState::Failed;
            state.end_time = Some(event.timestamp);
            state.error = event.error_message.clone();
        }

        EventType::WorkflowRolledBack => {
            state.state = InstanceState::Cancelled;
            state.end_time = Some(event.timestamp);
        }

        EventType::NodeStarted => {
            if let Some(node_id) = &event.node_id {
                state.current_node_id = Some(node_id.clone());
                if !active_set.contains(node_id) {
                    active_set.push(node_id.clone());
                }
            }
        }

        EventType::NodeCompleted => {
            if let Some(node_id) = &event.node_id {
                active_set.retain(|n| n != node_id);
                if completed_set.insert(node_id.clone()) {
                    state.completed_nodes.push(node_id.clone());
                }
            }
            if let Some(serde_json::Value::Object(vars)) = &event.variables_snapshot {
                for (key, value) in vars {
                    state.variables.insert(key.clone(), value.clone());
                }
            }
        }

        EventType::NodeFailed => {
            if let Some(node_id) = &event.node_id {
                active_set.retain(|n| n != node_id);
                state.failed_nodes.insert(
                    node_id.clone(),
                    event.error_message.clone().unwrap_or_default(),
                );
            }
        }

        EventType::VariableSet | EventType::VariableUpdated => {
            if let Some(serde_json::Value::Object(vars)) = &event.variables_snapshot {
                for (key, value) in vars {
                    state.variables.insert(key.clone(), value.clone());
                }
            }
        }

        EventType::GatewayBranchTaken => {
            if let Some(edge_id) = &event.edge_taken {
                state.edge_traversals.push(edge_id.clone());
            }
        }

        EventType::CheckpointCreated => {
            state.checkpoints.insert(
                event.sequence_number,
                event.decision_result.clone().unwrap_or_default(),
            );
        }

        // Informational during replay.
        EventType::NodeEntered
        | EventType::NodeSkipped
        | EventType::TransactionStarted
        | EventType::TransactionCommitted
        | EventType::TransactionRolledBack
        | EventType::CompensationInitiated
        | EventType::CompensationCompleted
        | EventType::CompensationFailed
        | EventType::RollbackInitiated
        | EventType::RollbackCompleted
        | EventType::RollbackFailed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;
    use crate::persistence::{EventStore, InMemoryStore};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        replay: ReplayEngine,
        execution_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let replay = ReplayEngine::new(store.clone());
        Fixture {
            store,
            replay,
            execution_id: Uuid::now_v7(),
        }
    }

    async fn append(f: &Fixture, draft: EventDraft) {
        f.store
            .append(f.execution_id, "default", draft)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_log_reconstructs_pending() {
        let f = fixture();
        let state = f
            .replay
            .reconstruct_state(f.execution_id, None)
            .await
            .unwrap();
        assert_eq!(state.state, InstanceState::Pending);
        assert_eq!(state.last_sequence_number, 0);
        assert!(!f.replay.can_resume(f.execution_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_linear_run_reconstruction() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        append(&f, EventDraft::new(EventType::NodeStarted).with_node_id("n1")).await;
        append(
            &f,
            EventDraft::new(EventType::NodeCompleted)
                .with_node_id("n1")
                .with_variables(json!({"x": 1})),
        )
        .await;
        append(&f, EventDraft::new(EventType::WorkflowCompleted)).await;

        let state = f
            .replay
            .reconstruct_state(f.execution_id, None)
            .await
            .unwrap();
        assert_eq!(state.state, InstanceState::Completed);
        assert_eq!(state.completed_nodes, vec!["n1"]);
        assert!(state.active_nodes.is_empty());
        assert_eq!(state.variables.get("x"), Some(&json!(1)));
        assert!(state.start_time.is_some());
        assert!(state.end_time.is_some());
        assert_eq!(state.last_sequence_number, 4);
    }

    #[tokio::test]
    async fn test_crash_scenario_resume_point() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        append(&f, EventDraft::new(EventType::NodeStarted).with_node_id("n1")).await;
        append(&f, EventDraft::new(EventType::NodeCompleted).with_node_id("n1")).await;
        append(&f, EventDraft::new(EventType::NodeStarted).with_node_id("n2")).await;

        assert!(f.replay.can_resume(f.execution_id).await.unwrap());

        let point = f
            .replay
            .resume_point(f.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(point.resume_node_id, "n2");
        assert_eq!(point.completed_nodes, vec!["n1"]);
        assert_eq!(point.last_sequence_number, 4);

        let state = f
            .replay
            .reconstruct_state(f.execution_id, None)
            .await
            .unwrap();
        assert_eq!(state.active_nodes, vec!["n2"]);
    }

    #[tokio::test]
    async fn test_terminal_states_not_resumable() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        append(&f, EventDraft::new(EventType::NodeStarted).with_node_id("n1")).await;
        append(
            &f,
            EventDraft::new(EventType::NodeFailed)
                .with_node_id("n1")
                .with_error("exploded"),
        )
        .await;
        append(
            &f,
            EventDraft::new(EventType::WorkflowFailed).with_error("exploded"),
        )
        .await;

        assert!(!f.replay.can_resume(f.execution_id).await.unwrap());
        assert!(f.replay.resume_point(f.execution_id).await.unwrap().is_none());

        let state = f
            .replay
            .reconstruct_state(f.execution_id, None)
            .await
            .unwrap();
        assert_eq!(state.state, InstanceState::Failed);
        assert_eq!(state.error.as_deref(), Some("exploded"));
        assert_eq!(state.failed_nodes.get("n1").unwrap(), "exploded");
    }

    #[tokio::test]
    async fn test_variable_merge_order() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        append(
            &f,
            EventDraft::new(EventType::VariableSet).with_variables(json!({"a": 1, "b": 1})),
        )
        .await;
        append(
            &f,
            EventDraft::new(EventType::VariableUpdated).with_variables(json!({"b": 2, "c": 3})),
        )
        .await;

        let state = f
            .replay
            .reconstruct_state(f.execution_id, None)
            .await
            .unwrap();
        assert_eq!(state.variables.get("a"), Some(&json!(1)));
        assert_eq!(state.variables.get("b"), Some(&json!(2)));
        assert_eq!(state.variables.get("c"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_completed_nodes_deduplicated_in_order() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        for node in ["n1", "n2", "n1", "n3"] {
            append(
                &f,
                EventDraft::new(EventType::NodeCompleted).with_node_id(node),
            )
            .await;
        }

        let state = f
            .replay
            .reconstruct_state(f.execution_id, None)
            .await
            .unwrap();
        assert_eq!(state.completed_nodes, vec!["n1", "n2", "n3"]);
    }

    #[tokio::test]
    async fn test_edge_traversals_and_checkpoints() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        append(
            &f,
            EventDraft::new(EventType::GatewayBranchTaken)
                .with_node_id("gate")
                .with_edge_taken("edge-approved"),
        )
        .await;
        append(
            &f,
            EventDraft::new(EventType::CheckpointCreated).with_decision("cp1"),
        )
        .await;

        let state = f
            .replay
            .reconstruct_state(f.execution_id, None)
            .await
            .unwrap();
        assert_eq!(state.edge_traversals, vec!["edge-approved"]);
        assert_eq!(state.checkpoints.get(&3), Some(&"cp1".to_string()));
    }

    #[tokio::test]
    async fn test_upto_sequence_bounds_the_fold() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        append(&f, EventDraft::new(EventType::NodeStarted).with_node_id("n1")).await;
        append(&f, EventDraft::new(EventType::NodeCompleted).with_node_id("n1")).await;
        append(&f, EventDraft::new(EventType::WorkflowCompleted)).await;

        let partial = f
            .replay
            .reconstruct_state(f.execution_id, Some(2))
            .await
            .unwrap();
        assert_eq!(partial.state, InstanceState::Running);
        assert!(partial.completed_nodes.is_empty());
        assert_eq!(partial.current_node_id.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let f = fixture();
        append(&f, EventDraft::new(EventType::WorkflowStarted)).await;
        for node in ["n1", "n2", "n3"] {
            append(&f, EventDraft::new(EventType::NodeStarted).with_node_id(node)).await;
            append(
                &f,
                EventDraft::new(EventType::NodeCompleted)
                    .with_node_id(node)
                    .with_variables(json!({node: true})),
            )
            .await;
        }

        assert!(f
            .replay
            .validate_replay_consistency(f.execution_id)
            .await
            .unwrap());

        let first = f.replay.reconstruct_state(f.execution_id, None).await.unwrap();
        let second = f.replay.reconstruct_state(f.execution_id, None).await.unwrap();
        assert_eq!(first, second);
    }
}
