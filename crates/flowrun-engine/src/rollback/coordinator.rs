//! The rollback coordinator
//!
//! Orchestrates compensation into the three rollback shapes: a single
//! node, everything after a checkpoint, or the whole workflow. Reads only
//! the event log and the instance row — rollback never needs the memory of
//! the process that originally ran the nodes.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::compensation::CompensationService;
use crate::error::EngineError;
use crate::event::{EventDraft, EventStatus, EventType};
use crate::metrics::{names, EngineMetrics};
use crate::persistence::WorkflowStore;
use crate::state::StateManager;

/// Why a rollback was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackReasonCode {
    UserRequested,
    ExecutionFailed,
    ValidationFailed,
    TimeoutExceeded,
}

impl RollbackReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackReasonCode::UserRequested => "USER_REQUESTED",
            RollbackReasonCode::ExecutionFailed => "EXECUTION_FAILED",
            RollbackReasonCode::ValidationFailed => "VALIDATION_FAILED",
            RollbackReasonCode::TimeoutExceeded => "TIMEOUT_EXCEEDED",
        }
    }
}

/// Structured rollback reason: a code plus free-form details
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RollbackReason {
    pub code: RollbackReasonCode,
    pub details: String,
}

impl RollbackReason {
    pub fn user_requested(details: impl Into<String>) -> Self {
        Self {
            code: RollbackReasonCode::UserRequested,
            details: details.into(),
        }
    }

    pub fn execution_failed(details: impl Into<String>) -> Self {
        Self {
            code: RollbackReasonCode::ExecutionFailed,
            details: details.into(),
        }
    }

    pub fn validation_failed(details: impl Into<String>) -> Self {
        Self {
            code: RollbackReasonCode::ValidationFailed,
            details: details.into(),
        }
    }

    pub fn timeout_exceeded(details: impl Into<String>) -> Self {
        Self {
            code: RollbackReasonCode::TimeoutExceeded,
            details: details.into(),
        }
    }
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.details)
    }
}

/// Outcome of a rollback operation
#[derive(Debug, Clone)]
pub struct RollbackResult {
    pub success: bool,
    pub execution_id: Uuid,

    /// Nodes whose compensation succeeded, in original completion order
    pub rolled_back_nodes: Vec<String>,

    /// Nodes whose compensation failed
    pub failed_nodes: Vec<String>,

    pub message: String,
}

/// A named rollback target: the sequence number of a CHECKPOINT_CREATED
/// event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub sequence_number: i64,
    pub name: String,
}

/// Orchestrates node/checkpoint/workflow rollback
pub struct RollbackCoordinator {
    store: Arc<dyn WorkflowStore>,
    state: Arc<StateManager>,
    compensation: Arc<CompensationService>,
    metrics: Arc<EngineMetrics>,
}

impl RollbackCoordinator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        state: Arc<StateManager>,
        compensation: Arc<CompensationService>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            state,
            compensation,
            metrics,
        }
    }

    /// Roll back a single completed node.
    ///
    /// On success, restores the instance variables from the compensated
    /// event's snapshot when one was recorded.
    #[instrument(skip(self, reason))]
    pub async fn rollback_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        reason: &RollbackReason,
    ) -> Result<RollbackResult, EngineError> {
        let tenant_id = self.state.instance(execution_id).await?.tenant_id;
        self.metrics.incr(names::ROLLBACK, &tenant_id);

        self.store
            .append(
                execution_id,
                &tenant_id,
                EventDraft::new(EventType::RollbackInitiated)
                    .with_node_id(node_id)
                    .with_decision(reason.code.as_str())
                    .with_output(json!({ "reason": reason })),
            )
            .await?;

        // Capture the snapshot before compensation flips the event status.
        let snapshot = self
            .store
            .events_by_node(execution_id, node_id)
            .await?
            .iter()
            .rev()
            .find(|e| {
                e.event_type == EventType::NodeCompleted && e.status == EventStatus::Completed
            })
            .and_then(|e| e.variables_snapshot.clone());

        let result = self.compensation.compensate_node(execution_id, node_id).await?;

        if result.success {
            if let Some(serde_json::Value::Object(variables)) = snapshot {
                self.state.update_variables(execution_id, variables).await?;
                info!(%execution_id, node_id, "variables restored from snapshot");
            }
            self.store
                .append(
                    execution_id,
                    &tenant_id,
                    EventDraft::new(EventType::RollbackCompleted).with_node_id(node_id),
                )
                .await?;
            Ok(RollbackResult {
                success: true,
                execution_id,
                rolled_back_nodes: vec![node_id.to_string()],
                failed_nodes: vec![],
                message: "rolled back".into(),
            })
        } else {
            self.store
                .append(
                    execution_id,
                    &tenant_id,
                    EventDraft::new(EventType::RollbackFailed)
                        .with_node_id(node_id)
                        .with_error(result.message.clone()),
                )
                .await?;
            warn!(%execution_id, node_id, message = %result.message, "node rollback failed");
            Ok(RollbackResult {
                success: false,
                execution_id,
                rolled_back_nodes: vec![],
                failed_nodes: vec![node_id.to_string()],
                message: result.message,
            })
        }
    }

    /// Undo every NODE_COMPLETED after the checkpoint, newest first
    #[instrument(skip(self, reason))]
    pub async fn rollback_to_checkpoint(
        &self,
        execution_id: Uuid,
        checkpoint_sequence: i64,
        reason: &RollbackReason,
    ) -> Result<RollbackResult, EngineError> {
        let events = self.store.timeline(execution_id).await?;

        // Completed non-control nodes strictly after the checkpoint,
        // descending.
        let mut targets: Vec<(i64, String)> = events
            .iter()
            .filter(|e| {
                e.event_type == EventType::NodeCompleted
                    && e.status == EventStatus::Completed
                    && e.sequence_number > checkpoint_sequence
                    && !crate::compensation::is_control_node_key(e.node_type.as_deref())
            })
            .filter_map(|e| e.node_id.clone().map(|n| (e.sequence_number, n)))
            .collect();
        targets.sort_by(|a, b| b.0.cmp(&a.0));

        let mut rolled_back = Vec::new();
        let mut failed = Vec::new();
        for (_, node_id) in &targets {
            let result = self.rollback_node(execution_id, node_id, reason).await?;
            if result.success {
                rolled_back.push(node_id.clone());
            } else {
                failed.push(node_id.clone());
            }
        }

        // Report in original completion order.
        rolled_back.reverse();

        let success = failed.is_empty();
        let failed_count = failed.len();
        info!(
            %execution_id,
            checkpoint_sequence,
            rolled_back = rolled_back.len(),
            failed = failed_count,
            "checkpoint rollback finished"
        );
        Ok(RollbackResult {
            success,
            execution_id,
            rolled_back_nodes: rolled_back,
            failed_nodes: failed,
            message: if success {
                format!("rolled back to checkpoint {checkpoint_sequence}")
            } else {
                format!("checkpoint rollback left {} node(s) uncompensated", failed_count)
            },
        })
    }

    /// Roll back the whole workflow and cancel the instance
    #[instrument(skip(self, reason))]
    pub async fn rollback_workflow(
        &self,
        execution_id: Uuid,
        reason: &RollbackReason,
    ) -> Result<RollbackResult, EngineError> {
        let instance = self.state.instance(execution_id).await?;
        let tenant_id = instance.tenant_id.clone();
        self.metrics.incr(names::ROLLBACK, &tenant_id);

        self.store
            .append(
                execution_id,
                &tenant_id,
                EventDraft::new(EventType::RollbackInitiated)
                    .with_decision(reason.code.as_str())
                    .with_output(json!({ "reason": reason }))
                    // Pre-rollback state for the audit trail.
                    .with_variables(serde_json::Value::Object(instance.variables.clone())),
            )
            .await?;

        let results = self.compensation.compensate_workflow(execution_id).await?;
        let mut rolled_back: Vec<String> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.node_id.clone())
            .collect();
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.node_id.clone())
            .collect();
        rolled_back.reverse();

        self.state.cancel_workflow(execution_id).await?;
        self.store
            .append(
                execution_id,
                &tenant_id,
                EventDraft::new(EventType::WorkflowRolledBack)
                    .with_decision(reason.code.as_str()),
            )
            .await?;

        let success = failed.is_empty();
        info!(%execution_id, success, "workflow rolled back");
        Ok(RollbackResult {
            success,
            execution_id,
            rolled_back_nodes: rolled_back,
            failed_nodes: failed,
            message: reason.to_string(),
        })
    }

    /// Append a CHECKPOINT_CREATED event; its sequence number is the
    /// checkpoint identifier
    #[instrument(skip(self))]
    pub async fn create_checkpoint(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<i64, EngineError> {
        let tenant_id = self.state.instance(execution_id).await?.tenant_id;
        let event = self
            .store
            .append(
                execution_id,
                &tenant_id,
                EventDraft::new(EventType::CheckpointCreated).with_decision(name),
            )
            .await?;
        info!(%execution_id, name, sequence = event.sequence_number, "checkpoint created");
        Ok(event.sequence_number)
    }

    /// All checkpoints in creation order
    pub async fn checkpoints(&self, execution_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        let events = self.store.timeline(execution_id).await?;
        Ok(events
            .iter()
            .filter(|e| e.event_type == EventType::CheckpointCreated)
            .map(|e| Checkpoint {
                sequence_number: e.sequence_number,
                name: e.decision_result.clone().unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::{CompensationRegistry, FnCompensation};
    use crate::context::TenantContext;
    use crate::persistence::{EventStore, InMemoryStore};
    use crate::instance::InstanceState;
    use flowrun_graph::Variables;
    use parking_lot::Mutex;

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: Arc<CompensationRegistry>,
        state: Arc<StateManager>,
        coordinator: RollbackCoordinator,
    }

    fn fixture() -> Fixture {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let registry = Arc::new(CompensationRegistry::new());
        let state = Arc::new(StateManager::new(store.clone(), metrics.clone()));
        let compensation = Arc::new(CompensationService::new(
            store.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let coordinator = RollbackCoordinator::new(
            store.clone(),
            state.clone(),
            compensation,
            metrics,
        );
        Fixture {
            store,
            registry,
            state,
            coordinator,
        }
    }

    async fn running_instance(f: &Fixture) -> Uuid {
        let instance = f
            .state
            .create_instance(&TenantContext::default(), "wf", 1, Variables::new())
            .await
            .unwrap();
        f.state.start_execution(instance.execution_id).await.unwrap();
        instance.execution_id
    }

    async fn complete_node(
        f: &Fixture,
        execution_id: Uuid,
        node_id: &str,
        variables: serde_json::Value,
    ) {
        f.store
            .append(
                execution_id,
                "default",
                EventDraft::new(EventType::NodeCompleted)
                    .with_node_id(node_id)
                    .with_node_type("svc")
                    .with_output(serde_json::json!({"node": node_id}))
                    .with_variables(variables),
            )
            .await
            .unwrap();
    }

    fn recording_handler(f: &Fixture) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        f.registry.register(
            "svc",
            FnCompensation::new(move |ctx| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(ctx.node_id.clone());
                    Ok(())
                }
            }),
        );
        log
    }

    #[tokio::test]
    async fn test_rollback_node_restores_variables() {
        let f = fixture();
        let execution_id = running_instance(&f).await;
        let _log = recording_handler(&f);

        complete_node(
            &f,
            execution_id,
            "n1",
            serde_json::json!({"balance": 100}),
        )
        .await;

        let result = f
            .coordinator
            .rollback_node(execution_id, "n1", &RollbackReason::user_requested("test"))
            .await
            .unwrap();
        assert!(result.success);

        let instance = f.state.instance(execution_id).await.unwrap();
        assert_eq!(instance.variables.get("balance"), Some(&serde_json::json!(100)));

        let timeline = f.store.timeline(execution_id).await.unwrap();
        let types: Vec<_> = timeline.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::RollbackInitiated));
        assert!(types.contains(&EventType::RollbackCompleted));
    }

    #[tokio::test]
    async fn test_rollback_node_failure_is_recorded() {
        let f = fixture();
        let execution_id = running_instance(&f).await;
        // No handler registered.
        complete_node(&f, execution_id, "n1", serde_json::json!({})).await;

        let result = f
            .coordinator
            .rollback_node(execution_id, "n1", &RollbackReason::user_requested("test"))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failed_nodes, vec!["n1"]);

        let timeline = f.store.timeline(execution_id).await.unwrap();
        assert!(timeline
            .iter()
            .any(|e| e.event_type == EventType::RollbackFailed));
    }

    #[tokio::test]
    async fn test_checkpoint_rollback_descending_order() {
        let f = fixture();
        let execution_id = running_instance(&f).await;
        let log = recording_handler(&f);

        complete_node(&f, execution_id, "n1", serde_json::json!({})).await;
        let checkpoint = f
            .coordinator
            .create_checkpoint(execution_id, "after-n1")
            .await
            .unwrap();
        complete_node(&f, execution_id, "n2", serde_json::json!({})).await;
        complete_node(&f, execution_id, "n3", serde_json::json!({})).await;

        let result = f
            .coordinator
            .rollback_to_checkpoint(
                execution_id,
                checkpoint,
                &RollbackReason::execution_failed("downstream broke"),
            )
            .await
            .unwrap();

        assert!(result.success);
        // Compensated newest-first, reported in completion order.
        assert_eq!(*log.lock(), vec!["n3", "n2"]);
        assert_eq!(result.rolled_back_nodes, vec!["n2", "n3"]);
        assert!(result.failed_nodes.is_empty());

        // n1 (before the checkpoint) was untouched.
        assert!(!log.lock().contains(&"n1".to_string()));
    }

    #[tokio::test]
    async fn test_checkpoint_listing() {
        let f = fixture();
        let execution_id = running_instance(&f).await;

        let first = f
            .coordinator
            .create_checkpoint(execution_id, "cp-one")
            .await
            .unwrap();
        complete_node(&f, execution_id, "n1", serde_json::json!({})).await;
        let second = f
            .coordinator
            .create_checkpoint(execution_id, "cp-two")
            .await
            .unwrap();

        let checkpoints = f.coordinator.checkpoints(execution_id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].sequence_number, first);
        assert_eq!(checkpoints[0].name, "cp-one");
        assert_eq!(checkpoints[1].sequence_number, second);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_workflow_rollback_cancels_instance() {
        let f = fixture();
        let execution_id = running_instance(&f).await;
        let log = recording_handler(&f);

        complete_node(&f, execution_id, "n1", serde_json::json!({})).await;
        complete_node(&f, execution_id, "n2", serde_json::json!({})).await;

        let result = f
            .coordinator
            .rollback_workflow(execution_id, &RollbackReason::user_requested("abort all"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(*log.lock(), vec!["n2", "n1"]);
        assert_eq!(result.rolled_back_nodes, vec!["n1", "n2"]);

        let instance = f.state.instance(execution_id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Cancelled);

        let timeline = f.store.timeline(execution_id).await.unwrap();
        assert!(timeline
            .iter()
            .any(|e| e.event_type == EventType::WorkflowRolledBack));
    }

    #[tokio::test]
    async fn test_workflow_rollback_collects_failures() {
        let f = fixture();
        let execution_id = running_instance(&f).await;
        // Handler for n1 only.
        f.registry.register_for_node(
            execution_id,
            "n1",
            FnCompensation::new(|_| async { Ok(()) }),
        );

        complete_node(&f, execution_id, "n1", serde_json::json!({})).await;
        complete_node(&f, execution_id, "n2", serde_json::json!({})).await;

        let result = f
            .coordinator
            .rollback_workflow(execution_id, &RollbackReason::timeout_exceeded("too slow"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.rolled_back_nodes, vec!["n1"]);
        assert_eq!(result.failed_nodes, vec!["n2"]);

        // Failures do not block the cancel transition.
        let instance = f.state.instance(execution_id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Cancelled);
    }
}
