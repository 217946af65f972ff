//! Compensation orchestration over the event log
//!
//! Works purely from persisted events: which nodes completed, in what
//! order, and with what output. Never needs live process memory, so it can
//! run from any replica after the original one died.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::registry::{CompensationContext, CompensationRegistry};
use crate::error::EngineError;
use crate::event::{EventDraft, EventStatus, EventType, ExecutionEvent};
use crate::metrics::{names, EngineMetrics};
use crate::persistence::WorkflowStore;

/// Outcome of compensating one node
#[derive(Debug, Clone)]
pub struct CompensationResult {
    pub success: bool,
    pub node_id: String,
    pub message: String,

    /// The COMPENSATION_COMPLETED event, on success
    pub compensation_event_id: Option<Uuid>,
}

impl CompensationResult {
    fn ok(node_id: &str, event_id: Uuid) -> Self {
        Self {
            success: true,
            node_id: node_id.to_string(),
            message: "compensated".to_string(),
            compensation_event_id: Some(event_id),
        }
    }

    fn failure(node_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            node_id: node_id.to_string(),
            message: message.into(),
            compensation_event_id: None,
        }
    }
}

/// Binding keys of pure control nodes: no side effects, nothing to undo.
/// Workflow- and checkpoint-level walks skip them.
const CONTROL_NODE_KEYS: [&str; 7] = [
    "START_EVENT",
    "END_EVENT",
    "INTERMEDIATE_EVENT",
    "EXCLUSIVE_GATEWAY",
    "PARALLEL_GATEWAY",
    "INCLUSIVE_GATEWAY",
    "EVENT_BASED_GATEWAY",
];

/// Whether an event's binding key names a control node
pub(crate) fn is_control_node_key(key: Option<&str>) -> bool {
    key.map_or(false, |k| CONTROL_NODE_KEYS.contains(&k))
}

/// Invokes registered compensation handlers for completed nodes
pub struct CompensationService {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<CompensationRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl CompensationService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<CompensationRegistry>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<CompensationRegistry> {
        &self.registry
    }

    /// Compensate a single node (§ latest completed attempt).
    ///
    /// Never fails hard: every outcome, including "no handler", is an
    /// auditable [`CompensationResult`].
    #[instrument(skip(self))]
    pub async fn compensate_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<CompensationResult, EngineError> {
        let events = self.store.events_by_node(execution_id, node_id).await?;
        if events.is_empty() {
            return Ok(CompensationResult::failure(
                node_id,
                "no events recorded for node",
            ));
        }

        let tenant_id = events[0].tenant_id.clone();

        // Latest still-completed NODE_COMPLETED; compensated ones are done.
        let completed = events
            .iter()
            .rev()
            .find(|e| {
                e.event_type == EventType::NodeCompleted && e.status == EventStatus::Completed
            })
            .cloned();
        let Some(completed) = completed else {
            return Ok(CompensationResult::failure(node_id, "node not completed"));
        };

        let handler =
            self.registry
                .resolve(execution_id, node_id, completed.node_type.as_deref());

        let initiated = EventDraft::new(EventType::CompensationInitiated)
            .with_node_id(node_id)
            .with_node_type(completed.node_type.clone().unwrap_or_default());
        self.store
            .append(execution_id, &tenant_id, initiated)
            .await?;

        let Some(handler) = handler else {
            warn!(%execution_id, node_id, "no compensation handler registered");
            return Ok(CompensationResult::failure(
                node_id,
                "no compensation handler registered",
            ));
        };

        let ctx = CompensationContext {
            execution_id,
            node_id: node_id.to_string(),
            node_type: completed.node_type.clone(),
            original_output: completed
                .output_snapshot
                .as_ref()
                .map(|v| v.to_string()),
        };

        self.metrics.incr(names::COMPENSATION, &tenant_id);
        match handler.compensate(&ctx).await {
            Ok(()) => {
                let done = self
                    .store
                    .append(
                        execution_id,
                        &tenant_id,
                        EventDraft::new(EventType::CompensationCompleted)
                            .with_node_id(node_id)
                            .with_node_type(completed.node_type.clone().unwrap_or_default()),
                    )
                    .await?;
                self.store.mark_compensated(completed.id, done.id).await?;
                info!(%execution_id, node_id, "node compensated");
                Ok(CompensationResult::ok(node_id, done.id))
            }
            Err(err) => {
                self.store
                    .append(
                        execution_id,
                        &tenant_id,
                        EventDraft::new(EventType::CompensationFailed)
                            .with_node_id(node_id)
                            .with_error(err.to_string()),
                    )
                    .await?;
                warn!(%execution_id, node_id, %err, "compensation handler failed");
                Ok(CompensationResult::failure(
                    node_id,
                    format!("compensation handler failed: {err}"),
                ))
            }
        }
    }

    /// Compensate the completed nodes between two anchors (inclusive), in
    /// reverse completion order, stopping at the first failure
    #[instrument(skip(self))]
    pub async fn compensate_sequence(
        &self,
        execution_id: Uuid,
        start_node_id: &str,
        end_node_id: &str,
    ) -> Result<Vec<CompensationResult>, EngineError> {
        let order = self.completion_order(execution_id).await?;

        let start = order.iter().position(|n| n == start_node_id);
        let end = order.iter().rposition(|n| n == end_node_id);
        let (Some(start), Some(end)) = (start, end) else {
            return Ok(vec![CompensationResult::failure(
                start_node_id,
                "anchor node has no completed execution",
            )]);
        };
        if start > end {
            return Ok(vec![CompensationResult::failure(
                start_node_id,
                "start anchor completed after end anchor",
            )]);
        }

        let mut results = Vec::new();
        for node_id in order[start..=end].iter().rev() {
            let result = self.compensate_node(execution_id, node_id).await?;
            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }
        Ok(results)
    }

    /// Compensate every completed node in reverse completion order,
    /// collecting all results (individual failures do not stop the walk)
    #[instrument(skip(self))]
    pub async fn compensate_workflow(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<CompensationResult>, EngineError> {
        let order = self.completion_order(execution_id).await?;

        let mut results = Vec::new();
        for node_id in order.iter().rev() {
            results.push(self.compensate_node(execution_id, node_id).await?);
        }
        Ok(results)
    }

    /// Node ids with a still-completed NODE_COMPLETED event, in ascending
    /// completion (sequence) order, de-duplicated keeping the first.
    /// Control nodes (events, gateways) carry no side effects and are
    /// left out.
    async fn completion_order(&self, execution_id: Uuid) -> Result<Vec<String>, EngineError> {
        let events = self.store.timeline(execution_id).await?;
        let mut seen = std::collections::HashSet::new();
        let mut order = Vec::new();
        for event in completed_node_events(&events) {
            if is_control_node_key(event.node_type.as_deref()) {
                continue;
            }
            if let Some(node_id) = &event.node_id {
                if seen.insert(node_id.clone()) {
                    order.push(node_id.clone());
                }
            }
        }
        Ok(order)
    }
}

fn completed_node_events(events: &[ExecutionEvent]) -> impl Iterator<Item = &ExecutionEvent> {
    events.iter().filter(|e| {
        e.event_type == EventType::NodeCompleted && e.status == EventStatus::Completed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::FnCompensation;
    use crate::persistence::InMemoryStore;
    use crate::prelude::EventStore;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: Arc<CompensationRegistry>,
        service: CompensationService,
        execution_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(CompensationRegistry::new());
        let service = CompensationService::new(
            store.clone(),
            registry.clone(),
            Arc::new(EngineMetrics::new()),
        );
        Fixture {
            store,
            registry,
            service,
            execution_id: Uuid::now_v7(),
        }
    }

    async fn record_completed(
        store: &InMemoryStore,
        execution_id: Uuid,
        node_id: &str,
        key: &str,
        output: serde_json::Value,
    ) {
        store
            .append(
                execution_id,
                "default",
                EventDraft::new(EventType::NodeCompleted)
                    .with_node_id(node_id)
                    .with_node_type(key)
                    .with_output(output),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_compensate_node_happy_path() {
        let f = fixture();
        record_completed(
            &f.store,
            f.execution_id,
            "n1",
            "payment",
            json!({"paymentId": "p-42"}),
        )
        .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_handler = seen.clone();
        f.registry.register(
            "payment",
            FnCompensation::new(move |ctx| {
                let seen = seen_handler.clone();
                async move {
                    seen.lock().push(ctx.original_output.clone().unwrap_or_default());
                    Ok(())
                }
            }),
        );

        let result = f
            .service
            .compensate_node(f.execution_id, "n1")
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
        assert!(seen.lock()[0].contains("p-42"));

        // Events: NODE_COMPLETED, COMPENSATION_INITIATED, COMPENSATION_COMPLETED.
        let timeline = f.store.timeline(f.execution_id).await.unwrap();
        let types: Vec<_> = timeline.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::NodeCompleted,
                EventType::CompensationInitiated,
                EventType::CompensationCompleted
            ]
        );

        // The completed event is now marked compensated and linked.
        assert_eq!(timeline[0].status, EventStatus::Compensated);
        assert_eq!(timeline[0].compensated_by, Some(timeline[2].id));
    }

    #[tokio::test]
    async fn test_compensate_node_without_events() {
        let f = fixture();
        let result = f
            .service
            .compensate_node(f.execution_id, "ghost")
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("no events"));
    }

    #[tokio::test]
    async fn test_compensate_node_not_completed() {
        let f = fixture();
        f.store
            .append(
                f.execution_id,
                "default",
                EventDraft::new(EventType::NodeStarted).with_node_id("n1"),
            )
            .await
            .unwrap();

        let result = f
            .service
            .compensate_node(f.execution_id, "n1")
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("not completed"));
    }

    #[tokio::test]
    async fn test_no_handler_is_still_audited() {
        let f = fixture();
        record_completed(&f.store, f.execution_id, "n1", "payment", json!({})).await;

        let result = f
            .service
            .compensate_node(f.execution_id, "n1")
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("no compensation handler"));

        // COMPENSATION_INITIATED was still appended.
        let timeline = f.store.timeline(f.execution_id).await.unwrap();
        assert!(timeline
            .iter()
            .any(|e| e.event_type == EventType::CompensationInitiated));
    }

    #[tokio::test]
    async fn test_handler_failure_appends_failed_event() {
        let f = fixture();
        record_completed(&f.store, f.execution_id, "n1", "payment", json!({})).await;
        f.registry.register(
            "payment",
            FnCompensation::new(|_| async { Err(EngineError::Handler("refund refused".into())) }),
        );

        let result = f
            .service
            .compensate_node(f.execution_id, "n1")
            .await
            .unwrap();
        assert!(!result.success);

        let timeline = f.store.timeline(f.execution_id).await.unwrap();
        let failed = timeline
            .iter()
            .find(|e| e.event_type == EventType::CompensationFailed)
            .unwrap();
        assert!(failed.error_message.as_deref().unwrap().contains("refund refused"));

        // The NODE_COMPLETED event keeps its status.
        assert_eq!(timeline[0].status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_workflow_compensation_runs_in_reverse_order() {
        let f = fixture();
        for node in ["n1", "n2", "n3"] {
            record_completed(&f.store, f.execution_id, node, "svc", json!({})).await;
        }

        let invocations = Arc::new(Mutex::new(Vec::new()));
        let log = invocations.clone();
        f.registry.register(
            "svc",
            FnCompensation::new(move |ctx| {
                let log = log.clone();
                async move {
                    log.lock().push(ctx.node_id.clone());
                    Ok(())
                }
            }),
        );

        let results = f.service.compensate_workflow(f.execution_id).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(*invocations.lock(), vec!["n3", "n2", "n1"]);
    }

    #[tokio::test]
    async fn test_workflow_compensation_collects_failures() {
        let f = fixture();
        for node in ["n1", "n2"] {
            record_completed(&f.store, f.execution_id, node, "svc", json!({})).await;
        }
        // Only n1 has a handler (per-node registration).
        f.registry.register_for_node(
            f.execution_id,
            "n1",
            FnCompensation::new(|_| async { Ok(()) }),
        );

        let results = f.service.compensate_workflow(f.execution_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[0].success); // n2: no handler
        assert!(results[1].success); // n1
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let f = fixture();
        for node in ["n1", "n2", "n3"] {
            record_completed(&f.store, f.execution_id, node, "svc", json!({})).await;
        }
        // n3 compensates fine, n2 fails, n1 must never be attempted.
        let invocations = Arc::new(Mutex::new(Vec::new()));
        let log = invocations.clone();
        f.registry.register(
            "svc",
            FnCompensation::new(move |ctx| {
                let log = log.clone();
                async move {
                    log.lock().push(ctx.node_id.clone());
                    if ctx.node_id == "n2" {
                        Err(EngineError::Handler("stuck".into()))
                    } else {
                        Ok(())
                    }
                }
            }),
        );

        let results = f
            .service
            .compensate_sequence(f.execution_id, "n1", "n3")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(*invocations.lock(), vec!["n3", "n2"]);
    }

    #[tokio::test]
    async fn test_compensated_node_not_compensated_twice() {
        let f = fixture();
        record_completed(&f.store, f.execution_id, "n1", "svc", json!({})).await;
        f.registry
            .register("svc", FnCompensation::new(|_| async { Ok(()) }));

        let first = f.service.compensate_node(f.execution_id, "n1").await.unwrap();
        assert!(first.success);

        let second = f.service.compensate_node(f.execution_id, "n1").await.unwrap();
        assert!(!second.success);
        assert!(second.message.contains("not completed"));
    }
}
