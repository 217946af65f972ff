//! Two-phase commit with compensation as the failure net

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

use flowrun_engine::prelude::*;
use flowrun_graph::Variables;

/// Prepare succeeds, commit fails, compensation counts its invocations
struct CaptureFunds {
    commit_attempts: Arc<AtomicUsize>,
    compensations: Arc<AtomicUsize>,
    fail_commit: bool,
}

#[async_trait]
impl TwoPhaseOperation for CaptureFunds {
    async fn prepare(&self, _ctx: &TransactionContext) -> Result<Value, EngineError> {
        Ok(json!("PREPARED"))
    }

    async fn commit(
        &self,
        _ctx: &TransactionContext,
        prepared: Value,
    ) -> Result<Value, EngineError> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        assert_eq!(prepared, json!("PREPARED"));
        if self.fail_commit {
            Err(EngineError::Handler("acquirer unreachable".into()))
        } else {
            Ok(json!("CAPTURED"))
        }
    }

    fn compensation(&self) -> Option<Arc<dyn CompensationHandler>> {
        let counter = self.compensations.clone();
        Some(FnCompensation::new(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }
}

async fn engine_with_instance() -> (WorkflowEngine, uuid::Uuid) {
    let store = Arc::new(InMemoryStore::new());
    let engine = WorkflowEngine::new(store);
    let instance = engine
        .state()
        .create_instance(&TenantContext::default(), "capture", 1, Variables::new())
        .await
        .unwrap();
    (engine, instance.execution_id)
}

#[tokio::test]
async fn commit_failure_compensates_exactly_once() {
    let (engine, execution_id) = engine_with_instance().await;
    let ctx = TransactionContext::new(execution_id, "capture-funds", "default");

    let op = CaptureFunds {
        commit_attempts: Arc::new(AtomicUsize::new(0)),
        compensations: Arc::new(AtomicUsize::new(0)),
        fail_commit: true,
    };

    let result = engine
        .transactions()
        .execute_with_two_phase_commit(&ctx, engine.compensation_registry(), &op)
        .await;

    match result {
        Err(EngineError::TransactionFailure(message)) => {
            assert!(message.contains("compensated"), "{message}");
        }
        other => panic!("expected TransactionFailure, got {other:?}"),
    }
    assert_eq!(op.commit_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(op.compensations.load(Ordering::SeqCst), 1);

    // The prepare transaction left its bookkeeping trail.
    let history = engine
        .replay_timeline(execution_id, None, None)
        .await
        .unwrap();
    let types: Vec<_> = history.iter().map(|e| e.event_type).collect();
    assert!(types.contains(&EventType::TransactionStarted));
    assert!(types.contains(&EventType::TransactionCommitted));
}

#[tokio::test]
async fn successful_commit_never_compensates() {
    let (engine, execution_id) = engine_with_instance().await;
    let ctx = TransactionContext::new(execution_id, "capture-funds", "default");

    let op = CaptureFunds {
        commit_attempts: Arc::new(AtomicUsize::new(0)),
        compensations: Arc::new(AtomicUsize::new(0)),
        fail_commit: false,
    };

    let value = engine
        .transactions()
        .execute_with_two_phase_commit(&ctx, engine.compensation_registry(), &op)
        .await
        .unwrap();

    assert_eq!(value, json!("CAPTURED"));
    assert_eq!(op.compensations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_compensation_escalates_to_compensation_failure() {
    let (engine, execution_id) = engine_with_instance().await;
    let ctx = TransactionContext::new(execution_id, "capture-funds", "default");

    struct BrokenCompensation;

    #[async_trait]
    impl TwoPhaseOperation for BrokenCompensation {
        async fn prepare(&self, _ctx: &TransactionContext) -> Result<Value, EngineError> {
            Ok(json!("PREPARED"))
        }
        async fn commit(
            &self,
            _ctx: &TransactionContext,
            _prepared: Value,
        ) -> Result<Value, EngineError> {
            Err(EngineError::Handler("commit refused".into()))
        }
        fn compensation(&self) -> Option<Arc<dyn CompensationHandler>> {
            Some(FnCompensation::new(|_| async {
                Err(EngineError::Handler("void also refused".into()))
            }))
        }
    }

    let result = engine
        .transactions()
        .execute_with_two_phase_commit(&ctx, engine.compensation_registry(), &BrokenCompensation)
        .await;

    assert!(matches!(result, Err(EngineError::CompensationFailure(_))));
}

#[tokio::test]
async fn idempotency_check_guards_the_side_effecting_half() {
    let (engine, execution_id) = engine_with_instance().await;

    // Before anything ran, the key is unknown.
    let key = format!("{execution_id}:capture-funds:charge");
    assert!(!engine.transactions().check_idempotency(&key).await.unwrap());

    // A prior run left its marker event; the retry sees it and skips.
    engine
        .state()
        .start_execution(execution_id)
        .await
        .unwrap();
    let ctx = TransactionContext::new(execution_id, "capture-funds", "default");
    engine
        .transactions()
        .execute_in_transaction(&ctx, || async {
            ctx.stage_event(
                EventDraft::new(EventType::NodeCompleted)
                    .with_node_id("capture-funds")
                    .with_idempotency_key(&key),
            );
            Ok(json!("done"))
        })
        .await
        .unwrap();

    assert!(engine.transactions().check_idempotency(&key).await.unwrap());
}
