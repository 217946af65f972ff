//! Two-phase commit as a Saga
//!
//! Phase 1 (prepare) runs inside an ordinary transactional boundary and
//! registers the operation's compensation, if any. Phase 2 (commit) runs
//! outside that boundary — which is exactly why compensation is the only
//! recovery when it fails. The commit step must therefore be designed to
//! become externally visible only once compensation is known to succeed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{instrument, warn};

use super::manager::{TransactionContext, TransactionManager};
use crate::compensation::{CompensationContext, CompensationHandler, CompensationRegistry};
use crate::error::EngineError;

/// A prepare/commit pair with an optional compensation
#[async_trait]
pub trait TwoPhaseOperation: Send + Sync {
    /// Phase 1: runs inside the prepare transaction; its value is handed
    /// to `commit`
    async fn prepare(&self, ctx: &TransactionContext) -> Result<Value, EngineError>;

    /// Phase 2: runs outside the prepare transaction
    async fn commit(&self, ctx: &TransactionContext, prepared: Value)
        -> Result<Value, EngineError>;

    /// The inverse of the prepared side effect; registered during prepare
    fn compensation(&self) -> Option<Arc<dyn CompensationHandler>> {
        None
    }
}

impl TransactionManager {
    /// Run a two-phase operation.
    ///
    /// Commit failure triggers the compensation registered during prepare:
    /// if compensation succeeds the caller sees a `TransactionFailure`
    /// describing the compensated commit; if compensation fails too, the
    /// non-recoverable [`EngineError::CompensationFailure`] escalates.
    #[instrument(skip_all, fields(transaction_id = %ctx.transaction_id))]
    pub async fn execute_with_two_phase_commit(
        &self,
        ctx: &TransactionContext,
        registry: &CompensationRegistry,
        op: &dyn TwoPhaseOperation,
    ) -> Result<Value, EngineError> {
        let prepared = self
            .execute_in_transaction(ctx, || op.prepare(ctx))
            .await?;

        if let Some(handler) = op.compensation() {
            registry.register_for_node(ctx.execution_id, &ctx.node_id, handler);
        }

        match op.commit(ctx, prepared.clone()).await {
            Ok(value) => Ok(value),
            Err(commit_err) => {
                warn!(%commit_err, "commit phase failed, invoking compensation");

                let Some(handler) = registry.resolve(ctx.execution_id, &ctx.node_id, None)
                else {
                    return Err(EngineError::TransactionFailure(format!(
                        "commit failed with no compensation registered: {commit_err}"
                    )));
                };

                let compensation_ctx = CompensationContext {
                    execution_id: ctx.execution_id,
                    node_id: ctx.node_id.clone(),
                    node_type: None,
                    original_output: Some(prepared.to_string()),
                };

                match handler.compensate(&compensation_ctx).await {
                    Ok(()) => Err(EngineError::TransactionFailure(format!(
                        "commit failed and was compensated: {commit_err}"
                    ))),
                    Err(comp_err) => Err(EngineError::CompensationFailure(format!(
                        "commit failed ({commit_err}) and compensation failed ({comp_err})"
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::FnCompensation;
    use crate::persistence::{InMemoryStore, InstanceStore};
    use crate::instance::WorkflowInstance;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct PaymentCapture {
        fail_commit: bool,
        fail_compensation: bool,
        compensations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TwoPhaseOperation for PaymentCapture {
        async fn prepare(&self, _ctx: &TransactionContext) -> Result<Value, EngineError> {
            Ok(json!("PREPARED"))
        }

        async fn commit(
            &self,
            _ctx: &TransactionContext,
            prepared: Value,
        ) -> Result<Value, EngineError> {
            assert_eq!(prepared, json!("PREPARED"));
            if self.fail_commit {
                Err(EngineError::Handler("gateway timeout".into()))
            } else {
                Ok(json!("CAPTURED"))
            }
        }

        fn compensation(&self) -> Option<Arc<dyn CompensationHandler>> {
            let counter = self.compensations.clone();
            let fail = self.fail_compensation;
            Some(FnCompensation::new(move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(EngineError::Handler("void refused".into()))
                    } else {
                        Ok(())
                    }
                }
            }))
        }
    }

    async fn fixture() -> (TransactionManager, CompensationRegistry, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let execution_id = Uuid::now_v7();
        store
            .insert_instance(WorkflowInstance::new(
                execution_id,
                "wf",
                1,
                "default",
                flowrun_graph::Variables::new(),
            ))
            .await
            .unwrap();
        (
            TransactionManager::new(store),
            CompensationRegistry::new(),
            execution_id,
        )
    }

    #[tokio::test]
    async fn test_commit_success() {
        let (manager, registry, execution_id) = fixture().await;
        let ctx = TransactionContext::new(execution_id, "capture", "default");
        let op = PaymentCapture {
            fail_commit: false,
            fail_compensation: false,
            compensations: Arc::new(AtomicUsize::new(0)),
        };

        let value = manager
            .execute_with_two_phase_commit(&ctx, &registry, &op)
            .await
            .unwrap();
        assert_eq!(value, json!("CAPTURED"));
        assert_eq!(op.compensations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_compensates_exactly_once() {
        let (manager, registry, execution_id) = fixture().await;
        let ctx = TransactionContext::new(execution_id, "capture", "default");
        let op = PaymentCapture {
            fail_commit: true,
            fail_compensation: false,
            compensations: Arc::new(AtomicUsize::new(0)),
        };

        let result = manager
            .execute_with_two_phase_commit(&ctx, &registry, &op)
            .await;

        assert!(
            matches!(result, Err(EngineError::TransactionFailure(ref msg)) if msg.contains("compensated")),
            "{result:?}"
        );
        assert_eq!(op.compensations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compensation_failure_escalates() {
        let (manager, registry, execution_id) = fixture().await;
        let ctx = TransactionContext::new(execution_id, "capture", "default");
        let op = PaymentCapture {
            fail_commit: true,
            fail_compensation: true,
            compensations: Arc::new(AtomicUsize::new(0)),
        };

        let result = manager
            .execute_with_two_phase_commit(&ctx, &registry, &op)
            .await;
        assert!(matches!(result, Err(EngineError::CompensationFailure(_))));
    }

    #[tokio::test]
    async fn test_prepare_failure_skips_commit_and_compensation() {
        let (manager, registry, execution_id) = fixture().await;
        let ctx = TransactionContext::new(execution_id, "capture", "default");

        struct FailingPrepare;
        #[async_trait]
        impl TwoPhaseOperation for FailingPrepare {
            async fn prepare(&self, _ctx: &TransactionContext) -> Result<Value, EngineError> {
                Err(EngineError::Handler("prepare exploded".into()))
            }
            async fn commit(
                &self,
                _ctx: &TransactionContext,
                _prepared: Value,
            ) -> Result<Value, EngineError> {
                panic!("commit must not run");
            }
        }

        let result = manager
            .execute_with_two_phase_commit(&ctx, &registry, &FailingPrepare)
            .await;
        assert!(matches!(result, Err(EngineError::TransactionFailure(_))));
        assert!(registry.resolve(execution_id, "capture", None).is_none());
    }

    #[tokio::test]
    async fn test_commit_failure_without_compensation() {
        let (manager, registry, execution_id) = fixture().await;
        let ctx = TransactionContext::new(execution_id, "capture", "default");

        struct NoCompensation;
        #[async_trait]
        impl TwoPhaseOperation for NoCompensation {
            async fn prepare(&self, _ctx: &TransactionContext) -> Result<Value, EngineError> {
                Ok(json!("PREPARED"))
            }
            async fn commit(
                &self,
                _ctx: &TransactionContext,
                _prepared: Value,
            ) -> Result<Value, EngineError> {
                Err(EngineError::Handler("boom".into()))
            }
        }

        let result = manager
            .execute_with_two_phase_commit(&ctx, &registry, &NoCompensation)
            .await;
        assert!(
            matches!(result, Err(EngineError::TransactionFailure(ref msg)) if msg.contains("no compensation")),
            "{result:?}"
        );
    }
}
