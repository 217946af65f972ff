//! The transaction manager
//!
//! Wraps an operation in a transactional boundary: a deadline, a pre-commit
//! validator, a staged-event buffer that commits all-or-nothing, and
//! TRANSACTION_STARTED / COMMITTED / ROLLED_BACK bookkeeping events. An
//! in-memory map of active transactions supports monitoring and
//! force-rollback.
//!
//! Two entry points share the machinery: [`TransactionManager::execute_in_transaction`]
//! is the full contract with bookkeeping events; the node executor
//! dispatches handlers through a context built with
//! [`TransactionContext::internal`], which suppresses the bookkeeping rows
//! so the per-node event sequence stays exactly the documented one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::{EventDraft, EventType};
use crate::persistence::WorkflowStore;

/// Default per-transaction deadline
pub const DEFAULT_TXN_TIMEOUT: Duration = Duration::from_secs(30);

/// Isolation level requested from the storage layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
    ReadCommitted,
}

/// Validator run before the operation; a failure aborts the transaction
pub type PreCommitValidator =
    Arc<dyn Fn(&TransactionContext) -> Result<(), String> + Send + Sync>;

/// Context of one transactional operation
pub struct TransactionContext {
    /// `txn-{execution_id}-{node_id}-{nanos}`
    pub transaction_id: String,

    pub execution_id: Uuid,
    pub node_id: String,
    pub tenant_id: String,

    pub isolation: IsolationLevel,
    pub timeout: Duration,

    /// Abort when the operation produces a JSON null
    pub null_result_forbidden: bool,

    /// Whether TRANSACTION_* bookkeeping events are appended
    record_events: bool,

    pre_commit_validator: Option<PreCommitValidator>,

    /// Events staged by the operation; flushed on commit, discarded on
    /// rollback
    staged: Mutex<Vec<EventDraft>>,
}

impl TransactionContext {
    pub fn new(
        execution_id: Uuid,
        node_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        let node_id = node_id.into();
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            transaction_id: format!("txn-{execution_id}-{node_id}-{nanos}"),
            execution_id,
            node_id,
            tenant_id: tenant_id.into(),
            isolation: IsolationLevel::default(),
            timeout: DEFAULT_TXN_TIMEOUT,
            null_result_forbidden: false,
            record_events: true,
            pre_commit_validator: None,
            staged: Mutex::new(Vec::new()),
        }
    }

    /// A context for engine-internal boundaries: same deadline, validator
    /// and rollback machinery, no TRANSACTION_* event rows
    pub fn internal(
        execution_id: Uuid,
        node_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        let mut ctx = Self::new(execution_id, node_id, tenant_id);
        ctx.record_events = false;
        ctx
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn forbid_null_result(mut self) -> Self {
        self.null_result_forbidden = true;
        self
    }

    pub fn with_pre_commit_validator(mut self, validator: PreCommitValidator) -> Self {
        self.pre_commit_validator = Some(validator);
        self
    }

    /// Stage an event to be appended iff the transaction commits
    pub fn stage_event(&self, draft: EventDraft) {
        self.staged.lock().push(draft);
    }

    pub fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }

    fn take_staged(&self) -> Vec<EventDraft> {
        std::mem::take(&mut *self.staged.lock())
    }

    fn discard_staged(&self) {
        self.staged.lock().clear();
    }
}

/// Snapshot of an in-flight transaction, for monitoring
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    pub transaction_id: String,
    pub execution_id: Uuid,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub marked_for_rollback: bool,
}

/// Wraps operations in transactional boundaries
pub struct TransactionManager {
    store: Arc<dyn WorkflowStore>,
    active: DashMap<String, ActiveTransaction>,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            active: DashMap::new(),
        }
    }

    /// Execute `op` in a transactional boundary with bookkeeping events.
    ///
    /// 1. append TRANSACTION_STARTED (unless the context is internal)
    /// 2. register in the active map
    /// 3. run the pre-commit validator
    /// 4. run `op` under the context deadline
    /// 5. flush staged events + append TRANSACTION_COMMITTED, or discard
    ///    staged events + append TRANSACTION_ROLLED_BACK and rethrow as a
    ///    transaction failure
    /// 6. remove from the active map
    #[instrument(skip(self, ctx, op), fields(transaction_id = %ctx.transaction_id))]
    pub async fn execute_in_transaction<F, Fut>(
        &self,
        ctx: &TransactionContext,
        op: F,
    ) -> Result<Value, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, EngineError>>,
    {
        if ctx.record_events {
            self.store
                .append(
                    ctx.execution_id,
                    &ctx.tenant_id,
                    EventDraft::new(EventType::TransactionStarted)
                        .with_node_id(&ctx.node_id)
                        .with_transaction_id(&ctx.transaction_id),
                )
                .await?;
        }

        let outcome = self.run_scoped(ctx, op).await;

        let outcome = match outcome {
            Ok(value) if ctx.null_result_forbidden && value.is_null() => Err(
                EngineError::TransactionValidation("operation produced a null result".into()),
            ),
            other => other,
        };

        match outcome {
            Ok(value) => {
                for draft in ctx.take_staged() {
                    self.store
                        .append(ctx.execution_id, &ctx.tenant_id, draft)
                        .await?;
                }
                if ctx.record_events {
                    self.store
                        .append(
                            ctx.execution_id,
                            &ctx.tenant_id,
                            EventDraft::new(EventType::TransactionCommitted)
                                .with_node_id(&ctx.node_id)
                                .with_transaction_id(&ctx.transaction_id),
                        )
                        .await?;
                }
                debug!("transaction committed");
                Ok(value)
            }
            Err(err) => {
                ctx.discard_staged();
                if ctx.record_events {
                    self.store
                        .append(
                            ctx.execution_id,
                            &ctx.tenant_id,
                            EventDraft::new(EventType::TransactionRolledBack)
                                .with_node_id(&ctx.node_id)
                                .with_transaction_id(&ctx.transaction_id)
                                .with_error(err.to_string()),
                        )
                        .await?;
                }
                warn!(%err, "transaction rolled back");
                Err(wrap_failure(err))
            }
        }
    }

    /// The shared boundary: deadline, validator, active-map registration
    /// and force-rollback checks, without event bookkeeping. The node
    /// executor dispatches handlers through this.
    pub(crate) async fn run_scoped<T, F, Fut>(
        &self,
        ctx: &TransactionContext,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.active.insert(
            ctx.transaction_id.clone(),
            ActiveTransaction {
                transaction_id: ctx.transaction_id.clone(),
                execution_id: ctx.execution_id,
                node_id: ctx.node_id.clone(),
                started_at: Utc::now(),
                marked_for_rollback: false,
            },
        );

        let result = self.run_guarded(ctx, op).await;

        self.active.remove(&ctx.transaction_id);
        result
    }

    async fn run_guarded<T, F, Fut>(
        &self,
        ctx: &TransactionContext,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        if let Some(validator) = &ctx.pre_commit_validator {
            validator(ctx).map_err(EngineError::TransactionValidation)?;
        }

        let value = tokio::time::timeout(ctx.timeout, op())
            .await
            .map_err(|_| {
                EngineError::TransactionFailure(format!(
                    "transaction {} exceeded its {}s deadline",
                    ctx.transaction_id,
                    ctx.timeout.as_secs()
                ))
            })??;

        // Commit check: an operator may have marked this transaction while
        // the operation ran.
        let marked = self
            .active
            .get(&ctx.transaction_id)
            .map(|t| t.marked_for_rollback)
            .unwrap_or(false);
        if marked {
            return Err(EngineError::TransactionRollback(format!(
                "transaction {} was force-rolled-back",
                ctx.transaction_id
            )));
        }

        Ok(value)
    }

    /// Delegates to the event store; callers check before the
    /// side-effecting part of an operation to suppress retries
    pub async fn check_idempotency(&self, key: &str) -> Result<bool, EngineError> {
        Ok(self.store.exists_by_idempotency_key(key).await?)
    }

    /// Snapshot of in-flight transactions
    pub fn active_transactions(&self) -> Vec<ActiveTransaction> {
        let mut list: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Mark an in-flight transaction for rollback at its commit check.
    /// Returns false when the transaction is not (or no longer) active.
    pub fn force_rollback(&self, transaction_id: &str) -> bool {
        match self.active.get_mut(transaction_id) {
            Some(mut entry) => {
                entry.marked_for_rollback = true;
                true
            }
            None => false,
        }
    }
}

/// Validation and forced-rollback outcomes keep their kind; anything else
/// becomes a transaction failure
fn wrap_failure(err: EngineError) -> EngineError {
    match err {
        e @ EngineError::TransactionValidation(_) => e,
        e @ EngineError::TransactionRollback(_) => e,
        e @ EngineError::TransactionFailure(_) => e,
        other => EngineError::TransactionFailure(other.to_string()),
    }
}
