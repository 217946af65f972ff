//! # Workflow execution engine
//!
//! A stateless, horizontally scalable core that drives graph-structured
//! workflow instances to terminal state with transactional guarantees.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowEngine                        │
//! │   (deploy / execute / resume / rollback / replay facade)    │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌──────────────────┐
//! │ WorkflowExecutor│ │RollbackCoordina-│ │   ReplayEngine   │
//! │  NodeExecutor   │ │tor+Compensation │ │ (pure event fold)│
//! └─────────────────┘ └─────────────────┘ └──────────────────┘
//!          │                    │                    │
//!          ▼                    ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            WorkflowStore (in-memory / PostgreSQL)           │
//! │  definitions · instances · node executions · events · audit │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The append-only event log is the sole source of truth: crash recovery
//! reconstructs state by folding events, node idempotency rows make
//! re-driving safe, and a lease column on the instance row keeps replicas
//! from racing. The engine holds no instance state in memory between two
//! events — a process may die at any point and another replica picks up.
//!
//! ## Example
//!
//! ```ignore
//! use flowrun_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let engine = WorkflowEngine::new(store);
//! let ctx = TenantContext::default();
//!
//! engine.deploy(&ctx, definition_json).await?;
//! let instance = engine.execute(&ctx, "order-fulfilment", variables).await?;
//! assert_eq!(instance.state, InstanceState::Completed);
//! ```

pub mod compensation;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod instance;
pub mod metrics;
pub mod persistence;
pub mod reliability;
pub mod replay;
pub mod rollback;
pub mod state;
pub mod txn;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::compensation::{
        CompensationContext, CompensationHandler, CompensationRegistry, CompensationResult,
        CompensationService, FnCompensation,
    };
    pub use crate::context::TenantContext;
    pub use crate::engine::{
        ExecutionStatus, ExecutorConfig, HandlerOutcome, HandlerRegistry, NodeContext,
        NodeHandler, NodeStateSummary, RuleEngine, ServiceCall, ServiceRegistry, StepOutcome,
        WorkflowEngine, WorkflowEngineBuilder, WorkflowExecutor,
    };
    pub use crate::error::EngineError;
    pub use crate::event::{EventDraft, EventStatus, EventType, ExecutionEvent};
    pub use crate::instance::{
        DeployedDefinition, InstanceState, NodeExecution, NodeExecutionState, WorkflowInstance,
    };
    pub use crate::metrics::EngineMetrics;
    pub use crate::persistence::{
        DefinitionStore, EventStore, InMemoryStore, InstanceStore, PostgresStore, StoreError,
        WorkflowStore,
    };
    pub use crate::replay::{ReconstructedState, ReplayEngine, ResumePoint};
    pub use crate::rollback::{
        Checkpoint, RollbackCoordinator, RollbackReason, RollbackReasonCode, RollbackResult,
    };
    pub use crate::state::{StateManager, StateManagerConfig};
    pub use crate::txn::{TransactionContext, TransactionManager, TwoPhaseOperation};
    pub use crate::worker::{ExecutionPool, ExecutionPoolConfig};
}

// Re-export key types at crate root
pub use compensation::{CompensationHandler, CompensationRegistry, CompensationService};
pub use context::TenantContext;
pub use engine::{ServiceRegistry, WorkflowEngine, WorkflowExecutor};
pub use error::EngineError;
pub use event::{EventStatus, EventType, ExecutionEvent};
pub use instance::{InstanceState, WorkflowInstance};
pub use persistence::{InMemoryStore, PostgresStore, StoreError, WorkflowStore};
pub use replay::ReplayEngine;
pub use rollback::{RollbackCoordinator, RollbackReason, RollbackResult};
pub use state::StateManager;
pub use txn::TransactionManager;
