//! Rollback orchestration: node, checkpoint and workflow level

mod coordinator;

pub use coordinator::{
    Checkpoint, RollbackCoordinator, RollbackReason, RollbackReasonCode, RollbackResult,
};
