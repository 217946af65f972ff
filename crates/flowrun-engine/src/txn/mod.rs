//! Transactional execution: per-node boundaries and two-phase commit

mod manager;
mod two_phase;

pub use manager::{
    ActiveTransaction, IsolationLevel, TransactionContext, TransactionManager,
    DEFAULT_TXN_TIMEOUT,
};
pub use two_phase::TwoPhaseOperation;
