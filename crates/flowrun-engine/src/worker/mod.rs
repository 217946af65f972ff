//! Background execution pool

mod pool;

pub use pool::{ExecutionPool, ExecutionPoolConfig};
