//! Reliability primitives

mod retry;

pub use retry::{delay_for_attempt, run_with_retry};
