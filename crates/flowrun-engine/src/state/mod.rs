//! Instance state management

mod manager;

pub use manager::{StateManager, StateManagerConfig};
