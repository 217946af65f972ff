//! Event-log replay: pure state reconstruction

mod engine;

pub use engine::{ReconstructedState, ReplayEngine, ResumePoint};
