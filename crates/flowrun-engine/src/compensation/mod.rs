//! Compensation: user-supplied inverses of completed node side effects

mod registry;
mod service;

pub use registry::{
    binding_key, CompensationContext, CompensationHandler, CompensationRegistry, FnCompensation,
};
pub use service::{CompensationResult, CompensationService};

pub(crate) use service::is_control_node_key;
