//! Execution: handlers, node/workflow executors and the engine facade

pub mod handlers;
mod node_executor;
mod service;
pub mod services;
mod workflow_executor;

pub use handlers::{HandlerOutcome, HandlerRegistry, NodeContext, NodeHandler};
pub use node_executor::{NodeExecutor, StepOutcome};
pub use service::{
    ExecutionStatus, NodeStateSummary, WorkflowEngine, WorkflowEngineBuilder,
};
pub use services::{PassthroughRuleEngine, RuleEngine, ServiceCall, ServiceRegistry};
pub use workflow_executor::{ExecutorConfig, WorkflowExecutor};
