//! # Workflow graph model
//!
//! The definition side of the engine: parse a JSON definition document into
//! an executable directed graph, validate it, and evaluate edge conditions.
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌───────────────┐
//! │  JSON (v1/v2)│ ──► │ ParsedDefinition ──► │ WorkflowGraph │
//! └──────────────┘     └───────────────┘     └───────────────┘
//!                             │                      │
//!                             ▼                      ▼
//!                        validate()            outgoing()/incoming()
//! ```
//!
//! Everything here is pure and synchronous; persistence and execution live
//! in `flowrun-engine`.

pub mod condition;
pub mod edge;
pub mod error;
pub mod graph;
pub mod node;
pub mod parser;
pub mod validator;

pub use condition::{evaluate, Variables};
pub use edge::{GraphEdge, PathType};
pub use error::DefinitionError;
pub use graph::{GatewayDirection, WorkflowGraph};
pub use node::{
    BackoffStrategy, GatewayKind, GraphNode, Mappings, NodeConfig, NodeType, RetryPolicy,
};
pub use parser::{parse_definition, parse_definition_value, ParsedDefinition};
pub use validator::{validate, Severity, ValidationCode, ValidationIssue, ValidationResult};
