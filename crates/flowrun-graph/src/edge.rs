//! Graph edges and their ordering

use serde::{Deserialize, Serialize};

/// Classification of an edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    /// Normal forward path
    #[default]
    Success,

    /// Taken when the source node failed (reserved for error boundaries)
    Error,

    /// Guarded by a condition expression
    Conditional,

    /// One branch of a parallel fan-out
    Parallel,

    /// Fallback branch when no condition matches
    Default,
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Unique within the definition
    pub id: String,

    /// Source node id
    pub source: String,

    /// Target node id
    pub target: String,

    #[serde(default)]
    pub path_type: PathType,

    /// Boolean expression over the variable map; absent means unconditional
    pub condition: Option<String>,

    /// Lower priority is tried first; ties break on edge id
    #[serde(default)]
    pub priority: i32,

    /// Optional human-readable label
    pub name: Option<String>,
}

impl GraphEdge {
    /// An edge is a default branch if it is marked `default` or carries no
    /// condition at all
    pub fn is_unconditional(&self) -> bool {
        self.path_type == PathType::Default
            || self
                .condition
                .as_deref()
                .map(|c| c.trim().is_empty())
                .unwrap_or(true)
    }

    /// Ordering key for edge selection: ascending priority, ties on id
    pub fn selection_key(&self) -> (i32, &str) {
        (self.priority, self.id.as_str())
    }
}
