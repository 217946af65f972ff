//! Errors raised while turning a definition document into a graph

/// Error raised by the parser when a definition document is malformed.
///
/// These are shape errors: the JSON cannot be turned into a graph at all.
/// Semantic problems with a well-shaped graph (missing start event,
/// unreachable nodes, …) are reported by the validator instead, which
/// collects them into a [`crate::ValidationResult`] rather than failing
/// on the first finding.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The document is not valid JSON
    #[error("definition is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// A required top-level field is absent
    #[error("definition is missing required field `{0}`")]
    MissingField(&'static str),

    /// Neither `execution.{{nodes,edges}}` nor top-level `nodes`/`edges` present
    #[error("definition has no `execution.nodes`/`execution.edges` and no top-level `nodes`/`edges`")]
    MissingGraphSection,

    /// The `version` field is neither a number nor a numeric string
    #[error("definition field `version` is not a number: {0}")]
    InvalidVersion(String),

    /// A node is missing its `id`
    #[error("node at index {0} is missing required field `id`")]
    NodeMissingId(usize),

    /// An edge is missing a required field
    #[error("edge `{edge}` is missing required field `{field}`")]
    EdgeMissingField { edge: String, field: &'static str },

    /// Two nodes share an id
    #[error("duplicate node id `{0}`")]
    DuplicateNodeId(String),

    /// Two edges share an id
    #[error("duplicate edge id `{0}`")]
    DuplicateEdgeId(String),

    /// The `type` of a node is not a known node type
    #[error("node `{node}` has unknown type `{value}`")]
    UnknownNodeType { node: String, value: String },

    /// The `pathType` of an edge is not a known path type
    #[error("edge `{edge}` has unknown path type `{value}`")]
    UnknownPathType { edge: String, value: String },

    /// The `gatewayType` of a node is not XOR/AND/OR
    #[error("node `{node}` has unknown gateway type `{value}`")]
    UnknownGatewayType { node: String, value: String },
}
