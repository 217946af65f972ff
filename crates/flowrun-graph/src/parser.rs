//! Definition document parsing
//!
//! Turns a UTF-8 JSON definition into a normalized [`ParsedDefinition`] and
//! its derived [`WorkflowGraph`]. Two document shapes are accepted: the
//! current one with `nodes`/`edges` nested under `execution`, and the legacy
//! one with both arrays at the top level. The legacy shape is normalized
//! transparently; nothing downstream can tell them apart.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use crate::edge::{GraphEdge, PathType};
use crate::error::DefinitionError;
use crate::graph::WorkflowGraph;
use crate::node::{GatewayKind, GraphNode, Mappings, NodeConfig, NodeType, RetryPolicy};

/// A definition document after shape normalization
#[derive(Debug, Clone)]
pub struct ParsedDefinition {
    pub workflow_id: String,
    pub version: i64,
    pub name: String,
    pub description: Option<String>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,

    /// The original document, kept verbatim for storage
    pub raw: Value,
}

impl ParsedDefinition {
    /// Derive the executable graph (adjacency, start/end indices)
    pub fn build_graph(&self) -> WorkflowGraph {
        WorkflowGraph::new(self.nodes.clone(), self.edges.clone())
    }
}

/// Parse a definition from its JSON text
pub fn parse_definition(text: &str) -> Result<ParsedDefinition, DefinitionError> {
    let doc: Value = serde_json::from_str(text)?;
    parse_definition_value(&doc)
}

/// Parse a definition from an already-deserialized JSON document
pub fn parse_definition_value(doc: &Value) -> Result<ParsedDefinition, DefinitionError> {
    let workflow_id = required_str(doc, "workflowId")?;
    let name = required_str(doc, "name")?;
    let version = parse_version(doc)?;
    let description = doc
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let (raw_nodes, raw_edges) = graph_section(doc)?;

    let mut nodes = Vec::with_capacity(raw_nodes.len());
    let mut seen_nodes: HashSet<String> = HashSet::with_capacity(raw_nodes.len());
    for (index, value) in raw_nodes.iter().enumerate() {
        let node = parse_node(index, value)?;
        if !seen_nodes.insert(node.id.clone()) {
            return Err(DefinitionError::DuplicateNodeId(node.id));
        }
        nodes.push(node);
    }

    let mut edges = Vec::with_capacity(raw_edges.len());
    let mut seen_edges: HashSet<String> = HashSet::with_capacity(raw_edges.len());
    for value in raw_edges {
        let edge = parse_edge(value)?;
        if !seen_edges.insert(edge.id.clone()) {
            return Err(DefinitionError::DuplicateEdgeId(edge.id));
        }
        edges.push(edge);
    }

    Ok(ParsedDefinition {
        workflow_id,
        version,
        name,
        description,
        nodes,
        edges,
        raw: doc.clone(),
    })
}

fn required_str(doc: &Value, field: &'static str) -> Result<String, DefinitionError> {
    doc.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned)
        .ok_or(DefinitionError::MissingField(field))
}

fn parse_version(doc: &Value) -> Result<i64, DefinitionError> {
    match doc.get("version") {
        None | Some(Value::Null) => Err(DefinitionError::MissingField("version")),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| DefinitionError::InvalidVersion(n.to_string())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| DefinitionError::InvalidVersion(s.clone())),
        Some(other) => Err(DefinitionError::InvalidVersion(other.to_string())),
    }
}

/// Locate the node/edge arrays in either document shape
fn graph_section(doc: &Value) -> Result<(&Vec<Value>, &Vec<Value>), DefinitionError> {
    static EMPTY: Vec<Value> = Vec::new();

    let container = match doc.get("execution") {
        Some(execution) if execution.is_object() => execution,
        _ => doc,
    };

    let nodes = container
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or(DefinitionError::MissingGraphSection)?;
    let edges = container
        .get("edges")
        .and_then(Value::as_array)
        .unwrap_or(&EMPTY);

    Ok((nodes, edges))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    id: Option<String>,
    #[serde(rename = "type")]
    node_type: Option<String>,
    name: Option<String>,
    gateway_type: Option<String>,
    service_name: Option<String>,
    service_method: Option<String>,
    rule_file: Option<String>,
    ruleflow_group: Option<String>,
    #[serde(default)]
    terminate: bool,
    #[serde(default)]
    input_mappings: Mappings,
    #[serde(default)]
    output_mappings: Mappings,
    retry_policy: Option<RetryPolicy>,
}

fn parse_node(index: usize, value: &Value) -> Result<GraphNode, DefinitionError> {
    let raw: RawNode = serde_json::from_value(value.clone())?;

    let id = raw
        .id
        .filter(|s| !s.trim().is_empty())
        .ok_or(DefinitionError::NodeMissingId(index))?;

    let type_name = raw.node_type.unwrap_or_default();
    let node_type: NodeType = serde_json::from_value(Value::String(type_name.clone()))
        .map_err(|_| DefinitionError::UnknownNodeType {
            node: id.clone(),
            value: type_name,
        })?;

    let gateway_type = match raw.gateway_type {
        Some(s) => Some(
            serde_json::from_value::<GatewayKind>(Value::String(s.clone())).map_err(|_| {
                DefinitionError::UnknownGatewayType {
                    node: id.clone(),
                    value: s,
                }
            })?,
        ),
        None => None,
    };

    let config = match node_type {
        NodeType::EndEvent => NodeConfig::End {
            terminate: raw.terminate,
        },
        NodeType::ServiceTask => NodeConfig::Service {
            service_name: raw.service_name,
            service_method: raw.service_method,
            input_mappings: raw.input_mappings,
            output_mappings: raw.output_mappings,
            retry_policy: raw.retry_policy,
        },
        NodeType::BusinessRuleTask => NodeConfig::Rule {
            rule_file: raw.rule_file,
            ruleflow_group: raw.ruleflow_group,
            input_mappings: raw.input_mappings,
            output_mappings: raw.output_mappings,
        },
        t if t.is_gateway() => NodeConfig::Gateway { gateway_type },
        _ => NodeConfig::None,
    };

    let name = raw.name.unwrap_or_else(|| id.clone());

    Ok(GraphNode {
        id,
        name,
        node_type,
        config,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEdge {
    id: Option<String>,
    source: Option<String>,
    target: Option<String>,
    path_type: Option<String>,
    condition: Option<String>,
    priority: Option<i32>,
    name: Option<String>,
}

fn parse_edge(value: &Value) -> Result<GraphEdge, DefinitionError> {
    let raw: RawEdge = serde_json::from_value(value.clone())?;

    let id = raw
        .id
        .filter(|s| !s.trim().is_empty())
        .ok_or(DefinitionError::EdgeMissingField {
            edge: "<unnamed>".into(),
            field: "id",
        })?;

    let source = raw.source.ok_or_else(|| DefinitionError::EdgeMissingField {
        edge: id.clone(),
        field: "source",
    })?;
    let target = raw.target.ok_or_else(|| DefinitionError::EdgeMissingField {
        edge: id.clone(),
        field: "target",
    })?;

    let path_type = match raw.path_type {
        Some(s) => serde_json::from_value::<PathType>(Value::String(s.clone())).map_err(|_| {
            DefinitionError::UnknownPathType {
                edge: id.clone(),
                value: s,
            }
        })?,
        None => PathType::default(),
    };

    Ok(GraphEdge {
        id,
        source,
        target,
        path_type,
        condition: raw.condition,
        priority: raw.priority.unwrap_or(0),
        name: raw.name,
    })
}
