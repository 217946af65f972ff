//! The executable directed graph derived from a definition document
//!
//! A `WorkflowGraph` is a pure index: nodes by id, plus forward and reverse
//! adjacency with a stable edge order. It is derived from the raw JSON,
//! cacheable, and regenerable — nothing in here is persisted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::edge::GraphEdge;
use crate::node::{GraphNode, NodeType};

/// In/out shape of a gateway, derived from its degree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayDirection {
    /// 1 in, N out: splits flow
    Diverging,

    /// N in, 1 out: joins flow
    Converging,

    /// N in, M out: tolerated, but the validator flags it
    Mixed,
}

/// Directed graph of [`GraphNode`]s keyed by node id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<String, GraphEdge>,

    /// node id → outgoing edge ids, ascending (priority, edge id)
    outgoing: HashMap<String, Vec<String>>,

    /// node id → incoming edge ids, same order
    incoming: HashMap<String, Vec<String>>,

    start_event: Option<String>,
    end_events: Vec<String>,
}

impl WorkflowGraph {
    /// Build the graph and its adjacency indices.
    ///
    /// Accepts structurally dubious input (no start event, dangling edge
    /// endpoints): those are the validator's findings, not construction
    /// failures. Dangling endpoints simply get no adjacency entry.
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        let mut node_index: HashMap<String, GraphNode> = HashMap::with_capacity(nodes.len());
        let mut start_event = None;
        let mut end_events = Vec::new();

        for node in nodes {
            match node.node_type {
                NodeType::StartEvent if start_event.is_none() => {
                    start_event = Some(node.id.clone());
                }
                NodeType::EndEvent => end_events.push(node.id.clone()),
                _ => {}
            }
            node_index.insert(node.id.clone(), node);
        }
        end_events.sort();

        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        let mut edge_index: HashMap<String, GraphEdge> = HashMap::with_capacity(edges.len());

        let mut sorted = edges;
        sorted.sort_by(|a, b| a.selection_key().cmp(&b.selection_key()));

        for edge in sorted {
            if node_index.contains_key(&edge.source) {
                outgoing
                    .entry(edge.source.clone())
                    .or_default()
                    .push(edge.id.clone());
            }
            if node_index.contains_key(&edge.target) {
                incoming
                    .entry(edge.target.clone())
                    .or_default()
                    .push(edge.id.clone());
            }
            edge_index.insert(edge.id.clone(), edge);
        }

        Self {
            nodes: node_index,
            edges: edge_index,
            outgoing,
            incoming,
            start_event,
            end_events,
        }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&GraphEdge> {
        self.edges.get(id)
    }

    /// Outgoing edges in selection order (ascending priority, ties on id)
    pub fn outgoing(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.outgoing
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.edges.get(id)).collect())
            .unwrap_or_default()
    }

    /// Incoming edges in the same stable order
    pub fn incoming(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.incoming
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.edges.get(id)).collect())
            .unwrap_or_default()
    }

    /// The unique start event, when the definition has exactly one
    pub fn start_event(&self) -> Option<&GraphNode> {
        self.start_event.as_deref().and_then(|id| self.nodes.get(id))
    }

    /// All end events, sorted by id
    pub fn end_events(&self) -> Vec<&GraphNode> {
        self.end_events
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Degree-derived direction of a gateway node
    pub fn gateway_direction(&self, node_id: &str) -> GatewayDirection {
        let ins = self.incoming.get(node_id).map_or(0, Vec::len);
        let outs = self.outgoing.get(node_id).map_or(0, Vec::len);
        if ins <= 1 && outs > 1 {
            GatewayDirection::Diverging
        } else if ins > 1 && outs <= 1 {
            GatewayDirection::Converging
        } else {
            GatewayDirection::Mixed
        }
    }
}
