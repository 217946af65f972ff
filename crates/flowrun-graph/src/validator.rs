//! Structural and semantic validation of a workflow graph
//!
//! Run at deploy time, before a definition is persisted. Findings come in
//! two severities: errors make a definition undeployable, warnings do not.
//! The validator never fails fast — a single pass reports everything.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::graph::{GatewayDirection, WorkflowGraph};
use crate::node::{GatewayKind, NodeConfig, NodeType};

/// Identifies a validation rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    StartEventMissing,
    StartEventHasIncoming,
    StartEventNoOutgoing,
    EndEventMissing,
    EndEventHasOutgoing,
    EndEventNoIncoming,
    EdgeTargetNotFound,
    SelfLoop,
    GatewayTypeMissing,
    GatewayMixed,
    GatewayMultipleDefault,
    GatewayNoDefault,
    NodeUnreachable,
    NoReachableEndEvent,
    NonGatewayMultipleOutgoing,
    ServiceTaskNoName,
    RuleTaskNoFile,
    RuleTaskNoGroup,
}

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A single validator finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub severity: Severity,

    /// Node the finding is anchored to, when there is one
    pub node_id: Option<String>,

    /// Edge the finding is anchored to, when there is one
    pub edge_id: Option<String>,

    pub message: String,
}

/// Everything the validator found, split by severity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// A definition is deployable iff there are no errors
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_code(&self, code: ValidationCode) -> bool {
        self.errors.iter().chain(&self.warnings).any(|i| i.code == code)
    }

    fn error(&mut self, code: ValidationCode, node: Option<&str>, edge: Option<&str>, message: String) {
        self.errors.push(ValidationIssue {
            code,
            severity: Severity::Error,
            node_id: node.map(Into::into),
            edge_id: edge.map(Into::into),
            message,
        });
    }

    fn warning(&mut self, code: ValidationCode, node: Option<&str>, edge: Option<&str>, message: String) {
        self.warnings.push(ValidationIssue {
            code,
            severity: Severity::Warning,
            node_id: node.map(Into::into),
            edge_id: edge.map(Into::into),
            message,
        });
    }
}

/// Validate a graph against the full rule set
pub fn validate(graph: &WorkflowGraph) -> ValidationResult {
    let mut result = ValidationResult::default();

    check_start_events(graph, &mut result);
    check_end_events(graph, &mut result);
    check_edges(graph, &mut result);
    check_gateways(graph, &mut result);
    check_reachability(graph, &mut result);
    check_task_bindings(graph, &mut result);

    result
}

fn check_start_events(graph: &WorkflowGraph, result: &mut ValidationResult) {
    let starts: Vec<_> = graph
        .nodes()
        .filter(|n| n.node_type == NodeType::StartEvent)
        .collect();

    match starts.len() {
        0 => result.error(
            ValidationCode::StartEventMissing,
            None,
            None,
            "workflow has no START_EVENT".into(),
        ),
        1 => {}
        n => result.error(
            ValidationCode::StartEventMissing,
            None,
            None,
            format!("workflow must have exactly one START_EVENT, found {n}"),
        ),
    }

    for start in starts {
        if !graph.incoming(&start.id).is_empty() {
            result.error(
                ValidationCode::StartEventHasIncoming,
                Some(&start.id),
                None,
                format!("start event `{}` has incoming edges", start.id),
            );
        }
        if graph.outgoing(&start.id).is_empty() {
            result.error(
                ValidationCode::StartEventNoOutgoing,
                Some(&start.id),
                None,
                format!("start event `{}` has no outgoing edge", start.id),
            );
        }
    }
}

fn check_end_events(graph: &WorkflowGraph, result: &mut ValidationResult) {
    let ends = graph.end_events();
    if ends.is_empty() {
        result.error(
            ValidationCode::EndEventMissing,
            None,
            None,
            "workflow has no END_EVENT".into(),
        );
    }

    for end in ends {
        if !graph.outgoing(&end.id).is_empty() {
            result.error(
                ValidationCode::EndEventHasOutgoing,
                Some(&end.id),
                None,
                format!("end event `{}` has outgoing edges", end.id),
            );
        }
        if graph.incoming(&end.id).is_empty() {
            result.warning(
                ValidationCode::EndEventNoIncoming,
                Some(&end.id),
                None,
                format!("end event `{}` has no incoming edge", end.id),
            );
        }
    }
}

fn check_edges(graph: &WorkflowGraph, result: &mut ValidationResult) {
    for edge in graph.edges() {
        for endpoint in [&edge.source, &edge.target] {
            if graph.node(endpoint).is_none() {
                result.error(
                    ValidationCode::EdgeTargetNotFound,
                    None,
                    Some(&edge.id),
                    format!("edge `{}` references missing node `{endpoint}`", edge.id),
                );
            }
        }
        if edge.source == edge.target {
            result.error(
                ValidationCode::SelfLoop,
                Some(&edge.source),
                Some(&edge.id),
                format!("edge `{}` loops node `{}` onto itself", edge.id, edge.source),
            );
        }
    }
}

fn check_gateways(graph: &WorkflowGraph, result: &mut ValidationResult) {
    for node in graph.nodes() {
        if !node.node_type.is_gateway() {
            if graph.outgoing(&node.id).len() > 1 {
                result.warning(
                    ValidationCode::NonGatewayMultipleOutgoing,
                    Some(&node.id),
                    None,
                    format!(
                        "node `{}` is not a gateway but has multiple outgoing edges; only the first will be taken",
                        node.id
                    ),
                );
            }
            continue;
        }

        let kind = node.gateway_kind();
        if kind.is_none() {
            result.error(
                ValidationCode::GatewayTypeMissing,
                Some(&node.id),
                None,
                format!("gateway `{}` has no gateway type", node.id),
            );
        }

        let direction = graph.gateway_direction(&node.id);
        if direction == GatewayDirection::Mixed {
            result.warning(
                ValidationCode::GatewayMixed,
                Some(&node.id),
                None,
                format!("gateway `{}` is neither purely diverging nor converging", node.id),
            );
        }

        // Default-branch rules only apply to diverging XOR/OR gateways.
        if direction == GatewayDirection::Diverging
            && matches!(kind, Some(GatewayKind::Xor) | Some(GatewayKind::Or))
        {
            let unconditional = graph
                .outgoing(&node.id)
                .iter()
                .filter(|e| e.is_unconditional())
                .count();

            if unconditional > 1 {
                result.error(
                    ValidationCode::GatewayMultipleDefault,
                    Some(&node.id),
                    None,
                    format!(
                        "gateway `{}` has {unconditional} unconditional branches, at most one is allowed",
                        node.id
                    ),
                );
            } else if unconditional == 0 {
                result.warning(
                    ValidationCode::GatewayNoDefault,
                    Some(&node.id),
                    None,
                    format!("gateway `{}` has no default branch", node.id),
                );
            }
        }
    }
}

fn check_reachability(graph: &WorkflowGraph, result: &mut ValidationResult) {
    let Some(start) = graph.start_event() else {
        // Already reported by check_start_events.
        return;
    };

    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    reachable.insert(start.id.as_str());
    queue.push_back(start.id.as_str());

    while let Some(current) = queue.pop_front() {
        for edge in graph.outgoing(current) {
            if graph.node(&edge.target).is_some() && reachable.insert(edge.target.as_str()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }

    for node in graph.nodes() {
        if !reachable.contains(node.id.as_str()) {
            result.warning(
                ValidationCode::NodeUnreachable,
                Some(&node.id),
                None,
                format!("node `{}` is unreachable from the start event", node.id),
            );
        }
    }

    let end_reachable = graph
        .end_events()
        .iter()
        .any(|end| reachable.contains(end.id.as_str()));
    if !end_reachable && !graph.end_events().is_empty() {
        result.error(
            ValidationCode::NoReachableEndEvent,
            None,
            None,
            "no END_EVENT is reachable from the start event".into(),
        );
    }
}

fn check_task_bindings(graph: &WorkflowGraph, result: &mut ValidationResult) {
    for node in graph.nodes() {
        match (&node.node_type, &node.config) {
            (NodeType::ServiceTask, NodeConfig::Service { service_name, .. }) => {
                if service_name.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    result.error(
                        ValidationCode::ServiceTaskNoName,
                        Some(&node.id),
                        None,
                        format!("service task `{}` has no service name", node.id),
                    );
                }
            }
            (NodeType::BusinessRuleTask, NodeConfig::Rule { rule_file, ruleflow_group, .. }) => {
                if rule_file.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    result.error(
                        ValidationCode::RuleTaskNoFile,
                        Some(&node.id),
                        None,
                        format!("business rule task `{}` has no rule file", node.id),
                    );
                }
                if ruleflow_group.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    result.error(
                        ValidationCode::RuleTaskNoGroup,
                        Some(&node.id),
                        None,
                        format!("business rule task `{}` has no ruleflow group", node.id),
                    );
                }
            }
            _ => {}
        }
    }
}
