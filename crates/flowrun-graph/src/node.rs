//! Graph nodes: the typed node set and per-type configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The node type tag.
///
/// This is the dispatch key for the whole engine: handlers are selected by
/// this tag and never by inspecting configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    StartEvent,
    EndEvent,
    IntermediateEvent,
    Task,
    ScriptTask,
    ServiceTask,
    UserTask,
    BusinessRuleTask,
    ManualTask,
    Subprocess,
    CallActivity,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
}

impl NodeType {
    /// All variants, in declaration order (dispatch tables iterate this).
    pub const ALL: [NodeType; 15] = [
        NodeType::StartEvent,
        NodeType::EndEvent,
        NodeType::IntermediateEvent,
        NodeType::Task,
        NodeType::ScriptTask,
        NodeType::ServiceTask,
        NodeType::UserTask,
        NodeType::BusinessRuleTask,
        NodeType::ManualTask,
        NodeType::Subprocess,
        NodeType::CallActivity,
        NodeType::ExclusiveGateway,
        NodeType::ParallelGateway,
        NodeType::InclusiveGateway,
        NodeType::EventBasedGateway,
    ];

    /// Whether this node is one of the gateway types
    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            NodeType::ExclusiveGateway
                | NodeType::ParallelGateway
                | NodeType::InclusiveGateway
                | NodeType::EventBasedGateway
        )
    }

    /// The wire name, e.g. `SERVICE_TASK`
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::StartEvent => "START_EVENT",
            NodeType::EndEvent => "END_EVENT",
            NodeType::IntermediateEvent => "INTERMEDIATE_EVENT",
            NodeType::Task => "TASK",
            NodeType::ScriptTask => "SCRIPT_TASK",
            NodeType::ServiceTask => "SERVICE_TASK",
            NodeType::UserTask => "USER_TASK",
            NodeType::BusinessRuleTask => "BUSINESS_RULE_TASK",
            NodeType::ManualTask => "MANUAL_TASK",
            NodeType::Subprocess => "SUBPROCESS",
            NodeType::CallActivity => "CALL_ACTIVITY",
            NodeType::ExclusiveGateway => "EXCLUSIVE_GATEWAY",
            NodeType::ParallelGateway => "PARALLEL_GATEWAY",
            NodeType::InclusiveGateway => "INCLUSIVE_GATEWAY",
            NodeType::EventBasedGateway => "EVENT_BASED_GATEWAY",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway branching semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayKind {
    /// Exclusive: exactly one outgoing branch is taken
    #[serde(rename = "XOR")]
    Xor,

    /// Parallel: every outgoing branch is taken
    #[serde(rename = "AND")]
    And,

    /// Inclusive: every branch whose condition holds is taken
    #[serde(rename = "OR")]
    Or,
}

/// Backoff strategy for service-task retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffStrategy {
    /// Constant delay between attempts
    #[default]
    Fixed,

    /// Delay grows linearly with the attempt number
    Linear,

    /// Delay doubles per attempt
    Exponential,
}

/// Retry policy carried by a service task's definition
///
/// Honored per attempt by the service handler; nodes without a policy run
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How the inter-attempt delay evolves
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,

    /// Base delay in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_strategy: BackoffStrategy::Fixed,
            delay_ms: 0,
        }
    }
}

/// Variable mappings: `source key → target key`, applied in key order
pub type Mappings = BTreeMap<String, String>;

/// Per-type node configuration.
///
/// A tagged sum type: each case carries exactly the fields its node type
/// needs, so the executor matches on the tag and never probes a bag of
/// optional fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Plain nodes: tasks, script/manual tasks, intermediate events,
    /// subprocesses and call activities
    #[default]
    None,

    /// End events; `terminate` ends the whole workflow even when other
    /// branches are still pending
    End { terminate: bool },

    /// Service tasks: a named callable plus variable mappings.
    ///
    /// `service_name` is validated at deploy time, which is why it is
    /// optional here.
    Service {
        service_name: Option<String>,
        service_method: Option<String>,
        #[serde(default)]
        input_mappings: Mappings,
        #[serde(default)]
        output_mappings: Mappings,
        retry_policy: Option<RetryPolicy>,
    },

    /// Business-rule tasks: rule file + ruleflow group plus mappings
    Rule {
        rule_file: Option<String>,
        ruleflow_group: Option<String>,
        #[serde(default)]
        input_mappings: Mappings,
        #[serde(default)]
        output_mappings: Mappings,
    },

    /// Gateways; the kind is implied by the node type for the three
    /// dedicated gateway types and must be given explicitly for
    /// EVENT_BASED_GATEWAY
    Gateway { gateway_type: Option<GatewayKind> },
}

/// A node of the executable graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Unique within the definition; referenced by edges
    pub id: String,

    /// Human-readable label
    pub name: String,

    pub node_type: NodeType,

    #[serde(default)]
    pub config: NodeConfig,
}

impl GraphNode {
    /// Branching semantics of this node, if it is a gateway.
    ///
    /// The three dedicated gateway types imply their kind; an event-based
    /// gateway only has one if the definition supplied `gatewayType`.
    pub fn gateway_kind(&self) -> Option<GatewayKind> {
        match self.node_type {
            NodeType::ExclusiveGateway => Some(GatewayKind::Xor),
            NodeType::ParallelGateway => Some(GatewayKind::And),
            NodeType::InclusiveGateway => Some(GatewayKind::Or),
            NodeType::EventBasedGateway => match &self.config {
                NodeConfig::Gateway { gateway_type } => *gateway_type,
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether completing this node terminates the workflow outright
    pub fn terminates(&self) -> bool {
        matches!(self.config, NodeConfig::End { terminate: true })
    }
}
