//! Node handlers and their dispatch table
//!
//! One handler per node type, selected through a table keyed on the type
//! tag — the executor never walks a list probing `supports`. The variable
//! map exposed through [`NodeContext`] is a handler's only side-effect
//! channel; instance transitions (pausing for user tasks, terminating on
//! end events) are signalled through the [`HandlerOutcome`] and performed
//! by the executor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::services::{RuleEngine, ServiceRegistry};
use crate::error::EngineError;
use crate::metrics::{names, EngineMetrics};
use crate::reliability::run_with_retry;
use flowrun_graph::{GraphNode, Mappings, NodeConfig, NodeType, Variables};

/// A handler's window onto the running instance
pub struct NodeContext {
    pub execution_id: Uuid,
    pub tenant_id: String,
    variables: Variables,
    changed: bool,
}

impl NodeContext {
    pub fn new(execution_id: Uuid, tenant_id: impl Into<String>, variables: Variables) -> Self {
        Self {
            execution_id,
            tenant_id: tenant_id.into(),
            variables,
            changed: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
        self.changed = true;
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// The final variable map and whether the handler changed it
    pub fn into_parts(self) -> (Variables, bool) {
        (self.variables, self.changed)
    }
}

/// What a handler's run means for the instance
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The node finished; `output` becomes the NODE_COMPLETED snapshot
    Completed { output: Option<Value> },

    /// The node is waiting on an external actor; the executor pauses the
    /// instance
    Paused,
}

impl HandlerOutcome {
    pub fn completed() -> Self {
        Self::Completed { output: None }
    }

    pub fn completed_with(output: Value) -> Self {
        Self::Completed {
            output: Some(output),
        }
    }
}

/// A per-node-type execution strategy
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn supports(&self, node: &GraphNode) -> bool;

    async fn execute(
        &self,
        node: &GraphNode,
        ctx: &mut NodeContext,
    ) -> Result<HandlerOutcome, EngineError>;
}

/// Copy `variables[src] → target[dst]` for every mapping entry
fn apply_mappings(mappings: &Mappings, source: &Variables) -> Variables {
    let mut target = Variables::new();
    for (src, dst) in mappings {
        if let Some(value) = source.get(src) {
            target.insert(dst.clone(), value.clone());
        }
    }
    target
}

// =============================================================================
// Handlers
// =============================================================================

/// Start, end and intermediate events: recorded no-ops. The terminate
/// flag on end events is acted on by the executor after completion.
pub struct EventNodeHandler;

#[async_trait]
impl NodeHandler for EventNodeHandler {
    fn supports(&self, node: &GraphNode) -> bool {
        matches!(
            node.node_type,
            NodeType::StartEvent | NodeType::EndEvent | NodeType::IntermediateEvent
        )
    }

    async fn execute(
        &self,
        _node: &GraphNode,
        _ctx: &mut NodeContext,
    ) -> Result<HandlerOutcome, EngineError> {
        Ok(HandlerOutcome::completed())
    }
}

/// Plain tasks, script/manual tasks, subprocesses and call activities:
/// recorded pass-throughs (script evaluation and subprocess spawning are
/// external collaborators)
pub struct PassthroughTaskHandler;

#[async_trait]
impl NodeHandler for PassthroughTaskHandler {
    fn supports(&self, node: &GraphNode) -> bool {
        matches!(
            node.node_type,
            NodeType::Task
                | NodeType::ScriptTask
                | NodeType::ManualTask
                | NodeType::Subprocess
                | NodeType::CallActivity
        )
    }

    async fn execute(
        &self,
        node: &GraphNode,
        _ctx: &mut NodeContext,
    ) -> Result<HandlerOutcome, EngineError> {
        debug!(node_id = %node.id, "task pass-through");
        Ok(HandlerOutcome::completed())
    }
}

/// Service tasks: resolve the named callable, map inputs, invoke with the
/// definition's retry policy, map outputs back
pub struct ServiceTaskHandler {
    services: Arc<ServiceRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl ServiceTaskHandler {
    pub fn new(services: Arc<ServiceRegistry>, metrics: Arc<EngineMetrics>) -> Self {
        Self { services, metrics }
    }
}

#[async_trait]
impl NodeHandler for ServiceTaskHandler {
    fn supports(&self, node: &GraphNode) -> bool {
        node.node_type == NodeType::ServiceTask
    }

    async fn execute(
        &self,
        node: &GraphNode,
        ctx: &mut NodeContext,
    ) -> Result<HandlerOutcome, EngineError> {
        let NodeConfig::Service {
            service_name,
            input_mappings,
            output_mappings,
            retry_policy,
            ..
        } = &node.config
        else {
            return Err(EngineError::Handler(format!(
                "service task `{}` has no service configuration",
                node.id
            )));
        };

        let name = service_name.as_deref().ok_or_else(|| {
            EngineError::Handler(format!("service task `{}` has no service name", node.id))
        })?;
        let service = self
            .services
            .get(name)
            .ok_or_else(|| EngineError::ServiceNotRegistered(name.to_string()))?;

        let call_input = apply_mappings(input_mappings, ctx.variables());
        let tenant_id = ctx.tenant_id.clone();
        let metrics = self.metrics.clone();

        let result = run_with_retry(
            retry_policy.as_ref(),
            move |_| metrics.incr(names::RETRY, &tenant_id),
            |attempt| {
                let service = service.clone();
                let input = call_input.clone();
                async move {
                    debug!(service = name, attempt, "invoking service");
                    service.invoke(input).await
                }
            },
        )
        .await?;

        for (src, dst) in output_mappings {
            if let Some(value) = result.get(src) {
                ctx.set(dst.clone(), value.clone());
            }
        }

        Ok(HandlerOutcome::completed_with(Value::Object(result)))
    }
}

/// Business-rule tasks: feed mapped inputs to the rule engine, collect
/// mapped outputs
pub struct RuleTaskHandler {
    engine: Arc<dyn RuleEngine>,
}

impl RuleTaskHandler {
    pub fn new(engine: Arc<dyn RuleEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NodeHandler for RuleTaskHandler {
    fn supports(&self, node: &GraphNode) -> bool {
        node.node_type == NodeType::BusinessRuleTask
    }

    async fn execute(
        &self,
        node: &GraphNode,
        ctx: &mut NodeContext,
    ) -> Result<HandlerOutcome, EngineError> {
        let NodeConfig::Rule {
            rule_file,
            ruleflow_group,
            input_mappings,
            output_mappings,
        } = &node.config
        else {
            return Err(EngineError::Handler(format!(
                "rule task `{}` has no rule configuration",
                node.id
            )));
        };

        let file = rule_file.as_deref().ok_or_else(|| {
            EngineError::Handler(format!("rule task `{}` has no rule file", node.id))
        })?;
        let group = ruleflow_group.as_deref().ok_or_else(|| {
            EngineError::Handler(format!("rule task `{}` has no ruleflow group", node.id))
        })?;

        let inputs = apply_mappings(input_mappings, ctx.variables());
        let outputs = self.engine.evaluate(file, group, inputs).await?;

        for (src, dst) in output_mappings {
            if let Some(value) = outputs.get(src) {
                ctx.set(dst.clone(), value.clone());
            }
        }

        Ok(HandlerOutcome::completed_with(Value::Object(outputs)))
    }
}

/// User tasks wait for a human: the instance pauses and an external
/// resume continues past the node
pub struct UserTaskHandler;

#[async_trait]
impl NodeHandler for UserTaskHandler {
    fn supports(&self, node: &GraphNode) -> bool {
        node.node_type == NodeType::UserTask
    }

    async fn execute(
        &self,
        node: &GraphNode,
        _ctx: &mut NodeContext,
    ) -> Result<HandlerOutcome, EngineError> {
        debug!(node_id = %node.id, "user task reached, pausing");
        Ok(HandlerOutcome::Paused)
    }
}

/// Gateways: handler is a no-op; all branching lives in edge selection
pub struct GatewayHandler;

#[async_trait]
impl NodeHandler for GatewayHandler {
    fn supports(&self, node: &GraphNode) -> bool {
        node.node_type.is_gateway()
    }

    async fn execute(
        &self,
        _node: &GraphNode,
        _ctx: &mut NodeContext,
    ) -> Result<HandlerOutcome, EngineError> {
        Ok(HandlerOutcome::completed())
    }
}

// =============================================================================
// Dispatch table
// =============================================================================

/// Handler dispatch table keyed on the node-type tag
pub struct HandlerRegistry {
    table: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// The standard table: one entry per node type
    pub fn standard(
        services: Arc<ServiceRegistry>,
        rule_engine: Arc<dyn RuleEngine>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let events: Arc<dyn NodeHandler> = Arc::new(EventNodeHandler);
        let tasks: Arc<dyn NodeHandler> = Arc::new(PassthroughTaskHandler);
        let service: Arc<dyn NodeHandler> =
            Arc::new(ServiceTaskHandler::new(services, metrics));
        let rules: Arc<dyn NodeHandler> = Arc::new(RuleTaskHandler::new(rule_engine));
        let user: Arc<dyn NodeHandler> = Arc::new(UserTaskHandler);
        let gateway: Arc<dyn NodeHandler> = Arc::new(GatewayHandler);

        let mut table: HashMap<NodeType, Arc<dyn NodeHandler>> = HashMap::new();
        for node_type in NodeType::ALL {
            let handler = match node_type {
                NodeType::StartEvent | NodeType::EndEvent | NodeType::IntermediateEvent => {
                    events.clone()
                }
                NodeType::Task
                | NodeType::ScriptTask
                | NodeType::ManualTask
                | NodeType::Subprocess
                | NodeType::CallActivity => tasks.clone(),
                NodeType::ServiceTask => service.clone(),
                NodeType::BusinessRuleTask => rules.clone(),
                NodeType::UserTask => user.clone(),
                NodeType::ExclusiveGateway
                | NodeType::ParallelGateway
                | NodeType::InclusiveGateway
                | NodeType::EventBasedGateway => gateway.clone(),
            };
            table.insert(node_type, handler);
        }

        Self { table }
    }

    /// Override the handler for one node type
    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) {
        self.table.insert(node_type, handler);
    }

    /// The single handler for a node; its `supports` check is an
    /// invariant, not a search
    pub fn resolve(&self, node: &GraphNode) -> Result<Arc<dyn NodeHandler>, EngineError> {
        let handler = self.table.get(&node.node_type).ok_or_else(|| {
            EngineError::Handler(format!(
                "no handler registered for node type {}",
                node.node_type
            ))
        })?;
        if !handler.supports(node) {
            return Err(EngineError::Handler(format!(
                "handler for {} rejects node `{}`",
                node.node_type, node.id
            )));
        }
        Ok(handler.clone())
    }
}
