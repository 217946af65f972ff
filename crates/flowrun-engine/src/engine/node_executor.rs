//! Per-node execution
//!
//! One call drives one node: join-barrier check, idempotency
//! short-circuit, record-start, transactional handler dispatch,
//! record-complete, edge selection. The idempotency short-circuit — skip
//! the handler, go straight to edge selection on the last persisted
//! variables — is what makes crash-mid-workflow resumable.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::handlers::{HandlerOutcome, HandlerRegistry, NodeContext};
use crate::error::EngineError;
use crate::event::{EventDraft, EventType};
use crate::metrics::{names, EngineMetrics};
use crate::persistence::WorkflowStore;
use crate::state::StateManager;
use crate::txn::{TransactionContext, TransactionManager};
use flowrun_graph::{
    condition, GatewayDirection, GatewayKind, GraphEdge, GraphNode, Variables, WorkflowGraph,
};

/// What happened to the traversal after one node
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Continue with these target node ids, in selection order
    Advance(Vec<String>),

    /// A user task paused the instance
    Paused,

    /// An end event with `terminate = true` completed
    Terminated,

    /// A converging parallel gateway is still waiting for sibling
    /// branches; this branch stops here
    AwaitingJoin,
}

/// Executes a single node of a single instance
pub struct NodeExecutor {
    store: Arc<dyn WorkflowStore>,
    state: Arc<StateManager>,
    txn: Arc<TransactionManager>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl NodeExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        state: Arc<StateManager>,
        txn: Arc<TransactionManager>,
        handlers: Arc<HandlerRegistry>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            state,
            txn,
            handlers,
            metrics,
        }
    }

    #[instrument(skip(self, graph))]
    pub async fn execute_node(
        &self,
        graph: &WorkflowGraph,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<StepOutcome, EngineError> {
        let node = graph
            .node(node_id)
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
        let instance = self.state.instance(execution_id).await?;
        let tenant_id = instance.tenant_id.clone();

        // Converging parallel gateways are join barriers: only the arrival
        // that finds every predecessor completed may proceed.
        if node.gateway_kind() == Some(GatewayKind::And)
            && graph.gateway_direction(node_id) == GatewayDirection::Converging
            && !self.join_ready(graph, execution_id, node_id).await?
        {
            self.store
                .append(
                    execution_id,
                    &tenant_id,
                    EventDraft::new(EventType::NodeEntered).for_node(node),
                )
                .await?;
            debug!(node_id, "join barrier not ready, branch stops");
            return Ok(StepOutcome::AwaitingJoin);
        }

        // Idempotency short-circuit: never re-run a completed node's
        // handler; pick up at edge selection on the persisted variables.
        if self.state.has_node_been_executed(execution_id, node_id).await? {
            self.store
                .append(
                    execution_id,
                    &tenant_id,
                    EventDraft::new(EventType::NodeSkipped).for_node(node),
                )
                .await?;
            self.metrics.incr(names::NODE_SKIPPED, &tenant_id);
            debug!(node_id, "already completed, skipping handler");
            return self
                .select_edges(graph, execution_id, &tenant_id, node, &instance.variables)
                .await;
        }

        let attempt_number = self
            .store
            .node_executions_for_node(execution_id, node_id)
            .await?
            .len() as i32
            + 1;

        let record = self
            .state
            .record_node_start(execution_id, node, attempt_number, &instance.variables)
            .await?;
        let started_event = self
            .store
            .append(
                execution_id,
                &tenant_id,
                EventDraft::new(EventType::NodeStarted)
                    .for_node(node)
                    .in_progress()
                    .with_input(Value::Object(instance.variables.clone())),
            )
            .await?;
        self.state.update_current_node(execution_id, node_id).await?;

        let handler = self.handlers.resolve(node)?;
        let mut node_ctx =
            NodeContext::new(execution_id, tenant_id.clone(), instance.variables.clone());
        let txn_ctx = TransactionContext::internal(execution_id, node_id, tenant_id.clone());

        let started_at = Instant::now();
        let outcome = self
            .txn
            .run_scoped(&txn_ctx, || handler.execute(node, &mut node_ctx))
            .await;

        match outcome {
            Ok(HandlerOutcome::Paused) => {
                // The attempt stays RUNNING and the started event stays
                // in progress; resuming completes them.
                debug!(node_id, "node paused the instance");
                Ok(StepOutcome::Paused)
            }

            Ok(HandlerOutcome::Completed { output }) => {
                let (variables, changed) = node_ctx.into_parts();
                if changed {
                    self.state
                        .update_variables(execution_id, variables.clone())
                        .await?;
                    self.store
                        .append(
                            execution_id,
                            &tenant_id,
                            EventDraft::new(EventType::VariableUpdated)
                                .with_node_id(node_id)
                                .with_variables(Value::Object(variables.clone())),
                        )
                        .await?;
                }

                let duration_ms = started_at.elapsed().as_millis() as i64;
                self.state
                    .record_node_complete(record, output.clone())
                    .await?;
                self.store
                    .mark_completed(started_event.id, duration_ms, output.clone())
                    .await?;

                let mut completed = EventDraft::new(EventType::NodeCompleted)
                    .for_node(node)
                    .with_duration_ms(duration_ms)
                    .with_variables(Value::Object(variables.clone()));
                if let Some(output) = output {
                    completed = completed.with_output(output);
                }
                self.store
                    .append(execution_id, &tenant_id, completed)
                    .await?;

                self.metrics
                    .record_duration(names::NODE_EXECUTION_DURATION, &tenant_id, duration_ms);

                if node.terminates() {
                    debug!(node_id, "terminate end event reached");
                    return Ok(StepOutcome::Terminated);
                }

                self.select_edges(graph, execution_id, &tenant_id, node, &variables)
                    .await
            }

            Err(err) => {
                let message = err.to_string();
                self.state.record_node_failure(record, &message).await?;
                self.store
                    .mark_failed(started_event.id, &message, None)
                    .await?;
                self.store
                    .append(
                        execution_id,
                        &tenant_id,
                        EventDraft::new(EventType::NodeFailed)
                            .for_node(node)
                            .with_error(message),
                    )
                    .await?;

                Err(EngineError::NodeExecution {
                    node_id: node_id.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    /// Every predecessor of the join has a completed execution
    async fn join_ready(
        &self,
        graph: &WorkflowGraph,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<bool, EngineError> {
        for edge in graph.incoming(node_id) {
            if !self
                .state
                .has_node_been_executed(execution_id, &edge.source)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pick the outgoing edges per the node's gateway semantics
    async fn select_edges(
        &self,
        graph: &WorkflowGraph,
        execution_id: Uuid,
        tenant_id: &str,
        node: &GraphNode,
        variables: &Variables,
    ) -> Result<StepOutcome, EngineError> {
        let edges = graph.outgoing(&node.id);
        if edges.is_empty() {
            return Ok(StepOutcome::Advance(vec![]));
        }

        let selected: Vec<&GraphEdge> = match node.gateway_kind() {
            None => {
                if edges.len() > 1 {
                    warn!(
                        node_id = %node.id,
                        "non-gateway node has multiple outgoing edges, taking the first"
                    );
                }
                vec![edges[0]]
            }

            Some(kind) => {
                self.metrics.incr(names::GATEWAY_EVALUATED, tenant_id);
                match kind {
                    // First conditional edge that holds; otherwise the
                    // default branch.
                    GatewayKind::Xor => {
                        let matched = edges.iter().find(|e| {
                            !e.is_unconditional()
                                && condition::evaluate(
                                    e.condition.as_deref().unwrap_or(""),
                                    variables,
                                )
                        });
                        match matched.or_else(|| edges.iter().find(|e| e.is_unconditional())) {
                            Some(edge) => vec![*edge],
                            None => {
                                return Err(EngineError::NoBranchSatisfied {
                                    node_id: node.id.clone(),
                                })
                            }
                        }
                    }

                    // Every branch.
                    GatewayKind::And => edges.clone(),

                    // Every holding conditional branch; the default branch
                    // only as fallback.
                    GatewayKind::Or => {
                        let matched: Vec<&GraphEdge> = edges
                            .iter()
                            .filter(|e| {
                                !e.is_unconditional()
                                    && condition::evaluate(
                                        e.condition.as_deref().unwrap_or(""),
                                        variables,
                                    )
                            })
                            .copied()
                            .collect();
                        if !matched.is_empty() {
                            matched
                        } else if let Some(fallback) =
                            edges.iter().find(|e| e.is_unconditional())
                        {
                            vec![*fallback]
                        } else {
                            return Err(EngineError::NoBranchSatisfied {
                                node_id: node.id.clone(),
                            });
                        }
                    }
                }
            }
        };

        let mut targets = Vec::with_capacity(selected.len());
        for edge in selected {
            if node.node_type.is_gateway() {
                self.store
                    .append(
                        execution_id,
                        tenant_id,
                        EventDraft::new(EventType::GatewayBranchTaken)
                            .for_node(node)
                            .with_edge_taken(&edge.id)
                            .with_decision(
                                edge.condition.clone().unwrap_or_else(|| "default".into()),
                            ),
                    )
                    .await?;
            }
            targets.push(edge.target.clone());
        }

        Ok(StepOutcome::Advance(targets))
    }
}
