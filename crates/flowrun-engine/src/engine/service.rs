//! The engine facade
//!
//! One wiring point for the whole core: deploy, execute (sync or
//! background), query, resume, rollback, replay. This is the surface an
//! HTTP layer (out of scope here) injects and calls; every method takes
//! or carries the tenant explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, instrument};
use uuid::Uuid;

use super::handlers::{HandlerRegistry, NodeHandler};
use super::node_executor::NodeExecutor;
use super::services::{PassthroughRuleEngine, RuleEngine, ServiceRegistry};
use super::workflow_executor::{ExecutorConfig, WorkflowExecutor};
use crate::compensation::{CompensationRegistry, CompensationService};
use crate::context::TenantContext;
use crate::error::EngineError;
use crate::event::ExecutionEvent;
use crate::instance::{
    AuditEntry, DeployedDefinition, InstanceState, NodeExecutionState, WorkflowInstance,
};
use crate::metrics::EngineMetrics;
use crate::persistence::{StoreError, WorkflowStore};
use crate::replay::ReplayEngine;
use crate::rollback::{RollbackCoordinator, RollbackReason, RollbackResult};
use crate::state::{StateManager, StateManagerConfig};
use crate::txn::TransactionManager;
use crate::worker::{ExecutionPool, ExecutionPoolConfig};
use flowrun_graph::{parse_definition, validate, NodeType, Variables, WorkflowGraph};

/// Answer shape for status queries
#[derive(Debug, Clone)]
pub struct ExecutionStatus {
    pub execution_id: Uuid,
    pub state: InstanceState,
    pub current_node_id: Option<String>,
    pub variables: Variables,
    pub history: Vec<ExecutionEvent>,
    pub error: Option<String>,
}

/// Per-node summary for the node-states query
#[derive(Debug, Clone)]
pub struct NodeStateSummary {
    pub status: NodeExecutionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub attempts: i32,
}

/// Builder for a fully wired [`WorkflowEngine`]
pub struct WorkflowEngineBuilder {
    store: Arc<dyn WorkflowStore>,
    rule_engine: Arc<dyn RuleEngine>,
    state_config: StateManagerConfig,
    executor_config: ExecutorConfig,
    pool_config: ExecutionPoolConfig,
    handler_overrides: Vec<(NodeType, Arc<dyn NodeHandler>)>,
}

impl WorkflowEngineBuilder {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            rule_engine: Arc::new(PassthroughRuleEngine),
            state_config: StateManagerConfig::default(),
            executor_config: ExecutorConfig::default(),
            pool_config: ExecutionPoolConfig::default(),
            handler_overrides: Vec::new(),
        }
    }

    pub fn with_rule_engine(mut self, rule_engine: Arc<dyn RuleEngine>) -> Self {
        self.rule_engine = rule_engine;
        self
    }

    pub fn with_state_config(mut self, config: StateManagerConfig) -> Self {
        self.state_config = config;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn with_pool_config(mut self, config: ExecutionPoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Override the handler for one node type
    pub fn with_handler(mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) -> Self {
        self.handler_overrides.push((node_type, handler));
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let metrics = Arc::new(EngineMetrics::new());
        let services = Arc::new(ServiceRegistry::new());
        let state = Arc::new(StateManager::with_config(
            self.store.clone(),
            metrics.clone(),
            self.state_config,
        ));
        let txn = Arc::new(TransactionManager::new(self.store.clone()));

        let mut handlers =
            HandlerRegistry::standard(services.clone(), self.rule_engine, metrics.clone());
        for (node_type, handler) in self.handler_overrides {
            handlers.register(node_type, handler);
        }
        let handlers = Arc::new(handlers);

        let node_executor = Arc::new(NodeExecutor::new(
            self.store.clone(),
            state.clone(),
            txn.clone(),
            handlers,
            metrics.clone(),
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            self.store.clone(),
            state.clone(),
            node_executor,
            self.executor_config,
        ));

        let compensation_registry = Arc::new(CompensationRegistry::new());
        let compensation = Arc::new(CompensationService::new(
            self.store.clone(),
            compensation_registry.clone(),
            metrics.clone(),
        ));
        let rollback = Arc::new(RollbackCoordinator::new(
            self.store.clone(),
            state.clone(),
            compensation.clone(),
            metrics.clone(),
        ));
        let replay = Arc::new(ReplayEngine::new(self.store.clone()));
        let pool = ExecutionPool::new(self.pool_config);

        WorkflowEngine {
            store: self.store,
            metrics,
            services,
            state,
            txn,
            executor,
            compensation_registry,
            compensation,
            rollback,
            replay,
            pool,
            graphs: DashMap::new(),
        }
    }
}

/// The workflow execution core, fully wired
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    metrics: Arc<EngineMetrics>,
    services: Arc<ServiceRegistry>,
    state: Arc<StateManager>,
    txn: Arc<TransactionManager>,
    executor: Arc<WorkflowExecutor>,
    compensation_registry: Arc<CompensationRegistry>,
    compensation: Arc<CompensationService>,
    rollback: Arc<RollbackCoordinator>,
    replay: Arc<ReplayEngine>,
    pool: ExecutionPool,

    /// Derived-graph cache keyed by (tenant, workflow, version)
    graphs: DashMap<(String, String, i64), Arc<WorkflowGraph>>,
}

impl WorkflowEngine {
    pub fn builder(store: Arc<dyn WorkflowStore>) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new(store)
    }

    /// Build with defaults over the given store
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        WorkflowEngineBuilder::new(store).build()
    }

    // =========================================================================
    // Component access
    // =========================================================================

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn compensation_registry(&self) -> &CompensationRegistry {
        &self.compensation_registry
    }

    pub fn compensation(&self) -> &CompensationService {
        &self.compensation
    }

    pub fn rollback_coordinator(&self) -> &RollbackCoordinator {
        &self.rollback
    }

    pub fn replay(&self) -> &ReplayEngine {
        &self.replay
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txn
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    /// Parse, validate and persist a definition document.
    ///
    /// The stored version is the document's own version or, when that is
    /// already taken (or lower), the next free one — definitions are
    /// immutable, re-deploying always creates a new row.
    #[instrument(skip(self, ctx, document), fields(tenant_id = %ctx.tenant_id))]
    pub async fn deploy(
        &self,
        ctx: &TenantContext,
        document: &str,
    ) -> Result<DeployedDefinition, EngineError> {
        let parsed = parse_definition(document)?;
        let graph = parsed.build_graph();

        let result = validate(&graph);
        if !result.is_valid() {
            return Err(EngineError::DefinitionInvalid { result });
        }

        let next = self
            .store
            .next_version(&ctx.tenant_id, &parsed.workflow_id)
            .await?;
        let version = parsed.version.max(next);

        let definition = DeployedDefinition {
            id: Uuid::now_v7(),
            workflow_id: parsed.workflow_id.clone(),
            version,
            tenant_id: ctx.tenant_id.clone(),
            name: parsed.name.clone(),
            document: parsed.raw.clone(),
            active: true,
            deployed_at: Utc::now(),
        };
        self.store.insert_definition(definition.clone()).await?;

        self.graphs.insert(
            (ctx.tenant_id.clone(), definition.workflow_id.clone(), version),
            Arc::new(graph),
        );

        info!(
            workflow_id = %definition.workflow_id,
            version,
            warnings = result.warnings.len(),
            "definition deployed"
        );
        Ok(definition)
    }

    /// Run the latest active version synchronously; returns the terminal
    /// (or paused) instance
    pub async fn execute(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
        variables: Variables,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self.latest_definition(ctx, workflow_id).await?;
        let graph = self.graph_for(&definition)?;
        self.executor
            .execute_sync(ctx, workflow_id, definition.version, &graph, variables)
            .await
    }

    /// Run the latest active version on the background pool; returns the
    /// execution id immediately
    pub async fn execute_background(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
        variables: Variables,
    ) -> Result<Uuid, EngineError> {
        let definition = self.latest_definition(ctx, workflow_id).await?;
        let graph = self.graph_for(&definition)?;
        self.executor
            .execute_async(
                ctx,
                workflow_id,
                definition.version,
                graph,
                variables,
                &self.pool,
            )
            .await
    }

    /// State, variables and full event history of one execution
    pub async fn execution_status(
        &self,
        execution_id: Uuid,
    ) -> Result<ExecutionStatus, EngineError> {
        let instance = self.state.instance(execution_id).await?;
        let history = self.store.timeline(execution_id).await?;
        Ok(ExecutionStatus {
            execution_id,
            state: instance.state,
            current_node_id: instance.current_node_id,
            variables: instance.variables,
            history,
            error: instance.failure_message,
        })
    }

    /// Resume a paused instance (or reclaim a crashed one)
    pub async fn resume(&self, execution_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let instance = self.state.instance(execution_id).await?;
        if instance.state.is_terminal() || instance.state == InstanceState::Pending {
            return Err(EngineError::IllegalTransition {
                execution_id,
                from: instance.state.to_string(),
                to: InstanceState::Running.to_string(),
            });
        }

        let definition = self
            .definition(&instance.tenant_id, &instance.workflow_id, instance.version)
            .await?;
        let graph = self.graph_for(&definition)?;
        self.executor.resume_execution(&graph, execution_id).await
    }

    /// Compensate every completed node and cancel the instance
    pub async fn rollback(
        &self,
        execution_id: Uuid,
        reason: RollbackReason,
    ) -> Result<RollbackResult, EngineError> {
        self.rollback.rollback_workflow(execution_id, &reason).await
    }

    /// The event timeline, optionally bounded to an inclusive sequence
    /// range
    pub async fn replay_timeline(
        &self,
        execution_id: Uuid,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<ExecutionEvent>, EngineError> {
        let events = match (start, end) {
            (None, None) => self.store.timeline(execution_id).await?,
            (start, end) => {
                self.store
                    .timeline_range(execution_id, start.unwrap_or(1), end.unwrap_or(i64::MAX))
                    .await?
            }
        };
        Ok(events)
    }

    /// Latest state of each node, from the node-execution rows
    pub async fn node_states(
        &self,
        execution_id: Uuid,
    ) -> Result<HashMap<String, NodeStateSummary>, EngineError> {
        let rows = self.store.node_executions(execution_id).await?;
        let mut summaries: HashMap<String, NodeStateSummary> = HashMap::new();
        for row in rows {
            let attempts = summaries.get(&row.node_id).map_or(0, |s| s.attempts);
            summaries.insert(
                row.node_id.clone(),
                NodeStateSummary {
                    status: row.state,
                    started_at: row.executed_at,
                    completed_at: row.completed_at,
                    duration_ms: row.duration_ms,
                    error: row.error_message,
                    attempts: attempts.max(row.attempt_number),
                },
            );
        }
        Ok(summaries)
    }

    /// The compliance audit trail of one execution
    pub async fn audit_trail(&self, execution_id: Uuid) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self.store.audit_trail(execution_id).await?)
    }

    /// Replay self-test: reconstructing twice must agree
    pub async fn validate_replay(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        self.replay.validate_replay_consistency(execution_id).await
    }

    /// Drain the background pool; returns executions still running at the
    /// deadline
    pub async fn shutdown(&self) -> Vec<Uuid> {
        self.pool.shutdown_graceful().await
    }

    // =========================================================================
    // Internal
    // =========================================================================

    async fn latest_definition(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
    ) -> Result<DeployedDefinition, EngineError> {
        match self.store.latest_active(&ctx.tenant_id, workflow_id).await {
            Ok(definition) => Ok(definition),
            Err(StoreError::DefinitionNotFound { workflow_id, .. }) => {
                Err(EngineError::DefinitionNotFound { workflow_id })
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn definition(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        version: i64,
    ) -> Result<DeployedDefinition, EngineError> {
        match self.store.definition(tenant_id, workflow_id, version).await {
            Ok(definition) => Ok(definition),
            Err(StoreError::DefinitionNotFound { workflow_id, .. }) => {
                Err(EngineError::DefinitionNotFound { workflow_id })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// The cached derived graph for a definition
    fn graph_for(&self, definition: &DeployedDefinition) -> Result<Arc<WorkflowGraph>, EngineError> {
        let key = (
            definition.tenant_id.clone(),
            definition.workflow_id.clone(),
            definition.version,
        );
        if let Some(graph) = self.graphs.get(&key) {
            return Ok(graph.value().clone());
        }
        let graph = Arc::new(definition.build_graph()?);
        self.graphs.insert(key, graph.clone());
        Ok(graph)
    }
}
