//! Driving a workflow instance to terminal state
//!
//! Lease-bracketed traversal of the graph: acquire the instance lease,
//! start (or resume) the execution, walk nodes off a frontier queue until
//! an end node, a pause, or a failure. Failures are persisted — a FAILED
//! instance, a WORKFLOW_FAILED event — not raised: synchronous callers
//! read the terminal instance, the background pool just logs.
//!
//! Parallel fan-out is serialized over the frontier queue: every successor
//! of an AND gateway is visited, in edge-selection order, one at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::node_executor::{NodeExecutor, StepOutcome};
use crate::context::TenantContext;
use crate::error::EngineError;
use crate::event::{EventDraft, EventStatus, EventType};
use crate::instance::{InstanceState, NodeExecutionState, WorkflowInstance};
use crate::persistence::WorkflowStore;
use crate::state::StateManager;
use crate::worker::ExecutionPool;
use flowrun_graph::{Variables, WorkflowGraph};

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on visited nodes per invocation; a backstop against
    /// mis-modelled graphs
    pub max_steps: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_steps: 10_000 }
    }
}

/// How one drive invocation ended
enum RunEnd {
    Completed,
    Paused,
    AlreadyTerminal,
}

/// Drives instances to terminal state; stateless between invocations
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowStore>,
    state: Arc<StateManager>,
    nodes: Arc<NodeExecutor>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        state: Arc<StateManager>,
        nodes: Arc<NodeExecutor>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            state,
            nodes,
            config,
        }
    }

    /// Create an instance and drive it on the caller's task; returns the
    /// terminal (or paused) instance
    #[instrument(skip(self, ctx, graph, variables), fields(tenant_id = %ctx.tenant_id))]
    pub async fn execute_sync(
        &self,
        ctx: &TenantContext,
        workflow_id: &str,
        version: i64,
        graph: &WorkflowGraph,
        variables: Variables,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .state
            .create_instance(ctx, workflow_id, version, variables)
            .await?;
        self.run(graph, instance.execution_id, false).await?;
        self.state.instance(instance.execution_id).await
    }

    /// Create an instance and return immediately; the pool drives it
    #[instrument(skip(self, ctx, graph, variables, pool), fields(tenant_id = %ctx.tenant_id))]
    pub async fn execute_async(
        self: &Arc<Self>,
        ctx: &TenantContext,
        workflow_id: &str,
        version: i64,
        graph: Arc<WorkflowGraph>,
        variables: Variables,
        pool: &ExecutionPool,
    ) -> Result<Uuid, EngineError> {
        let instance = self
            .state
            .create_instance(ctx, workflow_id, version, variables)
            .await?;
        let execution_id = instance.execution_id;

        let executor = Arc::clone(self);
        pool.spawn(execution_id, async move {
            if let Err(err) = executor.run(&graph, execution_id, false).await {
                // Persisted already where possible; this is the backstop
                // for storage failures during failure handling itself.
                warn!(%execution_id, %err, "background execution aborted");
            }
        });

        Ok(execution_id)
    }

    /// Resume a paused or reclaimed execution from its current node
    #[instrument(skip(self, graph))]
    pub async fn resume_execution(
        &self,
        graph: &WorkflowGraph,
        execution_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        self.run(graph, execution_id, true).await?;
        self.state.instance(execution_id).await
    }

    /// One lease-bracketed drive invocation
    async fn run(
        &self,
        graph: &WorkflowGraph,
        execution_id: Uuid,
        resume: bool,
    ) -> Result<(), EngineError> {
        if !self.state.acquire_lease(execution_id).await? {
            info!(%execution_id, "another replica holds the lease");
            return Ok(());
        }

        let outcome = self.drive(graph, execution_id, resume).await;

        let result = match outcome {
            Ok(RunEnd::Completed) => {
                let instance = self.state.instance(execution_id).await?;
                self.store
                    .append(
                        execution_id,
                        &instance.tenant_id,
                        EventDraft::new(EventType::WorkflowCompleted)
                            .with_variables(Value::Object(instance.variables.clone())),
                    )
                    .await?;
                self.state.complete_workflow(execution_id).await?;
                Ok(())
            }

            Ok(RunEnd::Paused) => {
                self.state.pause_workflow(execution_id).await?;
                Ok(())
            }

            Ok(RunEnd::AlreadyTerminal) => Ok(()),

            Err(err) => {
                let message = err.to_string();
                let failed_node = err.failed_node_id().map(str::to_string);
                let instance = self.state.instance(execution_id).await?;
                self.store
                    .append(
                        execution_id,
                        &instance.tenant_id,
                        EventDraft::new(EventType::WorkflowFailed).with_error(&message),
                    )
                    .await?;
                self.state
                    .fail_workflow(execution_id, &message, failed_node.as_deref())
                    .await?;
                // The failure is persisted; callers observe the FAILED
                // instance rather than an error.
                Ok(())
            }
        };

        self.state.release_lease(execution_id).await?;
        result
    }

    /// Frontier-queue traversal
    async fn drive(
        &self,
        graph: &WorkflowGraph,
        execution_id: Uuid,
        resume: bool,
    ) -> Result<RunEnd, EngineError> {
        let instance = self.state.instance(execution_id).await?;
        if instance.state.is_terminal() {
            debug!(%execution_id, state = %instance.state, "instance already terminal");
            return Ok(RunEnd::AlreadyTerminal);
        }

        let start_node = graph
            .start_event()
            .ok_or(EngineError::NoStartEvent)?
            .id
            .clone();

        let first_node = match instance.state {
            InstanceState::Pending => {
                self.state.start_execution(execution_id).await?;
                self.store
                    .append(
                        execution_id,
                        &instance.tenant_id,
                        EventDraft::new(EventType::WorkflowStarted)
                            .with_input(Value::Object(instance.variables.clone()))
                            .with_variables(Value::Object(instance.variables.clone())),
                    )
                    .await?;
                start_node
            }

            InstanceState::Paused if resume => {
                self.finish_pending_user_task(graph, &instance).await?;
                self.state.resume_workflow(execution_id).await?;
                instance.current_node_id.clone().unwrap_or(start_node)
            }

            InstanceState::Running if resume => {
                // Lease reclaim after a crash: pick up at the node the
                // dead replica was on; idempotency skips completed work.
                instance.current_node_id.clone().unwrap_or(start_node)
            }

            state => {
                return Err(EngineError::IllegalTransition {
                    execution_id,
                    from: state.to_string(),
                    to: InstanceState::Running.to_string(),
                });
            }
        };

        let mut frontier: VecDeque<String> = VecDeque::from([first_node]);
        let mut steps = 0usize;

        while let Some(node_id) = frontier.pop_front() {
            steps += 1;
            if steps > self.config.max_steps {
                return Err(EngineError::StepBudgetExceeded(self.config.max_steps));
            }

            match self
                .nodes
                .execute_node(graph, execution_id, &node_id)
                .await?
            {
                StepOutcome::Advance(targets) => frontier.extend(targets),
                StepOutcome::AwaitingJoin => {}
                StepOutcome::Paused => return Ok(RunEnd::Paused),
                StepOutcome::Terminated => return Ok(RunEnd::Completed),
            }
        }

        Ok(RunEnd::Completed)
    }

    /// A paused user task is considered done when the instance is
    /// resumed: close its attempt and events so the idempotency check
    /// routes the traversal straight through edge selection.
    async fn finish_pending_user_task(
        &self,
        graph: &WorkflowGraph,
        instance: &WorkflowInstance,
    ) -> Result<(), EngineError> {
        let Some(node_id) = instance.current_node_id.as_deref() else {
            return Ok(());
        };

        let pending = self
            .store
            .node_executions_for_node(instance.execution_id, node_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.state == NodeExecutionState::Running);
        let Some(record) = pending else {
            return Ok(());
        };

        info!(execution_id = %instance.execution_id, node_id, "completing user task on resume");
        let record = self.state.record_node_complete(record, None).await?;

        let started = self
            .store
            .events_by_node(instance.execution_id, node_id)
            .await?
            .into_iter()
            .rev()
            .find(|e| {
                e.event_type == EventType::NodeStarted && e.status == EventStatus::InProgress
            });
        if let Some(started) = started {
            self.store
                .mark_completed(started.id, record.duration_ms.unwrap_or(0), None)
                .await?;
        }

        let mut completed = EventDraft::new(EventType::NodeCompleted)
            .with_variables(Value::Object(instance.variables.clone()));
        completed = match graph.node(node_id) {
            Some(node) => completed.for_node(node),
            None => completed.with_node_id(node_id),
        };
        self.store
            .append(instance.execution_id, &instance.tenant_id, completed)
            .await?;

        Ok(())
    }
}
