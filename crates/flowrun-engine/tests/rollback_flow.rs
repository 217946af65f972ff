//! Rollback end-to-end: node-level, checkpoint and whole-workflow

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use flowrun_engine::engine::{
    HandlerRegistry, NodeExecutor, PassthroughRuleEngine, ServiceRegistry,
};
use flowrun_engine::prelude::*;
use flowrun_graph::{
    GraphEdge, GraphNode, Mappings, NodeConfig, NodeType, PathType, Variables, WorkflowGraph,
};

fn vars(pairs: &[(&str, serde_json::Value)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn node_rollback_invokes_the_payment_compensation() {
    let store = Arc::new(InMemoryStore::new());
    let engine = WorkflowEngine::new(store);
    let ctx = TenantContext::default();

    let document = json!({
        "workflowId": "payments",
        "version": 1,
        "name": "Payments",
        "nodes": [
            {"id": "start", "type": "START_EVENT"},
            {"id": "n1", "type": "SERVICE_TASK", "serviceName": "payment",
             "outputMappings": {"paymentId": "paymentId"}},
            {"id": "end", "type": "END_EVENT"}
        ],
        "edges": [
            {"id": "e1", "source": "start", "target": "n1"},
            {"id": "e2", "source": "n1", "target": "end"}
        ]
    })
    .to_string();

    engine.services().register_fn("payment", |_input: Variables| async move {
        let mut out = Variables::new();
        out.insert("paymentId".into(), json!("p-42"));
        Ok(out)
    });

    // A payment compensation that records what it received.
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = seen.clone();
    engine.compensation_registry().register(
        "payment",
        FnCompensation::new(move |ctx| {
            let sink = sink.clone();
            async move {
                sink.lock().push(ctx.original_output.clone().unwrap_or_default());
                Ok(())
            }
        }),
    );

    engine.deploy(&ctx, &document).await.unwrap();
    let instance = engine.execute(&ctx, "payments", vars(&[])).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    assert_eq!(instance.variables.get("paymentId"), Some(&json!("p-42")));

    let result = engine
        .rollback_coordinator()
        .rollback_node(
            instance.execution_id,
            "n1",
            &RollbackReason::user_requested("test"),
        )
        .await
        .unwrap();

    assert!(result.success, "{}", result.message);
    assert_eq!(result.rolled_back_nodes, vec!["n1"]);

    // The handler got the original output snapshot.
    let outputs = seen.lock();
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].contains("p-42"));
    drop(outputs);

    // COMPENSATION_INITIATED precedes COMPENSATION_COMPLETED.
    let history = engine
        .replay_timeline(instance.execution_id, None, None)
        .await
        .unwrap();
    let compensation_events: Vec<_> = history
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                EventType::CompensationInitiated | EventType::CompensationCompleted
            )
        })
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        compensation_events,
        vec![
            EventType::CompensationInitiated,
            EventType::CompensationCompleted
        ]
    );
}

struct StepRig {
    store: Arc<InMemoryStore>,
    state: Arc<StateManager>,
    nodes: Arc<NodeExecutor>,
    rollback: RollbackCoordinator,
    compensated: Arc<Mutex<Vec<String>>>,
}

/// start → n1 → n2 → n3 → end, every step a `step` service call, driven
/// node by node so checkpoints land mid-run
fn step_rig() -> (StepRig, WorkflowGraph) {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let metrics = Arc::new(EngineMetrics::new());
    let services = Arc::new(ServiceRegistry::new());
    services.register_fn("step", |input: Variables| async move { Ok(input) });

    let registry = Arc::new(CompensationRegistry::new());
    let compensated = Arc::new(Mutex::new(Vec::new()));
    let sink = compensated.clone();
    registry.register(
        "step",
        FnCompensation::new(move |ctx| {
            let sink = sink.clone();
            async move {
                sink.lock().push(ctx.node_id.clone());
                Ok(())
            }
        }),
    );

    let state = Arc::new(StateManager::new(store.clone(), metrics.clone()));
    let txn = Arc::new(TransactionManager::new(store.clone()));
    let handlers = Arc::new(HandlerRegistry::standard(
        services,
        Arc::new(PassthroughRuleEngine),
        metrics.clone(),
    ));
    let nodes = Arc::new(NodeExecutor::new(
        store.clone(),
        state.clone(),
        txn,
        handlers,
        metrics.clone(),
    ));
    let compensation = Arc::new(CompensationService::new(
        store.clone(),
        registry,
        metrics.clone(),
    ));
    let rollback = RollbackCoordinator::new(store.clone(), state.clone(), compensation, metrics);

    let service_node = |id: &str| GraphNode {
        id: id.into(),
        name: id.into(),
        node_type: NodeType::ServiceTask,
        config: NodeConfig::Service {
            service_name: Some("step".into()),
            service_method: None,
            input_mappings: Mappings::new(),
            output_mappings: Mappings::new(),
            retry_policy: None,
        },
    };
    let edge = |id: &str, source: &str, target: &str| GraphEdge {
        id: id.into(),
        source: source.into(),
        target: target.into(),
        path_type: PathType::Success,
        condition: None,
        priority: 0,
        name: None,
    };

    let graph = WorkflowGraph::new(
        vec![
            GraphNode {
                id: "start".into(),
                name: "start".into(),
                node_type: NodeType::StartEvent,
                config: NodeConfig::None,
            },
            service_node("n1"),
            service_node("n2"),
            service_node("n3"),
            GraphNode {
                id: "end".into(),
                name: "end".into(),
                node_type: NodeType::EndEvent,
                config: NodeConfig::End { terminate: false },
            },
        ],
        vec![
            edge("e1", "start", "n1"),
            edge("e2", "n1", "n2"),
            edge("e3", "n2", "n3"),
            edge("e4", "n3", "end"),
        ],
    );

    (
        StepRig {
            store,
            state,
            nodes,
            rollback,
            compensated,
        },
        graph,
    )
}

#[tokio::test]
async fn checkpoint_rollback_undoes_only_later_nodes() {
    let (rig, graph) = step_rig();

    let instance = rig
        .state
        .create_instance(&TenantContext::default(), "steps", 1, Variables::new())
        .await
        .unwrap();
    let execution_id = instance.execution_id;
    rig.state.start_execution(execution_id).await.unwrap();

    // n1 completes, checkpoint, then n2 and n3.
    rig.nodes.execute_node(&graph, execution_id, "n1").await.unwrap();
    let checkpoint = rig
        .rollback
        .create_checkpoint(execution_id, "cp1")
        .await
        .unwrap();
    rig.nodes.execute_node(&graph, execution_id, "n2").await.unwrap();
    rig.nodes.execute_node(&graph, execution_id, "n3").await.unwrap();

    let result = rig
        .rollback
        .rollback_to_checkpoint(
            execution_id,
            checkpoint,
            &RollbackReason::execution_failed("later step broke"),
        )
        .await
        .unwrap();

    assert!(result.success, "{}", result.message);
    // n3 then n2 were compensated, n1 untouched.
    assert_eq!(*rig.compensated.lock(), vec!["n3", "n2"]);
    assert_eq!(result.rolled_back_nodes, vec!["n2", "n3"]);
    assert!(result.failed_nodes.is_empty());

    // n1's completion event still stands.
    let events = rig.store.events_by_node(execution_id, "n1").await.unwrap();
    assert!(events.iter().any(|e| {
        e.event_type == EventType::NodeCompleted && e.status == EventStatus::Completed
    }));

    // The checkpoint is listed.
    let checkpoints = rig.rollback.checkpoints(execution_id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].name, "cp1");
    assert_eq!(checkpoints[0].sequence_number, checkpoint);
}

#[tokio::test]
async fn full_workflow_rollback_cancels_and_reverses_everything() {
    let (rig, graph) = step_rig();

    let instance = rig
        .state
        .create_instance(&TenantContext::default(), "steps", 1, Variables::new())
        .await
        .unwrap();
    let execution_id = instance.execution_id;
    rig.state.start_execution(execution_id).await.unwrap();

    for node in ["n1", "n2", "n3"] {
        rig.nodes.execute_node(&graph, execution_id, node).await.unwrap();
    }

    let result = rig
        .rollback
        .rollback_workflow(execution_id, &RollbackReason::user_requested("operator abort"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(*rig.compensated.lock(), vec!["n3", "n2", "n1"]);

    let instance = rig.state.instance(execution_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Cancelled);

    let timeline = rig.store.timeline(execution_id).await.unwrap();
    assert!(timeline
        .iter()
        .any(|e| e.event_type == EventType::WorkflowRolledBack));

    // Every NODE_COMPLETED is now marked compensated.
    assert!(timeline
        .iter()
        .filter(|e| e.event_type == EventType::NodeCompleted)
        .all(|e| e.status == EventStatus::Compensated));
}

#[tokio::test]
async fn facade_rollback_uses_the_workflow_path() {
    let store = Arc::new(InMemoryStore::new());
    let engine = WorkflowEngine::new(store);
    let ctx = TenantContext::default();

    let document = json!({
        "workflowId": "refundable",
        "version": 1,
        "name": "Refundable",
        "nodes": [
            {"id": "start", "type": "START_EVENT"},
            {"id": "charge", "type": "SERVICE_TASK", "serviceName": "charge"},
            {"id": "end", "type": "END_EVENT"}
        ],
        "edges": [
            {"id": "e1", "source": "start", "target": "charge"},
            {"id": "e2", "source": "charge", "target": "end"}
        ]
    })
    .to_string();

    engine
        .services()
        .register_fn("charge", |input: Variables| async move { Ok(input) });
    let refunds = Arc::new(Mutex::new(0u32));
    let counter = refunds.clone();
    engine.compensation_registry().register(
        "charge",
        FnCompensation::new(move |_| {
            let counter = counter.clone();
            async move {
                *counter.lock() += 1;
                Ok(())
            }
        }),
    );

    engine.deploy(&ctx, &document).await.unwrap();
    let instance = engine
        .execute(&ctx, "refundable", Variables::new())
        .await
        .unwrap();

    let result = engine
        .rollback(
            instance.execution_id,
            RollbackReason::user_requested("changed their mind"),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(*refunds.lock(), 1);

    let status = engine.execution_status(instance.execution_id).await.unwrap();
    assert_eq!(status.state, InstanceState::Cancelled);
}
