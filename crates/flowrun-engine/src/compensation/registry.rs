//! Compensation handler registry
//!
//! Two keyed tables: one by binding key (`"payment"`,
//! `"inventory-reserve"`, …) registered at startup, one by
//! `"{execution_id}:{node_id}"` registered while an instance runs. The
//! per-node table takes precedence. Both are process-local: per-node
//! registrations do not survive a restart, binding-key handlers must be
//! re-registered deterministically at startup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::EngineError;
use flowrun_graph::{GraphNode, NodeConfig};

/// What a compensation handler receives
#[derive(Debug, Clone)]
pub struct CompensationContext {
    pub execution_id: Uuid,
    pub node_id: String,

    /// The node's binding key (see [`binding_key`])
    pub node_type: Option<String>,

    /// JSON text of the compensated node's output snapshot
    pub original_output: Option<String>,
}

/// The user-supplied inverse of a node's side effect
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), EngineError>;
}

/// The key compensation handlers are registered and resolved by: the
/// service name for service tasks, the ruleflow group for rule tasks,
/// the node-type wire name otherwise.
pub fn binding_key(node: &GraphNode) -> String {
    match &node.config {
        NodeConfig::Service {
            service_name: Some(name),
            ..
        } => name.clone(),
        NodeConfig::Rule {
            ruleflow_group: Some(group),
            ..
        } => group.clone(),
        _ => node.node_type.as_str().to_string(),
    }
}

type CompensationFn = Box<
    dyn Fn(
            CompensationContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>>
        + Send
        + Sync,
>;

/// Adapter turning an async closure into a [`CompensationHandler`]
pub struct FnCompensation {
    f: CompensationFn,
}

impl FnCompensation {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(CompensationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        Arc::new(Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        })
    }
}

#[async_trait]
impl CompensationHandler for FnCompensation {
    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), EngineError> {
        (self.f)(ctx.clone()).await
    }
}

/// Registry of compensation handlers
#[derive(Default)]
pub struct CompensationRegistry {
    by_key: DashMap<String, Arc<dyn CompensationHandler>>,
    by_node: DashMap<String, Arc<dyn CompensationHandler>>,
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_key(execution_id: Uuid, node_id: &str) -> String {
        format!("{execution_id}:{node_id}")
    }

    /// Register a handler for every node with the given binding key
    pub fn register(&self, key: impl Into<String>, handler: Arc<dyn CompensationHandler>) {
        self.by_key.insert(key.into(), handler);
    }

    /// Register a handler for one node of one execution; overrides any
    /// binding-key handler
    pub fn register_for_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        handler: Arc<dyn CompensationHandler>,
    ) {
        self.by_node
            .insert(Self::node_key(execution_id, node_id), handler);
    }

    /// Remove a per-node registration
    pub fn deregister_node(&self, execution_id: Uuid, node_id: &str) {
        self.by_node.remove(&Self::node_key(execution_id, node_id));
    }

    /// Resolve a handler; per-node beats binding-key
    pub fn resolve(
        &self,
        execution_id: Uuid,
        node_id: &str,
        key: Option<&str>,
    ) -> Option<Arc<dyn CompensationHandler>> {
        if let Some(handler) = self.by_node.get(&Self::node_key(execution_id, node_id)) {
            return Some(handler.value().clone());
        }
        key.and_then(|k| self.by_key.get(k).map(|h| h.value().clone()))
    }

    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.by_key.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_graph::NodeType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Arc<FnCompensation> {
        FnCompensation::new(|_ctx| async { Ok(()) })
    }

    #[test]
    fn test_binding_key_per_node_shape() {
        let service = GraphNode {
            id: "n1".into(),
            name: "charge".into(),
            node_type: NodeType::ServiceTask,
            config: NodeConfig::Service {
                service_name: Some("payment".into()),
                service_method: None,
                input_mappings: Default::default(),
                output_mappings: Default::default(),
                retry_policy: None,
            },
        };
        assert_eq!(binding_key(&service), "payment");

        let rule = GraphNode {
            id: "n2".into(),
            name: "price".into(),
            node_type: NodeType::BusinessRuleTask,
            config: NodeConfig::Rule {
                rule_file: Some("pricing.rules".into()),
                ruleflow_group: Some("pricing".into()),
                input_mappings: Default::default(),
                output_mappings: Default::default(),
            },
        };
        assert_eq!(binding_key(&rule), "pricing");

        let task = GraphNode {
            id: "n3".into(),
            name: "t".into(),
            node_type: NodeType::Task,
            config: NodeConfig::None,
        };
        assert_eq!(binding_key(&task), "TASK");
    }

    #[test]
    fn test_per_node_beats_binding_key() {
        let registry = CompensationRegistry::new();
        let execution_id = Uuid::now_v7();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_node = calls.clone();
        let node_handler = FnCompensation::new(move |_| {
            let calls = calls_node.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        registry.register("payment", noop());
        registry.register_for_node(execution_id, "n1", node_handler);

        let resolved = registry
            .resolve(execution_id, "n1", Some("payment"))
            .unwrap();
        tokio_test::block_on(resolved.compensate(&CompensationContext {
            execution_id,
            node_id: "n1".into(),
            node_type: Some("payment".into()),
            original_output: None,
        }))
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolution_falls_back_to_key() {
        let registry = CompensationRegistry::new();
        registry.register("payment", noop());

        assert!(registry
            .resolve(Uuid::now_v7(), "n1", Some("payment"))
            .is_some());
        assert!(registry
            .resolve(Uuid::now_v7(), "n1", Some("inventory"))
            .is_none());
        assert!(registry.resolve(Uuid::now_v7(), "n1", None).is_none());
    }

    #[test]
    fn test_deregister_node() {
        let registry = CompensationRegistry::new();
        let execution_id = Uuid::now_v7();
        registry.register_for_node(execution_id, "n1", noop());
        assert!(registry.resolve(execution_id, "n1", None).is_some());

        registry.deregister_node(execution_id, "n1");
        assert!(registry.resolve(execution_id, "n1", None).is_none());
    }
}
