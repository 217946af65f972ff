//! Named-callable and rule-engine registries
//!
//! Service tasks bind to callables by name through an explicit registry
//! populated at startup — no reflection, no method-name strings beyond the
//! registry key. The rule engine is an external collaborator behind a
//! trait; only its contract lives here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::EngineError;
use flowrun_graph::Variables;

/// A named callable invoked by service tasks
#[async_trait]
pub trait ServiceCall: Send + Sync {
    async fn invoke(&self, input: Variables) -> Result<Variables, EngineError>;
}

type ServiceFn = Box<
    dyn Fn(Variables) -> Pin<Box<dyn Future<Output = Result<Variables, EngineError>> + Send>>
        + Send
        + Sync,
>;

struct FnServiceCall {
    f: ServiceFn,
}

#[async_trait]
impl ServiceCall for FnServiceCall {
    async fn invoke(&self, input: Variables) -> Result<Variables, EngineError> {
        (self.f)(input).await
    }
}

/// Registry of named callables, populated at startup
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<dyn ServiceCall>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, service: Arc<dyn ServiceCall>) {
        self.services.insert(name.into(), service);
    }

    /// Register an async closure as a callable
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Variables) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Variables, EngineError>> + Send + 'static,
    {
        self.register(
            name,
            Arc::new(FnServiceCall {
                f: Box::new(move |input| Box::pin(f(input))),
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceCall>> {
        self.services.get(name).map(|s| s.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// The external rule-engine contract: load a rule file, run a ruleflow
/// group over the inputs, return the produced outputs
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn evaluate(
        &self,
        rule_file: &str,
        ruleflow_group: &str,
        inputs: Variables,
    ) -> Result<Variables, EngineError>;
}

/// Stand-in rule engine that echoes its inputs; wired when no production
/// engine is configured
pub struct PassthroughRuleEngine;

#[async_trait]
impl RuleEngine for PassthroughRuleEngine {
    async fn evaluate(
        &self,
        _rule_file: &str,
        _ruleflow_group: &str,
        inputs: Variables,
    ) -> Result<Variables, EngineError> {
        Ok(inputs)
    }
}
