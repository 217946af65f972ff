//! Explicit request context threaded through call sites
//!
//! Tenancy is never ambient: every inbound operation carries a
//! `TenantContext` and the engine passes it down to the state manager and
//! event store for row-level isolation.

use serde::{Deserialize, Serialize};

/// Tenant the default header value maps to
pub const DEFAULT_TENANT: &str = "default";

/// Per-request context: tenant plus optional correlation metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,

    /// Correlates audit entries across services
    pub correlation_id: Option<String>,

    /// Who triggered the operation; defaults to the process identity
    pub actor: Option<String>,
}

impl Default for TenantContext {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT)
    }
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            correlation_id: None,
            actor: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}
