//! In-memory implementation of the store traits
//!
//! Same semantics as the PostgreSQL implementation — sequence derivation,
//! idempotency-hit behavior, optimistic row versions, lease expiry — with
//! all data behind process-local locks. Primarily for tests and
//! single-process embedding.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::store::*;
use crate::event::{EventDraft, EventStatus, ExecutionEvent};
use crate::instance::{AuditEntry, DeployedDefinition, NodeExecution, WorkflowInstance};

/// In-memory store with PostgreSQL-equivalent semantics
///
/// # Example
///
/// ```
/// use flowrun_engine::persistence::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
pub struct InMemoryStore {
    definitions: RwLock<Vec<DeployedDefinition>>,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    node_executions: RwLock<HashMap<Uuid, Vec<NodeExecution>>>,
    events: RwLock<HashMap<Uuid, Vec<ExecutionEvent>>>,

    /// event id → owning execution id
    event_index: RwLock<HashMap<Uuid, Uuid>>,

    /// idempotency key → event id
    key_index: RwLock<HashMap<String, Uuid>>,

    audit: RwLock<HashMap<Uuid, Vec<AuditEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            instances: RwLock::new(HashMap::new()),
            node_executions: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            event_index: RwLock::new(HashMap::new()),
            key_index: RwLock::new(HashMap::new()),
            audit: RwLock::new(HashMap::new()),
        }
    }

    /// Number of events recorded for an execution (for tests)
    pub fn event_count(&self, execution_id: Uuid) -> usize {
        self.events.read().get(&execution_id).map_or(0, Vec::len)
    }

    /// Number of node-execution rows for an execution (for tests)
    pub fn node_execution_count(&self, execution_id: Uuid) -> usize {
        self.node_executions
            .read()
            .get(&execution_id)
            .map_or(0, Vec::len)
    }

    /// Number of instances (for tests)
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Clear all data (for tests)
    pub fn clear(&self) {
        self.definitions.write().clear();
        self.instances.write().clear();
        self.node_executions.write().clear();
        self.events.write().clear();
        self.event_index.write().clear();
        self.key_index.write().clear();
        self.audit.write().clear();
    }

    fn find_event_mut<'a>(
        events: &'a mut HashMap<Uuid, Vec<ExecutionEvent>>,
        event_index: &HashMap<Uuid, Uuid>,
        event_id: Uuid,
    ) -> Result<&'a mut ExecutionEvent, StoreError> {
        let execution_id = event_index
            .get(&event_id)
            .copied()
            .ok_or(StoreError::EventNotFound(event_id))?;
        events
            .get_mut(&execution_id)
            .and_then(|list| list.iter_mut().find(|e| e.id == event_id))
            .ok_or(StoreError::EventNotFound(event_id))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStore {
    async fn insert_definition(&self, definition: DeployedDefinition) -> Result<(), StoreError> {
        let mut definitions = self.definitions.write();
        let exists = definitions.iter().any(|d| {
            d.workflow_id == definition.workflow_id
                && d.version == definition.version
                && d.tenant_id == definition.tenant_id
        });
        if exists {
            return Err(StoreError::DefinitionAlreadyExists {
                workflow_id: definition.workflow_id,
                version: definition.version,
            });
        }
        definitions.push(definition);
        Ok(())
    }

    async fn definition(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        version: i64,
    ) -> Result<DeployedDefinition, StoreError> {
        self.definitions
            .read()
            .iter()
            .find(|d| {
                d.tenant_id == tenant_id && d.workflow_id == workflow_id && d.version == version
            })
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound {
                workflow_id: workflow_id.to_string(),
                version: Some(version),
            })
    }

    async fn latest_active(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<DeployedDefinition, StoreError> {
        self.definitions
            .read()
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.workflow_id == workflow_id && d.active)
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound {
                workflow_id: workflow_id.to_string(),
                version: None,
            })
    }

    async fn next_version(&self, tenant_id: &str, workflow_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .definitions
            .read()
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.workflow_id == workflow_id)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn list_definitions(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<DeployedDefinition>, StoreError> {
        let mut list: Vec<_> = self
            .definitions
            .read()
            .iter()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.deployed_at.cmp(&a.deployed_at));
        Ok(list)
    }
}

#[async_trait]
impl InstanceStore for InMemoryStore {
    async fn insert_instance(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        self.instances
            .write()
            .insert(instance.execution_id, instance);
        Ok(())
    }

    async fn instance(&self, execution_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(execution_id))
    }

    async fn update_instance(
        &self,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(&instance.execution_id)
            .ok_or(StoreError::InstanceNotFound(instance.execution_id))?;

        if stored.row_version != instance.row_version {
            return Err(StoreError::ConcurrencyConflict {
                expected: instance.row_version,
                actual: stored.row_version,
            });
        }

        instance.row_version += 1;
        *stored = instance.clone();
        Ok(instance)
    }

    async fn try_acquire_lease(
        &self,
        execution_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&execution_id)
            .ok_or(StoreError::InstanceNotFound(execution_id))?;

        let now = Utc::now();
        let expired = instance.lease_acquired_at.map_or(true, |acquired| {
            now - acquired > ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(300))
        });

        let claimable = match instance.lease_owner.as_deref() {
            None => true,
            Some(current) => current == owner || expired,
        };

        if claimable {
            instance.lease_owner = Some(owner.to_string());
            instance.lease_acquired_at = Some(now);
            instance.row_version += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lease(&self, execution_id: Uuid, owner: &str) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&execution_id)
            .ok_or(StoreError::InstanceNotFound(execution_id))?;

        if instance.lease_owner.as_deref() == Some(owner) {
            instance.lease_owner = None;
            instance.lease_acquired_at = None;
            instance.row_version += 1;
        }
        Ok(())
    }

    async fn insert_node_execution(&self, record: NodeExecution) -> Result<(), StoreError> {
        self.node_executions
            .write()
            .entry(record.execution_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn update_node_execution(&self, record: NodeExecution) -> Result<(), StoreError> {
        let mut executions = self.node_executions.write();
        let list = executions
            .get_mut(&record.execution_id)
            .ok_or(StoreError::NodeExecutionNotFound(record.id))?;
        let stored = list
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(StoreError::NodeExecutionNotFound(record.id))?;
        *stored = record;
        Ok(())
    }

    async fn node_executions(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        Ok(self
            .node_executions
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn node_executions_for_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        Ok(self
            .node_executions
            .read()
            .get(&execution_id)
            .map(|list| {
                list.iter()
                    .filter(|r| r.node_id == node_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.audit
            .write()
            .entry(entry.execution_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn audit_trail(&self, execution_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .audit
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        draft: EventDraft,
    ) -> Result<ExecutionEvent, StoreError> {
        // Lock order: events, then indices. Held together so sequence
        // derivation, the idempotency check and the insert are one atomic
        // step, matching the row-locked transaction in Postgres.
        let mut events = self.events.write();
        let mut event_index = self.event_index.write();
        let mut key_index = self.key_index.write();

        let list = events.entry(execution_id).or_default();
        let sequence = list.iter().map(|e| e.sequence_number).max().unwrap_or(0) + 1;

        let event_type = draft.event_type();
        let key = draft
            .idempotency_key
            .clone()
            .unwrap_or_else(|| ExecutionEvent::canonical_key(execution_id, sequence, event_type));

        if let Some(existing_id) = key_index.get(&key) {
            let existing = list
                .iter()
                .find(|e| e.id == *existing_id)
                .cloned()
                .ok_or(StoreError::EventNotFound(*existing_id))?;
            return Ok(existing);
        }

        let event = ExecutionEvent {
            id: Uuid::now_v7(),
            execution_id,
            tenant_id: tenant_id.to_string(),
            sequence_number: sequence,
            event_type,
            status: draft.status.unwrap_or(EventStatus::Completed),
            node_id: draft.node_id,
            node_type: draft.node_type,
            edge_taken: draft.edge_taken,
            timestamp: Utc::now(),
            duration_ms: draft.duration_ms,
            input_snapshot: draft.input_snapshot,
            output_snapshot: draft.output_snapshot,
            variables_snapshot: draft.variables_snapshot,
            error_message: draft.error_message,
            error_snapshot: draft.error_snapshot,
            decision_result: draft.decision_result,
            transaction_id: draft.transaction_id,
            idempotency_key: key.clone(),
            compensated_by: None,
        };

        event_index.insert(event.id, execution_id);
        key_index.insert(key, event.id);
        list.push(event.clone());
        Ok(event)
    }

    async fn timeline(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        let mut list = self
            .events
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by_key(|e| e.sequence_number);
        Ok(list)
    }

    async fn timeline_range(
        &self,
        execution_id: Uuid,
        start: i64,
        end: i64,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let mut list: Vec<_> = self
            .events
            .read()
            .get(&execution_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence_number >= start && e.sequence_number <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by_key(|e| e.sequence_number);
        Ok(list)
    }

    async fn last_event(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .get(&execution_id)
            .and_then(|list| list.iter().max_by_key(|e| e.sequence_number).cloned()))
    }

    async fn events_by_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let mut list: Vec<_> = self
            .events
            .read()
            .get(&execution_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.node_id.as_deref() == Some(node_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by_key(|e| e.sequence_number);
        Ok(list)
    }

    async fn events_by_status(
        &self,
        execution_id: Uuid,
        status: EventStatus,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let mut list: Vec<_> = self
            .events
            .read()
            .get(&execution_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by_key(|e| e.sequence_number);
        Ok(list)
    }

    async fn event(&self, event_id: Uuid) -> Result<ExecutionEvent, StoreError> {
        let event_index = self.event_index.read();
        let execution_id = event_index
            .get(&event_id)
            .copied()
            .ok_or(StoreError::EventNotFound(event_id))?;
        self.events
            .read()
            .get(&execution_id)
            .and_then(|list| list.iter().find(|e| e.id == event_id).cloned())
            .ok_or(StoreError::EventNotFound(event_id))
    }

    async fn exists_by_idempotency_key(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.key_index.read().contains_key(key))
    }

    async fn mark_completed(
        &self,
        event_id: Uuid,
        duration_ms: i64,
        output_snapshot: Option<Value>,
    ) -> Result<ExecutionEvent, StoreError> {
        let mut events = self.events.write();
        let event_index = self.event_index.read();
        let event = Self::find_event_mut(&mut events, &event_index, event_id)?;

        if event.status.is_terminal() {
            return Err(StoreError::EventAlreadyTerminal(event_id));
        }

        event.status = EventStatus::Completed;
        event.duration_ms = Some(duration_ms);
        if output_snapshot.is_some() {
            event.output_snapshot = output_snapshot;
        }
        Ok(event.clone())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error_message: &str,
        error_snapshot: Option<Value>,
    ) -> Result<ExecutionEvent, StoreError> {
        let mut events = self.events.write();
        let event_index = self.event_index.read();
        let event = Self::find_event_mut(&mut events, &event_index, event_id)?;

        if event.status.is_terminal() {
            return Err(StoreError::EventAlreadyTerminal(event_id));
        }

        event.status = EventStatus::Failed;
        event.error_message = Some(error_message.to_string());
        if error_snapshot.is_some() {
            event.error_snapshot = error_snapshot;
        }
        Ok(event.clone())
    }

    async fn mark_compensated(
        &self,
        event_id: Uuid,
        compensation_event_id: Uuid,
    ) -> Result<ExecutionEvent, StoreError> {
        let mut events = self.events.write();
        let event_index = self.event_index.read();
        let event = Self::find_event_mut(&mut events, &event_index, event_id)?;

        if event.status != EventStatus::Completed {
            return Err(StoreError::EventAlreadyTerminal(event_id));
        }

        event.status = EventStatus::Compensated;
        event.compensated_by = Some(compensation_event_id);
        Ok(event.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use flowrun_graph::Variables;

    fn instance(execution_id: Uuid) -> WorkflowInstance {
        WorkflowInstance::new(execution_id, "wf", 1, "default", Variables::new())
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one_and_increments() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();

        let first = store
            .append(execution_id, "default", EventDraft::new(EventType::WorkflowStarted))
            .await
            .unwrap();
        let second = store
            .append(execution_id, "default", EventDraft::new(EventType::NodeStarted))
            .await
            .unwrap();

        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_idempotency_hit_returns_existing_row() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();

        let first = store
            .append(
                execution_id,
                "default",
                EventDraft::new(EventType::NodeCompleted).with_idempotency_key("fixed-key"),
            )
            .await
            .unwrap();
        let second = store
            .append(
                execution_id,
                "default",
                EventDraft::new(EventType::NodeCompleted).with_idempotency_key("fixed-key"),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.event_count(execution_id), 1);
    }

    #[tokio::test]
    async fn test_canonical_key_shape() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();

        let event = store
            .append(execution_id, "default", EventDraft::new(EventType::WorkflowStarted))
            .await
            .unwrap();
        assert_eq!(
            event.idempotency_key,
            format!("{execution_id}:1:WORKFLOW_STARTED")
        );
        assert!(store
            .exists_by_idempotency_key(&event.idempotency_key)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_mark_completed_then_remark_fails() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();

        let event = store
            .append(
                execution_id,
                "default",
                EventDraft::new(EventType::NodeStarted).in_progress(),
            )
            .await
            .unwrap();

        let updated = store
            .mark_completed(event.id, 42, Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(updated.status, EventStatus::Completed);
        assert_eq!(updated.duration_ms, Some(42));

        let again = store.mark_failed(event.id, "boom", None).await;
        assert!(matches!(again, Err(StoreError::EventAlreadyTerminal(_))));
    }

    #[tokio::test]
    async fn test_mark_compensated_requires_completed() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();

        let in_progress = store
            .append(
                execution_id,
                "default",
                EventDraft::new(EventType::NodeStarted).in_progress(),
            )
            .await
            .unwrap();
        assert!(matches!(
            store.mark_compensated(in_progress.id, Uuid::now_v7()).await,
            Err(StoreError::EventAlreadyTerminal(_))
        ));

        let completed = store
            .append(execution_id, "default", EventDraft::new(EventType::NodeCompleted))
            .await
            .unwrap();
        let comp_id = Uuid::now_v7();
        let updated = store.mark_compensated(completed.id, comp_id).await.unwrap();
        assert_eq!(updated.status, EventStatus::Compensated);
        assert_eq!(updated.compensated_by, Some(comp_id));
    }

    #[tokio::test]
    async fn test_timeline_queries() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();

        for event_type in [
            EventType::WorkflowStarted,
            EventType::NodeStarted,
            EventType::NodeCompleted,
            EventType::WorkflowCompleted,
        ] {
            store
                .append(
                    execution_id,
                    "default",
                    EventDraft::new(event_type).with_node_id("n1"),
                )
                .await
                .unwrap();
        }

        let all = store.timeline(execution_id).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(
            all.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );

        let range = store.timeline_range(execution_id, 2, 3).await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].event_type, EventType::NodeStarted);

        let last = store.last_event(execution_id).await.unwrap().unwrap();
        assert_eq!(last.event_type, EventType::WorkflowCompleted);

        let by_node = store.events_by_node(execution_id, "n1").await.unwrap();
        assert_eq!(by_node.len(), 4);
    }

    #[tokio::test]
    async fn test_instance_optimistic_concurrency() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();
        store.insert_instance(instance(execution_id)).await.unwrap();

        let loaded = store.instance(execution_id).await.unwrap();
        let updated = store.update_instance(loaded.clone()).await.unwrap();
        assert_eq!(updated.row_version, 1);

        // Writing through the stale copy loses.
        let stale = store.update_instance(loaded).await;
        assert!(matches!(
            stale,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_lease_mutual_exclusion() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();
        store.insert_instance(instance(execution_id)).await.unwrap();

        let ttl = Duration::from_secs(300);
        assert!(store
            .try_acquire_lease(execution_id, "replica-a", ttl)
            .await
            .unwrap());
        assert!(!store
            .try_acquire_lease(execution_id, "replica-b", ttl)
            .await
            .unwrap());

        // Re-entrant for the same owner.
        assert!(store
            .try_acquire_lease(execution_id, "replica-a", ttl)
            .await
            .unwrap());

        store
            .release_lease(execution_id, "replica-a")
            .await
            .unwrap();
        assert!(store
            .try_acquire_lease(execution_id, "replica-b", ttl)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();
        store.insert_instance(instance(execution_id)).await.unwrap();

        assert!(store
            .try_acquire_lease(execution_id, "replica-a", Duration::from_secs(300))
            .await
            .unwrap());

        // With a zero TTL the lease is immediately stale.
        assert!(store
            .try_acquire_lease(execution_id, "replica-b", Duration::ZERO)
            .await
            .unwrap());

        let stored = store.instance(execution_id).await.unwrap();
        assert_eq!(stored.lease_owner.as_deref(), Some("replica-b"));
    }

    #[tokio::test]
    async fn test_stale_release_is_noop() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();
        store.insert_instance(instance(execution_id)).await.unwrap();

        store
            .try_acquire_lease(execution_id, "replica-a", Duration::from_secs(300))
            .await
            .unwrap();
        store
            .release_lease(execution_id, "replica-b")
            .await
            .unwrap();

        let stored = store.instance(execution_id).await.unwrap();
        assert_eq!(stored.lease_owner.as_deref(), Some("replica-a"));
    }

    #[tokio::test]
    async fn test_definition_versioning() {
        let store = InMemoryStore::new();
        let make = |version: i64, active: bool| DeployedDefinition {
            id: Uuid::now_v7(),
            workflow_id: "orders".into(),
            version,
            tenant_id: "default".into(),
            name: "Orders".into(),
            document: serde_json::json!({}),
            active,
            deployed_at: Utc::now(),
        };

        assert_eq!(store.next_version("default", "orders").await.unwrap(), 1);
        store.insert_definition(make(1, true)).await.unwrap();
        store.insert_definition(make(2, true)).await.unwrap();
        store.insert_definition(make(3, false)).await.unwrap();

        assert_eq!(store.next_version("default", "orders").await.unwrap(), 4);
        let latest = store.latest_active("default", "orders").await.unwrap();
        assert_eq!(latest.version, 2);

        let dup = store.insert_definition(make(2, true)).await;
        assert!(matches!(
            dup,
            Err(StoreError::DefinitionAlreadyExists { version: 2, .. })
        ));

        // Other tenants see nothing.
        assert!(store.latest_active("acme", "orders").await.is_err());
    }

    #[tokio::test]
    async fn test_node_execution_rows() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::now_v7();

        let mut record = NodeExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: "n1".into(),
            node_type: "TASK".into(),
            state: crate::instance::NodeExecutionState::Running,
            attempt_number: 1,
            executed_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            input_variables: None,
            output_variables: None,
            error_message: None,
            executed_by: "host-1".into(),
        };
        store.insert_node_execution(record.clone()).await.unwrap();

        record.state = crate::instance::NodeExecutionState::Completed;
        record.completed_at = Some(Utc::now());
        store.update_node_execution(record.clone()).await.unwrap();

        let rows = store
            .node_executions_for_node(execution_id, "n1")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, crate::instance::NodeExecutionState::Completed);
    }
}
