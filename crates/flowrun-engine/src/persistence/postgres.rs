//! PostgreSQL implementation of the store traits
//!
//! Production persistence: the instance row is the lock anchor — sequence
//! derivation and lease claims run inside a transaction holding
//! `SELECT … FOR UPDATE` on it, and the unique constraint on
//! `execution_events.idempotency_key` backstops concurrent appenders.
//!
//! Logical tables: `workflow_definitions`, `workflow_instances`,
//! `node_executions`, `execution_events`, `execution_audit_log`. Schema
//! migrations are owned by the deployment, not this crate.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::event::{EventDraft, EventStatus, EventType, ExecutionEvent};
use crate::instance::{
    AuditEntry, DeployedDefinition, InstanceState, NodeExecution, NodeExecutionState,
    WorkflowInstance,
};

/// PostgreSQL-backed store over a connection pool
///
/// # Example
///
/// ```ignore
/// use flowrun_engine::persistence::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowrun").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown enum value `{raw}`")))
}

fn variables_from(value: Value) -> flowrun_graph::Variables {
    match value {
        Value::Object(map) => map,
        _ => flowrun_graph::Variables::new(),
    }
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowInstance, StoreError> {
    let state: String = row.get("state");
    Ok(WorkflowInstance {
        execution_id: row.get("execution_id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        tenant_id: row.get("tenant_id"),
        state: parse_enum::<InstanceState>(&state)?,
        current_node_id: row.get("current_node_id"),
        variables: variables_from(row.get("variables")),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        failure_message: row.get("failure_message"),
        failed_node_id: row.get("failed_node_id"),
        retry_count: row.get("retry_count"),
        lease_owner: row.get("lease_owner"),
        lease_acquired_at: row.get("lease_acquired_at"),
        row_version: row.get("row_version"),
    })
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<ExecutionEvent, StoreError> {
    let event_type: String = row.get("event_type");
    let status: String = row.get("status");
    Ok(ExecutionEvent {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        tenant_id: row.get("tenant_id"),
        sequence_number: row.get("sequence_number"),
        event_type: parse_enum::<EventType>(&event_type)?,
        status: parse_enum::<EventStatus>(&status)?,
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        edge_taken: row.get("edge_taken"),
        timestamp: row.get("timestamp"),
        duration_ms: row.get("duration_ms"),
        input_snapshot: row.get("input_snapshot"),
        output_snapshot: row.get("output_snapshot"),
        variables_snapshot: row.get("variables_snapshot"),
        error_message: row.get("error_message"),
        error_snapshot: row.get("error_snapshot"),
        decision_result: row.get("decision_result"),
        transaction_id: row.get("transaction_id"),
        idempotency_key: row.get("idempotency_key"),
        compensated_by: row.get("compensated_by"),
    })
}

fn node_execution_from_row(row: &sqlx::postgres::PgRow) -> Result<NodeExecution, StoreError> {
    let state: String = row.get("state");
    Ok(NodeExecution {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        state: parse_enum::<NodeExecutionState>(&state)?,
        attempt_number: row.get("attempt_number"),
        executed_at: row.get("executed_at"),
        completed_at: row.get("completed_at"),
        duration_ms: row.get("duration_ms"),
        input_variables: row.get("input_variables"),
        output_variables: row.get("output_variables"),
        error_message: row.get("error_message"),
        executed_by: row.get("executed_by"),
    })
}

fn definition_from_row(row: &sqlx::postgres::PgRow) -> DeployedDefinition {
    DeployedDefinition {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        document: row.get("document"),
        active: row.get("active"),
        deployed_at: row.get("deployed_at"),
    }
}

const EVENT_COLUMNS: &str = "id, execution_id, tenant_id, sequence_number, event_type, status, \
     node_id, node_type, edge_taken, timestamp, duration_ms, input_snapshot, output_snapshot, \
     variables_snapshot, error_message, error_snapshot, decision_result, transaction_id, \
     idempotency_key, compensated_by";

#[async_trait]
impl DefinitionStore for PostgresStore {
    #[instrument(skip(self, definition), fields(workflow_id = %definition.workflow_id, version = definition.version))]
    async fn insert_definition(&self, definition: DeployedDefinition) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_definitions
                (id, workflow_id, version, tenant_id, name, document, active, deployed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (workflow_id, version, tenant_id) DO NOTHING
            "#,
        )
        .bind(definition.id)
        .bind(&definition.workflow_id)
        .bind(definition.version)
        .bind(&definition.tenant_id)
        .bind(&definition.name)
        .bind(&definition.document)
        .bind(definition.active)
        .bind(definition.deployed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DefinitionAlreadyExists {
                workflow_id: definition.workflow_id,
                version: definition.version,
            });
        }

        debug!("deployed definition");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn definition(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        version: i64,
    ) -> Result<DeployedDefinition, StoreError> {
        sqlx::query(
            r#"
            SELECT id, workflow_id, version, tenant_id, name, document, active, deployed_at
            FROM workflow_definitions
            WHERE tenant_id = $1 AND workflow_id = $2 AND version = $3
            "#,
        )
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| definition_from_row(&row))
        .ok_or_else(|| StoreError::DefinitionNotFound {
            workflow_id: workflow_id.to_string(),
            version: Some(version),
        })
    }

    #[instrument(skip(self))]
    async fn latest_active(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<DeployedDefinition, StoreError> {
        sqlx::query(
            r#"
            SELECT id, workflow_id, version, tenant_id, name, document, active, deployed_at
            FROM workflow_definitions
            WHERE tenant_id = $1 AND workflow_id = $2 AND active
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| definition_from_row(&row))
        .ok_or_else(|| StoreError::DefinitionNotFound {
            workflow_id: workflow_id.to_string(),
            version: None,
        })
    }

    #[instrument(skip(self))]
    async fn next_version(&self, tenant_id: &str, workflow_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1 AS next_version
            FROM workflow_definitions
            WHERE tenant_id = $1 AND workflow_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("next_version"))
    }

    #[instrument(skip(self))]
    async fn list_definitions(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<DeployedDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, version, tenant_id, name, document, active, deployed_at
            FROM workflow_definitions
            WHERE tenant_id = $1
            ORDER BY deployed_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(definition_from_row).collect())
    }
}

#[async_trait]
impl InstanceStore for PostgresStore {
    #[instrument(skip(self, instance), fields(execution_id = %instance.execution_id))]
    async fn insert_instance(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (execution_id, workflow_id, version, tenant_id, state, current_node_id,
                 variables, created_at, started_at, completed_at, failure_message,
                 failed_node_id, retry_count, lease_owner, lease_acquired_at, row_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(instance.execution_id)
        .bind(&instance.workflow_id)
        .bind(instance.version)
        .bind(&instance.tenant_id)
        .bind(instance.state.as_str())
        .bind(&instance.current_node_id)
        .bind(Value::Object(instance.variables.clone()))
        .bind(instance.created_at)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(&instance.failure_message)
        .bind(&instance.failed_node_id)
        .bind(instance.retry_count)
        .bind(&instance.lease_owner)
        .bind(instance.lease_acquired_at)
        .bind(instance.row_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to insert instance: {}", e);
            db_err(e)
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn instance(&self, execution_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(
            r#"SELECT * FROM workflow_instances WHERE execution_id = $1"#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::InstanceNotFound(execution_id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self, instance), fields(execution_id = %instance.execution_id))]
    async fn update_instance(
        &self,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let expected = instance.row_version;
        instance.row_version += 1;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = $2, current_node_id = $3, variables = $4, started_at = $5,
                completed_at = $6, failure_message = $7, failed_node_id = $8,
                retry_count = $9, lease_owner = $10, lease_acquired_at = $11,
                row_version = $12
            WHERE execution_id = $1 AND row_version = $13
            "#,
        )
        .bind(instance.execution_id)
        .bind(instance.state.as_str())
        .bind(&instance.current_node_id)
        .bind(Value::Object(instance.variables.clone()))
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(&instance.failure_message)
        .bind(&instance.failed_node_id)
        .bind(instance.retry_count)
        .bind(&instance.lease_owner)
        .bind(instance.lease_acquired_at)
        .bind(instance.row_version)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Either missing or a stale row version; disambiguate.
            let current = self.instance(instance.execution_id).await?;
            return Err(StoreError::ConcurrencyConflict {
                expected,
                actual: current.row_version,
            });
        }

        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn try_acquire_lease(
        &self,
        execution_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT lease_owner, lease_acquired_at
            FROM workflow_instances
            WHERE execution_id = $1
            FOR UPDATE
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::InstanceNotFound(execution_id))?;

        let current_owner: Option<String> = row.get("lease_owner");
        let acquired_at: Option<DateTime<Utc>> = row.get("lease_acquired_at");

        let now = Utc::now();
        let expired = acquired_at.map_or(true, |at| {
            now.signed_duration_since(at).num_seconds() as u64 >= ttl.as_secs()
        });
        let claimable = match current_owner.as_deref() {
            None => true,
            Some(current) => current == owner || expired,
        };

        if claimable {
            sqlx::query(
                r#"
                UPDATE workflow_instances
                SET lease_owner = $2, lease_acquired_at = $3, row_version = row_version + 1
                WHERE execution_id = $1
                "#,
            )
            .bind(execution_id)
            .bind(owner)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(%execution_id, claimable, "lease attempt");
        Ok(claimable)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, execution_id: Uuid, owner: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_owner = NULL, lease_acquired_at = NULL, row_version = row_version + 1
            WHERE execution_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(execution_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(execution_id = %record.execution_id, node_id = %record.node_id))]
    async fn insert_node_execution(&self, record: NodeExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO node_executions
                (id, execution_id, node_id, node_type, state, attempt_number, executed_at,
                 completed_at, duration_ms, input_variables, output_variables,
                 error_message, executed_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(record.execution_id)
        .bind(&record.node_id)
        .bind(&record.node_type)
        .bind(record.state.as_str())
        .bind(record.attempt_number)
        .bind(record.executed_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(&record.input_variables)
        .bind(&record.output_variables)
        .bind(&record.error_message)
        .bind(&record.executed_by)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn update_node_execution(&self, record: NodeExecution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE node_executions
            SET state = $2, completed_at = $3, duration_ms = $4, output_variables = $5,
                error_message = $6
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.state.as_str())
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(&record.output_variables)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NodeExecutionNotFound(record.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn node_executions(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM node_executions
            WHERE execution_id = $1
            ORDER BY executed_at, attempt_number
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(node_execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn node_executions_for_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM node_executions
            WHERE execution_id = $1 AND node_id = $2
            ORDER BY executed_at, attempt_number
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(node_execution_from_row).collect()
    }

    #[instrument(skip(self, entry), fields(execution_id = %entry.execution_id, action = %entry.action))]
    async fn record_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_audit_log
                (id, execution_id, tenant_id, actor, action, timestamp,
                 before_snapshot, after_snapshot, correlation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.execution_id)
        .bind(&entry.tenant_id)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(entry.timestamp)
        .bind(&entry.before_snapshot)
        .bind(&entry.after_snapshot)
        .bind(&entry.correlation_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn audit_trail(&self, execution_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_audit_log
            WHERE execution_id = $1
            ORDER BY timestamp
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                execution_id: row.get("execution_id"),
                tenant_id: row.get("tenant_id"),
                actor: row.get("actor"),
                action: row.get("action"),
                timestamp: row.get("timestamp"),
                before_snapshot: row.get("before_snapshot"),
                after_snapshot: row.get("after_snapshot"),
                correlation_id: row.get("correlation_id"),
            })
            .collect())
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    #[instrument(skip(self, draft), fields(event_type = %draft.event_type()))]
    async fn append(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        draft: EventDraft,
    ) -> Result<ExecutionEvent, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The instance row is the lock anchor for sequence derivation.
        sqlx::query(
            r#"SELECT execution_id FROM workflow_instances WHERE execution_id = $1 FOR UPDATE"#,
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_number), 0) + 1 AS next_sequence
            FROM execution_events
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let sequence: i64 = row.get("next_sequence");

        let event_type = draft.event_type();
        let key = draft
            .idempotency_key
            .clone()
            .unwrap_or_else(|| ExecutionEvent::canonical_key(execution_id, sequence, event_type));

        let existing = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM execution_events WHERE idempotency_key = $1"
        ))
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = existing {
            tx.commit().await.map_err(db_err)?;
            return event_from_row(&row);
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
            idempotency_key: key,
            compensated_by: None,
        };

        sqlx::query(
            r#"
            INSERT INTO execution_events
                (id, execution_id, tenant_id, sequence_number, event_type, status, node_id,
                 node_type, edge_taken, timestamp, duration_ms, input_snapshot, output_snapshot,
                 variables_snapshot, error_message, error_snapshot, decision_result,
                 transaction_id, idempotency_key, compensated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20)
            "#,
        )
        .bind(event.id)
        .bind(event.execution_id)
        .bind(&event.tenant_id)
        .bind(event.sequence_number)
        .bind(event.event_type.as_str())
        .bind(event.status.as_str())
        .bind(&event.node_id)
        .bind(&event.node_type)
        .bind(&event.edge_taken)
        .bind(event.timestamp)
        .bind(event.duration_ms)
        .bind(&event.input_snapshot)
        .bind(&event.output_snapshot)
        .bind(&event.variables_snapshot)
        .bind(&event.error_message)
        .bind(&event.error_snapshot)
        .bind(&event.decision_result)
        .bind(&event.transaction_id)
        .bind(&event.idempotency_key)
        .bind(event.compensated_by)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%execution_id, sequence, "appended event");
        Ok(event)
    }

    #[instrument(skip(self))]
    async fn timeline(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM execution_events \
             WHERE execution_id = $1 ORDER BY sequence_number"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn timeline_range(
        &self,
        execution_id: Uuid,
        start: i64,
        end: i64,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM execution_events \
             WHERE execution_id = $1 AND sequence_number BETWEEN $2 AND $3 \
             ORDER BY sequence_number"
        ))
        .bind(execution_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn last_event(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM execution_events \
             WHERE execution_id = $1 ORDER BY sequence_number DESC LIMIT 1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(event_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn events_by_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM execution_events \
             WHERE execution_id = $1 AND node_id = $2 ORDER BY sequence_number"
        ))
        .bind(execution_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn events_by_status(
        &self,
        execution_id: Uuid,
        status: EventStatus,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM execution_events \
             WHERE execution_id = $1 AND status = $2 ORDER BY sequence_number"
        ))
        .bind(execution_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn event(&self, event_id: Uuid) -> Result<ExecutionEvent, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM execution_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::EventNotFound(event_id))?;

        event_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn exists_by_idempotency_key(&self, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"SELECT EXISTS(SELECT 1 FROM execution_events WHERE idempotency_key = $1) AS hit"#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("hit"))
    }

    #[instrument(skip(self, output_snapshot))]
    async fn mark_completed(
        &self,
        event_id: Uuid,
        duration_ms: i64,
        output_snapshot: Option<Value>,
    ) -> Result<ExecutionEvent, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE execution_events \
             SET status = 'completed', duration_ms = $2, \
                 output_snapshot = COALESCE($3, output_snapshot) \
             WHERE id = $1 AND status = 'in_progress' \
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(event_id)
        .bind(duration_ms)
        .bind(&output_snapshot)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => event_from_row(&row),
            None => {
                // Distinguish "missing" from "already terminal".
                self.event(event_id).await?;
                Err(StoreError::EventAlreadyTerminal(event_id))
            }
        }
    }

    #[instrument(skip(self, error_snapshot))]
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error_message: &str,
        error_snapshot: Option<Value>,
    ) -> Result<ExecutionEvent, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE execution_events \
             SET status = 'failed', error_message = $2, \
                 error_snapshot = COALESCE($3, error_snapshot) \
             WHERE id = $1 AND status = 'in_progress' \
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(event_id)
        .bind(error_message)
        .bind(&error_snapshot)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => event_from_row(&row),
            None => {
                self.event(event_id).await?;
                Err(StoreError::EventAlreadyTerminal(event_id))
            }
        }
    }

    #[instrument(skip(self))]
    async fn mark_compensated(
        &self,
        event_id: Uuid,
        compensation_event_id: Uuid,
    ) -> Result<ExecutionEvent, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE execution_events \
             SET status = 'compensated', compensated_by = $2 \
             WHERE id = $1 AND status = 'completed' \
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(event_id)
        .bind(compensation_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => event_from_row(&row),
            None => {
                self.event(event_id).await?;
                Err(StoreError::EventAlreadyTerminal(event_id))
            }
        }
    }
}
