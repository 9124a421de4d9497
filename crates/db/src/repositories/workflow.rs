use std::collections::HashMap;

use serde::de::DeserializeOwned;
use sqlx::{Sqlite, Transaction};

use signoff_core::domain::delegation::{DelegationAuditEntry, ProxyApprovalRecord};
use signoff_core::domain::workflow::{
    InstanceId, RejectionHistoryEntry, WorkflowInstance, WorkflowStepHistory,
};
use signoff_core::ledger::LedgerEntry;
use signoff_core::workflow::{DelegationUsage, TransitionReport};

use super::codec::{column, day, from_json, payload, timestamp, to_json};
use super::{RepositoryError, WorkflowRepository};
use crate::DbPool;

pub struct SqlWorkflowRepository {
    pool: DbPool,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Instance row without the append-only records; those live in their own tables and are
/// stitched back in on load.
fn snapshot(instance: &WorkflowInstance) -> Result<String, RepositoryError> {
    let mut snapshot = instance.clone();
    snapshot.step_history.clear();
    snapshot.rejection_history.clear();
    snapshot.proxy_approvals.clear();
    to_json(&snapshot)
}

fn state_version(value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::Encode(format!("state version {value} overflows")))
}

struct InstanceRecords {
    history: HashMap<String, Vec<WorkflowStepHistory>>,
    rejections: HashMap<String, Vec<RejectionHistoryEntry>>,
    proxies: HashMap<String, Vec<ProxyApprovalRecord>>,
}

impl InstanceRecords {
    async fn load(pool: &DbPool, instance_id: Option<&InstanceId>) -> Result<Self, RepositoryError> {
        Ok(Self {
            history: load_records(pool, "workflow_step_history", instance_id).await?,
            rejections: load_records(pool, "rejection_history", instance_id).await?,
            proxies: load_records(pool, "proxy_approval_record", instance_id).await?,
        })
    }

    fn assemble(&mut self, raw_snapshot: &str) -> Result<WorkflowInstance, RepositoryError> {
        let mut instance: WorkflowInstance = from_json(raw_snapshot)?;
        let key = instance.id.0.clone();
        instance.step_history = self.history.remove(&key).unwrap_or_default();
        instance.rejection_history = self.rejections.remove(&key).unwrap_or_default();
        instance.proxy_approvals = self.proxies.remove(&key).unwrap_or_default();
        instance
            .verify_projection()
            .map_err(|reason| RepositoryError::Decode(format!("instance {key}: {reason}")))?;
        Ok(instance)
    }
}

async fn load_records<T: DeserializeOwned>(
    pool: &DbPool,
    table: &'static str,
    instance_id: Option<&InstanceId>,
) -> Result<HashMap<String, Vec<T>>, RepositoryError> {
    let sql = match instance_id {
        Some(_) => {
            format!("SELECT instance_id, payload_json FROM {table} WHERE instance_id = ? ORDER BY seq ASC")
        }
        None => format!("SELECT instance_id, payload_json FROM {table} ORDER BY seq ASC"),
    };
    let mut query = sqlx::query(&sql);
    if let Some(id) = instance_id {
        query = query.bind(&id.0);
    }
    let rows = query.fetch_all(pool).await?;

    let mut grouped: HashMap<String, Vec<T>> = HashMap::new();
    for row in &rows {
        let instance_id: String = column(row, "instance_id")?;
        grouped.entry(instance_id).or_default().push(payload(row)?);
    }
    Ok(grouped)
}

async fn write_instance(
    tx: &mut Transaction<'_, Sqlite>,
    report: &TransitionReport,
) -> Result<(), RepositoryError> {
    let instance = &report.instance;
    let snapshot = snapshot(instance)?;
    let completed_at = instance.completed_at.map(timestamp);

    let affected = match report.expected_version {
        None => sqlx::query(
            "INSERT INTO workflow_instance (id, reference_id, reference_type, category, requester_id,
                                            configuration_id, configuration_version, status,
                                            current_step_order, cycle, state_version, snapshot_json,
                                            created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&instance.id.0)
        .bind(&instance.reference_id)
        .bind(&instance.reference_type)
        .bind(instance.category.as_str())
        .bind(instance.requester_id().as_str())
        .bind(&instance.configuration_id.0)
        .bind(instance.configuration_version)
        .bind(instance.status().as_str())
        .bind(instance.current_step_order)
        .bind(instance.cycle)
        .bind(state_version(instance.state_version)?)
        .bind(&snapshot)
        .bind(timestamp(instance.created_at))
        .bind(timestamp(instance.updated_at))
        .bind(&completed_at)
        .execute(&mut **tx)
        .await?
        .rows_affected(),
        Some(expected) => sqlx::query(
            "UPDATE workflow_instance SET
                 status = ?,
                 current_step_order = ?,
                 cycle = ?,
                 state_version = ?,
                 snapshot_json = ?,
                 updated_at = ?,
                 completed_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(instance.status().as_str())
        .bind(instance.current_step_order)
        .bind(instance.cycle)
        .bind(state_version(instance.state_version)?)
        .bind(&snapshot)
        .bind(timestamp(instance.updated_at))
        .bind(&completed_at)
        .bind(&instance.id.0)
        .bind(state_version(expected)?)
        .execute(&mut **tx)
        .await?
        .rows_affected(),
    };

    if affected == 0 {
        return Err(RepositoryError::VersionConflict {
            instance_id: instance.id.clone(),
            expected: report.expected_version,
        });
    }
    Ok(())
}

async fn append_history(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &WorkflowStepHistory,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO workflow_step_history (id, instance_id, step_id, tier_level, action, action_by,
                                            is_proxy_approval, is_system_action, cycle,
                                            payload_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.instance_id.0)
    .bind(entry.step_id.as_ref().map(|id| id.0.clone()))
    .bind(entry.tier_level)
    .bind(entry.action.as_str())
    .bind(entry.action_by.as_str())
    .bind(entry.is_proxy_approval)
    .bind(entry.is_system_action)
    .bind(entry.cycle)
    .bind(to_json(entry)?)
    .bind(timestamp(entry.created_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_rejection(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &RejectionHistoryEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO rejection_history (id, instance_id, step_id, tier_level, rejected_by,
                                        returned_to_requestor, payload_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.instance_id.0)
    .bind(&entry.step_id.0)
    .bind(entry.tier_level)
    .bind(entry.rejected_by.as_str())
    .bind(entry.returned_to_requestor)
    .bind(to_json(entry)?)
    .bind(timestamp(entry.created_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_proxy(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ProxyApprovalRecord,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO proxy_approval_record (id, instance_id, step_id, delegation_id, proxy_user_id,
                                            original_approver_id, payload_json, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.instance_id.0)
    .bind(&record.step_id.0)
    .bind(&record.delegation_id.0)
    .bind(record.proxy_user_id.as_str())
    .bind(record.original_approver_id.as_str())
    .bind(to_json(record)?)
    .bind(timestamp(record.recorded_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn append_delegation_audit(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &DelegationAuditEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO delegation_audit (id, delegation_id, action, actor_id, instance_id,
                                       payload_json, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.delegation_id.0)
    .bind(entry.action.as_str())
    .bind(entry.actor_id.as_str())
    .bind(entry.instance_id.as_ref().map(|id| id.0.clone()))
    .bind(to_json(entry)?)
    .bind(timestamp(entry.occurred_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_usage(
    tx: &mut Transaction<'_, Sqlite>,
    usage: &DelegationUsage,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO delegation_usage (delegation_id, day, count) VALUES (?, ?, ?)
         ON CONFLICT(delegation_id, day) DO UPDATE SET count = MAX(count, excluded.count)",
    )
    .bind(&usage.delegation_id.0)
    .bind(day(usage.day))
    .bind(usage.count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn append_ledger_entry(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &LedgerEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO ledger_entry (entry_id, chain_key, sequence, record_kind, record_id,
                                   entry_hash, payload_json, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.entry_id)
    .bind(&entry.chain_key)
    .bind(entry.sequence)
    .bind(entry.record_kind.as_str())
    .bind(&entry.record_id)
    .bind(&entry.entry_hash)
    .bind(to_json(entry)?)
    .bind(timestamp(entry.recorded_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn find_instance(
        &self,
        id: &InstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT snapshot_json FROM workflow_instance WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = column(&row, "snapshot_json")?;
        let mut records = InstanceRecords::load(&self.pool, Some(id)).await?;
        records.assemble(&raw).map(Some)
    }

    async fn list_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query("SELECT snapshot_json FROM workflow_instance ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut records = InstanceRecords::load(&self.pool, None).await?;

        rows.iter()
            .map(|row| {
                let raw: String = column(row, "snapshot_json")?;
                records.assemble(&raw)
            })
            .collect()
    }

    async fn record_transition(&self, report: &TransitionReport) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        write_instance(&mut tx, report).await?;

        if let Some((id, version)) = &report.referenced_configuration {
            sqlx::query("UPDATE tier_configuration SET referenced = 1 WHERE id = ? AND version = ?")
                .bind(&id.0)
                .bind(*version)
                .execute(&mut *tx)
                .await?;
        }
        for entry in &report.history {
            append_history(&mut tx, entry).await?;
        }
        for entry in &report.rejections {
            append_rejection(&mut tx, entry).await?;
        }
        for record in &report.proxy_approvals {
            append_proxy(&mut tx, record).await?;
        }
        for entry in &report.delegation_audit {
            append_delegation_audit(&mut tx, entry).await?;
        }
        for usage in &report.delegation_usage {
            upsert_usage(&mut tx, usage).await?;
        }
        for entry in &report.ledger_entries {
            append_ledger_entry(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use signoff_core::domain::workflow::{StepAction, WorkflowStatus};
    use signoff_core::workflow::{ActorDecision, DecisionAction};
    use signoff_core::UserId;

    use super::SqlWorkflowRepository;
    use crate::repositories::{
        ConfigurationRepository, RepositoryError, SqlConfigurationRepository, SqlLedgerRepository,
        LedgerRepository, WorkflowRepository,
    };
    use crate::test_support::{engine, purchase_request, setup};

    #[tokio::test]
    async fn transitions_round_trip_through_append_only_tables() {
        let pool = setup().await;
        let engine = engine();
        for configuration in engine.configurations() {
            SqlConfigurationRepository::new(pool.clone()).save(&configuration).await.expect("config");
        }
        let repo = SqlWorkflowRepository::new(pool.clone());

        let routed = engine.route_request(purchase_request(6000), "corr-1").expect("route");
        repo.record_transition(&routed).await.expect("persist route");

        let step = routed.instance.current_step().cloned().expect("current step");
        let approved = engine
            .decide(
                ActorDecision {
                    instance_id: routed.instance.id.clone(),
                    step_id: step.id,
                    actor_id: UserId::new("fay"),
                    action: DecisionAction::Approve,
                    reason: None,
                },
                "corr-2",
            )
            .expect("approve");
        repo.record_transition(&approved).await.expect("persist approval");

        let stored = repo
            .find_instance(&routed.instance.id)
            .await
            .expect("find")
            .expect("instance exists");
        assert_eq!(stored, approved.instance);
        assert_eq!(stored.status(), WorkflowStatus::InProgress);
        assert_eq!(stored.step_history.last().map(|entry| entry.action), Some(StepAction::Approved));

        let stored_configurations =
            SqlConfigurationRepository::new(pool.clone()).list().await.expect("configurations");
        assert!(stored_configurations.iter().any(|stored| stored.referenced));

        let ledger = SqlLedgerRepository::new(pool)
            .entries_for(&routed.instance.id.0)
            .await
            .expect("ledger");
        assert_eq!(ledger.len(), stored.step_history.len());
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let pool = setup().await;
        let engine = engine();
        for configuration in engine.configurations() {
            SqlConfigurationRepository::new(pool.clone()).save(&configuration).await.expect("config");
        }
        let repo = SqlWorkflowRepository::new(pool);

        let routed = engine.route_request(purchase_request(6000), "corr-1").expect("route");
        repo.record_transition(&routed).await.expect("persist route");

        let duplicate = repo.record_transition(&routed).await.expect_err("second insert conflicts");
        assert!(matches!(duplicate, RepositoryError::VersionConflict { expected: None, .. }));

        let mut stale = routed.clone();
        stale.expected_version = Some(routed.instance.state_version + 7);
        stale.history.clear();
        stale.ledger_entries.clear();
        let error = repo.record_transition(&stale).await.expect_err("stale version conflicts");
        assert!(matches!(error, RepositoryError::VersionConflict { .. }));

        let instances = repo.list_instances().await.expect("list");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state_version, routed.instance.state_version);
    }
}
