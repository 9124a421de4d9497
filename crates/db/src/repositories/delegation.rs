use signoff_core::domain::delegation::{DelegationAuditEntry, DelegationId, DelegationRule};
use signoff_core::workflow::{DelegationChange, DelegationUsage};

use super::codec::{column, parse_day, payload, timestamp, to_json};
use super::workflow::{append_delegation_audit, append_ledger_entry};
use super::{DelegationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDelegationRepository {
    pool: DbPool,
}

impl SqlDelegationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DelegationRepository for SqlDelegationRepository {
    async fn record_change(&self, change: &DelegationChange) -> Result<(), RepositoryError> {
        let rule = &change.rule;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO delegation_rule (id, from_user_id, to_user_id, start_date, end_date,
                                          revoked_at, payload_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 revoked_at = excluded.revoked_at,
                 payload_json = excluded.payload_json",
        )
        .bind(&rule.id.0)
        .bind(rule.from_user_id.as_str())
        .bind(rule.to_user_id.as_str())
        .bind(timestamp(rule.start_date))
        .bind(timestamp(rule.end_date))
        .bind(rule.revoked_at.map(timestamp))
        .bind(to_json(rule)?)
        .bind(timestamp(rule.created_at))
        .execute(&mut *tx)
        .await?;

        append_delegation_audit(&mut tx, &change.audit).await?;
        append_ledger_entry(&mut tx, &change.ledger_entry).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<DelegationRule>, RepositoryError> {
        let rows = sqlx::query("SELECT payload_json FROM delegation_rule ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(payload).collect()
    }

    async fn list_audit(&self) -> Result<Vec<DelegationAuditEntry>, RepositoryError> {
        let rows = sqlx::query("SELECT payload_json FROM delegation_audit ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(payload).collect()
    }

    async fn list_usage(&self) -> Result<Vec<DelegationUsage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT delegation_id, day, count FROM delegation_usage ORDER BY day ASC, delegation_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let day: String = column(row, "day")?;
                Ok(DelegationUsage {
                    delegation_id: DelegationId(column(row, "delegation_id")?),
                    day: parse_day(&day)?,
                    count: column(row, "count")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use signoff_core::domain::delegation::{DelegationAuditAction, DelegationType};
    use signoff_core::{NewDelegation, UserId};

    use super::SqlDelegationRepository;
    use crate::repositories::DelegationRepository;
    use crate::test_support::{engine, setup};

    fn grant(from: &str, to: &str, engine_now: chrono::DateTime<chrono::Utc>) -> NewDelegation {
        NewDelegation {
            from_user_id: UserId::new(from),
            to_user_id: UserId::new(to),
            start_date: engine_now,
            end_date: engine_now + Duration::days(7),
            delegation_type: DelegationType::Full,
            categories: Vec::new(),
            limits: None,
            reason: Some("vacation".to_string()),
            created_by: UserId::new(from),
        }
    }

    #[tokio::test]
    async fn create_and_revoke_are_both_kept() {
        let pool = setup().await;
        let engine = engine();
        let repo = SqlDelegationRepository::new(pool);

        let created =
            engine.create_delegation(grant("alice", "bob", engine.now()), "corr-1").expect("create");
        repo.record_change(&created).await.expect("persist create");

        let revoked = engine
            .revoke_delegation(&created.rule.id, &UserId::new("alice"), "back early", "corr-2")
            .expect("revoke");
        repo.record_change(&revoked).await.expect("persist revoke");

        let rules = repo.list_rules().await.expect("rules");
        assert_eq!(rules.len(), 1);
        assert!(rules[0].revoked_at.is_some());

        let audit = repo.list_audit().await.expect("audit");
        let actions: Vec<_> = audit.iter().map(|entry| entry.action).collect();
        assert_eq!(actions, vec![DelegationAuditAction::Created, DelegationAuditAction::Revoked]);
        assert!(repo.list_usage().await.expect("usage").is_empty());
    }
}
