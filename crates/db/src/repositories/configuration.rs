use sqlx::Row;

use signoff_core::domain::tier::{ConfigurationId, TierConfiguration};

use super::codec::{column, from_json, timestamp, to_json};
use super::{ConfigurationRepository, RepositoryError, StoredConfiguration};
use crate::DbPool;

pub struct SqlConfigurationRepository {
    pool: DbPool,
}

impl SqlConfigurationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// The part of a configuration that freezes once referenced. Activation flags stay
/// mutable so a revision can retire its predecessor.
pub(crate) fn frozen_body(configuration: &TierConfiguration) -> TierConfiguration {
    let mut body = configuration.clone();
    body.is_default = false;
    body.is_active = false;
    body
}

fn row_to_configuration(row: &sqlx::sqlite::SqliteRow) -> Result<StoredConfiguration, RepositoryError> {
    let raw: String = column(row, "payload_json")?;
    let mut configuration: TierConfiguration = from_json(&raw)?;
    configuration.is_default = column::<i64>(row, "is_default")? != 0;
    configuration.is_active = column::<i64>(row, "is_active")? != 0;
    let referenced = column::<i64>(row, "referenced")? != 0;
    Ok(StoredConfiguration { configuration, referenced })
}

#[async_trait::async_trait]
impl ConfigurationRepository for SqlConfigurationRepository {
    async fn save(&self, configuration: &TierConfiguration) -> Result<(), RepositoryError> {
        let payload = to_json(&frozen_body(configuration))?;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT referenced, payload_json FROM tier_configuration WHERE id = ? AND version = ?",
        )
        .bind(&configuration.id.0)
        .bind(configuration.version)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let referenced = row.try_get::<i64, _>("referenced")? != 0;
            let stored: String = row.try_get("payload_json")?;
            if referenced && stored != payload {
                return Err(RepositoryError::ImmutableConfiguration {
                    id: configuration.id.clone(),
                    version: configuration.version,
                });
            }
        }

        sqlx::query(
            "INSERT INTO tier_configuration (id, version, name, category, is_default, is_active,
                                             payload_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id, version) DO UPDATE SET
                 name = excluded.name,
                 category = excluded.category,
                 is_default = excluded.is_default,
                 is_active = excluded.is_active,
                 payload_json = excluded.payload_json",
        )
        .bind(&configuration.id.0)
        .bind(configuration.version)
        .bind(&configuration.name)
        .bind(configuration.category.as_str())
        .bind(configuration.is_default)
        .bind(configuration.is_active)
        .bind(&payload)
        .bind(timestamp(configuration.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_referenced(
        &self,
        id: &ConfigurationId,
        version: u32,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE tier_configuration SET referenced = 1 WHERE id = ? AND version = ?")
            .bind(&id.0)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredConfiguration>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT is_default, is_active, referenced, payload_json
             FROM tier_configuration ORDER BY id ASC, version ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_configuration).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SqlConfigurationRepository;
    use crate::repositories::{ConfigurationRepository, RepositoryError};
    use crate::test_support::{purchase_configuration, setup};

    #[tokio::test]
    async fn save_and_list_keeps_activation_flags() {
        let pool = setup().await;
        let repo = SqlConfigurationRepository::new(pool);
        let configuration = purchase_configuration();

        repo.save(&configuration).await.expect("save");
        let stored = repo.list().await.expect("list");

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].configuration, configuration);
        assert!(!stored[0].referenced);
    }

    #[tokio::test]
    async fn referenced_version_rejects_changed_tiers_but_allows_retirement() {
        let pool = setup().await;
        let repo = SqlConfigurationRepository::new(pool);
        let configuration = purchase_configuration();
        repo.save(&configuration).await.expect("save");
        repo.mark_referenced(&configuration.id, configuration.version).await.expect("reference");

        let mut edited = configuration.clone();
        edited.tiers.pop();
        let error = repo.save(&edited).await.expect_err("tier edit must be refused");
        assert!(matches!(error, RepositoryError::ImmutableConfiguration { version: 1, .. }));

        let mut retired = configuration.clone();
        retired.is_active = false;
        retired.is_default = false;
        repo.save(&retired).await.expect("retiring a referenced version is allowed");

        let stored = repo.list().await.expect("list");
        assert!(stored[0].referenced);
        assert!(!stored[0].configuration.is_active);
        assert_eq!(stored[0].configuration.tiers.len(), configuration.tiers.len());
    }
}
