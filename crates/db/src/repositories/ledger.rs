use signoff_core::ledger::LedgerEntry;

use super::codec::payload;
use super::{LedgerRepository, RepositoryError};
use crate::DbPool;

/// Read side of the ledger. Entries are written with the transition or delegation change
/// that sealed them.
pub struct SqlLedgerRepository {
    pool: DbPool,
}

impl SqlLedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LedgerRepository for SqlLedgerRepository {
    async fn list_entries(&self) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let rows = sqlx::query("SELECT payload_json FROM ledger_entry ORDER BY chain_key ASC, sequence ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(payload).collect()
    }

    async fn entries_for(&self, chain_key: &str) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT payload_json FROM ledger_entry WHERE chain_key = ? ORDER BY sequence ASC",
        )
        .bind(chain_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payload).collect()
    }
}
