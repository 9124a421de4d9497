use async_trait::async_trait;
use thiserror::Error;

use signoff_core::domain::delegation::{DelegationAuditEntry, DelegationRule};
use signoff_core::domain::tier::{ConfigurationId, TierConfiguration};
use signoff_core::domain::workflow::{InstanceId, WorkflowInstance};
use signoff_core::errors::ApplicationError;
use signoff_core::ledger::LedgerEntry;
use signoff_core::workflow::{DelegationChange, DelegationUsage, TransitionReport};

pub mod configuration;
pub mod delegation;
pub mod ledger;
pub mod memory;
pub mod workflow;

mod codec;

pub use configuration::SqlConfigurationRepository;
pub use delegation::SqlDelegationRepository;
pub use ledger::SqlLedgerRepository;
pub use memory::InMemoryStore;
pub use workflow::SqlWorkflowRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("instance {instance_id} changed concurrently (expected state version {expected:?})")]
    VersionConflict { instance_id: InstanceId, expected: Option<u64> },
    #[error("configuration `{id}` version {version} is referenced and cannot change")]
    ImmutableConfiguration { id: ConfigurationId, version: u32 },
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

/// Stored configuration version and whether any instance has referenced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredConfiguration {
    pub configuration: TierConfiguration,
    pub referenced: bool,
}

#[async_trait]
pub trait ConfigurationRepository: Send + Sync {
    /// Inserts or replaces a version. A referenced version only accepts identical content.
    async fn save(&self, configuration: &TierConfiguration) -> Result<(), RepositoryError>;
    async fn mark_referenced(&self, id: &ConfigurationId, version: u32)
        -> Result<(), RepositoryError>;
    async fn list(&self) -> Result<Vec<StoredConfiguration>, RepositoryError>;
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn find_instance(
        &self,
        id: &InstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError>;

    async fn list_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError>;

    /// Writes one committed transition as a unit. Fails with `VersionConflict` when the
    /// stored instance is not at `report.expected_version`.
    async fn record_transition(&self, report: &TransitionReport) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait DelegationRepository: Send + Sync {
    async fn record_change(&self, change: &DelegationChange) -> Result<(), RepositoryError>;
    async fn list_rules(&self) -> Result<Vec<DelegationRule>, RepositoryError>;
    async fn list_audit(&self) -> Result<Vec<DelegationAuditEntry>, RepositoryError>;
    async fn list_usage(&self) -> Result<Vec<DelegationUsage>, RepositoryError>;
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn list_entries(&self) -> Result<Vec<LedgerEntry>, RepositoryError>;
    async fn entries_for(&self, chain_key: &str) -> Result<Vec<LedgerEntry>, RepositoryError>;
}
