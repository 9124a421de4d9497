use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use signoff_core::domain::tier::TierConfiguration;
use signoff_core::eligibility::DirectoryClient;
use signoff_core::errors::ApplicationError;
use signoff_core::workflow::{ApprovalEngine, DelegationChange, TransitionReport};

use crate::repositories::{
    ConfigurationRepository, DelegationRepository, InMemoryStore, LedgerRepository,
    RepositoryError, SqlConfigurationRepository, SqlDelegationRepository, SqlLedgerRepository,
    SqlWorkflowRepository, WorkflowRepository,
};
use crate::DbPool;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HydrationSummary {
    pub configurations: usize,
    pub instances: usize,
    pub delegations: usize,
    pub ledger_entries: usize,
}

/// Durable side of the engine: loads its state at boot and writes every committed change.
#[derive(Clone)]
pub struct EngineStore {
    configurations: Arc<dyn ConfigurationRepository>,
    workflows: Arc<dyn WorkflowRepository>,
    delegations: Arc<dyn DelegationRepository>,
    ledger: Arc<dyn LedgerRepository>,
}

impl EngineStore {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            configurations: Arc::new(SqlConfigurationRepository::new(pool.clone())),
            workflows: Arc::new(SqlWorkflowRepository::new(pool.clone())),
            delegations: Arc::new(SqlDelegationRepository::new(pool.clone())),
            ledger: Arc::new(SqlLedgerRepository::new(pool)),
        }
    }

    pub fn in_memory(store: InMemoryStore) -> Self {
        Self {
            configurations: Arc::new(store.clone()),
            workflows: Arc::new(store.clone()),
            delegations: Arc::new(store.clone()),
            ledger: Arc::new(store),
        }
    }

    pub fn workflows(&self) -> &dyn WorkflowRepository {
        self.workflows.as_ref()
    }

    pub fn ledger(&self) -> &dyn LedgerRepository {
        self.ledger.as_ref()
    }

    /// Replays persisted state into a freshly built engine. Instances whose stored
    /// position disagrees with their history abort the load.
    pub async fn hydrate<D>(&self, engine: &ApprovalEngine<D>) -> Result<HydrationSummary, ApplicationError>
    where
        D: DirectoryClient + Send + Sync,
    {
        let mut summary = HydrationSummary::default();

        for stored in self.configurations.list().await? {
            engine.register_configuration(stored.configuration)?;
            summary.configurations += 1;
        }

        for rule in self.delegations.list_rules().await? {
            engine.restore_delegation(rule);
            summary.delegations += 1;
        }
        for usage in self.delegations.list_usage().await? {
            engine.restore_delegation_usage(usage.delegation_id, usage.day, usage.count);
        }
        engine.restore_delegation_audit(self.delegations.list_audit().await?);

        let entries = self.ledger.list_entries().await?;
        summary.ledger_entries = entries.len();
        engine.restore_ledger(entries);

        for instance in self.workflows.list_instances().await? {
            engine.restore_instance(instance)?;
            summary.instances += 1;
        }

        info!(
            event_name = "persistence.hydrated",
            configurations = summary.configurations,
            instances = summary.instances,
            delegations = summary.delegations,
            ledger_entries = summary.ledger_entries,
            "engine state loaded from storage"
        );
        Ok(summary)
    }

    pub async fn save_configuration(&self, configuration: &TierConfiguration) -> Result<(), RepositoryError> {
        self.configurations.save(configuration).await
    }

    pub async fn persist_transition(&self, report: &TransitionReport) -> Result<(), RepositoryError> {
        self.workflows.record_transition(report).await
    }

    pub async fn persist_delegation(&self, change: &DelegationChange) -> Result<(), RepositoryError> {
        self.delegations.record_change(change).await
    }
}
