use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use signoff_core::domain::delegation::{DelegationAuditEntry, DelegationId, DelegationRule};
use signoff_core::domain::tier::{ConfigurationId, TierConfiguration};
use signoff_core::domain::workflow::{InstanceId, WorkflowInstance};
use signoff_core::ledger::LedgerEntry;
use signoff_core::workflow::{DelegationChange, DelegationUsage, TransitionReport};

use super::configuration::frozen_body;
use super::{
    ConfigurationRepository, DelegationRepository, LedgerRepository, RepositoryError,
    StoredConfiguration, WorkflowRepository,
};

#[derive(Default)]
struct State {
    configurations: BTreeMap<(ConfigurationId, u32), StoredConfiguration>,
    instances: BTreeMap<InstanceId, WorkflowInstance>,
    rules: BTreeMap<DelegationId, DelegationRule>,
    delegation_audit: Vec<DelegationAuditEntry>,
    usage: BTreeMap<(DelegationId, NaiveDate), u32>,
    ledger: Vec<LedgerEntry>,
}

/// One shared state behind every repository trait, so a transition written through one
/// is visible through the others.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

#[async_trait::async_trait]
impl ConfigurationRepository for InMemoryStore {
    async fn save(&self, configuration: &TierConfiguration) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let key = (configuration.id.clone(), configuration.version);
        let referenced = match state.configurations.get(&key) {
            Some(stored) if stored.referenced => {
                if frozen_body(&stored.configuration) != frozen_body(configuration) {
                    return Err(RepositoryError::ImmutableConfiguration {
                        id: configuration.id.clone(),
                        version: configuration.version,
                    });
                }
                true
            }
            _ => false,
        };
        state
            .configurations
            .insert(key, StoredConfiguration { configuration: configuration.clone(), referenced });
        Ok(())
    }

    async fn mark_referenced(
        &self,
        id: &ConfigurationId,
        version: u32,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(stored) = state.configurations.get_mut(&(id.clone(), version)) {
            stored.referenced = true;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredConfiguration>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.configurations.values().cloned().collect())
    }
}

#[async_trait::async_trait]
impl WorkflowRepository for InMemoryStore {
    async fn find_instance(
        &self,
        id: &InstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.instances.get(id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let state = self.state.read().await;
        let mut instances: Vec<WorkflowInstance> = state.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn record_transition(&self, report: &TransitionReport) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let instance = &report.instance;
        let stored_version = state.instances.get(&instance.id).map(|stored| stored.state_version);
        if stored_version != report.expected_version {
            return Err(RepositoryError::VersionConflict {
                instance_id: instance.id.clone(),
                expected: report.expected_version,
            });
        }

        state.instances.insert(instance.id.clone(), instance.clone());
        if let Some(key) = &report.referenced_configuration {
            if let Some(stored) = state.configurations.get_mut(key) {
                stored.referenced = true;
            }
        }
        state.delegation_audit.extend(report.delegation_audit.iter().cloned());
        for usage in &report.delegation_usage {
            let count = state.usage.entry((usage.delegation_id.clone(), usage.day)).or_insert(0);
            *count = (*count).max(usage.count);
        }
        state.ledger.extend(report.ledger_entries.iter().cloned());
        Ok(())
    }
}

#[async_trait::async_trait]
impl DelegationRepository for InMemoryStore {
    async fn record_change(&self, change: &DelegationChange) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.rules.insert(change.rule.id.clone(), change.rule.clone());
        state.delegation_audit.push(change.audit.clone());
        state.ledger.push(change.ledger_entry.clone());
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<DelegationRule>, RepositoryError> {
        let state = self.state.read().await;
        let mut rules: Vec<DelegationRule> = state.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(rules)
    }

    async fn list_audit(&self) -> Result<Vec<DelegationAuditEntry>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.delegation_audit.clone())
    }

    async fn list_usage(&self) -> Result<Vec<DelegationUsage>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .usage
            .iter()
            .map(|((delegation_id, day), count)| DelegationUsage {
                delegation_id: delegation_id.clone(),
                day: *day,
                count: *count,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl LedgerRepository for InMemoryStore {
    async fn list_entries(&self) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.ledger.clone())
    }

    async fn entries_for(&self, chain_key: &str) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.ledger.iter().filter(|entry| entry.chain_key == chain_key).cloned().collect())
    }
}
