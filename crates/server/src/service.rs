use std::collections::VecDeque;
use std::sync::Arc;

use signoff_core::delegation::NewDelegation;
use signoff_core::domain::delegation::{DelegationAuditEntry, DelegationId, DelegationRule, DelegationStatus};
use signoff_core::domain::request::{RequestAttributes, UserId};
use signoff_core::domain::tier::{ConfigurationId, TierConfiguration};
use signoff_core::domain::workflow::{InstanceId, StepId, WorkflowInstance};
use signoff_core::eligibility::{EligibleSet, InMemoryDirectory};
use signoff_core::errors::ApplicationError;
use signoff_core::escalation::SweepReport;
use signoff_core::retry::RetryPolicy;
use signoff_core::workflow::{
    ActorDecision, ApprovalEngine, AuditTrail, Commit, CommitLog, DelegationChange, RouteRequest,
    TransitionReport,
};
use signoff_db::{EngineStore, RepositoryError};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A committed change waiting to reach storage.
#[derive(Clone, Debug)]
pub enum PendingWrite {
    Transition(Box<TransitionReport>),
    Delegation(Box<DelegationChange>),
    Configuration(Box<TierConfiguration>),
}

/// Identifies one write so a caller can tell whether its own change made it to storage.
#[derive(Clone, Debug, PartialEq, Eq)]
enum WriteKey {
    Transition(InstanceId, u64),
    Delegation(String),
    Configuration(ConfigurationId, u32),
}

impl PendingWrite {
    fn label(&self) -> &'static str {
        match self {
            Self::Transition(_) => "transition",
            Self::Delegation(_) => "delegation",
            Self::Configuration(_) => "configuration",
        }
    }

    fn key(&self) -> WriteKey {
        match self {
            Self::Transition(report) => transition_key(report),
            Self::Delegation(change) => WriteKey::Delegation(change.audit.id.clone()),
            Self::Configuration(configuration) => {
                WriteKey::Configuration(configuration.id.clone(), configuration.version)
            }
        }
    }
}

impl From<Commit> for PendingWrite {
    fn from(commit: Commit) -> Self {
        match commit {
            Commit::Transition(report) => Self::Transition(report),
            Commit::Delegation(change) => Self::Delegation(change),
        }
    }
}

fn transition_key(report: &TransitionReport) -> WriteKey {
    WriteKey::Transition(report.instance.id.clone(), report.instance.state_version)
}

/// Writes in commit order, plus the ones storage refused outright.
#[derive(Debug, Default)]
struct Backlog {
    pending: VecDeque<PendingWrite>,
    rejected: Vec<PendingWrite>,
}

impl Backlog {
    fn holds(&self, key: &WriteKey) -> bool {
        self.pending.iter().chain(self.rejected.iter()).any(|write| &write.key() == key)
    }
}

/// Outcome of a mutating call: the committed value and whether it is already durable.
#[derive(Clone, Debug)]
pub struct Committed<T> {
    pub value: T,
    pub persisted: bool,
}

/// The engine is the single writer. It logs every commit while holding the lock that
/// ordered it, and the service writes that log behind it in the same order. A write
/// that keeps failing stays queued and later writes line up behind it; a write storage
/// refuses is set aside and reported, never dropped.
pub struct ApprovalService {
    engine: ApprovalEngine<InMemoryDirectory>,
    store: EngineStore,
    retry: RetryPolicy,
    commits: Arc<CommitLog>,
    backlog: Mutex<Backlog>,
}

impl ApprovalService {
    pub fn new(engine: ApprovalEngine<InMemoryDirectory>, store: EngineStore, retry: RetryPolicy) -> Self {
        let commits = Arc::new(CommitLog::default());
        let engine = engine.with_commit_sink(commits.clone());
        Self { engine, store, retry, commits, backlog: Mutex::new(Backlog::default()) }
    }

    pub fn engine(&self) -> &ApprovalEngine<InMemoryDirectory> {
        &self.engine
    }

    /// Committed changes not yet stored, including ones the engine logged since the
    /// last write pass.
    pub async fn backlog_len(&self) -> usize {
        let backlog = self.backlog.lock().await;
        backlog.pending.len() + self.commits.len()
    }

    /// Committed changes storage refused; they need an operator.
    pub async fn rejected_len(&self) -> usize {
        self.backlog.lock().await.rejected.len()
    }

    pub async fn route(
        &self,
        request: RouteRequest,
        correlation_id: &str,
    ) -> Result<Committed<TransitionReport>, ApplicationError> {
        let report = self.engine.route_request(request, correlation_id)?;
        Ok(self.commit_transition(report, correlation_id).await)
    }

    pub async fn decide(
        &self,
        decision: ActorDecision,
        correlation_id: &str,
    ) -> Result<Committed<TransitionReport>, ApplicationError> {
        let report = self.engine.decide(decision, correlation_id)?;
        Ok(self.commit_transition(report, correlation_id).await)
    }

    pub async fn escalate(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
        actor_id: &UserId,
        correlation_id: &str,
    ) -> Result<Committed<TransitionReport>, ApplicationError> {
        let report = self.engine.escalate(instance_id, step_id, actor_id, correlation_id)?;
        Ok(self.commit_transition(report, correlation_id).await)
    }

    pub async fn cancel(
        &self,
        instance_id: &InstanceId,
        actor_id: &UserId,
        reason: Option<&str>,
        correlation_id: &str,
    ) -> Result<Committed<TransitionReport>, ApplicationError> {
        let report = self.engine.cancel(instance_id, actor_id, reason, correlation_id)?;
        Ok(self.commit_transition(report, correlation_id).await)
    }

    pub async fn resubmit(
        &self,
        instance_id: &InstanceId,
        actor_id: &UserId,
        attributes: Option<RequestAttributes>,
        correlation_id: &str,
    ) -> Result<Committed<TransitionReport>, ApplicationError> {
        let report = self.engine.resubmit(instance_id, actor_id, attributes, correlation_id)?;
        Ok(self.commit_transition(report, correlation_id).await)
    }

    pub async fn create_delegation(
        &self,
        request: NewDelegation,
        correlation_id: &str,
    ) -> Result<Committed<DelegationChange>, ApplicationError> {
        let change = self.engine.create_delegation(request, correlation_id)?;
        let key = WriteKey::Delegation(change.audit.id.clone());
        let persisted = self.settle(Some(key), None, correlation_id).await;
        Ok(Committed { value: change, persisted })
    }

    pub async fn revoke_delegation(
        &self,
        id: &DelegationId,
        revoked_by: &UserId,
        reason: &str,
        correlation_id: &str,
    ) -> Result<Committed<DelegationChange>, ApplicationError> {
        let change = self.engine.revoke_delegation(id, revoked_by, reason, correlation_id)?;
        let key = WriteKey::Delegation(change.audit.id.clone());
        let persisted = self.settle(Some(key), None, correlation_id).await;
        Ok(Committed { value: change, persisted })
    }

    /// Registers a configuration with the engine and stores it.
    pub async fn register_configuration(
        &self,
        configuration: TierConfiguration,
        correlation_id: &str,
    ) -> Result<bool, ApplicationError> {
        self.engine.register_configuration(configuration.clone())?;
        Ok(self.store_configuration(configuration, correlation_id).await)
    }

    pub async fn store_configuration(&self, configuration: TierConfiguration, correlation_id: &str) -> bool {
        let write = PendingWrite::Configuration(Box::new(configuration));
        let key = write.key();
        self.settle(Some(key), Some(write), correlation_id).await
    }

    /// One escalation pass followed by persisting everything committed so far.
    pub async fn sweep(&self, limit: usize, correlation_id: &str) -> SweepReport {
        let report = self.engine.run_escalation_sweep(limit, correlation_id);
        self.settle(None, None, correlation_id).await;
        report
    }

    pub fn instance(&self, id: &InstanceId) -> Result<WorkflowInstance, ApplicationError> {
        Ok(self.engine.instance(id)?)
    }

    pub fn eligible(&self, id: &InstanceId) -> Result<EligibleSet, ApplicationError> {
        Ok(self.engine.eligible_approvers(id)?)
    }

    pub fn audit_trail(&self, id: &InstanceId) -> Result<AuditTrail, ApplicationError> {
        Ok(self.engine.audit_trail(id)?)
    }

    pub fn delegation(
        &self,
        id: &DelegationId,
    ) -> Option<(DelegationRule, DelegationStatus, Vec<DelegationAuditEntry>)> {
        self.engine
            .delegation(id)
            .map(|(rule, status)| (rule, status, self.engine.delegation_audit(id)))
    }

    pub fn delegations_granted_by(&self, user: &UserId) -> Vec<(DelegationRule, DelegationStatus)> {
        self.engine.delegations_granted_by(user)
    }

    /// Retries queued writes in order. Returns how many are still waiting.
    pub async fn flush(&self, correlation_id: &str) -> usize {
        self.settle(None, None, correlation_id).await;
        self.backlog.lock().await.pending.len()
    }

    async fn commit_transition(&self, report: TransitionReport, correlation_id: &str) -> Committed<TransitionReport> {
        let persisted = self.settle(Some(transition_key(&report)), None, correlation_id).await;
        Committed { value: report, persisted }
    }

    /// Moves logged commits into the backlog, queues `extra` behind them, and writes as
    /// much as storage accepts. Returns whether the write named by `own` is stored.
    async fn settle(&self, own: Option<WriteKey>, extra: Option<PendingWrite>, correlation_id: &str) -> bool {
        let mut backlog = self.backlog.lock().await;
        backlog.pending.extend(self.commits.take().into_iter().map(PendingWrite::from));
        backlog.pending.extend(extra);
        self.drain(&mut backlog, correlation_id).await;
        own.map_or(true, |key| !backlog.holds(&key))
    }

    async fn drain(&self, backlog: &mut Backlog, correlation_id: &str) {
        while let Some(write) = backlog.pending.front() {
            match self.write_with_retry(write).await {
                Ok(()) => {
                    backlog.pending.pop_front();
                }
                Err(error) if is_transient(&error) => {
                    warn!(
                        event_name = "persistence.write_deferred",
                        correlation_id,
                        write = write.label(),
                        backlog = backlog.pending.len(),
                        error = %error,
                        "write failed after retries; kept for the next flush"
                    );
                    return;
                }
                Err(error) => {
                    // Storage disagrees with the engine; retrying cannot fix it.
                    error!(
                        event_name = "persistence.write_rejected",
                        correlation_id,
                        write = write.label(),
                        rejected = backlog.rejected.len() + 1,
                        error = %error,
                        "storage refused a committed change; set aside for an operator"
                    );
                    if let Some(write) = backlog.pending.pop_front() {
                        backlog.rejected.push(write);
                    }
                }
            }
        }
    }

    async fn write_with_retry(&self, write: &PendingWrite) -> Result<(), RepositoryError> {
        let mut retry_count = 0;
        loop {
            let result = match write {
                PendingWrite::Transition(report) => self.store.persist_transition(report).await,
                PendingWrite::Delegation(change) => self.store.persist_delegation(change).await,
                PendingWrite::Configuration(configuration) => {
                    self.store.save_configuration(configuration).await
                }
            };
            match result {
                Ok(()) => {
                    if retry_count > 0 {
                        info!(
                            event_name = "persistence.write_recovered",
                            write = write.label(),
                            retries = retry_count,
                            "write succeeded after retry"
                        );
                    }
                    return Ok(());
                }
                Err(error) if is_transient(&error) => match self.retry.delay_for(retry_count) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        retry_count += 1;
                    }
                    None => return Err(error),
                },
                Err(error) => return Err(error),
            }
        }
    }
}

fn is_transient(error: &RepositoryError) -> bool {
    matches!(error, RepositoryError::Database(_))
}

#[cfg(test)]
mod tests {
    use signoff_core::domain::workflow::WorkflowStatus;
    use signoff_core::workflow::{ActorDecision, DecisionAction, TransitionReport};
    use signoff_core::UserId;

    use super::{transition_key, ApprovalService};
    use crate::test_support::{purchase_request, service_with_store};

    fn approve_as(service: &ApprovalService, routed: &TransitionReport, actor: &str) -> TransitionReport {
        let step = routed.instance.current_step().cloned().expect("step");
        service
            .engine()
            .decide(
                ActorDecision {
                    instance_id: routed.instance.id.clone(),
                    step_id: step.id,
                    actor_id: UserId::new(actor),
                    action: DecisionAction::Approve,
                    reason: None,
                },
                "corr-3",
            )
            .expect("approve")
    }

    #[tokio::test]
    async fn committed_transitions_reach_storage_in_order() {
        let (service, store) = service_with_store().await;

        let routed = service.route(purchase_request(2000), "corr-1").await.expect("route");
        assert!(routed.persisted);
        let step = routed.value.instance.current_step().cloned().expect("step");

        let approved = service
            .decide(
                ActorDecision {
                    instance_id: routed.value.instance.id.clone(),
                    step_id: step.id,
                    actor_id: UserId::new("fay"),
                    action: DecisionAction::Approve,
                    reason: None,
                },
                "corr-2",
            )
            .await
            .expect("approve");
        assert!(approved.persisted);
        assert_eq!(approved.value.status(), WorkflowStatus::Approved);

        let stored = store
            .workflows()
            .find_instance(&routed.value.instance.id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored.status(), WorkflowStatus::Approved);
        assert_eq!(service.backlog_len().await, 0);
    }

    #[tokio::test]
    async fn a_later_commit_settled_first_still_stores_both_in_commit_order() {
        let (service, store) = service_with_store().await;
        let routed = service.route(purchase_request(2000), "corr-1").await.expect("route");
        let step = routed.value.instance.current_step().cloned().expect("step");

        // Two requests commit back to back; the second one reaches the store first.
        service
            .engine()
            .escalate(&routed.value.instance.id, &step.id, &UserId::new("fay"), "corr-2")
            .expect("escalate");
        let approved = approve_as(&service, &routed.value, "fay");
        assert_eq!(service.backlog_len().await, 2);

        assert!(service.settle(Some(transition_key(&approved)), None, "corr-3").await);
        assert!(service.settle(None, None, "corr-2").await);

        let stored = store
            .workflows()
            .find_instance(&routed.value.instance.id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored.status(), WorkflowStatus::Approved);
        assert_eq!(stored.state_version, approved.instance.state_version);
        assert_eq!(service.backlog_len().await, 0);
        assert_eq!(service.rejected_len().await, 0);
    }

    #[tokio::test]
    async fn refused_writes_are_set_aside_and_reported() {
        let (service, store) = service_with_store().await;
        let routed = service.route(purchase_request(2000), "corr-1").await.expect("route");
        let approved = approve_as(&service, &routed.value, "fay");

        // Storage already holds this version, so the queued copy conflicts.
        store.persist_transition(&approved).await.expect("direct write");

        assert!(!service.settle(Some(transition_key(&approved)), None, "corr-2").await);
        assert_eq!(service.backlog_len().await, 0);
        assert_eq!(service.rejected_len().await, 1);
    }

    #[tokio::test]
    async fn domain_refusals_are_not_queued() {
        let (service, _store) = service_with_store().await;
        let routed = service.route(purchase_request(2000), "corr-1").await.expect("route");

        let error = service
            .cancel(&routed.value.instance.id, &UserId::new("fay"), None, "corr-2")
            .await
            .expect_err("only requester or admin may cancel");
        assert!(!error.is_retryable());
        assert_eq!(service.backlog_len().await, 0);
    }
}
