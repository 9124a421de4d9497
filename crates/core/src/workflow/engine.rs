use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::delegation::{DelegationRegistry, NewDelegation};
use crate::domain::delegation::{
    DelegationAuditAction, DelegationAuditEntry, DelegationId, DelegationRule, DelegationStatus,
};
use crate::domain::request::{RequestAttributes, RequestContext, UserId};
use crate::domain::tier::{normalize_key, ConfigurationId, TierConfiguration};
use crate::domain::workflow::{
    InstanceId, StepAction, StepId, WorkflowInstance, WorkflowStatus, WorkflowStep,
};
use crate::eligibility::{
    ApproverSlot, ApproverUsage, DirectoryClient, EligibilityResolver, EligibilityScope,
    EligibleSet, TierProgress,
};
use crate::errors::{ApprovalError, DomainError, IneligibilityReason};
use crate::escalation::{
    is_escalation_due, reminders_due, EscalationPlan, EscalationTrigger, SweepFailure, SweepReport,
};
use crate::ledger::{delegation_chain_key, HistoryLedger, LedgerEntry};
use crate::notifications::{
    NotificationIntent, NotificationSink, NotificationType, TracingNotificationSink,
};
use crate::routing::{ConfigurationCatalog, Revision, TierResolver};
use crate::workflow::machine::{build_steps, Actor, FinishedTransition, PendingTransition, TransitionKind};
use crate::workflow::{
    ActorDecision, AuditTrail, Commit, CommitSink, DecisionAction, DelegationChange,
    DelegationUsage, RouteRequest, TransitionReport,
};

pub struct EngineSettings {
    /// Directory role allowed to cancel, resubmit and escalate on anyone's behalf.
    pub admin_role: String,
    pub ledger_signing_key: SecretString,
}

impl EngineSettings {
    pub fn new(admin_role: impl Into<String>, ledger_signing_key: SecretString) -> Self {
        Self { admin_role: admin_role.into(), ledger_signing_key }
    }
}

type InstanceHandle = Arc<Mutex<WorkflowInstance>>;

/// Single in-process writer for workflow instances.
///
/// Every mutation of an instance happens under that instance's mutex, on a working copy
/// that only replaces the stored instance once the transition is complete. Locks are
/// always taken in this order: instance, catalog, registry, usage, ledger, delegation
/// audit, reminders, commit sink.
pub struct ApprovalEngine<D> {
    resolver: EligibilityResolver<D>,
    tiers: TierResolver,
    settings: EngineSettings,
    catalog: RwLock<ConfigurationCatalog>,
    registry: RwLock<DelegationRegistry>,
    usage: RwLock<ApproverUsage>,
    instances: RwLock<HashMap<InstanceId, InstanceHandle>>,
    ledger: Mutex<HistoryLedger>,
    delegation_audit: Mutex<Vec<DelegationAuditEntry>>,
    reminders: Mutex<HashMap<StepId, u32>>,
    /// Last instance examined by a sweep that stopped at its limit.
    sweep_cursor: Mutex<Option<InstanceId>>,
    audit: Arc<dyn AuditSink>,
    notifications: Arc<dyn NotificationSink>,
    commits: Option<Arc<dyn CommitSink>>,
    clock: Arc<dyn Clock>,
}

impl<D> ApprovalEngine<D>
where
    D: DirectoryClient + Send + Sync,
{
    pub fn new(directory: D, settings: EngineSettings) -> Self {
        let ledger = HistoryLedger::new(settings.ledger_signing_key.expose_secret().as_bytes());
        Self {
            resolver: EligibilityResolver::new(directory),
            tiers: TierResolver,
            settings,
            catalog: RwLock::new(ConfigurationCatalog::new()),
            registry: RwLock::new(DelegationRegistry::new()),
            usage: RwLock::new(ApproverUsage::default()),
            instances: RwLock::new(HashMap::new()),
            ledger: Mutex::new(ledger),
            delegation_audit: Mutex::new(Vec::new()),
            reminders: Mutex::new(HashMap::new()),
            sweep_cursor: Mutex::new(None),
            audit: Arc::new(TracingAuditSink),
            notifications: Arc::new(TracingNotificationSink),
            commits: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notification_sink(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Hands every committed transition and delegation change to `commits`, in commit order.
    pub fn with_commit_sink(mut self, commits: Arc<dyn CommitSink>) -> Self {
        self.commits = Some(commits);
        self
    }

    pub fn directory(&self) -> &D {
        self.resolver.directory()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- configurations ----

    pub fn register_configuration(&self, config: TierConfiguration) -> Result<(), DomainError> {
        write(&self.catalog).register(config).map_err(DomainError::from)
    }

    pub fn amend_configuration(&self, config: TierConfiguration) -> Result<(), DomainError> {
        write(&self.catalog).amend(config).map_err(DomainError::from)
    }

    pub fn revise_configuration(&self, draft: TierConfiguration) -> Result<Revision, DomainError> {
        write(&self.catalog).revise(draft).map_err(DomainError::from)
    }

    pub fn configurations(&self) -> Vec<TierConfiguration> {
        read(&self.catalog).iter().cloned().collect()
    }

    pub fn is_configuration_referenced(&self, id: &ConfigurationId, version: u32) -> bool {
        read(&self.catalog).is_referenced(id, version)
    }

    // ---- routing ----

    /// Resolves the tiers for a new request and opens an instance at its first step.
    pub fn route_request(
        &self,
        request: RouteRequest,
        correlation_id: &str,
    ) -> Result<TransitionReport, DomainError> {
        let at = self.clock.now();
        let requester = request.requester_id.clone();
        let result = self.route_inner(request, at);
        self.audited(correlation_id, "route", None, &requester, at, result)
    }

    fn route_inner(
        &self,
        request: RouteRequest,
        at: DateTime<Utc>,
    ) -> Result<TransitionReport, DomainError> {
        // One write guard from selection to reference, so an amend cannot slip in between.
        let (config, tiers) = {
            let mut catalog = write(&self.catalog);
            let config =
                catalog.select(request.category, request.configuration_id.as_ref())?.clone();
            let tiers = self.tiers.resolve(&config, &request.attributes)?;
            catalog.mark_referenced(&config.id, config.version);
            (config, tiers)
        };

        let mut context =
            RequestContext::new(request.requester_id, request.category, request.attributes);
        context.dynamic_approvers = request
            .dynamic_approvers
            .into_iter()
            .map(|(key, users)| (normalize_key(&key), users))
            .collect();

        let instance = WorkflowInstance {
            id: InstanceId::generate(),
            reference_id: request.reference_id,
            reference_type: request.reference_type,
            category: request.category,
            configuration_id: config.id.clone(),
            configuration_version: config.version,
            context,
            steps: build_steps(tiers, at),
            current_step_order: Some(1),
            cycle: 0,
            step_history: Vec::new(),
            rejection_history: Vec::new(),
            proxy_approvals: Vec::new(),
            state_version: 1,
            created_at: at,
            updated_at: at,
            completed_at: None,
        };
        instance.verify_projection().map_err(DomainError::InvariantViolation)?;

        let notifications = {
            let registry = read(&self.registry);
            let usage = read(&self.usage);
            match instance.current_step() {
                Some(step) => self.step_intents(
                    &instance,
                    step,
                    NotificationType::StepActivated,
                    &registry,
                    &usage,
                    at,
                ),
                None => Vec::new(),
            }
        };

        tracing::info!(
            event_name = "workflow.instance_created",
            instance_id = %instance.id,
            reference_id = %instance.reference_id,
            configuration_id = %config.id,
            configuration_version = config.version,
            steps = instance.steps.len(),
            "workflow instance created"
        );
        let handle = Arc::new(Mutex::new(instance.clone()));
        let report = TransitionReport {
            transition: "route".to_string(),
            instance,
            expected_version: None,
            history: Vec::new(),
            rejections: Vec::new(),
            proxy_approvals: Vec::new(),
            delegation_audit: Vec::new(),
            delegation_usage: Vec::new(),
            ledger_entries: Vec::new(),
            notifications,
            referenced_configuration: Some((config.id, config.version)),
        };
        // Logged before the instance is reachable, so no later transition can overtake it.
        self.publish(Commit::Transition(Box::new(report.clone())));
        write(&self.instances).insert(report.instance.id.clone(), handle);
        Ok(report)
    }

    // ---- decisions ----

    pub fn decide(
        &self,
        decision: ActorDecision,
        correlation_id: &str,
    ) -> Result<TransitionReport, DomainError> {
        let at = self.clock.now();
        let actor = decision.actor_id.clone();
        let instance_id = decision.instance_id.clone();
        let transition = decision.action.transition();
        let result = self.decide_inner(decision, at);
        self.audited(correlation_id, transition.as_str(), Some(&instance_id), &actor, at, result)
    }

    fn decide_inner(
        &self,
        decision: ActorDecision,
        at: DateTime<Utc>,
    ) -> Result<TransitionReport, DomainError> {
        let handle = self.handle(&decision.instance_id)?;
        let mut instance = lock(&handle);
        let expected_version = instance.state_version;
        let mut pending = PendingTransition::begin(&instance, decision.action.transition(), at)?;
        let step = pending.expect_step(&decision.step_id)?;

        let mut registry = write(&self.registry);
        let mut usage = write(&self.usage);
        let set = self.eligible_for(pending.instance(), &step, &registry, &usage, at)?;
        if !set.contains(&decision.actor_id) {
            return Err(set.refusal(&decision.actor_id).into());
        }
        let (actor, slot) = acting_as(&set, &decision.actor_id);

        match decision.action {
            DecisionAction::Approve => {
                let (entry, satisfied) = {
                    let progress = TierProgress::new(
                        &step.tier,
                        &set,
                        pending.instance().approvals_for_step(&step.id),
                    );
                    if progress.already_approved_by(&decision.actor_id) {
                        return Err(not_eligible(&decision.actor_id, IneligibilityReason::AlreadyApproved));
                    }
                    if !progress.in_sequence(&decision.actor_id) {
                        return Err(not_eligible(&decision.actor_id, IneligibilityReason::OutOfSequence));
                    }
                    let entry = pending.entry(Some(&step), StepAction::Approved, &actor);
                    let satisfied = TierProgress::new(
                        &step.tier,
                        &set,
                        pending
                            .instance()
                            .approvals_for_step(&step.id)
                            .chain(std::iter::once(&entry)),
                    )
                    .is_satisfied();
                    (entry, satisfied)
                };
                pending.approve(&step, entry, satisfied);
            }
            DecisionAction::Reject | DecisionAction::Return => {
                let reason = decision.reason.as_deref().unwrap_or_default();
                pending.reject(&step, &actor, reason, decision.action == DecisionAction::Return)?;
            }
        }

        if let Some(entry) = pending.last_entry().cloned() {
            if entry.is_proxy_approval {
                pending.record_proxy(&step, &entry);
            }
        }
        let finished = pending.finish()?;

        let mut delegation_audit = Vec::new();
        let mut delegation_usage = Vec::new();
        if let Some(slot) = slot {
            if let Some(delegation_id) = slot.effective.delegation_id() {
                let chain = slot.effective.chain.clone();
                registry.record_usage(&chain, at);
                let day = at.date_naive();
                delegation_usage.extend(chain.iter().map(|id| DelegationUsage {
                    delegation_id: id.clone(),
                    day,
                    count: registry.used_on(id, day),
                }));
                delegation_audit.push(
                    DelegationAuditEntry::new(
                        delegation_id.clone(),
                        DelegationAuditAction::ApprovalUsed,
                        decision.actor_id.clone(),
                        at,
                    )
                    .for_instance(finished.instance.id.clone())
                    .with_details(format!(
                        "{} for {} on tier {}",
                        finished.kind.as_str(),
                        slot.nominal,
                        step.tier.level
                    )),
                );
            } else if let Some(bypass) = &slot.effective.bypassed {
                delegation_audit.push(
                    DelegationAuditEntry::new(
                        bypass.delegation_id.clone(),
                        DelegationAuditAction::LimitBypassed,
                        decision.actor_id.clone(),
                        at,
                    )
                    .for_instance(finished.instance.id.clone())
                    .with_details(bypass.violation.reason()),
                );
            }
        }
        if decision.action == DecisionAction::Approve {
            usage.record(&decision.actor_id, at);
        }
        drop(usage);

        let usage = read(&self.usage);
        let notifications = self.notifications_for(&finished, &registry, &usage, at);
        drop(usage);
        drop(registry);

        *instance = finished.instance.clone();
        Ok(self.seal(finished, Some(expected_version), delegation_audit, delegation_usage, notifications))
    }

    // ---- escalation ----

    /// Manual escalation by an eligible approver or an admin.
    pub fn escalate(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
        actor_id: &UserId,
        correlation_id: &str,
    ) -> Result<TransitionReport, DomainError> {
        let at = self.clock.now();
        let result = self.escalate_inner(instance_id, step_id, actor_id, at);
        self.audited(correlation_id, "escalate", Some(instance_id), actor_id, at, result)
    }

    fn escalate_inner(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
        actor_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<TransitionReport, DomainError> {
        let handle = self.handle(instance_id)?;
        let mut instance = lock(&handle);
        let pending = PendingTransition::begin(&instance, TransitionKind::Escalate, at)?;
        let step = pending.expect_step(step_id)?;

        let authorized = self.resolver.is_admin(actor_id, &self.settings.admin_role)? || {
            let registry = read(&self.registry);
            let usage = read(&self.usage);
            self.eligible_for(&instance, &step, &registry, &usage, at)?.contains(actor_id)
        };
        if !authorized {
            return Err(not_eligible(actor_id, IneligibilityReason::NotAnApprover));
        }
        if instance.is_step_escalated(&step.id) {
            return Err(ApprovalError::InvalidTransition {
                instance_id: instance.id.clone(),
                status: instance.status(),
                action: TransitionKind::Escalate.as_str(),
                detail: format!("step {} is already escalated", step.id),
            }
            .into());
        }

        let trigger = EscalationTrigger::Manual(actor_id.clone());
        self.apply_escalation(&mut instance, pending, step, &trigger, at).map(|(report, _)| report)
    }

    /// Fires the escalation timer for `step_id`. Returns `None` without touching the
    /// instance when the step is no longer the open, unescalated, overdue current step.
    pub fn fire_escalation_timer(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
        correlation_id: &str,
    ) -> Result<Option<TransitionReport>, DomainError> {
        let at = self.clock.now();
        let handle = self.handle(instance_id)?;
        let mut instance = lock(&handle);
        let outcome = self.fire_locked(&mut instance, Some(step_id), at);
        match outcome {
            Ok(None) => {
                tracing::debug!(
                    event_name = "escalation.timer_noop",
                    correlation_id,
                    instance_id = %instance_id,
                    step_id = %step_id,
                    "escalation timer found nothing to do"
                );
                Ok(None)
            }
            Ok(Some((report, _))) => self
                .audited(correlation_id, "escalate", Some(instance_id), &UserId::system(), at, Ok(report))
                .map(Some),
            Err(error) => self
                .audited(correlation_id, "escalate", Some(instance_id), &UserId::system(), at, Err(error))
                .map(Some),
        }
    }

    fn fire_locked(
        &self,
        instance: &mut WorkflowInstance,
        step_id: Option<&StepId>,
        at: DateTime<Utc>,
    ) -> Result<Option<(TransitionReport, EscalationPlan)>, DomainError> {
        if !is_escalation_due(instance, at) {
            return Ok(None);
        }
        let Some(step) = instance.current_step().cloned() else {
            return Ok(None);
        };
        if step_id.is_some_and(|expected| expected != &step.id) {
            return Ok(None);
        }

        let pending = PendingTransition::begin(instance, TransitionKind::Escalate, at)?;
        self.apply_escalation(instance, pending, step, &EscalationTrigger::Timer, at).map(Some)
    }

    fn apply_escalation(
        &self,
        instance: &mut WorkflowInstance,
        mut pending: PendingTransition,
        step: WorkflowStep,
        trigger: &EscalationTrigger,
        at: DateTime<Utc>,
    ) -> Result<(TransitionReport, EscalationPlan), DomainError> {
        let expected_version = instance.state_version;
        let actor = match trigger {
            EscalationTrigger::Timer => Actor::system(),
            EscalationTrigger::Manual(user_id) => Actor::human(user_id.clone()),
        };
        let plan = EscalationPlan::for_tier(&step.tier, trigger);

        match &plan {
            EscalationPlan::ToUser { user_id } => pending.escalate_to_user(&step, &actor, user_id),
            EscalationPlan::ToTier { level } => {
                let target = read(&self.catalog)
                    .get(&instance.configuration_id, instance.configuration_version)
                    .and_then(|config| config.tier(*level))
                    .cloned()
                    .ok_or_else(|| ApprovalError::InvalidConfiguration {
                        configuration_id: instance.configuration_id.clone(),
                        reason: format!("escalation target tier {level} is not configured"),
                    })?;
                pending.escalate_to_tier(&step, &actor, &target)?;
            }
            EscalationPlan::AutoApprove => {
                let mut entry = pending.entry(Some(&step), StepAction::Approved, &actor);
                entry.comments = Some("auto-approved after escalation timeout".to_string());
                pending.approve(&step, entry, true);
            }
            EscalationPlan::MarkEscalated => pending.escalate_in_place(&step, &actor),
        }
        let finished = pending.finish()?;

        let notifications = {
            let registry = read(&self.registry);
            let usage = read(&self.usage);
            self.notifications_for(&finished, &registry, &usage, at)
        };
        tracing::info!(
            event_name = "escalation.fired",
            instance_id = %finished.instance.id,
            step_id = %step.id,
            tier_level = step.tier.level,
            plan = plan.as_str(),
            timer = trigger.is_timer(),
            "step escalated"
        );

        *instance = finished.instance.clone();
        let report = self.seal(finished, Some(expected_version), Vec::new(), Vec::new(), notifications);
        Ok((report, plan))
    }

    /// One pass of the escalation scheduler. Only instances with an overdue step or a
    /// pending reminder count toward `limit`; a pass that hits the limit resumes after
    /// the last instance it examined on the next call. A failure on one instance is
    /// reported and the pass continues.
    pub fn run_escalation_sweep(&self, limit: usize, correlation_id: &str) -> SweepReport {
        let at = self.clock.now();
        let mut handles: Vec<(InstanceId, InstanceHandle)> = read(&self.instances)
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(cursor) = lock(&self.sweep_cursor).take() {
            let resume_at = handles.partition_point(|(id, _)| id <= &cursor);
            handles.rotate_left(resume_at);
        }

        let mut report = SweepReport::default();
        let mut last_examined = None;
        for (instance_id, handle) in handles {
            if report.examined >= limit {
                *lock(&self.sweep_cursor) = last_examined;
                break;
            }
            let mut instance = lock(&handle);
            if !is_escalation_due(&instance, at) && !self.reminder_pending(&instance, at) {
                continue;
            }
            report.examined += 1;
            last_examined = Some(instance_id.clone());
            report.reminders += self.send_reminders(&instance, at);

            let step_id = instance.current_step().map(|step| step.id.clone());
            match self.fire_locked(&mut instance, None, at) {
                Ok(None) => {}
                Ok(Some((transition, plan))) => {
                    report.escalated += 1;
                    if plan == EscalationPlan::AutoApprove {
                        report.auto_approved += 1;
                    }
                    if let Ok(transition) = self.audited(
                        correlation_id,
                        "escalate",
                        Some(&instance_id),
                        &UserId::system(),
                        at,
                        Ok(transition),
                    ) {
                        report.transitions.push(transition);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        event_name = "escalation.instance_failed",
                        correlation_id,
                        instance_id = %instance_id,
                        error = %error,
                        "escalation failed; retrying on the next tick"
                    );
                    report.failures.push(SweepFailure {
                        instance_id,
                        step_id,
                        message: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            event_name = "escalation.sweep_completed",
            correlation_id,
            examined = report.examined,
            escalated = report.escalated,
            auto_approved = report.auto_approved,
            reminders = report.reminders,
            failures = report.failures.len(),
            "escalation sweep completed"
        );
        report
    }

    fn reminder_pending(&self, instance: &WorkflowInstance, at: DateTime<Utc>) -> bool {
        if !instance.status().is_open() {
            return false;
        }
        let Some(step) = instance.current_step() else {
            return false;
        };
        let due = reminders_due(step, at);
        due > 0 && lock(&self.reminders).get(&step.id).copied().unwrap_or(0) < due
    }

    fn send_reminders(&self, instance: &WorkflowInstance, at: DateTime<Utc>) -> usize {
        if !self.reminder_pending(instance, at) {
            return 0;
        }
        let Some(step) = instance.current_step() else {
            return 0;
        };
        let due = reminders_due(step, at);

        let intents = {
            let registry = read(&self.registry);
            let usage = read(&self.usage);
            self.step_intents(instance, step, NotificationType::Reminder, &registry, &usage, at)
        };
        lock(&self.reminders).insert(step.id.clone(), due);
        for intent in &intents {
            self.notifications.emit(intent.clone());
        }
        intents.len()
    }

    // ---- cancel / resubmit ----

    pub fn cancel(
        &self,
        instance_id: &InstanceId,
        actor_id: &UserId,
        reason: Option<&str>,
        correlation_id: &str,
    ) -> Result<TransitionReport, DomainError> {
        let at = self.clock.now();
        let result = self.cancel_inner(instance_id, actor_id, reason, at);
        self.audited(correlation_id, "cancel", Some(instance_id), actor_id, at, result)
    }

    fn cancel_inner(
        &self,
        instance_id: &InstanceId,
        actor_id: &UserId,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<TransitionReport, DomainError> {
        let handle = self.handle(instance_id)?;
        let mut instance = lock(&handle);
        let expected_version = instance.state_version;
        let mut pending = PendingTransition::begin(&instance, TransitionKind::Cancel, at)?;
        self.authorize_requester_or_admin(&instance, actor_id)?;

        pending.cancel(&Actor::human(actor_id.clone()), reason);
        let finished = pending.finish()?;
        let notifications = {
            let registry = read(&self.registry);
            let usage = read(&self.usage);
            self.notifications_for(&finished, &registry, &usage, at)
        };

        *instance = finished.instance.clone();
        Ok(self.seal(finished, Some(expected_version), Vec::new(), Vec::new(), notifications))
    }

    /// Starts a new cycle for a returned request. Tiers are resolved again, against the
    /// configuration version the instance was routed with, using `attributes` when given.
    pub fn resubmit(
        &self,
        instance_id: &InstanceId,
        actor_id: &UserId,
        attributes: Option<RequestAttributes>,
        correlation_id: &str,
    ) -> Result<TransitionReport, DomainError> {
        let at = self.clock.now();
        let result = self.resubmit_inner(instance_id, actor_id, attributes, at);
        self.audited(correlation_id, "resubmit", Some(instance_id), actor_id, at, result)
    }

    fn resubmit_inner(
        &self,
        instance_id: &InstanceId,
        actor_id: &UserId,
        attributes: Option<RequestAttributes>,
        at: DateTime<Utc>,
    ) -> Result<TransitionReport, DomainError> {
        let handle = self.handle(instance_id)?;
        let mut instance = lock(&handle);
        let expected_version = instance.state_version;
        let mut pending = PendingTransition::begin(&instance, TransitionKind::Resubmit, at)?;
        self.authorize_requester_or_admin(&instance, actor_id)?;

        let tiers = {
            let catalog = read(&self.catalog);
            let config = catalog
                .get(&instance.configuration_id, instance.configuration_version)
                .ok_or_else(|| {
                    ApprovalError::ConfigurationNotFound(format!(
                        "{}@{}",
                        instance.configuration_id, instance.configuration_version
                    ))
                })?;
            let routed_with = attributes.as_ref().unwrap_or(&instance.context.attributes);
            self.tiers.resolve(config, routed_with)?
        };
        pending.resubmit(&Actor::human(actor_id.clone()), tiers, attributes)?;
        let finished = pending.finish()?;

        let notifications = {
            let registry = read(&self.registry);
            let usage = read(&self.usage);
            self.notifications_for(&finished, &registry, &usage, at)
        };
        *instance = finished.instance.clone();
        Ok(self.seal(finished, Some(expected_version), Vec::new(), Vec::new(), notifications))
    }

    fn authorize_requester_or_admin(
        &self,
        instance: &WorkflowInstance,
        actor_id: &UserId,
    ) -> Result<(), ApprovalError> {
        if actor_id == instance.requester_id()
            || self.resolver.is_admin(actor_id, &self.settings.admin_role)?
        {
            return Ok(());
        }
        Err(ApprovalError::NotEligible {
            actor_id: actor_id.clone(),
            reason: IneligibilityReason::NotRequesterOrAdmin,
        })
    }

    // ---- delegations ----

    pub fn create_delegation(
        &self,
        request: NewDelegation,
        correlation_id: &str,
    ) -> Result<DelegationChange, DomainError> {
        let at = self.clock.now();
        let actor = request.created_by.clone();
        let mut registry = write(&self.registry);
        let result = registry.create(request, at);
        self.delegation_change(correlation_id, "delegation.created", &actor, at, result)
    }

    /// Takes effect for every lookup from now on. Proxy records already written stay.
    pub fn revoke_delegation(
        &self,
        id: &DelegationId,
        revoked_by: &UserId,
        reason: &str,
        correlation_id: &str,
    ) -> Result<DelegationChange, DomainError> {
        let at = self.clock.now();
        let mut registry = write(&self.registry);
        let result = registry.revoke(id, revoked_by.clone(), at, reason);
        self.delegation_change(correlation_id, "delegation.revoked", revoked_by, at, result)
    }

    /// Callers hold the registry write lock so delegation commits publish in order.
    fn delegation_change(
        &self,
        correlation_id: &str,
        event_type: &str,
        actor: &UserId,
        at: DateTime<Utc>,
        result: Result<(DelegationRule, DelegationAuditEntry), ApprovalError>,
    ) -> Result<DelegationChange, DomainError> {
        match result {
            Ok((rule, audit)) => {
                let ledger_entry = lock(&self.ledger).append(&delegation_chain_key(&audit), &audit);
                lock(&self.delegation_audit).push(audit.clone());
                self.audit.emit(
                    AuditEvent::new(
                        None,
                        correlation_id,
                        event_type,
                        AuditCategory::Delegation,
                        actor.as_str(),
                        AuditOutcome::Success,
                        at,
                    )
                    .with_metadata("delegation_id", rule.id.to_string())
                    .with_metadata("status", rule.status_at(at).as_str()),
                );
                let change = DelegationChange { rule, audit, ledger_entry };
                self.publish(Commit::Delegation(Box::new(change.clone())));
                Ok(change)
            }
            Err(error) => {
                tracing::warn!(
                    event_name = "delegation.change_rejected",
                    correlation_id,
                    actor = %actor,
                    error = %error,
                    "delegation change rejected"
                );
                self.audit.emit(
                    AuditEvent::new(
                        None,
                        correlation_id,
                        "delegation.change_rejected",
                        AuditCategory::Delegation,
                        actor.as_str(),
                        AuditOutcome::Rejected,
                        at,
                    )
                    .with_metadata("error", error.to_string()),
                );
                Err(error.into())
            }
        }
    }

    pub fn delegation(&self, id: &DelegationId) -> Option<(DelegationRule, DelegationStatus)> {
        let at = self.clock.now();
        read(&self.registry).get(id).map(|rule| (rule.clone(), rule.status_at(at)))
    }

    pub fn delegations_granted_by(&self, user: &UserId) -> Vec<(DelegationRule, DelegationStatus)> {
        read(&self.registry).granted_by(user, self.clock.now())
    }

    pub fn delegation_audit(&self, id: &DelegationId) -> Vec<DelegationAuditEntry> {
        lock(&self.delegation_audit)
            .iter()
            .filter(|entry| &entry.delegation_id == id)
            .cloned()
            .collect()
    }

    // ---- queries ----

    pub fn instance(&self, id: &InstanceId) -> Result<WorkflowInstance, DomainError> {
        let handle = self.handle(id)?;
        let instance = lock(&handle).clone();
        Ok(instance)
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = read(&self.instances).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Who may act on the current step right now. Read-only: nothing is audited.
    pub fn eligible_approvers(&self, id: &InstanceId) -> Result<EligibleSet, DomainError> {
        let instance = self.instance(id)?;
        let step = instance.current_step().cloned().ok_or_else(|| {
            ApprovalError::InvalidTransition {
                instance_id: instance.id.clone(),
                status: instance.status(),
                action: "inspect",
                detail: "no step is active".to_string(),
            }
        })?;
        let at = self.clock.now();
        let registry = read(&self.registry);
        let usage = read(&self.usage);
        Ok(self.eligible_for(&instance, &step, &registry, &usage, at)?)
    }

    pub fn audit_trail(&self, id: &InstanceId) -> Result<AuditTrail, DomainError> {
        let instance = self.instance(id)?;
        let delegation_audit = lock(&self.delegation_audit)
            .iter()
            .filter(|entry| entry.instance_id.as_ref() == Some(id))
            .cloned()
            .collect();
        let verification = lock(&self.ledger).verify_chain(&id.0);
        Ok(AuditTrail {
            instance_id: instance.id.clone(),
            reference_id: instance.reference_id.clone(),
            status: instance.status(),
            current_step_order: instance.current_step_order,
            step_history: instance.step_history,
            rejection_history: instance.rejection_history,
            proxy_approvals: instance.proxy_approvals,
            delegation_audit,
            verification,
        })
    }

    // ---- hydration ----

    /// Loads a persisted instance. Its stored position must agree with its history.
    pub fn restore_instance(&self, instance: WorkflowInstance) -> Result<(), DomainError> {
        instance.verify_projection().map_err(DomainError::InvariantViolation)?;
        write(&self.catalog).mark_referenced(&instance.configuration_id, instance.configuration_version);
        {
            let mut usage = write(&self.usage);
            for entry in instance
                .step_history
                .iter()
                .filter(|entry| entry.action == StepAction::Approved && !entry.is_system_action)
            {
                usage.record(&entry.action_by, entry.created_at);
            }
        }
        write(&self.instances).insert(instance.id.clone(), Arc::new(Mutex::new(instance)));
        Ok(())
    }

    pub fn restore_delegation(&self, rule: DelegationRule) {
        write(&self.registry).insert(rule);
    }

    pub fn restore_delegation_usage(&self, id: DelegationId, day: NaiveDate, count: u32) {
        write(&self.registry).restore_usage(id, day, count);
    }

    pub fn restore_delegation_audit(&self, entries: impl IntoIterator<Item = DelegationAuditEntry>) {
        lock(&self.delegation_audit).extend(entries);
    }

    pub fn restore_ledger(&self, entries: impl IntoIterator<Item = LedgerEntry>) {
        lock(&self.ledger).restore(entries);
    }

    // ---- internals ----

    fn handle(&self, id: &InstanceId) -> Result<InstanceHandle, ApprovalError> {
        read(&self.instances)
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| ApprovalError::InstanceNotFound(id.clone()))
    }

    fn eligible_for(
        &self,
        instance: &WorkflowInstance,
        step: &WorkflowStep,
        registry: &DelegationRegistry,
        usage: &ApproverUsage,
        at: DateTime<Utc>,
    ) -> Result<EligibleSet, ApprovalError> {
        let scope = EligibilityScope {
            registry,
            usage,
            at,
            escalation_assignee: instance.escalation_assignee(&step.id),
        };
        self.resolver.eligible(&step.tier, &instance.context, scope)
    }

    fn step_intents(
        &self,
        instance: &WorkflowInstance,
        step: &WorkflowStep,
        notification_type: NotificationType,
        registry: &DelegationRegistry,
        usage: &ApproverUsage,
        at: DateTime<Utc>,
    ) -> Vec<NotificationIntent> {
        let recipients = match self.eligible_for(instance, step, registry, usage, at) {
            Ok(set) => set.actors(),
            Err(error) => {
                tracing::warn!(
                    event_name = "notification.recipients_unresolved",
                    instance_id = %instance.id,
                    step_id = %step.id,
                    error = %error,
                    "could not resolve notification recipients"
                );
                Vec::new()
            }
        };
        recipients
            .into_iter()
            .map(|recipient| {
                NotificationIntent::new(
                    recipient,
                    notification_type,
                    instance.id.clone(),
                    Some(step.id.clone()),
                    at,
                )
                .with_message(format!(
                    "tier {} ({}) for {} {} awaits your decision",
                    step.tier.level, step.tier.name, instance.reference_type, instance.reference_id
                ))
            })
            .collect()
    }

    fn notifications_for(
        &self,
        finished: &FinishedTransition,
        registry: &DelegationRegistry,
        usage: &ApproverUsage,
        at: DateTime<Utc>,
    ) -> Vec<NotificationIntent> {
        let instance = &finished.instance;
        let requester = instance.requester_id().clone();
        let last_step = finished.history.last().and_then(|entry| entry.step_id.clone());
        let to_requester = |notification_type: NotificationType, message: String| {
            vec![NotificationIntent::new(
                requester.clone(),
                notification_type,
                instance.id.clone(),
                last_step.clone(),
                at,
            )
            .with_message(message)]
        };
        let subject = format!("{} {}", instance.reference_type, instance.reference_id);
        let latest_reason =
            || finished.rejections.last().map(|entry| entry.reason.clone()).unwrap_or_default();

        match instance.status() {
            WorkflowStatus::Approved => {
                to_requester(NotificationType::ApprovalComplete, format!("{subject} was approved"))
            }
            WorkflowStatus::Rejected => to_requester(
                NotificationType::Rejected,
                format!("{subject} was rejected: {}", latest_reason()),
            ),
            WorkflowStatus::Returned => to_requester(
                NotificationType::Returned,
                format!("{subject} was returned to you: {}", latest_reason()),
            ),
            WorkflowStatus::Cancelled => {
                to_requester(NotificationType::Cancelled, format!("{subject} was cancelled"))
            }
            WorkflowStatus::Escalated => {
                let Some(step) = instance.current_step() else {
                    return Vec::new();
                };
                if let Some(assignee) = instance.escalation_assignee(&step.id) {
                    return vec![NotificationIntent::new(
                        assignee.clone(),
                        NotificationType::EscalationFired,
                        instance.id.clone(),
                        Some(step.id.clone()),
                        at,
                    )
                    .with_message(format!("{subject} was escalated to you"))];
                }
                let mut intents = self.step_intents(
                    instance,
                    step,
                    NotificationType::EscalationFired,
                    registry,
                    usage,
                    at,
                );
                intents.extend(to_requester(
                    NotificationType::EscalationFired,
                    format!("{subject} is overdue at tier {}", step.tier.level),
                ));
                intents
            }
            WorkflowStatus::Pending | WorkflowStatus::InProgress => {
                let moved = finished.history.iter().any(|entry| {
                    entry.tier_completed
                        || matches!(entry.action, StepAction::Skipped | StepAction::Resubmitted)
                });
                let Some(step) = instance.current_step().filter(|_| moved) else {
                    return Vec::new();
                };
                let notification_type =
                    if finished.history.iter().any(|entry| entry.action == StepAction::Escalated) {
                        NotificationType::EscalationFired
                    } else {
                        NotificationType::StepActivated
                    };
                self.step_intents(instance, step, notification_type, registry, usage, at)
            }
        }
    }

    /// Seals the committed records into the ledger and publishes the commit. Runs under
    /// the instance lock so each instance chain is appended in commit order.
    fn seal(
        &self,
        finished: FinishedTransition,
        expected_version: Option<u64>,
        delegation_audit: Vec<DelegationAuditEntry>,
        delegation_usage: Vec<DelegationUsage>,
        notifications: Vec<NotificationIntent>,
    ) -> TransitionReport {
        let chain_key = finished.instance.id.0.clone();
        let mut ledger_entries = Vec::new();
        {
            let mut ledger = lock(&self.ledger);
            for entry in &finished.history {
                ledger_entries.push(ledger.append(&chain_key, entry));
            }
            for entry in &finished.rejections {
                ledger_entries.push(ledger.append(&chain_key, entry));
            }
            for record in &finished.proxy_approvals {
                ledger_entries.push(ledger.append(&chain_key, record));
            }
            for entry in &delegation_audit {
                ledger_entries.push(ledger.append(&delegation_chain_key(entry), entry));
            }
        }
        lock(&self.delegation_audit).extend(delegation_audit.iter().cloned());
        self.prune_reminders(&finished.instance);

        tracing::info!(
            event_name = "workflow.transition_applied",
            instance_id = %finished.instance.id,
            transition = finished.kind.as_str(),
            status = %finished.instance.status(),
            current_step_order = ?finished.instance.current_step_order,
            state_version = finished.instance.state_version,
            "workflow transition applied"
        );

        let report = TransitionReport {
            transition: finished.kind.as_str().to_string(),
            instance: finished.instance,
            expected_version,
            history: finished.history,
            rejections: finished.rejections,
            proxy_approvals: finished.proxy_approvals,
            delegation_audit,
            delegation_usage,
            ledger_entries,
            notifications,
            referenced_configuration: None,
        };
        self.publish(Commit::Transition(Box::new(report.clone())));
        report
    }

    /// Drops reminder counters for every step of `instance` that is no longer current.
    fn prune_reminders(&self, instance: &WorkflowInstance) {
        let current = instance
            .current_step()
            .filter(|_| instance.status().is_open())
            .map(|step| &step.id);
        let mut reminders = lock(&self.reminders);
        for step in &instance.steps {
            if Some(&step.id) != current {
                reminders.remove(&step.id);
            }
        }
    }

    fn publish(&self, commit: Commit) {
        if let Some(commits) = &self.commits {
            commits.committed(commit);
        }
    }

    /// Emits the audit event for a transition attempt and, on success, its notifications.
    fn audited(
        &self,
        correlation_id: &str,
        transition: &str,
        instance_id: Option<&InstanceId>,
        actor: &UserId,
        at: DateTime<Utc>,
        result: Result<TransitionReport, DomainError>,
    ) -> Result<TransitionReport, DomainError> {
        let category = if transition == "escalate" {
            AuditCategory::Escalation
        } else {
            AuditCategory::Workflow
        };
        match &result {
            Ok(report) => {
                self.audit.emit(
                    AuditEvent::new(
                        Some(report.instance.id.clone()),
                        correlation_id,
                        "workflow.transition_applied",
                        category,
                        actor.as_str(),
                        AuditOutcome::Success,
                        at,
                    )
                    .with_metadata("transition", transition)
                    .with_metadata("status", report.status().as_str())
                    .with_metadata("state_version", report.instance.state_version.to_string()),
                );
                for intent in &report.notifications {
                    self.notifications.emit(intent.clone());
                }
            }
            Err(error) => {
                tracing::warn!(
                    event_name = "workflow.transition_rejected",
                    correlation_id,
                    instance_id = ?instance_id.map(|id| id.0.as_str()),
                    transition,
                    actor = %actor,
                    error = %error,
                    "workflow transition rejected"
                );
                self.audit.emit(
                    AuditEvent::new(
                        instance_id.cloned(),
                        correlation_id,
                        "workflow.transition_rejected",
                        category,
                        actor.as_str(),
                        AuditOutcome::Rejected,
                        at,
                    )
                    .with_metadata("transition", transition)
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

/// The identity `actor_id` acts under. Holding any slot directly makes it a first-hand
/// action; otherwise the actor is a delegate and the first delegated slot is recorded.
fn acting_as<'a>(set: &'a EligibleSet, actor_id: &UserId) -> (Actor, Option<&'a ApproverSlot>) {
    let held: Vec<&ApproverSlot> = set.slots.iter().filter(|slot| slot.actor() == actor_id).collect();
    if let Some(direct) = held.iter().find(|slot| !slot.effective.is_delegated()) {
        return (Actor::human(actor_id.clone()), Some(*direct));
    }
    match held.first() {
        Some(slot) => match slot.effective.delegation_id() {
            Some(delegation_id) => (
                Actor::proxy(actor_id.clone(), slot.nominal.clone(), delegation_id.clone()),
                Some(*slot),
            ),
            None => (Actor::human(actor_id.clone()), Some(*slot)),
        },
        None => (Actor::human(actor_id.clone()), None),
    }
}

fn not_eligible(actor_id: &UserId, reason: IneligibilityReason) -> DomainError {
    ApprovalError::NotEligible { actor_id: actor_id.clone(), reason }.into()
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
