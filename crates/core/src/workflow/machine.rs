use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::delegation::{DelegationId, ProxyApprovalRecord};
use crate::domain::request::{RequestAttributes, UserId};
use crate::domain::tier::ApprovalTier;
use crate::domain::workflow::{
    RejectionHistoryEntry, StepAction, StepId, WorkflowInstance, WorkflowStatus, WorkflowStep,
    WorkflowStepHistory,
};
use crate::errors::{ApprovalError, DomainError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Approve,
    Reject,
    Return,
    Escalate,
    Cancel,
    Resubmit,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Return => "return",
            Self::Escalate => "escalate",
            Self::Cancel => "cancel",
            Self::Resubmit => "resubmit",
        }
    }

    fn allowed_from(&self, status: WorkflowStatus) -> Result<(), &'static str> {
        match self {
            Self::Resubmit if status == WorkflowStatus::Returned => Ok(()),
            Self::Resubmit => Err("only returned requests can be resubmitted"),
            _ if status.is_terminal() => Err("the instance is in a terminal state"),
            _ if status == WorkflowStatus::Returned => {
                Err("the request was returned and awaits resubmission")
            }
            _ => Ok(()),
        }
    }
}

/// Who is performing a transition. A proxy actor carries the approver they stand in for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub proxy: Option<ProxyContext>,
    pub is_system: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyContext {
    pub original_approver_id: UserId,
    pub delegation_id: DelegationId,
}

impl Actor {
    pub fn human(user_id: UserId) -> Self {
        Self { user_id, proxy: None, is_system: false }
    }

    pub fn proxy(user_id: UserId, original_approver_id: UserId, delegation_id: DelegationId) -> Self {
        Self {
            user_id,
            proxy: Some(ProxyContext { original_approver_id, delegation_id }),
            is_system: false,
        }
    }

    pub fn system() -> Self {
        Self { user_id: UserId::system(), proxy: None, is_system: true }
    }

    fn stamp(&self, entry: &mut WorkflowStepHistory) {
        entry.action_by = self.user_id.clone();
        entry.is_system_action = self.is_system;
        if let Some(proxy) = &self.proxy {
            entry.is_proxy_approval = true;
            entry.original_approver_id = Some(proxy.original_approver_id.clone());
            entry.delegation_id = Some(proxy.delegation_id.clone());
        }
    }
}

/// Working copy of an instance for one transition. Nothing reaches the live instance until
/// [`PendingTransition::finish`] succeeds and the caller swaps the copy in.
#[derive(Debug)]
pub struct PendingTransition {
    kind: TransitionKind,
    instance: WorkflowInstance,
    history: Vec<WorkflowStepHistory>,
    rejections: Vec<RejectionHistoryEntry>,
    proxy_approvals: Vec<ProxyApprovalRecord>,
    at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct FinishedTransition {
    pub kind: TransitionKind,
    pub instance: WorkflowInstance,
    pub history: Vec<WorkflowStepHistory>,
    pub rejections: Vec<RejectionHistoryEntry>,
    pub proxy_approvals: Vec<ProxyApprovalRecord>,
}

impl PendingTransition {
    pub fn begin(
        instance: &WorkflowInstance,
        kind: TransitionKind,
        at: DateTime<Utc>,
    ) -> Result<Self, ApprovalError> {
        let status = instance.status();
        kind.allowed_from(status).map_err(|detail| ApprovalError::InvalidTransition {
            instance_id: instance.id.clone(),
            status,
            action: kind.as_str(),
            detail: detail.to_string(),
        })?;
        Ok(Self {
            kind,
            instance: instance.clone(),
            history: Vec::new(),
            rejections: Vec::new(),
            proxy_approvals: Vec::new(),
            at,
        })
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    fn invalid(&self, detail: impl Into<String>) -> ApprovalError {
        ApprovalError::InvalidTransition {
            instance_id: self.instance.id.clone(),
            status: self.instance.status(),
            action: self.kind.as_str(),
            detail: detail.into(),
        }
    }

    pub fn current_step(&self) -> Result<WorkflowStep, ApprovalError> {
        self.instance.current_step().cloned().ok_or_else(|| self.invalid("no step is active"))
    }

    /// The current step, provided it is the one the caller acted on.
    pub fn expect_step(&self, step_id: &StepId) -> Result<WorkflowStep, ApprovalError> {
        let current = self.current_step()?;
        if &current.id != step_id {
            return Err(self.invalid(format!("step {step_id} is not the current step")));
        }
        Ok(current)
    }

    pub fn entry(
        &self,
        step: Option<&WorkflowStep>,
        action: StepAction,
        actor: &Actor,
    ) -> WorkflowStepHistory {
        let mut entry =
            WorkflowStepHistory::new(&self.instance, step, action, actor.user_id.clone(), self.at);
        actor.stamp(&mut entry);
        entry
    }

    fn push(&mut self, entry: WorkflowStepHistory) {
        self.instance.current_step_order = entry.to_step_order;
        self.instance.step_history.push(entry.clone());
        self.history.push(entry);
    }

    fn activate(&mut self, order: u32) {
        let at = self.at;
        if let Some(step) = self.instance.steps.iter_mut().find(|step| step.order == order) {
            step.activated_at = Some(at);
        }
    }

    /// Records an approval. When the tier is satisfied the instance moves to the next step
    /// or completes.
    pub fn approve(
        &mut self,
        step: &WorkflowStep,
        mut entry: WorkflowStepHistory,
        tier_satisfied: bool,
    ) {
        entry.tier_completed = tier_satisfied;
        entry.to_step_order = Some(step.order);
        if tier_satisfied {
            match self.instance.next_step_after(step.order).map(|next| next.order) {
                Some(next) => {
                    entry.to_step_order = Some(next);
                    self.activate(next);
                }
                None => {
                    entry.workflow_completed = true;
                    entry.to_step_order = None;
                    self.instance.completed_at = Some(self.at);
                }
            }
        }
        self.push(entry);
    }

    /// Rejection ends the instance; a return sends it back to the requester at the first
    /// step. Earlier history is never touched.
    pub fn reject(
        &mut self,
        step: &WorkflowStep,
        actor: &Actor,
        reason: &str,
        returned_to_requestor: bool,
    ) -> Result<(), ApprovalError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ApprovalError::MissingReason { action: self.kind.as_str() });
        }

        let action = if returned_to_requestor { StepAction::Returned } else { StepAction::Rejected };
        let mut entry = self.entry(Some(step), action, actor);
        entry.comments = Some(reason.to_string());
        if returned_to_requestor {
            entry.to_step_order = self.instance.steps.iter().map(|step| step.order).min();
        } else {
            entry.to_step_order = None;
            self.instance.completed_at = Some(self.at);
        }

        self.rejections.push(RejectionHistoryEntry {
            id: Uuid::new_v4().to_string(),
            instance_id: self.instance.id.clone(),
            step_id: step.id.clone(),
            tier_level: step.tier.level,
            rejected_by: actor.user_id.clone(),
            reason: reason.to_string(),
            returned_to_requestor,
            is_proxy_approval: entry.is_proxy_approval,
            original_approver_id: entry.original_approver_id.clone(),
            cycle: self.instance.cycle,
            created_at: self.at,
        });
        self.instance.rejection_history.push(self.rejections[self.rejections.len() - 1].clone());
        self.push(entry);
        Ok(())
    }

    /// Hands the step to a named user. The instance stays on this step, marked escalated.
    pub fn escalate_to_user(&mut self, step: &WorkflowStep, actor: &Actor, assignee: &UserId) {
        let mut entry = self.entry(Some(step), StepAction::Escalated, actor);
        entry.assigned_to = Some(assignee.clone());
        entry.comments = Some(format!("escalated to {assignee}"));
        self.push(entry);
    }

    /// Marks the step escalated without moving it.
    pub fn escalate_in_place(&mut self, step: &WorkflowStep, actor: &Actor) {
        let mut entry = self.entry(Some(step), StepAction::Escalated, actor);
        entry.comments = Some("escalation timeout reached with no target".to_string());
        self.push(entry);
    }

    /// Jumps to a higher tier. Steps passed over are recorded as skipped; a tier the
    /// instance was not routed through is inserted in level order.
    pub fn escalate_to_tier(
        &mut self,
        step: &WorkflowStep,
        actor: &Actor,
        target: &ApprovalTier,
    ) -> Result<u32, ApprovalError> {
        if target.level <= step.tier.level {
            return Err(self.invalid(format!(
                "escalation target tier {} is not above tier {}",
                target.level, step.tier.level
            )));
        }

        let mut escalated = self.entry(Some(step), StepAction::Escalated, actor);
        escalated.comments = Some(format!("escalated to tier {}", target.level));
        self.push(escalated);

        let target_order = self.ensure_step_for(step.order, target);
        let passed_over: Vec<WorkflowStep> = self
            .instance
            .steps
            .iter()
            .filter(|candidate| candidate.order >= step.order && candidate.order < target_order)
            .cloned()
            .collect();
        for (index, skipped_step) in passed_over.iter().enumerate() {
            let mut skipped = self.entry(Some(skipped_step), StepAction::Skipped, actor);
            skipped.comments = Some(format!("skipped by escalation to tier {}", target.level));
            skipped.to_step_order = passed_over
                .get(index + 1)
                .map(|next| next.order)
                .or(Some(target_order));
            self.push(skipped);
        }
        self.activate(target_order);
        Ok(target_order)
    }

    /// Returns the order of the step for `target`, inserting one after `from_order` if the
    /// instance has none. Later, not yet active steps are renumbered to keep orders dense.
    fn ensure_step_for(&mut self, from_order: u32, target: &ApprovalTier) -> u32 {
        if let Some(existing) = self
            .instance
            .steps
            .iter()
            .find(|candidate| candidate.order > from_order && candidate.tier.level == target.level)
        {
            return existing.order;
        }

        let insert_at = self
            .instance
            .steps
            .iter()
            .position(|candidate| candidate.order > from_order && candidate.tier.level > target.level)
            .unwrap_or(self.instance.steps.len());
        self.instance.steps.insert(insert_at, WorkflowStep::new(0, target.clone()));
        for (index, candidate) in self.instance.steps.iter_mut().enumerate() {
            candidate.order = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
        }
        self.instance.steps[insert_at].order
    }

    /// Writes the proxy record for a delegate's action taken in this transition.
    pub fn record_proxy(&mut self, step: &WorkflowStep, entry: &WorkflowStepHistory) {
        let (Some(original_approver_id), Some(delegation_id)) =
            (entry.original_approver_id.clone(), entry.delegation_id.clone())
        else {
            return;
        };
        let record = ProxyApprovalRecord {
            id: Uuid::new_v4().to_string(),
            instance_id: self.instance.id.clone(),
            step_id: step.id.clone(),
            delegation_id,
            proxy_user_id: entry.action_by.clone(),
            original_approver_id,
            tier_level: step.tier.level,
            action: entry.action.as_str().to_string(),
            recorded_at: self.at,
        };
        self.instance.proxy_approvals.push(record.clone());
        self.proxy_approvals.push(record);
    }

    /// The entry most recently appended by this transition.
    pub fn last_entry(&self) -> Option<&WorkflowStepHistory> {
        self.history.last()
    }

    pub fn cancel(&mut self, actor: &Actor, reason: Option<&str>) {
        let step = self.instance.current_step().cloned();
        let mut entry = self.entry(step.as_ref(), StepAction::Cancelled, actor);
        entry.comments = reason.map(|reason| reason.trim().to_string()).filter(|r| !r.is_empty());
        entry.to_step_order = None;
        self.instance.completed_at = Some(self.at);
        self.push(entry);
    }

    /// Starts a new cycle over freshly resolved tiers. Approvals from earlier cycles stay in
    /// history but no longer count.
    pub fn resubmit(
        &mut self,
        actor: &Actor,
        tiers: Vec<ApprovalTier>,
        attributes: Option<RequestAttributes>,
    ) -> Result<(), ApprovalError> {
        if tiers.is_empty() {
            return Err(self.invalid("resubmission resolved no tiers"));
        }
        if let Some(attributes) = attributes {
            self.instance.context.attributes = attributes;
        }

        self.instance.cycle += 1;
        self.instance.steps = build_steps(tiers, self.at);
        self.instance.completed_at = None;

        let first = self.instance.steps[0].clone();
        let mut entry = self.entry(Some(&first), StepAction::Resubmitted, actor);
        entry.to_step_order = Some(first.order);
        self.push(entry);
        Ok(())
    }

    pub fn finish(mut self) -> Result<FinishedTransition, DomainError> {
        self.instance.updated_at = self.at;
        self.instance.state_version += 1;
        self.instance.verify_projection().map_err(DomainError::InvariantViolation)?;
        Ok(FinishedTransition {
            kind: self.kind,
            instance: self.instance,
            history: self.history,
            rejections: self.rejections,
            proxy_approvals: self.proxy_approvals,
        })
    }
}

/// Materializes resolved tiers into steps ordered 1..n, with the first step active.
pub fn build_steps(tiers: Vec<ApprovalTier>, at: DateTime<Utc>) -> Vec<WorkflowStep> {
    tiers
        .into_iter()
        .enumerate()
        .map(|(index, tier)| {
            let order = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            let mut step = WorkflowStep::new(order, tier);
            if order == 1 {
                step.activated_at = Some(at);
            }
            step
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{build_steps, Actor, PendingTransition, TransitionKind};
    use crate::domain::request::{RequestAttributes, RequestContext, UserId};
    use crate::domain::tier::{
        ApprovalTier, ApproverLimit, ApproverType, ConfigurationId, TierApprover, WorkflowCategory,
    };
    use crate::domain::workflow::{InstanceId, StepAction, WorkflowInstance, WorkflowStatus};
    use crate::errors::ApprovalError;

    fn tier(level: u8) -> ApprovalTier {
        ApprovalTier {
            level,
            name: format!("Tier {level}"),
            category: None,
            thresholds: Vec::new(),
            approvers: vec![TierApprover {
                approver_type: ApproverType::User,
                approver_id: Some(format!("approver-{level}")),
                order: 0,
                is_required: true,
            }],
            require_all_approvers: false,
            sequential: false,
            auto_escalate_hours: None,
            auto_approve_on_timeout: false,
            escalation: None,
            reminder_interval_hours: None,
            approver_limits: ApproverLimit::default(),
            is_active: true,
        }
    }

    fn instance(levels: &[u8]) -> WorkflowInstance {
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).single().expect("valid date");
        WorkflowInstance {
            id: InstanceId("WF-1".to_string()),
            reference_id: "PO-1".to_string(),
            reference_type: "purchase_order".to_string(),
            category: WorkflowCategory::Purchase,
            configuration_id: ConfigurationId("purchase".to_string()),
            configuration_version: 1,
            context: RequestContext::new(
                UserId::new("dana"),
                WorkflowCategory::Purchase,
                RequestAttributes::new(),
            ),
            steps: build_steps(levels.iter().map(|level| tier(*level)).collect(), at),
            current_step_order: Some(1),
            cycle: 0,
            step_history: Vec::new(),
            rejection_history: Vec::new(),
            proxy_approvals: Vec::new(),
            state_version: 1,
            created_at: at,
            updated_at: at,
            completed_at: None,
        }
    }

    fn approve(instance: &WorkflowInstance, by: &str) -> WorkflowInstance {
        let mut pending =
            PendingTransition::begin(instance, TransitionKind::Approve, Utc::now()).expect("open");
        let step = pending.current_step().expect("step");
        let entry = pending.entry(Some(&step), StepAction::Approved, &Actor::human(UserId::new(by)));
        pending.approve(&step, entry, true);
        pending.finish().expect("consistent").instance
    }

    #[test]
    fn approvals_walk_the_ladder_to_completion() {
        let start = instance(&[2, 3]);

        let middle = approve(&start, "approver-2");
        assert_eq!(middle.status(), WorkflowStatus::InProgress);
        assert_eq!(middle.current_step_order, Some(2));

        let done = approve(&middle, "approver-3");
        assert_eq!(done.status(), WorkflowStatus::Approved);
        assert!(done.completed_at.is_some());
        assert_eq!(done.state_version, 3);
    }

    #[test]
    fn terminal_instances_refuse_every_transition() {
        let done = approve(&instance(&[1]), "approver-1");

        for kind in [
            TransitionKind::Approve,
            TransitionKind::Reject,
            TransitionKind::Escalate,
            TransitionKind::Cancel,
            TransitionKind::Resubmit,
        ] {
            assert!(matches!(
                PendingTransition::begin(&done, kind, Utc::now()),
                Err(ApprovalError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn return_resets_to_first_step_and_keeps_history() {
        let first_done = approve(&instance(&[1, 2, 3]), "approver-1");
        let mut pending =
            PendingTransition::begin(&first_done, TransitionKind::Return, Utc::now()).expect("open");
        let step = pending.current_step().expect("step");
        pending
            .reject(&step, &Actor::human(UserId::new("approver-2")), "needs a quote", true)
            .expect("return");
        let returned = pending.finish().expect("consistent").instance;

        assert_eq!(returned.status(), WorkflowStatus::Returned);
        assert_eq!(returned.current_step_order, Some(1));
        assert_eq!(returned.step_history.len(), 2);
        assert_eq!(returned.step_history[0].action, StepAction::Approved);
        assert!(returned.rejection_history[0].returned_to_requestor);
    }

    #[test]
    fn rejection_requires_a_reason() {
        let start = instance(&[1]);
        let mut pending =
            PendingTransition::begin(&start, TransitionKind::Reject, Utc::now()).expect("open");
        let step = pending.current_step().expect("step");

        let error = pending
            .reject(&step, &Actor::human(UserId::new("approver-1")), "  ", false)
            .expect_err("blank reason");
        assert_eq!(error, ApprovalError::MissingReason { action: "reject" });
    }

    #[test]
    fn tier_escalation_inserts_missing_tier_and_skips_current() {
        let start = instance(&[1, 4]);
        let mut pending =
            PendingTransition::begin(&start, TransitionKind::Escalate, Utc::now()).expect("open");
        let step = pending.current_step().expect("step");

        let order = pending.escalate_to_tier(&step, &Actor::system(), &tier(3)).expect("escalate");
        let escalated = pending.finish().expect("consistent").instance;

        assert_eq!(order, 2);
        let levels: Vec<u8> = escalated.steps.iter().map(|step| step.tier.level).collect();
        assert_eq!(levels, vec![1, 3, 4]);
        assert_eq!(escalated.current_step_order, Some(2));
        assert_eq!(escalated.status(), WorkflowStatus::InProgress);
        let actions: Vec<StepAction> =
            escalated.step_history.iter().map(|entry| entry.action).collect();
        assert_eq!(actions, vec![StepAction::Escalated, StepAction::Skipped]);
        assert!(escalated.step_history.iter().all(|entry| entry.is_system_action));
    }

    #[test]
    fn resubmit_starts_a_new_cycle() {
        let mut pending =
            PendingTransition::begin(&instance(&[1, 2]), TransitionKind::Return, Utc::now())
                .expect("open");
        let step = pending.current_step().expect("step");
        pending.reject(&step, &Actor::human(UserId::new("approver-1")), "missing receipt", true).expect("return");
        let returned = pending.finish().expect("consistent").instance;

        let mut pending =
            PendingTransition::begin(&returned, TransitionKind::Resubmit, Utc::now()).expect("returned");
        pending.resubmit(&Actor::human(UserId::new("dana")), vec![tier(1)], None).expect("resubmit");
        let resubmitted = pending.finish().expect("consistent").instance;

        assert_eq!(resubmitted.status(), WorkflowStatus::Pending);
        assert_eq!(resubmitted.cycle, 1);
        assert_eq!(resubmitted.steps.len(), 1);
        assert_eq!(resubmitted.step_history.len(), 2);
    }
}
