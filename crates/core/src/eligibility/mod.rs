pub mod directory;
pub mod sources;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::delegation::{DelegationRegistry, EffectiveApprover};
use crate::domain::request::{RequestContext, UserId};
use crate::domain::tier::{ApprovalTier, ApproverType};
use crate::domain::workflow::WorkflowStepHistory;
use crate::errors::{ApprovalError, IneligibilityReason};

pub use directory::{
    Department, DirectoryClient, DirectoryFile, DirectoryFileError, DirectoryUser,
    InMemoryDirectory,
};
pub use sources::{source_for, ApproverSource};

/// Approvals recorded per actor per day, for `ApproverLimit.max_approvals_per_day`.
#[derive(Clone, Debug, Default)]
pub struct ApproverUsage {
    counts: HashMap<(UserId, NaiveDate), u32>,
}

impl ApproverUsage {
    pub fn count(&self, user: &UserId, day: NaiveDate) -> u32 {
        self.counts.get(&(user.clone(), day)).copied().unwrap_or(0)
    }

    pub fn record(&mut self, user: &UserId, at: DateTime<Utc>) {
        *self.counts.entry((user.clone(), at.date_naive())).or_insert(0) += 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "approver_type", rename_all = "snake_case")]
pub enum SlotSource {
    Configured(ApproverType),
    Escalation,
}

/// One concrete user standing in for one configured approver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSlot {
    /// Index of the configured approver in `ApprovalTier.approvers`; `None` for an
    /// escalation assignee.
    pub approver_index: Option<usize>,
    pub source: SlotSource,
    pub order: u32,
    pub is_required: bool,
    pub nominal: UserId,
    pub effective: EffectiveApprover,
}

impl ApproverSlot {
    pub fn actor(&self) -> &UserId {
        &self.effective.actor
    }

    /// True when `entry` is an approval that fills this slot.
    fn covered_by(&self, entry: &WorkflowStepHistory) -> bool {
        &entry.action_by == self.actor()
            || entry.action_by == self.nominal
            || entry.original_approver_id.as_ref() == Some(&self.nominal)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub user_id: UserId,
    pub nominal: UserId,
    pub reason: IneligibilityReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleSet {
    pub tier_level: u8,
    pub slots: Vec<ApproverSlot>,
    pub excluded: Vec<Exclusion>,
}

impl EligibleSet {
    /// Distinct effective actors, sorted.
    pub fn actors(&self) -> Vec<UserId> {
        self.slots.iter().map(|slot| slot.actor().clone()).collect::<BTreeSet<_>>().into_iter().collect()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.slots.iter().any(|slot| slot.actor() == user)
    }

    pub fn slots_for<'a>(&'a self, actor: &'a UserId) -> impl Iterator<Item = &'a ApproverSlot> + 'a {
        self.slots.iter().filter(move |slot| slot.actor() == actor)
    }

    /// Maps a refused actor to the most specific error available.
    pub fn refusal(&self, actor: &UserId) -> ApprovalError {
        if let Some(exclusion) = self.excluded.iter().find(|exclusion| &exclusion.user_id == actor) {
            return ApprovalError::NotEligible {
                actor_id: actor.clone(),
                reason: exclusion.reason.clone(),
            };
        }
        if let Some(bypass) = self
            .slots
            .iter()
            .filter_map(|slot| slot.effective.bypassed.as_ref())
            .find(|bypass| &bypass.delegate_id == actor)
        {
            return ApprovalError::DelegationLimitExceeded {
                delegation_id: bypass.delegation_id.clone(),
                violation: bypass.violation.clone(),
            };
        }
        let reason = if self.slots.iter().any(|slot| &slot.nominal == actor) {
            IneligibilityReason::DelegatedAway
        } else {
            IneligibilityReason::NotAnApprover
        };
        ApprovalError::NotEligible { actor_id: actor.clone(), reason }
    }
}

/// Inputs that vary per evaluation rather than per tier.
#[derive(Clone, Copy)]
pub struct EligibilityScope<'a> {
    pub registry: &'a DelegationRegistry,
    pub usage: &'a ApproverUsage,
    pub at: DateTime<Utc>,
    pub escalation_assignee: Option<&'a UserId>,
}

#[derive(Clone, Debug)]
pub struct EligibilityResolver<D> {
    directory: D,
}

impl<D> EligibilityResolver<D>
where
    D: DirectoryClient,
{
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn is_admin(&self, user: &UserId, admin_role: &str) -> Result<bool, ApprovalError> {
        self.directory.has_role(user, admin_role).map_err(ApprovalError::Directory)
    }

    /// Concrete approvers for `tier`, after delegation and `ApproverLimit` rules.
    pub fn eligible(
        &self,
        tier: &ApprovalTier,
        context: &RequestContext,
        scope: EligibilityScope<'_>,
    ) -> Result<EligibleSet, ApprovalError> {
        let tier_context = context.at_tier(tier.level);
        let mut set = EligibleSet { tier_level: tier.level, slots: Vec::new(), excluded: Vec::new() };

        for (index, approver) in tier.approvers.iter().enumerate() {
            let users = source_for(approver.approver_type).resolve(
                approver,
                &tier_context,
                &self.directory,
            )?;
            for nominal in users {
                let slot = ApproverSlot {
                    approver_index: Some(index),
                    source: SlotSource::Configured(approver.approver_type),
                    order: approver.order,
                    is_required: approver.is_required,
                    effective: scope.registry.effective_approver(&nominal, scope.at, &tier_context),
                    nominal,
                };
                self.admit(&mut set, slot, tier, &tier_context, scope)?;
            }
        }

        if let Some(assignee) = scope.escalation_assignee {
            let slot = ApproverSlot {
                approver_index: None,
                source: SlotSource::Escalation,
                order: 0,
                is_required: false,
                effective: scope.registry.effective_approver(assignee, scope.at, &tier_context),
                nominal: assignee.clone(),
            };
            self.admit(&mut set, slot, tier, &tier_context, scope)?;
        }

        if set.slots.is_empty() {
            tracing::warn!(
                event_name = "eligibility.empty_set",
                tier_level = tier.level,
                excluded = set.excluded.len(),
                "no eligible approver remains for tier"
            );
        }
        Ok(set)
    }

    fn admit(
        &self,
        set: &mut EligibleSet,
        slot: ApproverSlot,
        tier: &ApprovalTier,
        context: &RequestContext,
        scope: EligibilityScope<'_>,
    ) -> Result<(), ApprovalError> {
        match self.exclusion_reason(&slot, tier, context, scope)? {
            Some(reason) => set.excluded.push(Exclusion {
                user_id: slot.actor().clone(),
                nominal: slot.nominal.clone(),
                reason,
            }),
            None => set.slots.push(slot),
        }
        Ok(())
    }

    fn exclusion_reason(
        &self,
        slot: &ApproverSlot,
        tier: &ApprovalTier,
        context: &RequestContext,
        scope: EligibilityScope<'_>,
    ) -> Result<Option<IneligibilityReason>, ApprovalError> {
        let limits = &tier.approver_limits;
        let requester = &context.requester_id;
        let actor = slot.actor();

        if !limits.can_approve_own_requests && (actor == requester || &slot.nominal == requester) {
            return Ok(Some(IneligibilityReason::SelfApproval));
        }
        if !limits.can_approve_direct_reports {
            let manager = self.directory.manager_of(requester).map_err(ApprovalError::Directory)?;
            if manager.as_ref() == Some(actor) {
                return Ok(Some(IneligibilityReason::DirectReport));
            }
        }
        if let (Some(max_approval_amount), Some(amount)) = (limits.max_approval_amount, context.amount())
        {
            if amount > max_approval_amount {
                return Ok(Some(IneligibilityReason::AmountCap { max_approval_amount }));
            }
        }
        if let Some(max_approvals_per_day) = limits.max_approvals_per_day {
            if scope.usage.count(actor, scope.at.date_naive()) >= max_approvals_per_day {
                return Ok(Some(IneligibilityReason::DailyCap { max_approvals_per_day }));
            }
        }
        Ok(None)
    }
}

/// How far a step has come toward satisfying its tier.
pub struct TierProgress<'a> {
    tier: &'a ApprovalTier,
    set: &'a EligibleSet,
    approvals: Vec<&'a WorkflowStepHistory>,
}

impl<'a> TierProgress<'a> {
    pub fn new(
        tier: &'a ApprovalTier,
        set: &'a EligibleSet,
        approvals: impl IntoIterator<Item = &'a WorkflowStepHistory>,
    ) -> Self {
        Self { tier, set, approvals: approvals.into_iter().collect() }
    }

    /// Configured approvers that count toward completion: the required ones when all are
    /// needed (every approver if none is marked required), otherwise all of them.
    fn counted_indices(&self) -> Vec<usize> {
        let indices = 0..self.tier.approvers.len();
        if !self.tier.require_all_approvers {
            return indices.collect();
        }
        let required: Vec<usize> =
            indices.clone().filter(|index| self.tier.approvers[*index].is_required).collect();
        if required.is_empty() {
            indices.collect()
        } else {
            required
        }
    }

    fn is_approver_covered(&self, index: usize) -> bool {
        self.set
            .slots
            .iter()
            .filter(|slot| slot.approver_index == Some(index))
            .any(|slot| self.approvals.iter().any(|entry| slot.covered_by(entry)))
    }

    fn escalation_assignee_approved(&self) -> bool {
        self.set
            .slots
            .iter()
            .filter(|slot| slot.source == SlotSource::Escalation)
            .any(|slot| self.approvals.iter().any(|entry| slot.covered_by(entry)))
    }

    pub fn is_satisfied(&self) -> bool {
        if self.escalation_assignee_approved() {
            return true;
        }
        let counted = self.counted_indices();
        if self.tier.require_all_approvers {
            !counted.is_empty() && counted.iter().all(|index| self.is_approver_covered(*index))
        } else {
            counted.iter().any(|index| self.is_approver_covered(*index))
        }
    }

    /// True when every slot `actor` holds is already filled.
    pub fn already_approved_by(&self, actor: &UserId) -> bool {
        let mut held = self.set.slots_for(actor).peekable();
        if held.peek().is_none() {
            return false;
        }
        held.all(|slot| self.approvals.iter().any(|entry| slot.covered_by(entry)))
    }

    /// In a sequential tier, `actor` may act only once every counted approver ordered
    /// before one of their slots has approved.
    pub fn in_sequence(&self, actor: &UserId) -> bool {
        if !self.tier.sequential {
            return true;
        }
        let counted = self.counted_indices();
        self.set.slots_for(actor).any(|slot| {
            slot.source == SlotSource::Escalation
                || counted
                    .iter()
                    .filter(|index| self.tier.approvers[**index].order < slot.order)
                    .all(|index| self.is_approver_covered(*index))
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{ApproverUsage, EligibilityResolver, EligibilityScope, TierProgress};
    use crate::delegation::{DelegationRegistry, NewDelegation};
    use crate::domain::delegation::{DelegationLimits, DelegationType};
    use crate::domain::request::{RequestAttributes, RequestContext, UserId};
    use crate::domain::tier::{
        ApprovalTier, ApproverLimit, ApproverType, TierApprover, TriggerType, WorkflowCategory,
    };
    use crate::domain::workflow::{InstanceId, StepAction, WorkflowStepHistory};
    use crate::eligibility::directory::{DirectoryUser, InMemoryDirectory};
    use crate::errors::{ApprovalError, IneligibilityReason};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).single().expect("valid date")
    }

    fn user(id: &str, roles: &[&str], manager: Option<&str>) -> DirectoryUser {
        DirectoryUser {
            id: UserId::new(id),
            roles: roles.iter().map(|role| role.to_string()).collect(),
            manager_id: manager.map(UserId::new),
            department: None,
            is_executive: false,
        }
    }

    fn resolver() -> EligibilityResolver<InMemoryDirectory> {
        EligibilityResolver::new(
            InMemoryDirectory::default()
                .with_user(user("dana", &["finance"], Some("mo")))
                .with_user(user("mo", &["manager"], None))
                .with_user(user("fay", &["finance"], None))
                .with_user(user("alice", &["controller"], None)),
        )
    }

    fn approver(approver_type: ApproverType, id: Option<&str>, order: u32, required: bool) -> TierApprover {
        TierApprover { approver_type, approver_id: id.map(str::to_string), order, is_required: required }
    }

    fn tier(approvers: Vec<TierApprover>) -> ApprovalTier {
        ApprovalTier {
            level: 2,
            name: "Finance".to_string(),
            category: None,
            thresholds: Vec::new(),
            approvers,
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

    fn context(amount: i64) -> RequestContext {
        RequestContext::new(
            UserId::new("dana"),
            WorkflowCategory::Purchase,
            RequestAttributes::new().with_number(TriggerType::Amount, Decimal::new(amount, 0)),
        )
    }

    fn scope<'a>(registry: &'a DelegationRegistry, usage: &'a ApproverUsage) -> EligibilityScope<'a> {
        EligibilityScope { registry, usage, at: now(), escalation_assignee: None }
    }

    fn approval(by: &str, original: Option<&str>) -> WorkflowStepHistory {
        WorkflowStepHistory {
            id: format!("h-{by}"),
            instance_id: InstanceId("WF-1".to_string()),
            step_id: None,
            step_order: Some(1),
            tier_level: Some(2),
            action: StepAction::Approved,
            action_by: UserId::new(by),
            comments: None,
            is_proxy_approval: original.is_some(),
            original_approver_id: original.map(UserId::new),
            delegation_id: None,
            is_system_action: false,
            assigned_to: None,
            tier_completed: false,
            workflow_completed: false,
            to_step_order: Some(1),
            cycle: 0,
            created_at: now(),
        }
    }

    #[test]
    fn requester_holding_the_role_is_never_eligible() {
        let registry = DelegationRegistry::new();
        let usage = ApproverUsage::default();
        let tier = tier(vec![approver(ApproverType::Role, Some("finance"), 0, true)]);

        let set = resolver().eligible(&tier, &context(100), scope(&registry, &usage)).expect("set");

        assert_eq!(set.actors(), vec![UserId::new("fay")]);
        assert!(matches!(
            set.refusal(&UserId::new("dana")),
            ApprovalError::NotEligible { reason: IneligibilityReason::SelfApproval, .. }
        ));
    }

    #[test]
    fn direct_report_and_amount_limits_exclude_approvers() {
        let registry = DelegationRegistry::new();
        let usage = ApproverUsage::default();
        let mut manager_tier = tier(vec![approver(ApproverType::Manager, None, 0, true)]);
        manager_tier.approver_limits.can_approve_direct_reports = false;

        let set = resolver().eligible(&manager_tier, &context(100), scope(&registry, &usage)).expect("set");
        assert!(set.slots.is_empty());
        assert_eq!(set.excluded[0].reason, IneligibilityReason::DirectReport);

        let mut capped = tier(vec![approver(ApproverType::User, Some("fay"), 0, true)]);
        capped.approver_limits.max_approval_amount = Some(Decimal::new(1000, 0));
        let set = resolver().eligible(&capped, &context(5000), scope(&registry, &usage)).expect("set");
        assert!(matches!(set.excluded[0].reason, IneligibilityReason::AmountCap { .. }));
    }

    #[test]
    fn daily_cap_uses_recorded_usage() {
        let registry = DelegationRegistry::new();
        let mut usage = ApproverUsage::default();
        let mut capped = tier(vec![approver(ApproverType::User, Some("fay"), 0, true)]);
        capped.approver_limits.max_approvals_per_day = Some(2);
        usage.record(&UserId::new("fay"), now());

        assert!(resolver().eligible(&capped, &context(10), scope(&registry, &usage)).expect("set").contains(&UserId::new("fay")));
        usage.record(&UserId::new("fay"), now());
        assert!(!resolver().eligible(&capped, &context(10), scope(&registry, &usage)).expect("set").contains(&UserId::new("fay")));
    }

    #[test]
    fn delegates_replace_nominal_approvers_and_bypasses_are_explained() {
        let mut registry = DelegationRegistry::new();
        let usage = ApproverUsage::default();
        registry
            .create(
                NewDelegation {
                    from_user_id: UserId::new("alice"),
                    to_user_id: UserId::new("bob"),
                    start_date: now() - chrono::Duration::days(2),
                    end_date: now() + chrono::Duration::days(2),
                    delegation_type: DelegationType::Full,
                    categories: Vec::new(),
                    limits: Some(DelegationLimits {
                        max_approval_amount: Some(Decimal::new(2000, 0)),
                        ..DelegationLimits::default()
                    }),
                    reason: None,
                    created_by: UserId::new("alice"),
                },
                now() - chrono::Duration::days(3),
            )
            .expect("delegation");
        let tier = tier(vec![approver(ApproverType::Role, Some("controller"), 0, true)]);

        let small = resolver().eligible(&tier, &context(100), scope(&registry, &usage)).expect("set");
        assert_eq!(small.actors(), vec![UserId::new("bob")]);
        assert!(matches!(
            small.refusal(&UserId::new("alice")),
            ApprovalError::NotEligible { reason: IneligibilityReason::DelegatedAway, .. }
        ));

        let large = resolver().eligible(&tier, &context(3000), scope(&registry, &usage)).expect("set");
        assert_eq!(large.actors(), vec![UserId::new("alice")]);
        assert!(matches!(
            large.refusal(&UserId::new("bob")),
            ApprovalError::DelegationLimitExceeded { .. }
        ));
    }

    #[test]
    fn require_all_waits_for_every_required_approver() {
        let registry = DelegationRegistry::new();
        let usage = ApproverUsage::default();
        let mut tier = tier(vec![
            approver(ApproverType::User, Some("fay"), 0, true),
            approver(ApproverType::User, Some("mo"), 1, true),
            approver(ApproverType::User, Some("alice"), 2, false),
        ]);
        tier.require_all_approvers = true;
        let set = resolver().eligible(&tier, &context(100), scope(&registry, &usage)).expect("set");

        let one = [approval("fay", None)];
        assert!(!TierProgress::new(&tier, &set, one.iter()).is_satisfied());

        let both = [approval("fay", None), approval("mo", None)];
        assert!(TierProgress::new(&tier, &set, both.iter()).is_satisfied());

        let optional_only = [approval("alice", None)];
        assert!(!TierProgress::new(&tier, &set, optional_only.iter()).is_satisfied());
    }

    #[test]
    fn any_policy_is_satisfied_by_one_approval_and_proxy_covers_nominal() {
        let registry = DelegationRegistry::new();
        let usage = ApproverUsage::default();
        let tier = tier(vec![approver(ApproverType::User, Some("alice"), 0, true)]);
        let set = resolver().eligible(&tier, &context(100), scope(&registry, &usage)).expect("set");

        let proxy = [approval("bob", Some("alice"))];
        assert!(TierProgress::new(&tier, &set, proxy.iter()).is_satisfied());
    }

    #[test]
    fn sequential_tier_gates_on_order() {
        let registry = DelegationRegistry::new();
        let usage = ApproverUsage::default();
        let mut tier = tier(vec![
            approver(ApproverType::User, Some("fay"), 1, true),
            approver(ApproverType::User, Some("mo"), 2, true),
        ]);
        tier.require_all_approvers = true;
        tier.sequential = true;
        let set = resolver().eligible(&tier, &context(100), scope(&registry, &usage)).expect("set");

        let none: [WorkflowStepHistory; 0] = [];
        let progress = TierProgress::new(&tier, &set, none.iter());
        assert!(progress.in_sequence(&UserId::new("fay")));
        assert!(!progress.in_sequence(&UserId::new("mo")));

        let first = [approval("fay", None)];
        let progress = TierProgress::new(&tier, &set, first.iter());
        assert!(progress.in_sequence(&UserId::new("mo")));
        assert!(progress.already_approved_by(&UserId::new("fay")));
    }

    #[test]
    fn escalation_assignee_joins_the_set_and_completes_the_tier() {
        let registry = DelegationRegistry::new();
        let usage = ApproverUsage::default();
        let mut tier = tier(vec![
            approver(ApproverType::User, Some("fay"), 0, true),
            approver(ApproverType::User, Some("mo"), 0, true),
        ]);
        tier.require_all_approvers = true;
        let assignee = UserId::new("vp");
        let scope = EligibilityScope { escalation_assignee: Some(&assignee), ..scope(&registry, &usage) };

        let set = resolver().eligible(&tier, &context(100), scope).expect("set");
        assert!(set.contains(&assignee));

        let approvals = [approval("vp", None)];
        assert!(TierProgress::new(&tier, &set, approvals.iter()).is_satisfied());
    }
}
