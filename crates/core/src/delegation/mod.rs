use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::delegation::{
    DelegationAuditAction, DelegationAuditEntry, DelegationId, DelegationLimitViolation,
    DelegationLimits, DelegationRule, DelegationStatus, DelegationType,
};
use crate::domain::request::{RequestContext, UserId};
use crate::domain::tier::{WorkflowCategory, MAX_TIER_LEVEL, MIN_TIER_LEVEL};
use crate::errors::ApprovalError;

/// Input for [`DelegationRegistry::create`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDelegation {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub delegation_type: DelegationType,
    #[serde(default)]
    pub categories: Vec<WorkflowCategory>,
    #[serde(default)]
    pub limits: Option<DelegationLimits>,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_by: UserId,
}

/// A delegation that was in force for the nominal approver but whose limits rejected the
/// request, so the nominal approver stays responsible.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassedDelegation {
    pub delegation_id: DelegationId,
    pub delegate_id: UserId,
    pub violation: DelegationLimitViolation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveApprover {
    pub nominal: UserId,
    pub actor: UserId,
    /// Delegations followed from `nominal` to `actor`, first hop first.
    pub chain: Vec<DelegationId>,
    pub bypassed: Option<BypassedDelegation>,
}

impl EffectiveApprover {
    fn nominal(user: &UserId) -> Self {
        Self { nominal: user.clone(), actor: user.clone(), chain: Vec::new(), bypassed: None }
    }

    pub fn is_delegated(&self) -> bool {
        !self.chain.is_empty()
    }

    /// The delegation granted by the nominal approver, referenced by proxy records.
    pub fn delegation_id(&self) -> Option<&DelegationId> {
        self.chain.first()
    }
}

#[derive(Clone, Debug, Default)]
pub struct DelegationRegistry {
    rules: BTreeMap<DelegationId, DelegationRule>,
    usage: HashMap<(DelegationId, NaiveDate), u32>,
}

impl DelegationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        request: NewDelegation,
        at: DateTime<Utc>,
    ) -> Result<(DelegationRule, DelegationAuditEntry), ApprovalError> {
        validate_new(&request)?;

        let rule = DelegationRule {
            id: DelegationId::generate(),
            from_user_id: request.from_user_id,
            to_user_id: request.to_user_id,
            start_date: request.start_date,
            end_date: request.end_date,
            delegation_type: request.delegation_type,
            categories: request.categories,
            limits: request.limits,
            reason: request.reason,
            created_by: request.created_by.clone(),
            created_at: at,
            revoked_at: None,
            revoked_by: None,
            revoke_reason: None,
        };
        let audit = DelegationAuditEntry::new(
            rule.id.clone(),
            DelegationAuditAction::Created,
            request.created_by,
            at,
        )
        .with_details(format!(
            "{} -> {} from {} until {}",
            rule.from_user_id,
            rule.to_user_id,
            rule.start_date.to_rfc3339(),
            rule.end_date.to_rfc3339()
        ));

        tracing::info!(
            event_name = "delegation.created",
            delegation_id = %rule.id,
            from_user_id = %rule.from_user_id,
            to_user_id = %rule.to_user_id,
            status = rule.status_at(at).as_str(),
            "delegation created"
        );
        self.rules.insert(rule.id.clone(), rule.clone());
        Ok((rule, audit))
    }

    /// Revocation takes effect for every lookup at or after `revoked_at`. Proxy records
    /// already written are untouched.
    pub fn revoke(
        &mut self,
        id: &DelegationId,
        revoked_by: UserId,
        revoked_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(DelegationRule, DelegationAuditEntry), ApprovalError> {
        if reason.trim().is_empty() {
            return Err(ApprovalError::InvalidDelegation(
                "revocation requires a reason".to_string(),
            ));
        }
        let rule =
            self.rules.get_mut(id).ok_or_else(|| ApprovalError::DelegationNotFound(id.clone()))?;
        if rule.revoked_at.is_some() {
            return Err(ApprovalError::InvalidDelegation(format!(
                "delegation {id} is already revoked"
            )));
        }

        rule.revoked_at = Some(revoked_at);
        rule.revoked_by = Some(revoked_by.clone());
        rule.revoke_reason = Some(reason.trim().to_string());

        let audit =
            DelegationAuditEntry::new(id.clone(), DelegationAuditAction::Revoked, revoked_by, revoked_at)
                .with_details(reason.trim());
        tracing::info!(
            event_name = "delegation.revoked",
            delegation_id = %id,
            "delegation revoked"
        );
        Ok((rule.clone(), audit))
    }

    /// Restores a persisted rule without re-validating or auditing it.
    pub fn insert(&mut self, rule: DelegationRule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    pub fn restore_usage(&mut self, id: DelegationId, day: NaiveDate, count: u32) {
        self.usage.insert((id, day), count);
    }

    pub fn get(&self, id: &DelegationId) -> Option<&DelegationRule> {
        self.rules.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DelegationRule> {
        self.rules.values()
    }

    pub fn status_of(
        &self,
        id: &DelegationId,
        at: DateTime<Utc>,
    ) -> Result<DelegationStatus, ApprovalError> {
        self.get(id)
            .map(|rule| rule.status_at(at))
            .ok_or_else(|| ApprovalError::DelegationNotFound(id.clone()))
    }

    /// Rules granted by `user`, with their status at `at`.
    pub fn granted_by(
        &self,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Vec<(DelegationRule, DelegationStatus)> {
        self.rules
            .values()
            .filter(|rule| &rule.from_user_id == user)
            .map(|rule| (rule.clone(), rule.status_at(at)))
            .collect()
    }

    pub fn used_on(&self, id: &DelegationId, day: NaiveDate) -> u32 {
        self.usage.get(&(id.clone(), day)).copied().unwrap_or(0)
    }

    /// Counts one proxy action against every delegation in the chain. Returns the new
    /// count of the first hop.
    pub fn record_usage(&mut self, chain: &[DelegationId], at: DateTime<Utc>) -> u32 {
        let day = at.date_naive();
        let mut first = 0;
        for (index, id) in chain.iter().enumerate() {
            let count = self.usage.entry((id.clone(), day)).or_insert(0);
            *count += 1;
            if index == 0 {
                first = *count;
            }
        }
        first
    }

    /// Who actually acts for `nominal` at `at`.
    ///
    /// Status is recomputed from each rule's window. Overlapping rules resolve to the most
    /// recently created. When the winning rule's limits reject the request the nominal
    /// approver keeps the step. Chains are followed only when the first hop allows
    /// re-delegation, and never revisit a user.
    pub fn effective_approver(
        &self,
        nominal: &UserId,
        at: DateTime<Utc>,
        context: &RequestContext,
    ) -> EffectiveApprover {
        let mut resolved = EffectiveApprover::nominal(nominal);
        let mut visited: HashSet<UserId> = HashSet::from([nominal.clone()]);
        let mut follow_chain = true;
        let day = at.date_naive();

        while follow_chain {
            let Some(rule) = self.winning_rule(&resolved.actor, at) else {
                break;
            };

            if let Err(violation) = rule.check(context, self.used_on(&rule.id, day)) {
                if resolved.chain.is_empty() {
                    resolved.bypassed = Some(BypassedDelegation {
                        delegation_id: rule.id.clone(),
                        delegate_id: rule.to_user_id.clone(),
                        violation,
                    });
                }
                break;
            }
            if !visited.insert(rule.to_user_id.clone()) {
                break;
            }

            if resolved.chain.is_empty() {
                follow_chain = rule.allows_redelegation();
            }
            resolved.chain.push(rule.id.clone());
            resolved.actor = rule.to_user_id.clone();
        }

        resolved
    }

    fn winning_rule(&self, from: &UserId, at: DateTime<Utc>) -> Option<&DelegationRule> {
        self.rules
            .values()
            .filter(|rule| &rule.from_user_id == from && rule.is_active_at(at))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
    }
}

fn validate_new(request: &NewDelegation) -> Result<(), ApprovalError> {
    let invalid = |reason: &str| Err(ApprovalError::InvalidDelegation(reason.to_string()));

    if request.from_user_id.as_str().trim().is_empty()
        || request.to_user_id.as_str().trim().is_empty()
    {
        return invalid("both from_user_id and to_user_id are required");
    }
    if request.from_user_id == request.to_user_id {
        return invalid("a user cannot delegate to themselves");
    }
    if request.end_date <= request.start_date {
        return invalid("end_date must be after start_date");
    }
    if request.delegation_type == DelegationType::Specific && request.categories.is_empty() {
        return invalid("a specific delegation must list at least one category");
    }
    if let Some(limits) = &request.limits {
        if let Some(level) = limits.max_tier_level {
            if !(MIN_TIER_LEVEL..=MAX_TIER_LEVEL).contains(&level) {
                return invalid("limits.max_tier_level must be within the configured tier range");
            }
        }
        if limits.max_approvals_per_day == Some(0) {
            return invalid("limits.max_approvals_per_day must be greater than zero");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{DelegationRegistry, NewDelegation};
    use crate::domain::delegation::{
        DelegationAuditAction, DelegationLimitViolation, DelegationLimits, DelegationType,
    };
    use crate::domain::request::{RequestAttributes, RequestContext, UserId};
    use crate::domain::tier::{TriggerType, WorkflowCategory};
    use crate::errors::ApprovalError;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 9, 0, 0).single().expect("valid date")
    }

    fn purchase(amount: i64) -> RequestContext {
        RequestContext::new(
            UserId::new("requester"),
            WorkflowCategory::Purchase,
            RequestAttributes::new().with_number(TriggerType::Amount, Decimal::new(amount, 0)),
        )
        .at_tier(2)
    }

    fn grant(from: &str, to: &str, limits: Option<DelegationLimits>) -> NewDelegation {
        NewDelegation {
            from_user_id: UserId::new(from),
            to_user_id: UserId::new(to),
            start_date: day(1),
            end_date: day(10),
            delegation_type: DelegationType::Temporary,
            categories: Vec::new(),
            limits,
            reason: Some("vacation".to_string()),
            created_by: UserId::new(from),
        }
    }

    #[test]
    fn delegate_is_used_only_inside_the_window() {
        let mut registry = DelegationRegistry::new();
        registry.create(grant("alice", "bob", None), day(1)).expect("create");
        let alice = UserId::new("alice");

        assert_eq!(registry.effective_approver(&alice, day(5), &purchase(100)).actor.as_str(), "bob");
        assert_eq!(registry.effective_approver(&alice, day(10), &purchase(100)).actor.as_str(), "bob");
        let after = day(10) + Duration::seconds(1);
        assert_eq!(registry.effective_approver(&alice, after, &purchase(100)).actor.as_str(), "alice");
        let before = day(1) - Duration::seconds(1);
        assert_eq!(registry.effective_approver(&alice, before, &purchase(100)).actor.as_str(), "alice");
    }

    #[test]
    fn amount_cap_falls_back_to_the_nominal_approver() {
        let mut registry = DelegationRegistry::new();
        let limits = DelegationLimits {
            max_approval_amount: Some(Decimal::new(2000, 0)),
            ..DelegationLimits::default()
        };
        let (rule, _) = registry.create(grant("alice", "bob", Some(limits)), day(1)).expect("create");

        let resolved = registry.effective_approver(&UserId::new("alice"), day(5), &purchase(3000));

        assert_eq!(resolved.actor.as_str(), "alice");
        assert!(!resolved.is_delegated());
        let bypassed = resolved.bypassed.expect("bypass recorded");
        assert_eq!(bypassed.delegation_id, rule.id);
        assert!(matches!(bypassed.violation, DelegationLimitViolation::AmountExceeded { .. }));
    }

    #[test]
    fn excluded_category_falls_back_to_the_nominal_approver() {
        let mut registry = DelegationRegistry::new();
        let limits = DelegationLimits {
            excluded_categories: vec![WorkflowCategory::Purchase],
            ..DelegationLimits::default()
        };
        let (rule, _) = registry.create(grant("alice", "bob", Some(limits)), day(1)).expect("create");

        let resolved = registry.effective_approver(&UserId::new("alice"), day(5), &purchase(10));

        assert_eq!(resolved.actor.as_str(), "alice");
        assert!(!resolved.is_delegated());
        let bypassed = resolved.bypassed.expect("bypass recorded");
        assert_eq!(bypassed.delegation_id, rule.id);
        assert_eq!(
            bypassed.violation,
            DelegationLimitViolation::CategoryExcluded { category: WorkflowCategory::Purchase }
        );
    }

    #[test]
    fn most_recently_created_overlapping_rule_wins() {
        let mut registry = DelegationRegistry::new();
        registry.create(grant("alice", "bob", None), day(1)).expect("first");
        registry.create(grant("alice", "carol", None), day(2)).expect("second");

        let resolved = registry.effective_approver(&UserId::new("alice"), day(5), &purchase(10));

        assert_eq!(resolved.actor.as_str(), "carol");
    }

    #[test]
    fn revocation_immediately_restores_the_nominal_approver() {
        let mut registry = DelegationRegistry::new();
        let (rule, _) = registry.create(grant("alice", "bob", None), day(1)).expect("create");

        let (revoked, audit) = registry
            .revoke(&rule.id, UserId::new("alice"), day(3), "back early")
            .expect("revoke");

        assert_eq!(revoked.revoke_reason.as_deref(), Some("back early"));
        assert_eq!(audit.action, DelegationAuditAction::Revoked);
        let resolved = registry.effective_approver(&UserId::new("alice"), day(5), &purchase(10));
        assert_eq!(resolved.actor.as_str(), "alice");
        let earlier = registry.effective_approver(&UserId::new("alice"), day(2), &purchase(10));
        assert_eq!(earlier.actor.as_str(), "bob");
        assert!(registry.revoke(&rule.id, UserId::new("alice"), day(4), "again").is_err());
    }

    #[test]
    fn chains_are_followed_only_when_redelegation_is_allowed() {
        let mut registry = DelegationRegistry::new();
        registry.create(grant("alice", "bob", None), day(1)).expect("alice->bob");
        registry.create(grant("bob", "carol", None), day(1)).expect("bob->carol");

        let stops = registry.effective_approver(&UserId::new("alice"), day(5), &purchase(10));
        assert_eq!(stops.actor.as_str(), "bob");

        let mut chained = DelegationRegistry::new();
        let limits = DelegationLimits { allow_redelegation: true, ..DelegationLimits::default() };
        chained.create(grant("alice", "bob", Some(limits)), day(1)).expect("alice->bob");
        chained.create(grant("bob", "carol", None), day(1)).expect("bob->carol");
        chained.create(grant("carol", "alice", None), day(1)).expect("carol->alice");

        let follows = chained.effective_approver(&UserId::new("alice"), day(5), &purchase(10));
        assert_eq!(follows.actor.as_str(), "carol");
        assert_eq!(follows.chain.len(), 2);
    }

    #[test]
    fn daily_cap_counts_recorded_proxy_actions() {
        let mut registry = DelegationRegistry::new();
        let limits = DelegationLimits { max_approvals_per_day: Some(1), ..DelegationLimits::default() };
        let (rule, _) = registry.create(grant("alice", "bob", Some(limits)), day(1)).expect("create");
        let alice = UserId::new("alice");

        assert_eq!(registry.effective_approver(&alice, day(5), &purchase(10)).actor.as_str(), "bob");
        registry.record_usage(&[rule.id.clone()], day(5));

        let capped = registry.effective_approver(&alice, day(5), &purchase(10));
        assert_eq!(capped.actor.as_str(), "alice");
        assert!(matches!(
            capped.bypassed.map(|bypass| bypass.violation),
            Some(DelegationLimitViolation::DailyCapReached { max_approvals_per_day: 1 })
        ));
        assert_eq!(registry.effective_approver(&alice, day(6), &purchase(10)).actor.as_str(), "bob");
    }

    #[test]
    fn invalid_windows_and_self_delegation_are_rejected() {
        let mut registry = DelegationRegistry::new();

        let mut inverted = grant("alice", "bob", None);
        inverted.end_date = inverted.start_date;
        assert!(matches!(
            registry.create(inverted, day(1)),
            Err(ApprovalError::InvalidDelegation(_))
        ));
        assert!(registry.create(grant("alice", "alice", None), day(1)).is_err());

        let mut specific = grant("alice", "bob", None);
        specific.delegation_type = DelegationType::Specific;
        assert!(registry.create(specific, day(1)).is_err());
    }
}
