use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::{RequestContext, UserId};
use crate::domain::tier::WorkflowCategory;
use crate::domain::workflow::{InstanceId, StepId};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub String);

impl DelegationId {
    pub fn generate() -> Self {
        Self(format!("DLG-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationType {
    Full,
    Specific,
    Temporary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Active,
    Scheduled,
    Expired,
    Revoked,
}

impl DelegationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Scheduled => "scheduled",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationLimits {
    pub max_approval_amount: Option<Decimal>,
    pub max_approvals_per_day: Option<u32>,
    pub excluded_categories: Vec<WorkflowCategory>,
    pub max_tier_level: Option<u8>,
    pub allow_redelegation: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelegationLimitViolation {
    AmountExceeded { requested: Decimal, max_approval_amount: Decimal },
    DailyCapReached { max_approvals_per_day: u32 },
    CategoryExcluded { category: WorkflowCategory },
    TierLevelExceeded { tier_level: u8, max_tier_level: u8 },
    OutOfScope { category: WorkflowCategory },
}

impl DelegationLimitViolation {
    pub fn reason(&self) -> String {
        match self {
            Self::AmountExceeded { requested, max_approval_amount } => {
                format!("request amount {requested} exceeds delegated limit {max_approval_amount}")
            }
            Self::DailyCapReached { max_approvals_per_day } => {
                format!("delegated daily approval cap of {max_approvals_per_day} reached")
            }
            Self::CategoryExcluded { category } => {
                format!("category `{category}` is excluded from this delegation")
            }
            Self::TierLevelExceeded { tier_level, max_tier_level } => {
                format!("tier {tier_level} is above the delegated ceiling of tier {max_tier_level}")
            }
            Self::OutOfScope { category } => {
                format!("delegation does not cover category `{category}`")
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AmountExceeded { .. } => "amount_exceeded",
            Self::DailyCapReached { .. } => "daily_cap_reached",
            Self::CategoryExcluded { .. } => "category_excluded",
            Self::TierLevelExceeded { .. } => "tier_level_exceeded",
            Self::OutOfScope { .. } => "out_of_scope",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRule {
    pub id: DelegationId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub delegation_type: DelegationType,
    /// Categories covered by a `specific` delegation; ignored for other types.
    #[serde(default)]
    pub categories: Vec<WorkflowCategory>,
    #[serde(default)]
    pub limits: Option<DelegationLimits>,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_by: Option<UserId>,
    #[serde(default)]
    pub revoke_reason: Option<String>,
}

impl DelegationRule {
    /// Status is recomputed from the window on every call; nothing cached is trusted.
    /// A revocation counts from `revoked_at` onward.
    pub fn status_at(&self, at: DateTime<Utc>) -> DelegationStatus {
        if self.revoked_at.is_some_and(|revoked_at| at >= revoked_at) {
            DelegationStatus::Revoked
        } else if at < self.start_date {
            DelegationStatus::Scheduled
        } else if at > self.end_date {
            DelegationStatus::Expired
        } else {
            DelegationStatus::Active
        }
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.status_at(at) == DelegationStatus::Active
    }

    pub fn allows_redelegation(&self) -> bool {
        self.limits.as_ref().map(|limits| limits.allow_redelegation).unwrap_or(false)
    }

    /// Checks scope and limits for one request. `used_today` counts proxy actions already
    /// recorded under this delegation on the evaluation day.
    pub fn check(
        &self,
        context: &RequestContext,
        used_today: u32,
    ) -> Result<(), DelegationLimitViolation> {
        if self.delegation_type == DelegationType::Specific
            && !self.categories.contains(&context.category)
        {
            return Err(DelegationLimitViolation::OutOfScope { category: context.category });
        }

        let Some(limits) = &self.limits else {
            return Ok(());
        };

        if limits.excluded_categories.contains(&context.category) {
            return Err(DelegationLimitViolation::CategoryExcluded { category: context.category });
        }

        if let (Some(max_approval_amount), Some(requested)) =
            (limits.max_approval_amount, context.amount())
        {
            if requested > max_approval_amount {
                return Err(DelegationLimitViolation::AmountExceeded {
                    requested,
                    max_approval_amount,
                });
            }
        }

        if let Some(max_tier_level) = limits.max_tier_level {
            if context.tier_level > max_tier_level {
                return Err(DelegationLimitViolation::TierLevelExceeded {
                    tier_level: context.tier_level,
                    max_tier_level,
                });
            }
        }

        if let Some(max_approvals_per_day) = limits.max_approvals_per_day {
            if used_today >= max_approvals_per_day {
                return Err(DelegationLimitViolation::DailyCapReached { max_approvals_per_day });
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationAuditAction {
    Created,
    Revoked,
    ApprovalUsed,
    LimitBypassed,
}

impl DelegationAuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Revoked => "revoked",
            Self::ApprovalUsed => "approval_used",
            Self::LimitBypassed => "limit_bypassed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationAuditEntry {
    pub id: String,
    pub delegation_id: DelegationId,
    pub action: DelegationAuditAction,
    pub actor_id: UserId,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    #[serde(default)]
    pub details: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl DelegationAuditEntry {
    pub fn new(
        delegation_id: DelegationId,
        action: DelegationAuditAction,
        actor_id: UserId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            delegation_id,
            action,
            actor_id,
            instance_id: None,
            details: None,
            occurred_at,
        }
    }

    pub fn for_instance(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// One action a delegate took for an original approver. Written at decision time only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyApprovalRecord {
    pub id: String,
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub delegation_id: DelegationId,
    pub proxy_user_id: UserId,
    pub original_approver_id: UserId,
    pub tier_level: u8,
    pub action: String,
    pub recorded_at: DateTime<Utc>,
}
