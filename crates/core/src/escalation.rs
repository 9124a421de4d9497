use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::UserId;
use crate::domain::tier::{ApprovalTier, EscalationTarget};
use crate::domain::workflow::{InstanceId, StepId, WorkflowInstance, WorkflowStep};
use crate::workflow::TransitionReport;

/// Who asked for an escalation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationTrigger {
    Timer,
    Manual(UserId),
}

impl EscalationTrigger {
    pub fn is_timer(&self) -> bool {
        matches!(self, Self::Timer)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationPlan {
    ToUser { user_id: UserId },
    ToTier { level: u8 },
    /// Timeout counts as approval, recorded as a system action.
    AutoApprove,
    /// Nothing to hand over to; the step is flagged for reporting and left in place.
    MarkEscalated,
}

impl EscalationPlan {
    pub fn for_tier(tier: &ApprovalTier, trigger: &EscalationTrigger) -> Self {
        match tier.escalation_target() {
            Some(EscalationTarget::User(user_id)) => Self::ToUser { user_id: user_id.clone() },
            Some(EscalationTarget::Tier(level)) => Self::ToTier { level: *level },
            None if tier.auto_approve_on_timeout && trigger.is_timer() => Self::AutoApprove,
            None => Self::MarkEscalated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToUser { .. } => "to_user",
            Self::ToTier { .. } => "to_tier",
            Self::AutoApprove => "auto_approve",
            Self::MarkEscalated => "mark_escalated",
        }
    }
}

/// When the step's escalation timer fires, if it has one.
pub fn escalation_due_at(step: &WorkflowStep) -> Option<DateTime<Utc>> {
    let hours = step.tier.escalation_timeout_hours()?;
    let activated_at = step.activated_at?;
    Some(activated_at + Duration::hours(i64::from(hours)))
}

/// True when the timer for the instance's current step has elapsed and the step has not
/// been escalated yet. Callers must evaluate this under the instance lock.
pub fn is_escalation_due(instance: &WorkflowInstance, now: DateTime<Utc>) -> bool {
    if !instance.status().is_open() {
        return false;
    }
    let Some(step) = instance.current_step() else {
        return false;
    };
    if instance.is_step_escalated(&step.id) {
        return false;
    }
    escalation_due_at(step).is_some_and(|due_at| now >= due_at)
}

/// Number of reminders the step should have produced by `now`.
pub fn reminders_due(step: &WorkflowStep, now: DateTime<Utc>) -> u32 {
    let (Some(hours), Some(activated_at)) = (step.tier.reminder_interval_hours, step.activated_at)
    else {
        return 0;
    };
    if hours == 0 || now <= activated_at {
        return 0;
    }
    let elapsed_hours = (now - activated_at).num_hours();
    u32::try_from(elapsed_hours / i64::from(hours)).unwrap_or(u32::MAX)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub instance_id: InstanceId,
    pub step_id: Option<StepId>,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub escalated: usize,
    pub auto_approved: usize,
    pub reminders: usize,
    pub failures: Vec<SweepFailure>,
    /// Committed escalations, for the caller to persist.
    pub transitions: Vec<TransitionReport>,
}
