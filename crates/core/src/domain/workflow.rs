use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::delegation::{DelegationId, ProxyApprovalRecord};
use crate::domain::request::{RequestContext, UserId};
use crate::domain::tier::{ApprovalTier, ConfigurationId, WorkflowCategory};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(format!("WF-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn generate() -> Self {
        Self(format!("STP-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Returned,
    Cancelled,
    Escalated,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }

    /// Statuses in which the current step is waiting on an approver.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Returned => "returned",
            Self::Cancelled => "cancelled",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "returned" => Ok(Self::Returned),
            "cancelled" => Ok(Self::Cancelled),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown workflow status `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Approved,
    Rejected,
    Returned,
    Skipped,
    Escalated,
    Delegated,
    Reassigned,
    Resubmitted,
    Cancelled,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Returned => "returned",
            Self::Skipped => "skipped",
            Self::Escalated => "escalated",
            Self::Delegated => "delegated",
            Self::Reassigned => "reassigned",
            Self::Resubmitted => "resubmitted",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    /// 1-based position within the current cycle.
    pub order: u32,
    pub tier: ApprovalTier,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(order: u32, tier: ApprovalTier) -> Self {
        Self { id: StepId::generate(), order, tier, activated_at: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStepHistory {
    pub id: String,
    pub instance_id: InstanceId,
    pub step_id: Option<StepId>,
    pub step_order: Option<u32>,
    pub tier_level: Option<u8>,
    pub action: StepAction,
    pub action_by: UserId,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub is_proxy_approval: bool,
    #[serde(default)]
    pub original_approver_id: Option<UserId>,
    #[serde(default)]
    pub delegation_id: Option<DelegationId>,
    /// Set for timer-driven actions such as timeout auto-approval.
    #[serde(default)]
    pub is_system_action: bool,
    #[serde(default)]
    pub assigned_to: Option<UserId>,
    #[serde(default)]
    pub tier_completed: bool,
    #[serde(default)]
    pub workflow_completed: bool,
    /// Position of the instance once this entry is applied.
    pub to_step_order: Option<u32>,
    pub cycle: u32,
    pub created_at: DateTime<Utc>,
}

impl WorkflowStepHistory {
    pub fn new(
        instance: &WorkflowInstance,
        step: Option<&WorkflowStep>,
        action: StepAction,
        action_by: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            instance_id: instance.id.clone(),
            step_id: step.map(|step| step.id.clone()),
            step_order: step.map(|step| step.order),
            tier_level: step.map(|step| step.tier.level),
            action,
            action_by,
            comments: None,
            is_proxy_approval: false,
            original_approver_id: None,
            delegation_id: None,
            is_system_action: false,
            assigned_to: None,
            tier_completed: false,
            workflow_completed: false,
            to_step_order: instance.current_step_order,
            cycle: instance.cycle,
            created_at: at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionHistoryEntry {
    pub id: String,
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub tier_level: u8,
    pub rejected_by: UserId,
    pub reason: String,
    pub returned_to_requestor: bool,
    #[serde(default)]
    pub is_proxy_approval: bool,
    #[serde(default)]
    pub original_approver_id: Option<UserId>,
    pub cycle: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub status: WorkflowStatus,
    pub current_step_order: Option<u32>,
}

/// Folds the history into status and position. Status is never stored on the instance.
pub fn replay(history: &[WorkflowStepHistory], initial_step_order: Option<u32>) -> Projection {
    let mut projection =
        Projection { status: WorkflowStatus::Pending, current_step_order: initial_step_order };

    for entry in history {
        projection.status = match entry.action {
            StepAction::Approved | StepAction::Skipped if entry.workflow_completed => {
                WorkflowStatus::Approved
            }
            StepAction::Approved | StepAction::Skipped => WorkflowStatus::InProgress,
            StepAction::Rejected => WorkflowStatus::Rejected,
            StepAction::Returned => WorkflowStatus::Returned,
            StepAction::Escalated => WorkflowStatus::Escalated,
            StepAction::Resubmitted => WorkflowStatus::Pending,
            StepAction::Cancelled => WorkflowStatus::Cancelled,
            StepAction::Delegated | StepAction::Reassigned => projection.status,
        };
        projection.current_step_order = entry.to_step_order;
    }

    projection
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub reference_id: String,
    pub reference_type: String,
    pub category: WorkflowCategory,
    pub configuration_id: ConfigurationId,
    pub configuration_version: u32,
    pub context: RequestContext,
    pub steps: Vec<WorkflowStep>,
    pub current_step_order: Option<u32>,
    pub cycle: u32,
    pub step_history: Vec<WorkflowStepHistory>,
    pub rejection_history: Vec<RejectionHistoryEntry>,
    pub proxy_approvals: Vec<ProxyApprovalRecord>,
    /// Bumped on every committed transition; persistence uses it for optimistic locking.
    pub state_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn status(&self) -> WorkflowStatus {
        self.projection().status
    }

    pub fn projection(&self) -> Projection {
        replay(&self.step_history, self.initial_step_order())
    }

    /// Position the instance starts from before any history is applied.
    pub fn initial_step_order(&self) -> Option<u32> {
        (!self.steps.is_empty() || !self.step_history.is_empty()).then_some(1)
    }

    /// Re-derives the position from history and compares it with the stored one.
    pub fn verify_projection(&self) -> Result<(), String> {
        let projection = self.projection();
        if projection.current_step_order != self.current_step_order {
            return Err(format!(
                "instance {} stores step order {:?} but history replays to {:?}",
                self.id, self.current_step_order, projection.current_step_order
            ));
        }
        Ok(())
    }

    pub fn current_step(&self) -> Option<&WorkflowStep> {
        let order = self.current_step_order?;
        self.steps.iter().find(|step| step.order == order)
    }

    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| &step.id == step_id)
    }

    pub fn next_step_after(&self, order: u32) -> Option<&WorkflowStep> {
        self.steps.iter().filter(|step| step.order > order).min_by_key(|step| step.order)
    }

    pub fn requester_id(&self) -> &UserId {
        &self.context.requester_id
    }

    /// History entries of the running cycle that touch `step_id`.
    pub fn step_entries<'a>(
        &'a self,
        step_id: &'a StepId,
    ) -> impl Iterator<Item = &'a WorkflowStepHistory> + 'a {
        self.step_history
            .iter()
            .filter(move |entry| entry.cycle == self.cycle && entry.step_id.as_ref() == Some(step_id))
    }

    pub fn approvals_for_step<'a>(
        &'a self,
        step_id: &'a StepId,
    ) -> impl Iterator<Item = &'a WorkflowStepHistory> + 'a {
        self.step_entries(step_id).filter(|entry| entry.action == StepAction::Approved)
    }

    pub fn is_step_escalated(&self, step_id: &StepId) -> bool {
        self.step_entries(step_id).any(|entry| entry.action == StepAction::Escalated)
    }

    pub fn escalation_assignee<'a>(&'a self, step_id: &'a StepId) -> Option<&'a UserId> {
        self.step_entries(step_id)
            .filter(|entry| entry.action == StepAction::Escalated)
            .filter_map(|entry| entry.assigned_to.as_ref())
            .last()
    }
}
