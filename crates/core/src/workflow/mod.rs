pub mod commits;
pub mod engine;
pub mod machine;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::delegation::{
    DelegationAuditEntry, DelegationId, DelegationRule, ProxyApprovalRecord,
};
use crate::domain::request::{RequestAttributes, UserId};
use crate::domain::tier::{ConfigurationId, WorkflowCategory};
use crate::domain::workflow::{
    InstanceId, RejectionHistoryEntry, StepId, WorkflowInstance, WorkflowStatus,
    WorkflowStepHistory,
};
use crate::ledger::{LedgerEntry, VerificationResult};
use crate::notifications::NotificationIntent;

pub use commits::{Commit, CommitLog, CommitSink};
pub use engine::{ApprovalEngine, EngineSettings};
pub use machine::{build_steps, Actor, FinishedTransition, PendingTransition, TransitionKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
    Return,
}

impl DecisionAction {
    pub fn transition(&self) -> TransitionKind {
        match self {
            Self::Approve => TransitionKind::Approve,
            Self::Reject => TransitionKind::Reject,
            Self::Return => TransitionKind::Return,
        }
    }
}

/// Inbound request to start an approval workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub reference_id: String,
    pub reference_type: String,
    pub category: WorkflowCategory,
    pub requester_id: UserId,
    pub attributes: RequestAttributes,
    /// Route with this configuration instead of the category default.
    #[serde(default)]
    pub configuration_id: Option<ConfigurationId>,
    /// Users supplied by the caller for `dynamic` approvers, keyed by approver id.
    #[serde(default)]
    pub dynamic_approvers: BTreeMap<String, Vec<UserId>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorDecision {
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub actor_id: UserId,
    pub action: DecisionAction,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Everything a committed transition produced. Persistence writes it as one unit guarded
/// by `expected_version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub transition: String,
    pub instance: WorkflowInstance,
    /// State version the instance had before this transition; `None` for a new instance.
    pub expected_version: Option<u64>,
    pub history: Vec<WorkflowStepHistory>,
    pub rejections: Vec<RejectionHistoryEntry>,
    pub proxy_approvals: Vec<ProxyApprovalRecord>,
    pub delegation_audit: Vec<DelegationAuditEntry>,
    pub delegation_usage: Vec<DelegationUsage>,
    pub ledger_entries: Vec<LedgerEntry>,
    pub notifications: Vec<NotificationIntent>,
    pub referenced_configuration: Option<(ConfigurationId, u32)>,
}

impl TransitionReport {
    pub fn status(&self) -> WorkflowStatus {
        self.instance.status()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationUsage {
    pub delegation_id: DelegationId,
    pub day: NaiveDate,
    pub count: u32,
}

/// Result of a delegation create or revoke.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationChange {
    pub rule: DelegationRule,
    pub audit: DelegationAuditEntry,
    pub ledger_entry: LedgerEntry,
}

/// Read-only compliance projection of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub instance_id: InstanceId,
    pub reference_id: String,
    pub status: WorkflowStatus,
    pub current_step_order: Option<u32>,
    pub step_history: Vec<WorkflowStepHistory>,
    pub rejection_history: Vec<RejectionHistoryEntry>,
    pub proxy_approvals: Vec<ProxyApprovalRecord>,
    pub delegation_audit: Vec<DelegationAuditEntry>,
    pub verification: VerificationResult,
}
