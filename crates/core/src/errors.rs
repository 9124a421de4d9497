use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::delegation::{DelegationId, DelegationLimitViolation};
use crate::domain::request::UserId;
use crate::domain::tier::{ConfigurationId, WorkflowCategory};
use crate::domain::workflow::{InstanceId, WorkflowStatus};

/// Why an actor was refused at the current step. Rendered to approvers verbatim, so it
/// never names the delegate that replaced them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IneligibilityReason {
    NotAnApprover,
    SelfApproval,
    DirectReport,
    AmountCap { max_approval_amount: Decimal },
    DailyCap { max_approvals_per_day: u32 },
    OutOfSequence,
    DelegatedAway,
    AlreadyApproved,
    NotRequesterOrAdmin,
}

impl IneligibilityReason {
    pub fn describe(&self) -> String {
        match self {
            Self::NotAnApprover => "you are not an approver for the current step".to_string(),
            Self::SelfApproval => "requesters cannot approve their own requests".to_string(),
            Self::DirectReport => {
                "this tier does not allow approving requests from direct reports".to_string()
            }
            Self::AmountCap { max_approval_amount } => {
                format!("the request exceeds your approval limit of {max_approval_amount}")
            }
            Self::DailyCap { max_approvals_per_day } => {
                format!("you have reached your limit of {max_approvals_per_day} approvals today")
            }
            Self::OutOfSequence => {
                "an earlier approver in this sequential tier has not acted yet".to_string()
            }
            Self::DelegatedAway => {
                "your approvals for this request are currently delegated".to_string()
            }
            Self::AlreadyApproved => "you have already approved this step".to_string(),
            Self::NotRequesterOrAdmin => {
                "only the requester or an administrator may do this".to_string()
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no approval tier matched the `{category}` request under configuration `{configuration_id}`")]
    NoTierMatched { configuration_id: ConfigurationId, category: WorkflowCategory },
    #[error("cannot {action} instance {instance_id} while it is `{status}`: {detail}")]
    InvalidTransition {
        instance_id: InstanceId,
        status: WorkflowStatus,
        action: &'static str,
        detail: String,
    },
    #[error("actor `{actor_id}` is not eligible: {}", reason.describe())]
    NotEligible { actor_id: UserId, reason: IneligibilityReason },
    #[error("delegation {delegation_id} does not cover this request: {}", violation.reason())]
    DelegationLimitExceeded { delegation_id: DelegationId, violation: DelegationLimitViolation },
    #[error(
        "configuration `{configuration_id}` version {version} is referenced by workflow instances and cannot be modified"
    )]
    ConfigurationVersionMismatch { configuration_id: ConfigurationId, version: u32 },
    #[error("workflow instance {0} was not found")]
    InstanceNotFound(InstanceId),
    #[error("tier configuration `{0}` was not found")]
    ConfigurationNotFound(String),
    #[error("delegation {0} was not found")]
    DelegationNotFound(DelegationId),
    #[error("invalid tier configuration `{configuration_id}`: {reason}")]
    InvalidConfiguration { configuration_id: ConfigurationId, reason: String },
    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),
    #[error("a reason is required to {action} a request")]
    MissingReason { action: &'static str },
    #[error("identity directory failure: {0}")]
    Directory(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<ApprovalError> for ApplicationError {
    fn from(value: ApprovalError) -> Self {
        Self::Domain(DomainError::Approval(value))
    }
}

impl ApplicationError {
    /// Only infrastructural failures are retried; domain refusals go back to the actor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::LockTimeout(_))
    }

    pub fn approval(&self) -> Option<&ApprovalError> {
        match self {
            Self::Domain(DomainError::Approval(error)) => Some(error),
            _ => None,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not allowed to act on this approval step.",
            Self::Conflict { .. } => {
                "The approval has changed since you loaded it. Refresh and try again."
            }
            Self::NotFound { .. } => "The requested approval record does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::Forbidden { message, .. }
            | Self::Conflict { message, .. }
            | Self::NotFound { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::Approval(error)) => match error {
                ApprovalError::NoTierMatched { .. }
                | ApprovalError::InvalidConfiguration { .. }
                | ApprovalError::InvalidDelegation(_)
                | ApprovalError::MissingReason { .. } => {
                    Self::BadRequest { message: error.to_string(), correlation_id: unassigned() }
                }
                ApprovalError::NotEligible { ref reason, .. } => {
                    Self::Forbidden { message: reason.describe(), correlation_id: unassigned() }
                }
                ApprovalError::DelegationLimitExceeded { ref violation, .. } => Self::Forbidden {
                    message: format!(
                        "your delegation does not cover this request ({})",
                        violation.kind()
                    ),
                    correlation_id: unassigned(),
                },
                ApprovalError::InvalidTransition { .. }
                | ApprovalError::ConfigurationVersionMismatch { .. } => {
                    Self::Conflict { message: error.to_string(), correlation_id: unassigned() }
                }
                ApprovalError::InstanceNotFound(_)
                | ApprovalError::ConfigurationNotFound(_)
                | ApprovalError::DelegationNotFound(_) => {
                    Self::NotFound { message: error.to_string(), correlation_id: unassigned() }
                }
                ApprovalError::Directory(message) => {
                    Self::ServiceUnavailable { message, correlation_id: unassigned() }
                }
            },
            ApplicationError::Domain(DomainError::InvariantViolation(message)) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::LockTimeout(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}
