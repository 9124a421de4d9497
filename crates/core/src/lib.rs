pub mod audit;
pub mod clock;
pub mod config;
pub mod delegation;
pub mod domain;
pub mod eligibility;
pub mod errors;
pub mod escalation;
pub mod ledger;
pub mod notifications;
pub mod retry;
pub mod routing;
pub mod workflow;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use clock::{Clock, FixedClock, SystemClock};
pub use delegation::{DelegationRegistry, EffectiveApprover, NewDelegation};
pub use domain::delegation::{
    DelegationAuditEntry, DelegationId, DelegationLimits, DelegationRule, DelegationStatus,
    DelegationType, ProxyApprovalRecord,
};
pub use domain::request::{AttributeValue, RequestAttributes, RequestContext, UserId};
pub use domain::tier::{
    ApprovalTier, ConfigurationId, TierConfiguration, TriggerType, WorkflowCategory,
};
pub use domain::workflow::{
    InstanceId, RejectionHistoryEntry, StepAction, StepId, WorkflowInstance, WorkflowStatus,
    WorkflowStep, WorkflowStepHistory,
};
pub use eligibility::{DirectoryClient, EligibleSet, InMemoryDirectory};
pub use errors::{ApplicationError, ApprovalError, DomainError, InterfaceError};
pub use escalation::SweepReport;
pub use ledger::{HistoryLedger, LedgerEntry, VerificationResult};
pub use notifications::{NotificationIntent, NotificationSink, NotificationType};
pub use retry::RetryPolicy;
pub use routing::{ConfigurationCatalog, ConfigurationFile, TierResolver};
pub use workflow::{
    ActorDecision, ApprovalEngine, AuditTrail, DecisionAction, EngineSettings, RouteRequest,
    TransitionReport,
};
