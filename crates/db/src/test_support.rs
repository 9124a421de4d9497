use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;

use signoff_core::domain::request::{RequestAttributes, UserId};
use signoff_core::domain::tier::{
    ApprovalTier, ApproverLimit, ApproverType, ConfigurationId, ThresholdLogic, ThresholdOperator,
    ThresholdValue, TierApprover, TierConfiguration, TierInclusion, TierThreshold, TriggerType,
    WorkflowCategory,
};
use signoff_core::eligibility::{DirectoryUser, InMemoryDirectory};
use signoff_core::workflow::{ApprovalEngine, EngineSettings, RouteRequest};
use signoff_core::FixedClock;

use crate::{connect_with_settings, migrations, DbPool};

pub(crate) async fn setup() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    pool
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).single().expect("valid date")
}

fn user(id: &str, role: &str, manager: Option<&str>) -> DirectoryUser {
    DirectoryUser {
        id: UserId::new(id),
        roles: vec![role.to_string()],
        manager_id: manager.map(UserId::new),
        department: Some("operations".to_string()),
        is_executive: false,
    }
}

fn tier(level: u8, approver_type: ApproverType, approver_id: &str, above: i64) -> ApprovalTier {
    ApprovalTier {
        level,
        name: format!("Tier {level}"),
        category: None,
        thresholds: vec![TierThreshold {
            trigger_type: TriggerType::Amount,
            operator: ThresholdOperator::GreaterThan,
            value: ThresholdValue::Number(Decimal::new(above, 0)),
        }],
        approvers: vec![TierApprover {
            approver_type,
            approver_id: Some(approver_id.to_string()),
            order: 0,
            is_required: true,
        }],
        require_all_approvers: false,
        sequential: false,
        auto_escalate_hours: Some(24),
        auto_approve_on_timeout: false,
        escalation: None,
        reminder_interval_hours: None,
        approver_limits: ApproverLimit::default(),
        is_active: true,
    }
}

pub(crate) fn purchase_configuration() -> TierConfiguration {
    TierConfiguration {
        id: ConfigurationId("purchase".to_string()),
        name: "Purchase approvals".to_string(),
        category: WorkflowCategory::Purchase,
        version: 1,
        tiers: vec![
            tier(2, ApproverType::Role, "finance", 1000),
            tier(3, ApproverType::User, "alice", 5000),
        ],
        is_default: true,
        is_active: true,
        threshold_logic: ThresholdLogic::Any,
        tier_inclusion: TierInclusion::Cumulative,
        created_by: Some("ops".to_string()),
        created_at: start(),
    }
}

/// Engine with the org directory but no configurations, as at process start.
pub(crate) fn empty_engine() -> ApprovalEngine<InMemoryDirectory> {
    let directory = InMemoryDirectory::default()
        .with_user(user("dana", "finance", Some("mo")))
        .with_user(user("mo", "manager", None))
        .with_user(user("fay", "finance", Some("mo")))
        .with_user(user("alice", "controller", None))
        .with_user(user("bob", "controller", None));
    ApprovalEngine::new(
        directory,
        EngineSettings::new("approval_admin", SecretString::from("db-test-ledger-key".to_string())),
    )
    .with_clock(Arc::new(FixedClock::new(start())))
}

pub(crate) fn engine() -> ApprovalEngine<InMemoryDirectory> {
    let engine = empty_engine();
    engine.register_configuration(purchase_configuration()).expect("purchase configuration");
    engine
}

pub(crate) fn purchase_request(amount: i64) -> RouteRequest {
    RouteRequest {
        reference_id: format!("PO-{amount}"),
        reference_type: "purchase_order".to_string(),
        category: WorkflowCategory::Purchase,
        requester_id: UserId::new("dana"),
        attributes: RequestAttributes::new().with_number(TriggerType::Amount, Decimal::new(amount, 0)),
        configuration_id: None,
        dynamic_approvers: Default::default(),
    }
}
