use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;

use signoff_core::domain::request::{RequestAttributes, UserId};
use signoff_core::domain::tier::{
    ApprovalTier, ApproverLimit, ApproverType, ConfigurationId, ThresholdLogic, ThresholdOperator,
    ThresholdValue, TierApprover, TierConfiguration, TierInclusion, TierThreshold, TriggerType,
    WorkflowCategory,
};
use signoff_core::eligibility::{DirectoryUser, InMemoryDirectory};
use signoff_core::retry::RetryPolicy;
use signoff_core::workflow::{ApprovalEngine, EngineSettings, RouteRequest};
use signoff_core::FixedClock;
use signoff_db::{connect_with_settings, migrations, DbPool, EngineStore};

use crate::service::ApprovalService;

pub(crate) async fn pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    pool
}

fn member(id: &str, role: &str, manager: Option<&str>) -> DirectoryUser {
    DirectoryUser {
        id: UserId::new(id),
        roles: vec![role.to_string()],
        manager_id: manager.map(UserId::new),
        department: Some("operations".to_string()),
        is_executive: false,
    }
}

fn purchase_configuration() -> TierConfiguration {
    TierConfiguration {
        id: ConfigurationId("purchase".to_string()),
        name: "Purchase approvals".to_string(),
        category: WorkflowCategory::Purchase,
        version: 1,
        tiers: vec![ApprovalTier {
            level: 2,
            name: "Finance".to_string(),
            category: None,
            thresholds: vec![TierThreshold {
                trigger_type: TriggerType::Amount,
                operator: ThresholdOperator::GreaterThan,
                value: ThresholdValue::Number(Decimal::new(1000, 0)),
            }],
            approvers: vec![TierApprover {
                approver_type: ApproverType::Role,
                approver_id: Some("finance".to_string()),
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
        }],
        is_default: true,
        is_active: true,
        threshold_logic: ThresholdLogic::Any,
        tier_inclusion: TierInclusion::Cumulative,
        created_by: Some("ops".to_string()),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date"),
    }
}

/// dana and fay share the finance role; mo manages both.
pub(crate) fn engine(clock: Arc<FixedClock>) -> ApprovalEngine<InMemoryDirectory> {
    let directory = InMemoryDirectory::default()
        .with_user(member("dana", "finance", Some("mo")))
        .with_user(member("fay", "finance", Some("mo")))
        .with_user(member("mo", "approval_admin", None))
        .with_user(member("bob", "controller", None));
    let engine = ApprovalEngine::new(
        directory,
        EngineSettings::new("approval_admin", SecretString::from("server-test-ledger-key".to_string())),
    )
    .with_clock(clock);
    engine.register_configuration(purchase_configuration()).expect("purchase configuration");
    engine
}

pub(crate) struct Harness {
    pub service: Arc<ApprovalService>,
    pub store: EngineStore,
    pub clock: Arc<FixedClock>,
}

pub(crate) async fn harness() -> Harness {
    let store = EngineStore::sql(pool().await);
    let clock =
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).single().expect("valid date")));
    let engine = engine(clock.clone());
    for configuration in engine.configurations() {
        store.save_configuration(&configuration).await.expect("save configuration");
    }
    let retry = RetryPolicy { max_attempts: 2, base_delay_ms: 1, multiplier: 2 };
    Harness { service: Arc::new(ApprovalService::new(engine, store.clone(), retry)), store, clock }
}

pub(crate) async fn service_with_store() -> (Arc<ApprovalService>, EngineStore) {
    let Harness { service, store, .. } = harness().await;
    (service, store)
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
