//! HTTP surface over [`ApprovalService`].
//!
//! Identity is taken from the request body; authenticating callers is left to whatever
//! sits in front of this service.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use signoff_core::delegation::NewDelegation;
use signoff_core::domain::delegation::{
    DelegationAuditEntry, DelegationId, DelegationRule, DelegationStatus,
};
use signoff_core::domain::request::{RequestAttributes, UserId};
use signoff_core::domain::tier::{ConfigurationId, WorkflowCategory};
use signoff_core::domain::workflow::{InstanceId, StepId, WorkflowInstance, WorkflowStatus};
use signoff_core::errors::{ApplicationError, InterfaceError};
use signoff_core::escalation::SweepFailure;
use signoff_core::workflow::{
    ActorDecision, AuditTrail, DecisionAction, DelegationChange, RouteRequest, TransitionReport,
};

use crate::service::{ApprovalService, Committed};

const CORRELATION_HEADER: &str = "x-correlation-id";
const MAX_CORRELATION_LEN: usize = 128;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<ApprovalService>,
    pub sweep_limit: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/workflows", post(route_workflow))
        .route("/api/v1/workflows/{instance_id}", get(get_workflow))
        .route("/api/v1/workflows/{instance_id}/decisions", post(decide))
        .route("/api/v1/workflows/{instance_id}/escalations", post(escalate))
        .route("/api/v1/workflows/{instance_id}/cancel", post(cancel))
        .route("/api/v1/workflows/{instance_id}/resubmit", post(resubmit))
        .route("/api/v1/workflows/{instance_id}/eligible-approvers", get(eligible_approvers))
        .route("/api/v1/workflows/{instance_id}/audit", get(audit_trail))
        .route("/api/v1/delegations", post(create_delegation))
        .route("/api/v1/delegations/{delegation_id}", get(get_delegation))
        .route("/api/v1/delegations/{delegation_id}/revoke", post(revoke_delegation))
        .route("/api/v1/users/{user_id}/delegations", get(user_delegations))
        .route("/api/v1/escalations/sweep", post(sweep))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }

    fn not_found(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::NotFound {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            InterfaceError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
            InterfaceError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        };

        // Server-side detail stays in the logs.
        let message = if status.is_server_error() {
            error!(
                event_name = "api.request_failed",
                correlation_id = self.0.correlation_id(),
                error = %self.0,
                "request failed"
            );
            self.0.user_message().to_string()
        } else {
            warn!(
                event_name = "api.request_refused",
                correlation_id = self.0.correlation_id(),
                error = %self.0,
                "request refused"
            );
            self.0.message().to_string()
        };

        let body = ErrorBody {
            error: kind,
            message,
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_CORRELATION_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn parse_attributes(
    raw: &serde_json::Map<String, serde_json::Value>,
    correlation_id: &str,
) -> Result<RequestAttributes, ApiError> {
    RequestAttributes::from_json_map(raw)
        .map_err(|error| ApiError::bad_request(error.to_string(), correlation_id))
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct WorkflowView {
    pub status: WorkflowStatus,
    pub current_step_id: Option<StepId>,
    pub instance: WorkflowInstance,
}

impl From<WorkflowInstance> for WorkflowView {
    fn from(instance: WorkflowInstance) -> Self {
        Self {
            status: instance.status(),
            current_step_id: instance.current_step().map(|step| step.id.clone()),
            instance,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransitionView {
    pub transition: String,
    /// `false` when the change is committed but still queued for storage.
    pub persisted: bool,
    #[serde(flatten)]
    pub workflow: WorkflowView,
}

fn transition_response(committed: Committed<TransitionReport>, created: bool) -> Response {
    let status = match (committed.persisted, created) {
        (false, _) => StatusCode::ACCEPTED,
        (true, true) => StatusCode::CREATED,
        (true, false) => StatusCode::OK,
    };
    let report = committed.value;
    let view = TransitionView {
        transition: report.transition,
        persisted: committed.persisted,
        workflow: WorkflowView::from(report.instance),
    };
    (status, Json(view)).into_response()
}

#[derive(Debug, Serialize)]
pub struct EligibleApproversView {
    pub instance_id: InstanceId,
    pub tier_level: u8,
    pub approvers: Vec<UserId>,
}

#[derive(Debug, Serialize)]
pub struct DelegationView {
    pub status: DelegationStatus,
    pub rule: DelegationRule,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audit: Vec<DelegationAuditEntry>,
}

#[derive(Debug, Serialize)]
pub struct DelegationChangeView {
    pub persisted: bool,
    pub rule: DelegationRule,
    pub audit: DelegationAuditEntry,
}

fn delegation_response(committed: Committed<DelegationChange>, created: bool) -> Response {
    let status = match (committed.persisted, created) {
        (false, _) => StatusCode::ACCEPTED,
        (true, true) => StatusCode::CREATED,
        (true, false) => StatusCode::OK,
    };
    let change = committed.value;
    let view = DelegationChangeView {
        persisted: committed.persisted,
        rule: change.rule,
        audit: change.audit,
    };
    (status, Json(view)).into_response()
}

#[derive(Debug, Serialize)]
pub struct SweepView {
    pub examined: usize,
    pub escalated: usize,
    pub auto_approved: usize,
    pub reminders: usize,
    pub failures: Vec<SweepFailure>,
    pub pending_writes: usize,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RouteBody {
    pub reference_id: String,
    pub reference_type: String,
    pub category: WorkflowCategory,
    pub requester_id: UserId,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub configuration_id: Option<ConfigurationId>,
    #[serde(default)]
    pub dynamic_approvers: BTreeMap<String, Vec<UserId>>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub step_id: StepId,
    pub actor_id: UserId,
    pub action: DecisionAction,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EscalationBody {
    pub step_id: StepId,
    pub actor_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub actor_id: UserId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResubmitBody {
    pub actor_id: UserId,
    #[serde(default)]
    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub revoked_by: UserId,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct SweepParams {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn route_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<RouteBody>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let request = RouteRequest {
        attributes: parse_attributes(&body.attributes, &correlation_id)?,
        reference_id: body.reference_id,
        reference_type: body.reference_type,
        category: body.category,
        requester_id: body.requester_id,
        configuration_id: body.configuration_id,
        dynamic_approvers: body.dynamic_approvers,
    };
    let committed = state
        .service
        .route(request, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(transition_response(committed, true))
}

pub async fn get_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
) -> Result<Json<WorkflowView>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let instance = state
        .service
        .instance(&InstanceId(instance_id))
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(WorkflowView::from(instance)))
}

pub async fn decide(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let decision = ActorDecision {
        instance_id: InstanceId(instance_id),
        step_id: body.step_id,
        actor_id: body.actor_id,
        action: body.action,
        reason: body.reason,
    };
    let committed = state
        .service
        .decide(decision, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(transition_response(committed, false))
}

pub async fn escalate(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
    Json(body): Json<EscalationBody>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let committed = state
        .service
        .escalate(&InstanceId(instance_id), &body.step_id, &body.actor_id, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(transition_response(committed, false))
}

pub async fn cancel(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let committed = state
        .service
        .cancel(&InstanceId(instance_id), &body.actor_id, body.reason.as_deref(), &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(transition_response(committed, false))
}

pub async fn resubmit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
    Json(body): Json<ResubmitBody>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let attributes = body
        .attributes
        .as_ref()
        .map(|raw| parse_attributes(raw, &correlation_id))
        .transpose()?;
    let committed = state
        .service
        .resubmit(&InstanceId(instance_id), &body.actor_id, attributes, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(transition_response(committed, false))
}

/// Effective approvers only. Exclusions and delegation chains stay internal.
pub async fn eligible_approvers(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
) -> Result<Json<EligibleApproversView>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let instance_id = InstanceId(instance_id);
    let eligible = state
        .service
        .eligible(&instance_id)
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(EligibleApproversView {
        instance_id,
        tier_level: eligible.tier_level,
        approvers: eligible.actors(),
    }))
}

pub async fn audit_trail(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(instance_id): Path<String>,
) -> Result<Json<AuditTrail>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .service
        .audit_trail(&InstanceId(instance_id))
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

pub async fn create_delegation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<NewDelegation>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let committed = state
        .service
        .create_delegation(body, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(delegation_response(committed, true))
}

pub async fn get_delegation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(delegation_id): Path<String>,
) -> Result<Json<DelegationView>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let id = DelegationId(delegation_id);
    let (rule, status, audit) = state
        .service
        .delegation(&id)
        .ok_or_else(|| ApiError::not_found(format!("delegation {id} was not found"), &correlation_id))?;
    Ok(Json(DelegationView { status, rule, audit }))
}

pub async fn revoke_delegation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(delegation_id): Path<String>,
    Json(body): Json<RevokeBody>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let committed = state
        .service
        .revoke_delegation(
            &DelegationId(delegation_id),
            &body.revoked_by,
            &body.reason,
            &correlation_id,
        )
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(delegation_response(committed, false))
}

pub async fn user_delegations(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Json<Vec<DelegationView>> {
    let views = state
        .service
        .delegations_granted_by(&UserId::new(user_id))
        .into_iter()
        .map(|(rule, status)| DelegationView { status, rule, audit: Vec::new() })
        .collect();
    Json(views)
}

pub async fn sweep(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<SweepParams>,
) -> Json<SweepView> {
    let correlation_id = correlation_id(&headers);
    let limit = params.limit.unwrap_or(state.sweep_limit).min(state.sweep_limit);
    let report = state.service.sweep(limit, &correlation_id).await;
    Json(SweepView {
        examined: report.examined,
        escalated: report.escalated,
        auto_approved: report.auto_approved,
        reminders: report.reminders,
        failures: report.failures,
        pending_writes: state.service.backlog_len().await,
    })
}
