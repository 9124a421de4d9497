use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use signoff_db::DbPool;

use crate::service::ApprovalService;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub service: Arc<ApprovalService>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub persistence: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let persistence =
        backlog_check(state.service.backlog_len().await, state.service.rejected_len().await);
    let ready = database.status == "ready" && persistence.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: format!(
                "{} workflow instances loaded",
                state.service.engine().instance_ids().len()
            ),
        },
        database,
        persistence,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn backlog_check(pending: usize, rejected: usize) -> HealthCheck {
    match (pending, rejected) {
        (0, 0) => HealthCheck { status: "ready", detail: "all committed changes are stored".to_string() },
        (pending, 0) => HealthCheck {
            status: "degraded",
            detail: format!("{pending} committed changes waiting to be stored"),
        },
        (pending, rejected) => HealthCheck {
            status: "degraded",
            detail: format!("{rejected} committed changes refused by storage, {pending} waiting"),
        },
    }
}
