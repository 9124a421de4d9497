use std::sync::Arc;

use serde_json::json;
use signoff_core::audit::TracingAuditSink;
use signoff_core::config::AppConfig;
use signoff_core::eligibility::InMemoryDirectory;
use signoff_core::notifications::TracingNotificationSink;
use signoff_core::workflow::{ApprovalEngine, EngineSettings};
use signoff_db::{connect_with_config, migrations, EngineStore};

use crate::commands::{exit, load_config, runtime, CommandResult};

type Failure = (&'static str, String, u8);

/// One escalation pass against stored state, for deployments that run the server with
/// the scheduler disabled and drive timers from cron.
pub fn run(limit: Option<usize>) -> CommandResult {
    let config = match load_config("sweep") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("sweep") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    match runtime.block_on(sweep(&config, limit)) {
        Ok(details) => CommandResult::success_with_details(
            "sweep",
            "escalation pass completed",
            Some(details),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sweep", error_class, message, exit_code)
        }
    }
}

async fn sweep(config: &AppConfig, limit: Option<usize>) -> Result<serde_json::Value, Failure> {
    let directory = match &config.engine.directory_path {
        Some(path) => InMemoryDirectory::from_file(path)
            .map_err(|error| ("directory", error.to_string(), exit::INVALID_INPUT))?,
        None => InMemoryDirectory::default(),
    };
    let engine = ApprovalEngine::new(
        directory,
        EngineSettings::new(config.engine.admin_role.clone(), config.audit.signing_key.clone()),
    )
    .with_audit_sink(Arc::new(TracingAuditSink))
    .with_notification_sink(Arc::new(TracingNotificationSink));

    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), exit::DATABASE))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), exit::MIGRATION))?;

    let store = EngineStore::sql(pool.clone());
    store
        .hydrate(&engine)
        .await
        .map_err(|error| ("hydration", error.to_string(), exit::INTEGRITY))?;

    let limit = limit.unwrap_or(config.scheduler.batch_limit);
    let report = engine.run_escalation_sweep(limit, "cli-sweep");

    let mut persisted = 0;
    for transition in &report.transitions {
        store
            .persist_transition(transition)
            .await
            .map_err(|error| ("persistence", error.to_string(), exit::DATABASE))?;
        persisted += 1;
    }
    pool.close().await;

    Ok(json!({
        "examined": report.examined,
        "escalated": report.escalated,
        "auto_approved": report.auto_approved,
        "reminders": report.reminders,
        "persisted": persisted,
        "failures": report.failures,
    }))
}
