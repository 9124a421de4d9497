use std::collections::BTreeSet;

use secrecy::ExposeSecret;
use serde_json::json;
use signoff_core::ledger::{HistoryLedger, VerificationResult};
use signoff_db::{connect_with_config, migrations, EngineStore};

use crate::commands::{exit, load_config, runtime, CommandResult};

pub fn run() -> CommandResult {
    let config = match load_config("verify-ledger") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("verify-ledger") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let loaded = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), exit::DATABASE))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), exit::MIGRATION))?;
        let entries = EngineStore::sql(pool.clone())
            .ledger()
            .list_entries()
            .await
            .map_err(|error| ("persistence", error.to_string(), exit::DATABASE))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(entries)
    });
    let entries = match loaded {
        Ok(entries) => entries,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("verify-ledger", error_class, message, exit_code);
        }
    };

    let chain_keys: BTreeSet<String> = entries.iter().map(|entry| entry.chain_key.clone()).collect();
    let mut ledger = HistoryLedger::new(config.audit.signing_key.expose_secret().as_bytes());
    ledger.restore(entries);

    let results: Vec<VerificationResult> =
        chain_keys.iter().map(|chain_key| ledger.verify_chain(chain_key)).collect();
    let broken: Vec<&VerificationResult> = results.iter().filter(|result| !result.valid).collect();

    if let Some(first) = broken.first() {
        return CommandResult::failure(
            "verify-ledger",
            "ledger_integrity",
            format!(
                "{} of {} chains failed verification; first: {} ({})",
                broken.len(),
                results.len(),
                first.chain_key,
                first.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
            exit::INTEGRITY,
        );
    }

    let verified_entries: usize = results.iter().map(|result| result.verified_entries).sum();
    CommandResult::success_with_details(
        "verify-ledger",
        format!("{} chains verified", results.len()),
        Some(json!({ "chains": results.len(), "entries": verified_entries })),
    )
}
