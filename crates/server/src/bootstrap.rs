use std::sync::Arc;

use signoff_core::audit::TracingAuditSink;
use signoff_core::config::{AppConfig, ConfigError, LoadOptions};
use signoff_core::domain::tier::TierConfiguration;
use signoff_core::eligibility::{DirectoryFileError, InMemoryDirectory};
use signoff_core::errors::ApplicationError;
use signoff_core::notifications::TracingNotificationSink;
use signoff_core::routing::{CatalogFileError, ConfigurationFile};
use signoff_core::workflow::{ApprovalEngine, EngineSettings};
use signoff_db::{connect_with_config, migrations, DbPool, EngineStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::service::ApprovalService;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<ApprovalService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Directory(#[from] DirectoryFileError),
    #[error(transparent)]
    Configurations(#[from] CatalogFileError),
    #[error("engine state could not be restored: {0}")]
    Hydration(#[source] ApplicationError),
    #[error("tier configuration sync failed: {0}")]
    ConfigurationSync(#[source] ApplicationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let directory = match &config.engine.directory_path {
        Some(path) => InMemoryDirectory::from_file(path)?,
        None => {
            warn!(
                event_name = "system.bootstrap.directory_empty",
                correlation_id = "bootstrap",
                "no directory file configured; role and manager approvers will resolve to nobody"
            );
            InMemoryDirectory::default()
        }
    };

    let engine = ApprovalEngine::new(
        directory,
        EngineSettings::new(config.engine.admin_role.clone(), config.audit.signing_key.clone()),
    )
    .with_audit_sink(Arc::new(TracingAuditSink))
    .with_notification_sink(Arc::new(TracingNotificationSink));

    let store = EngineStore::sql(db_pool.clone());
    let hydrated = store.hydrate(&engine).await.map_err(BootstrapError::Hydration)?;
    let service = Arc::new(ApprovalService::new(engine, store, config.retry.policy()));

    if let Some(dir) = &config.engine.configurations_dir {
        let configurations = ConfigurationFile::load_dir(dir)?;
        let synced = sync_configurations(&service, configurations).await?;
        info!(
            event_name = "system.bootstrap.configurations_synced",
            correlation_id = "bootstrap",
            directory = %dir.display(),
            synced,
            "tier configuration files applied"
        );
    }

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        configurations = hydrated.configurations,
        instances = hydrated.instances,
        delegations = hydrated.delegations,
        "approval engine ready"
    );

    Ok(Application { config, db_pool, service })
}

/// Applies file-defined configurations on top of the stored catalog. Versions that are
/// new get registered, unreferenced versions that changed get amended, and a changed
/// version that instances already use aborts the boot.
async fn sync_configurations(
    service: &ApprovalService,
    configurations: Vec<TierConfiguration>,
) -> Result<usize, BootstrapError> {
    let engine = service.engine();
    let mut synced = 0;

    for configuration in configurations {
        let existing = engine
            .configurations()
            .into_iter()
            .find(|stored| stored.id == configuration.id && stored.version == configuration.version);

        match existing {
            None => {
                service
                    .register_configuration(configuration, "bootstrap")
                    .await
                    .map_err(BootstrapError::ConfigurationSync)?;
            }
            Some(stored) if same_definition(&stored, &configuration) => continue,
            Some(stored) => {
                let amended = TierConfiguration { created_at: stored.created_at, ..configuration };
                engine
                    .amend_configuration(amended.clone())
                    .map_err(|error| BootstrapError::ConfigurationSync(error.into()))?;
                service.store_configuration(amended, "bootstrap").await;
            }
        }
        synced += 1;
    }
    Ok(synced)
}

/// Activation flags are owned by the running catalog once a revision exists.
fn same_definition(stored: &TierConfiguration, file: &TierConfiguration) -> bool {
    let normalized = TierConfiguration {
        created_at: stored.created_at,
        is_active: stored.is_active,
        is_default: stored.is_default,
        ..file.clone()
    };
    &normalized == stored
}
