use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

const MIN_SIGNING_KEY_LEN: usize = 16;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub engine: EngineConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Most due instances examined per escalation tick.
    pub batch_limit: usize,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            multiplier: self.multiplier,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub admin_role: String,
    /// TOML org directory: users, roles, managers, department heads.
    pub directory_path: Option<PathBuf>,
    /// Tier configuration files registered at boot.
    pub configurations_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct AuditConfig {
    /// HMAC key for the history ledger.
    pub signing_key: SecretString,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub scheduler_enabled: Option<bool>,
    pub directory_path: Option<PathBuf>,
    pub configurations_dir: Option<PathBuf>,
    pub audit_signing_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://signoff.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            scheduler: SchedulerConfig { enabled: true, poll_interval_secs: 300, batch_limit: 500 },
            retry: RetryConfig { max_attempts: 3, base_delay_ms: 50, multiplier: 2 },
            engine: EngineConfig {
                admin_role: "approval_admin".to_string(),
                directory_path: None,
                configurations_dir: None,
            },
            audit: AuditConfig { signing_key: String::new().into() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("signoff.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            if let Some(enabled) = scheduler.enabled {
                self.scheduler.enabled = enabled;
            }
            if let Some(poll_interval_secs) = scheduler.poll_interval_secs {
                self.scheduler.poll_interval_secs = poll_interval_secs;
            }
            if let Some(batch_limit) = scheduler.batch_limit {
                self.scheduler.batch_limit = batch_limit;
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(max_attempts) = retry.max_attempts {
                self.retry.max_attempts = max_attempts;
            }
            if let Some(base_delay_ms) = retry.base_delay_ms {
                self.retry.base_delay_ms = base_delay_ms;
            }
            if let Some(multiplier) = retry.multiplier {
                self.retry.multiplier = multiplier;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(admin_role) = engine.admin_role {
                self.engine.admin_role = admin_role;
            }
            if let Some(directory_path) = engine.directory_path {
                self.engine.directory_path = Some(directory_path);
            }
            if let Some(configurations_dir) = engine.configurations_dir {
                self.engine.configurations_dir = Some(configurations_dir);
            }
        }

        if let Some(audit) = patch.audit {
            if let Some(signing_key) = audit.signing_key {
                self.audit.signing_key = secret_value(signing_key);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SIGNOFF_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SIGNOFF_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("SIGNOFF_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("SIGNOFF_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SIGNOFF_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SIGNOFF_SERVER_PORT") {
            self.server.port = parse_env("SIGNOFF_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("SIGNOFF_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("SIGNOFF_SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_env("SIGNOFF_SCHEDULER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_SCHEDULER_POLL_INTERVAL_SECS") {
            self.scheduler.poll_interval_secs =
                parse_env("SIGNOFF_SCHEDULER_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_SCHEDULER_BATCH_LIMIT") {
            self.scheduler.batch_limit = parse_env("SIGNOFF_SCHEDULER_BATCH_LIMIT", &value)?;
        }

        if let Some(value) = read_env("SIGNOFF_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("SIGNOFF_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_env("SIGNOFF_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_RETRY_MULTIPLIER") {
            self.retry.multiplier = parse_env("SIGNOFF_RETRY_MULTIPLIER", &value)?;
        }

        if let Some(value) = read_env("SIGNOFF_ENGINE_ADMIN_ROLE") {
            self.engine.admin_role = value;
        }
        if let Some(value) = read_env("SIGNOFF_ENGINE_DIRECTORY_PATH") {
            self.engine.directory_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("SIGNOFF_ENGINE_CONFIGURATIONS_DIR") {
            self.engine.configurations_dir = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("SIGNOFF_AUDIT_SIGNING_KEY") {
            self.audit.signing_key = secret_value(value);
        }

        let log_level = read_env("SIGNOFF_LOGGING_LEVEL").or_else(|| read_env("SIGNOFF_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SIGNOFF_LOGGING_FORMAT").or_else(|| read_env("SIGNOFF_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = enabled;
        }
        if let Some(directory_path) = overrides.directory_path {
            self.engine.directory_path = Some(directory_path);
        }
        if let Some(configurations_dir) = overrides.configurations_dir {
            self.engine.configurations_dir = Some(configurations_dir);
        }
        if let Some(signing_key) = overrides.audit_signing_key {
            self.audit.signing_key = secret_value(signing_key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_scheduler(&self.scheduler)?;
        validate_retry(&self.retry)?;
        validate_engine(&self.engine)?;
        validate_audit(&self.audit)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("signoff.toml"), PathBuf::from("config/signoff.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.poll_interval_secs == 0 || scheduler.poll_interval_secs > 3600 {
        return Err(ConfigError::Validation(
            "scheduler.poll_interval_secs must be in range 1..=3600".to_string(),
        ));
    }

    if scheduler.batch_limit == 0 {
        return Err(ConfigError::Validation(
            "scheduler.batch_limit must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry(retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 || retry.max_attempts > 10 {
        return Err(ConfigError::Validation(
            "retry.max_attempts must be in range 1..=10".to_string(),
        ));
    }

    if retry.base_delay_ms == 0 || retry.base_delay_ms > 60_000 {
        return Err(ConfigError::Validation(
            "retry.base_delay_ms must be in range 1..=60000".to_string(),
        ));
    }

    if retry.multiplier == 0 {
        return Err(ConfigError::Validation(
            "retry.multiplier must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.admin_role.trim().is_empty() {
        return Err(ConfigError::Validation("engine.admin_role must not be empty".to_string()));
    }
    Ok(())
}

fn validate_audit(audit: &AuditConfig) -> Result<(), ConfigError> {
    let signing_key = audit.signing_key.expose_secret();
    if signing_key.trim().is_empty() {
        return Err(ConfigError::Validation(
            "audit.signing_key is required; set it in signoff.toml or SIGNOFF_AUDIT_SIGNING_KEY"
                .to_string(),
        ));
    }
    if signing_key.len() < MIN_SIGNING_KEY_LEN {
        return Err(ConfigError::Validation(format!(
            "audit.signing_key must be at least {MIN_SIGNING_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    scheduler: Option<SchedulerPatch>,
    retry: Option<RetryPatch>,
    engine: Option<EnginePatch>,
    audit: Option<AuditPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    enabled: Option<bool>,
    poll_interval_secs: Option<u64>,
    batch_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryPatch {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    multiplier: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    admin_role: Option<String>,
    directory_path: Option<PathBuf>,
    configurations_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditPatch {
    signing_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
