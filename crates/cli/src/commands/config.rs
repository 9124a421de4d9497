use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use signoff_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// One rendered setting: dotted key, display value, and the env vars that can set it.
struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Field {
    fn new(key: &'static str, value: impl Into<String>, env_keys: &'static [&'static str]) -> Self {
        Self { key, value: value.into(), env_keys }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }
    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let optional_path = |path: &Option<PathBuf>| {
        path.as_ref().map(|path| path.display().to_string()).unwrap_or_else(|| "<unset>".to_string())
    };

    vec![
        Field::new("database.url", &config.database.url, &["SIGNOFF_DATABASE_URL"]),
        Field::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["SIGNOFF_DATABASE_MAX_CONNECTIONS"],
        ),
        Field::new(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["SIGNOFF_DATABASE_TIMEOUT_SECS"],
        ),
        Field::new(
            "server.bind_address",
            &config.server.bind_address,
            &["SIGNOFF_SERVER_BIND_ADDRESS"],
        ),
        Field::new("server.port", config.server.port.to_string(), &["SIGNOFF_SERVER_PORT"]),
        Field::new(
            "scheduler.enabled",
            config.scheduler.enabled.to_string(),
            &["SIGNOFF_SCHEDULER_ENABLED"],
        ),
        Field::new(
            "scheduler.poll_interval_secs",
            config.scheduler.poll_interval_secs.to_string(),
            &["SIGNOFF_SCHEDULER_POLL_INTERVAL_SECS"],
        ),
        Field::new(
            "scheduler.batch_limit",
            config.scheduler.batch_limit.to_string(),
            &["SIGNOFF_SCHEDULER_BATCH_LIMIT"],
        ),
        Field::new(
            "retry.max_attempts",
            config.retry.max_attempts.to_string(),
            &["SIGNOFF_RETRY_MAX_ATTEMPTS"],
        ),
        Field::new("engine.admin_role", &config.engine.admin_role, &["SIGNOFF_ENGINE_ADMIN_ROLE"]),
        Field::new(
            "engine.directory_path",
            optional_path(&config.engine.directory_path),
            &["SIGNOFF_ENGINE_DIRECTORY_PATH"],
        ),
        Field::new(
            "engine.configurations_dir",
            optional_path(&config.engine.configurations_dir),
            &["SIGNOFF_ENGINE_CONFIGURATIONS_DIR"],
        ),
        Field::new(
            "audit.signing_key",
            redact_secret(config.audit.signing_key.expose_secret()),
            &["SIGNOFF_AUDIT_SIGNING_KEY"],
        ),
        Field::new(
            "logging.level",
            &config.logging.level,
            &["SIGNOFF_LOGGING_LEVEL", "SIGNOFF_LOG_LEVEL"],
        ),
        Field::new(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["SIGNOFF_LOGGING_FORMAT", "SIGNOFF_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["signoff.toml", "config/signoff.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<unset>".to_string()
    } else {
        format!("<redacted, {} bytes>", secret.len())
    }
}
