use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use countersign_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let unset = || "<unset>".to_string();
    let entries = vec![
        Entry::new("database.url", redact_url(&config.database.url), &["COUNTERSIGN_DATABASE_URL"]),
        Entry::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["COUNTERSIGN_DATABASE_MAX_CONNECTIONS"],
        ),
        Entry::new(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["COUNTERSIGN_DATABASE_TIMEOUT_SECS"],
        ),
        Entry::new(
            "notifications.enabled",
            config.notifications.enabled.to_string(),
            &["COUNTERSIGN_NOTIFICATIONS_ENABLED"],
        ),
        Entry::new(
            "notifications.from_address",
            config.notifications.from_address.clone().unwrap_or_else(unset),
            &["COUNTERSIGN_NOTIFICATIONS_FROM_ADDRESS"],
        ),
        Entry::new(
            "notifications.base_url",
            config.notifications.base_url.as_deref().map(redact_url).unwrap_or_else(unset),
            &["COUNTERSIGN_NOTIFICATIONS_BASE_URL"],
        ),
        Entry::new("sequence.code", config.sequence.code.clone(), &[]),
        Entry::new(
            "sequence.prefix",
            config.sequence.prefix.clone(),
            &["COUNTERSIGN_SEQUENCE_PREFIX"],
        ),
        Entry::new(
            "sequence.padding",
            config.sequence.padding.to_string(),
            &["COUNTERSIGN_SEQUENCE_PADDING"],
        ),
        Entry::new(
            "logging.level",
            config.logging.level.clone(),
            &["COUNTERSIGN_LOGGING_LEVEL", "COUNTERSIGN_LOG_LEVEL"],
        ),
        Entry::new(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["COUNTERSIGN_LOGGING_FORMAT", "COUNTERSIGN_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries {
        let source = field_source(
            entry.key,
            entry.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

struct Entry {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Entry {
    fn new(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Self {
        Self { key, value, env_keys }
    }
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("countersign.toml"), PathBuf::from("config/countersign.toml")]
        .into_iter()
        .find(|path| path.exists())
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

/// Masks `user:password@` credentials embedded in a url.
fn redact_url(url: &str) -> String {
    let trimmed = url.trim();
    let Some((scheme, rest)) = trimmed.split_once("://") else {
        return trimmed.to_string();
    };
    match rest.split_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => trimmed.to_string(),
    }
}
