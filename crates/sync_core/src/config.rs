use std::{fs, io, path::Path, time::Duration};

use tracing::warn;

use crate::{reactions::EmptyReaction, replicator::RetryPolicy};

pub const SETTINGS_FILE: &str = "synctl.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub blob_base_url: Option<String>,
    pub replication_retry_attempts: usize,
    pub replication_retry_delay_ms: u64,
    pub event_capacity: usize,
    pub retain_empty_reactions: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/synctl.db".into(),
            blob_base_url: None,
            replication_retry_attempts: 3,
            replication_retry_delay_ms: 200,
            event_capacity: 256,
            retain_empty_reactions: false,
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.replication_retry_attempts.max(1),
            delay: Duration::from_millis(self.replication_retry_delay_ms),
        }
    }

    pub fn empty_reactions(&self) -> EmptyReaction {
        if self.retain_empty_reactions {
            EmptyReaction::Retain
        } else {
            EmptyReaction::Remove
        }
    }
}

/// Defaults, then `synctl.toml` in the working directory, then `APP__*` variables.
pub fn load_settings() -> Settings {
    load_settings_from(Some(Path::new(SETTINGS_FILE)))
}

pub fn load_settings_from(path: Option<&Path>) -> Settings {
    let mut settings = Settings::default();

    if let Some(path) = path {
        match fs::read_to_string(path) {
            Ok(raw) => apply_file_overrides(&mut settings, &raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), %err, "config: failed to read settings file"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let table = match toml::from_str::<toml::Table>(raw) {
        Ok(table) => table,
        Err(err) => {
            warn!(%err, "config: ignoring unparsable settings file");
            return;
        }
    };

    for (key, value) in table {
        let value = match value {
            toml::Value::String(value) => value,
            toml::Value::Integer(value) => value.to_string(),
            toml::Value::Boolean(value) => value.to_string(),
            other => {
                warn!(key = %key, value = %other, "config: unsupported value type");
                continue;
            }
        };
        apply_setting(settings, &key, &value);
    }
}

pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(value) = lookup("DATABASE_URL") {
        settings.database_url = value;
    }
    for key in [
        "database_url",
        "blob_base_url",
        "replication_retry_attempts",
        "replication_retry_delay_ms",
        "event_capacity",
        "retain_empty_reactions",
    ] {
        if let Some(value) = lookup(&format!("APP__{}", key.to_ascii_uppercase())) {
            apply_setting(settings, key, &value);
        }
    }
}

fn apply_setting(settings: &mut Settings, key: &str, value: &str) {
    match key {
        "database_url" => settings.database_url = value.to_string(),
        "blob_base_url" => {
            let value = value.trim();
            settings.blob_base_url = (!value.is_empty()).then(|| value.to_string());
        }
        "replication_retry_attempts" => {
            parse_into(key, value, &mut settings.replication_retry_attempts)
        }
        "replication_retry_delay_ms" => {
            parse_into(key, value, &mut settings.replication_retry_delay_ms)
        }
        "event_capacity" => parse_into(key, value, &mut settings.event_capacity),
        "retain_empty_reactions" => parse_into(key, value, &mut settings.retain_empty_reactions),
        _ => warn!(key, "config: unknown setting"),
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, raw: &str, slot: &mut T) {
    match raw.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = raw, "config: invalid value; keeping previous"),
    }
}

/// Normalizes a user-supplied database location into a sqlx SQLite URL.
pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
