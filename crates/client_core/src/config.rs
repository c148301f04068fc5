use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use shared::domain::UserId;
use tracing::warn;

use crate::connection::{BackoffPolicy, ConnectionOptions};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub auth_token: Option<String>,
    pub user_id: UserId,
    pub database_url: String,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    /// `None` keeps retrying a queued action across reconnects forever.
    pub max_requeue_attempts: Option<u32>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8443/ws".into(),
            auth_token: None,
            user_id: UserId::new("local-user"),
            database_url: "sqlite://./data/client.db".into(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            max_requeue_attempts: None,
        }
    }
}

impl ClientSettings {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: self.connect_timeout,
            send_timeout: self.send_timeout,
            backoff: self.backoff.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    auth_token: Option<String>,
    user_id: Option<String>,
    database_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    reconnect_jitter_ratio: Option<f64>,
    reconnect_max_attempts: Option<u32>,
    max_requeue_attempts: Option<u32>,
}

/// Defaults, then `client.toml` in the working directory, then the process
/// environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.auth_token {
        settings.auth_token = Some(v);
    }
    if let Some(v) = file_cfg.user_id {
        settings.user_id = UserId::new(v);
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = normalize_database_url(&v);
    }
    if let Some(v) = file_cfg.connect_timeout_ms {
        settings.connect_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.send_timeout_ms {
        settings.send_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.heartbeat_interval_secs {
        settings.heartbeat_interval = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.backoff.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.backoff.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_multiplier {
        settings.backoff.multiplier = v;
    }
    if let Some(v) = file_cfg.reconnect_jitter_ratio {
        settings.backoff.jitter_ratio = v;
    }
    if file_cfg.reconnect_max_attempts.is_some() {
        settings.backoff.max_attempts = file_cfg.reconnect_max_attempts;
    }
    if file_cfg.max_requeue_attempts.is_some() {
        settings.max_requeue_attempts = file_cfg.max_requeue_attempts;
    }
}

/// Overlays environment values read through `lookup`. Later names in each
/// group win.
pub fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    for key in ["CHAT_SERVER_URL", "APP__SERVER_URL"] {
        if let Some(v) = lookup(key) {
            settings.server_url = v;
        }
    }
    if let Some(v) = lookup("CHAT_AUTH_TOKEN") {
        settings.auth_token = Some(v).filter(|token| !token.is_empty());
    }
    if let Some(v) = lookup("CHAT_USER_ID") {
        settings.user_id = UserId::new(v);
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = lookup(key) {
            settings.database_url = normalize_database_url(&v);
        }
    }

    if let Some(v) = parsed::<u64>(&lookup, "APP__CONNECT_TIMEOUT_MS") {
        settings.connect_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<u64>(&lookup, "APP__SEND_TIMEOUT_MS") {
        settings.send_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<u64>(&lookup, "APP__HEARTBEAT_INTERVAL_SECS") {
        settings.heartbeat_interval = Duration::from_secs(v);
    }
    if let Some(v) = parsed::<u64>(&lookup, "APP__RECONNECT_BASE_DELAY_MS") {
        settings.backoff.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<u64>(&lookup, "APP__RECONNECT_MAX_DELAY_MS") {
        settings.backoff.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<f64>(&lookup, "APP__RECONNECT_MULTIPLIER") {
        settings.backoff.multiplier = v;
    }
    if let Some(v) = parsed::<f64>(&lookup, "APP__RECONNECT_JITTER_RATIO") {
        settings.backoff.jitter_ratio = v;
    }
    if let Some(v) = parsed::<u32>(&lookup, "APP__RECONNECT_MAX_ATTEMPTS") {
        settings.backoff.max_attempts = Some(v);
    }
    if let Some(v) = parsed::<u32>(&lookup, "APP__MAX_REQUEUE_ATTEMPTS") {
        settings.max_requeue_attempts = Some(v);
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring unparsable value");
            None
        }
    }
}

/// Turns bare file paths into `sqlite://` urls; anything with a scheme is
/// kept as is.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
