use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use tracing::warn;
use url::Url;

use crate::poller::BackoffPolicy;

pub const SETTINGS_FILE: &str = "todo_client.toml";
const DEFAULT_API_URL: &str = "http://localhost:3001";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_url: String,
    pub request_timeout_ms: u64,
    pub token_path: Option<PathBuf>,
    pub poll_max_attempts: u32,
    pub poll_base_delay_ms: u64,
    pub poll_cap_delay_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            request_timeout_ms: 5_000,
            token_path: None,
            poll_max_attempts: 5,
            poll_base_delay_ms: 1_000,
            poll_cap_delay_ms: 16_000,
        }
    }
}

impl ClientSettings {
    pub fn api_base_url(&self) -> anyhow::Result<Url> {
        normalize_api_url(&self.api_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.poll_max_attempts,
            Duration::from_millis(self.poll_base_delay_ms),
            Duration::from_millis(self.poll_cap_delay_ms),
        )
    }
}

/// Defaults, then `todo_client.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Err(err) = apply_file_overrides(&mut settings, &raw) {
            warn!(path = %path.display(), %err, "config: ignoring unreadable settings file");
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub(crate) fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) -> anyhow::Result<()> {
    let table: toml::Table = toml::from_str(raw).context("invalid toml")?;

    if let Some(v) = table.get("api_url").and_then(|v| v.as_str()) {
        settings.api_url = v.to_string();
    }
    if let Some(v) = table.get("request_timeout_ms").and_then(|v| v.as_integer()) {
        settings.request_timeout_ms = u64::try_from(v).unwrap_or(settings.request_timeout_ms);
    }
    if let Some(v) = table.get("token_path").and_then(|v| v.as_str()) {
        settings.token_path = Some(PathBuf::from(v));
    }

    if let Some(poll) = table.get("poll").and_then(|v| v.as_table()) {
        if let Some(v) = poll.get("max_attempts").and_then(|v| v.as_integer()) {
            settings.poll_max_attempts = u32::try_from(v).unwrap_or(settings.poll_max_attempts);
        }
        if let Some(v) = poll.get("base_delay_ms").and_then(|v| v.as_integer()) {
            settings.poll_base_delay_ms = u64::try_from(v).unwrap_or(settings.poll_base_delay_ms);
        }
        if let Some(v) = poll.get("cap_delay_ms").and_then(|v| v.as_integer()) {
            settings.poll_cap_delay_ms = u64::try_from(v).unwrap_or(settings.poll_cap_delay_ms);
        }
    }

    Ok(())
}

pub(crate) fn apply_env_overrides(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("TODO_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = lookup("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_ms = parsed;
        }
    }

    if let Some(v) = lookup("APP__TOKEN_PATH") {
        settings.token_path = Some(PathBuf::from(v));
    }

    if let Some(v) = lookup("APP__POLL_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.poll_max_attempts = parsed;
        }
    }
    if let Some(v) = lookup("APP__POLL_BASE_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_base_delay_ms = parsed;
        }
    }
    if let Some(v) = lookup("APP__POLL_CAP_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_cap_delay_ms = parsed;
        }
    }
}

pub fn normalize_api_url(raw: &str) -> anyhow::Result<Url> {
    let raw = raw.trim();
    let raw = if raw.is_empty() { DEFAULT_API_URL } else { raw };

    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let mut url = Url::parse(&candidate).with_context(|| format!("invalid api url '{raw}'"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("api url must use http or https: {raw}");
    }

    let trimmed = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
