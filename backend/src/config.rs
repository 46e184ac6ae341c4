use std::{path::PathBuf, time::Duration};

use tracing::warn;

use crate::error::StartupError;

const DEFAULT_MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024;
const DEFAULT_MAX_DOWNLOAD_SIZE: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_TEMP_DIR: &str = "./temp";
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_COMPRESSION_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_RATE_LIMIT_REQUESTS: usize = 5;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60 * 60;
const DEFAULT_MAX_ARTIFACT_AGE_SECONDS: u64 = 60 * 60;
const DEFAULT_PENDING_CHOICE_TTL_SECONDS: u64 = 10 * 60;
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
const PLACEHOLDER_TOKEN: &str = "your_bot_token_here";

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub max_upload_size: u64,
    pub max_download_size: u64,
    pub temp_dir: PathBuf,
    pub download_timeout: Duration,
    pub probe_timeout: Duration,
    pub compression_timeout: Duration,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub cleanup_interval: Duration,
    pub max_artifact_age: Duration,
    pub pending_choice_ttl: Duration,
    pub health_addr: String,
    pub yt_dlp_bin: String,
    pub ffmpeg_bin: String,
    pub telegram_api_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StartupError> {
        let bot_token = lookup("BOT_TOKEN")
            .as_deref()
            .and_then(non_empty)
            .filter(|token| *token != PLACEHOLDER_TOKEN)
            .map(ToString::to_string)
            .ok_or(StartupError::MissingToken)?;

        let seconds = |name: &str, default: u64| {
            Duration::from_secs(read_number(&lookup, name).unwrap_or(default))
        };

        Ok(Self {
            bot_token,
            max_upload_size: read_number(&lookup, "MAX_UPLOAD_SIZE").unwrap_or(DEFAULT_MAX_UPLOAD_SIZE),
            max_download_size: read_number(&lookup, "MAX_DOWNLOAD_SIZE")
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_SIZE),
            temp_dir: lookup("TEMP_DIR")
                .as_deref()
                .and_then(non_empty)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
            download_timeout: seconds("DOWNLOAD_TIMEOUT", DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            probe_timeout: seconds("PROBE_TIMEOUT", DEFAULT_PROBE_TIMEOUT_SECONDS),
            compression_timeout: seconds("COMPRESSION_TIMEOUT", DEFAULT_COMPRESSION_TIMEOUT_SECONDS),
            rate_limit_requests: read_number(&lookup, "RATE_LIMIT_REQUESTS")
                .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS),
            rate_limit_window: seconds("RATE_LIMIT_WINDOW", DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            cleanup_interval: seconds("CLEANUP_INTERVAL", DEFAULT_CLEANUP_INTERVAL_SECONDS),
            max_artifact_age: seconds("MAX_ARTIFACT_AGE", DEFAULT_MAX_ARTIFACT_AGE_SECONDS),
            pending_choice_ttl: seconds("PENDING_CHOICE_TTL", DEFAULT_PENDING_CHOICE_TTL_SECONDS),
            health_addr: resolve_health_addr(&lookup),
            yt_dlp_bin: lookup("YT_DLP_BIN")
                .as_deref()
                .and_then(non_empty)
                .unwrap_or("yt-dlp")
                .to_string(),
            ffmpeg_bin: lookup("FFMPEG_BIN")
                .as_deref()
                .and_then(non_empty)
                .unwrap_or("ffmpeg")
                .to_string(),
            telegram_api_url: lookup("TELEGRAM_API_URL")
                .as_deref()
                .and_then(non_empty)
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string()),
        })
    }
}

fn read_number<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let value = lookup(name)?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring {name}={value:?}: not a valid number, using the default.");
            None
        }
    }
}

fn resolve_health_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = lookup("HEALTH_ADDR")
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
    {
        return configured;
    }

    if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_HEALTH_ADDR.to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
