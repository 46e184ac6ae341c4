use std::time::Duration;

use thiserror::Error;

use crate::messages::{format_file_size, reset_hint};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("BOT_TOKEN is not configured. Get a token from @BotFather and export BOT_TOKEN.")]
    MissingToken,
    #[error("could not prepare temporary directory {path}: {source}")]
    TempDir {
        path: String,
        source: std::io::Error,
    },
    #[error("could not bind health server on {addr}: {source}")]
    HealthBind {
        addr: String,
        source: std::io::Error,
    },
    #[error("could not build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("could not reach the Bot API: {0}")]
    Polling(TransportError),
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("yt-dlp is not installed or not on PATH")]
    NotInstalled,
    #[error("{0}")]
    Failed(String),
    #[error("could not parse extractor output: {0}")]
    Malformed(String),
    #[error("downloaded file was not found in the temporary directory")]
    MissingOutput,
    #[error("extractor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Bot API rejected {method}: {description}")]
    Api {
        method: &'static str,
        description: String,
    },
    #[error("could not read upload file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("ffmpeg is not installed")]
    NotInstalled,
    #[error("ffmpeg exited unsuccessfully: {0}")]
    Failed(String),
    #[error("compression exceeded {0:?}")]
    TimedOut(Duration),
    #[error("compression I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every way a single download request can end short of delivery.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL")]
    InvalidUrl,
    #[error("a download is already in progress for this user")]
    AlreadyInProgress,
    #[error("rate limited, resets in {reset_in:?}")]
    RateLimited { reset_in: Duration },
    #[error("unsupported or unreachable URL")]
    UnsupportedOrUnreachable,
    #[error("format selection session expired")]
    SessionExpired,
    #[error("download failed: {0}")]
    DownloadFailed(#[source] ExtractorError),
    #[error("download timed out after {0:?}")]
    DownloadTimedOut(Duration),
    #[error("file is {size} bytes, limit is {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("compression failed: {0}")]
    CompressionFailed(#[source] CompressionError),
    #[error("delivery failed: {0}")]
    DeliveryFailed(#[source] TransportError),
}

impl DownloadError {
    pub fn user_message(&self, rate_limit_requests: usize, rate_limit_window: Duration) -> String {
        match self {
            Self::InvalidUrl => "❌ **Invalid Link**\n\nThe link you provided doesn't contain any downloadable content or is not supported.".to_string(),
            Self::AlreadyInProgress => {
                "⏳ **Please wait**\n\nYou already have an active download. Please wait for it to complete.".to_string()
            }
            Self::RateLimited { reset_in } => format!(
                "⏰ **Rate Limit Exceeded**\n\nLimit: {rate_limit_requests} requests per {} seconds. Try again in {}.",
                rate_limit_window.as_secs(),
                reset_hint(*reset_in)
            ),
            Self::UnsupportedOrUnreachable => "❌ **Invalid Link**\n\nThe link is not supported or the content is not reachable right now.".to_string(),
            Self::SessionExpired => "❌ **Error**\n\nSession expired. Please send the link again.".to_string(),
            Self::DownloadFailed(_) => "❌ **Download Failed**\n\nThe file could not be downloaded. The link might be invalid or the content is not accessible.".to_string(),
            Self::DownloadTimedOut(_) => "❌ **Download Timed Out**\n\nThe file might be too large or the connection is slow.".to_string(),
            Self::FileTooLarge { size, limit } => format!(
                "❌ **File Too Large**\n\nThe file is {}, over the {} limit, so it cannot be sent.",
                format_file_size(*size),
                format_file_size(*limit)
            ),
            Self::CompressionFailed(_) => "❌ **Error**\n\nThe file could not be compressed.".to_string(),
            Self::DeliveryFailed(_) => "❌ **Error**\n\nFailed to upload file to Telegram. The file might be corrupted or too large.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_content_failure_render_differently() {
        let window = Duration::from_secs(60);
        let timed_out = DownloadError::DownloadTimedOut(Duration::from_secs(300)).user_message(5, window);
        let failed = DownloadError::DownloadFailed(ExtractorError::Failed("HTTP Error 403".to_string()))
            .user_message(5, window);

        assert!(timed_out.contains("Timed Out"));
        assert!(!failed.contains("Timed Out"));
        assert_ne!(timed_out, failed);
    }

    #[test]
    fn too_large_message_fits_every_cause() {
        let message = DownloadError::FileTooLarge {
            size: 3 * 1024 * 1024 * 1024,
            limit: 2 * 1024 * 1024 * 1024,
        }
        .user_message(5, Duration::from_secs(60));

        assert!(message.contains("3.0GB"));
        assert!(message.contains("2.0GB"));
        assert!(!message.contains("compression"));
    }

    #[test]
    fn rate_limit_message_names_the_quota() {
        let message = DownloadError::RateLimited {
            reset_in: Duration::from_secs(42),
        }
        .user_message(5, Duration::from_secs(60));

        assert!(message.contains("5 requests per 60 seconds"));
        assert!(message.contains("00:42"));
    }
}
