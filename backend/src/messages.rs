use std::time::Duration;

use url::Url;

use crate::config::Config;
use crate::extractor::{FormatOption, MediaInfo};
use crate::stats::UsageRecord;

const SUPPORTED_PLATFORMS: [&str; 11] = [
    "YouTube",
    "Instagram",
    "Twitter/X",
    "TikTok",
    "Facebook",
    "Reddit",
    "Pinterest",
    "Dailymotion",
    "Vimeo",
    "Terabox",
    "And many more platforms supported by yt-dlp",
];

const PLATFORM_DOMAINS: [(&str, &str); 12] = [
    ("youtube.com", "YouTube"),
    ("youtu.be", "YouTube"),
    ("instagram.com", "Instagram"),
    ("twitter.com", "Twitter"),
    ("x.com", "Twitter/X"),
    ("tiktok.com", "TikTok"),
    ("facebook.com", "Facebook"),
    ("reddit.com", "Reddit"),
    ("pinterest.com", "Pinterest"),
    ("dailymotion.com", "Dailymotion"),
    ("vimeo.com", "Vimeo"),
    ("terabox.com", "Terabox"),
];

pub const UNKNOWN_PLATFORM: &str = "Unknown Platform";
pub const BEST_QUALITY_LABEL: &str = "🎯 Best Quality (Auto)";

pub const PROCESSING: &str = "🔄 **Processing...**\n\nAnalyzing your link and preparing download...";
pub const ANALYZING: &str = "🔍 **Analyzing Video...**\n\nGetting video information...";
pub const INVALID_SELECTION: &str = "❌ **Error**\n\nInvalid selection.";
pub const FORMAT_MENU_FAILED: &str =
    "❌ **Error**\n\nCould not show the quality options. Please send the link again.";

const MARKDOWN_SPECIAL: [char; 4] = ['_', '*', '`', '['];

pub fn platform_from_url(input: &str) -> &'static str {
    let Some(host) = Url::parse(input)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
    else {
        return UNKNOWN_PLATFORM;
    };

    PLATFORM_DOMAINS
        .iter()
        .find(|(domain, _)| host == *domain || host.ends_with(&format!(".{domain}")))
        .map(|(_, platform)| *platform)
        .unwrap_or(UNKNOWN_PLATFORM)
}

pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0B".to_string();
    }

    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.1}{}", UNITS[unit])
}

pub fn format_duration_secs(seconds: u64) -> String {
    if seconds == 0 {
        return "Unknown".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Escapes text taken from the media source for Telegram's legacy Markdown.
pub fn escape_markdown(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for character in value.chars() {
        if MARKDOWN_SPECIAL.contains(&character) {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

pub fn welcome() -> String {
    "🎬 **Video Downloader Bot** 🎬\n\n\
     Welcome! I can download videos and files from YouTube, Instagram, Twitter/X, TikTok, \
     Facebook, Reddit, Pinterest, Terabox and many more platforms.\n\n\
     📝 **How to use:**\nJust send me any video link and I'll download it for you!\n\n\
     📋 **Commands:**\n/start - Show this message\n/help - Get help and supported platforms\n\
     /stats - Show your usage statistics\n\n\
     ⚠️ **Note:** Files larger than the upload limit will be compressed."
        .to_string()
}

pub fn help(config: &Config) -> String {
    let platforms = SUPPORTED_PLATFORMS
        .iter()
        .map(|platform| format!("• {platform}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "📚 **Help & Supported Platforms**\n\n🔗 **Supported platforms:**\n{platforms}\n\n\
         📝 **How to use:**\n1. Copy any video/file link\n2. Send it to me\n\
         3. Wait for download to complete\n4. Receive your file!\n\n\
         ⚠️ **Limitations:**\n• Max file size: {} (larger files will be compressed)\n\
         • Max download size: {}\n• Rate limit: {} requests per {} seconds",
        format_file_size(config.max_upload_size),
        format_file_size(config.max_download_size),
        config.rate_limit_requests,
        config.rate_limit_window.as_secs()
    )
}

pub fn stats(record: Option<&UsageRecord>) -> String {
    let Some(record) = record else {
        return "📊 **Your Statistics**\n\n🔢 Total Downloads: 0\n📦 Total Size: 0B\n🌐 Platforms Used: 0"
            .to_string();
    };

    format!(
        "📊 **Your Statistics**\n\n🔢 Total Downloads: {}\n📦 Total Size: {}\n\
         📅 Member Since: {}\n🕒 Last Used: {}\n🌐 Platforms Used: {}",
        record.download_count,
        format_file_size(record.total_bytes),
        record.first_seen.format("%Y-%m-%d"),
        record.last_seen.format("%Y-%m-%d %H:%M"),
        record.platforms.len()
    )
}

pub fn media_summary(info: &MediaInfo, platform: &str) -> String {
    format!(
        "📹 **Video Found**\n\n📝 **Title:** {}\n👤 **Uploader:** {}\n🌐 **Platform:** {platform}\n⏱️ **Duration:** {}",
        escape_markdown(&truncate_chars(&info.title, 50)),
        escape_markdown(&info.uploader),
        format_duration_secs(info.duration_secs)
    )
}

pub fn choose_format(info: &MediaInfo, platform: &str) -> String {
    format!("{}\n\n📺 **Select Quality:**", media_summary(info, platform))
}

pub fn format_button_label(option: &FormatOption) -> String {
    match option.filesize {
        Some(size) if size > 0 => format!("{}p ({})", option.height, format_file_size(size)),
        _ => format!("{}p", option.height),
    }
}

pub fn downloading(summary: &str) -> String {
    format!("{summary}\n\n⬇️ **Downloading...**")
}

pub fn progress(summary: &str, percent: u8) -> String {
    format!("{summary}\n\n📥 **Progress:** {percent}%")
}

pub fn compressing(summary: &str) -> String {
    format!("{summary}\n\n🔄 **File too large, compressing...**")
}

pub fn uploading(summary: &str) -> String {
    format!("{summary}\n\n📤 **Uploading to Telegram...**")
}

pub fn caption(info: &MediaInfo, delivered_bytes: u64) -> String {
    format!(
        "✅ **Download Complete**\n\n📝 **Title:** {}\n👤 **Uploader:** {}\n📦 **Size:** {}\n⏱️ **Duration:** {}",
        escape_markdown(&truncate_chars(&info.title, 100)),
        escape_markdown(&truncate_chars(&info.uploader, 100)),
        format_file_size(delivered_bytes),
        format_duration_secs(info.duration_secs)
    )
}

pub fn unexpected_failure() -> &'static str {
    "❌ **Error Occurred**\n\nAn unexpected error occurred. Please try again later."
}

pub fn reset_hint(duration: Duration) -> String {
    format_duration_secs(duration.as_secs().max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_is_derived_from_host() {
        assert_eq!(platform_from_url("https://www.youtube.com/watch?v=abc"), "YouTube");
        assert_eq!(platform_from_url("https://youtu.be/abc"), "YouTube");
        assert_eq!(platform_from_url("https://x.com/user/status/1"), "Twitter/X");
        assert_eq!(platform_from_url("https://vm.tiktok.com/xyz"), "TikTok");
        assert_eq!(platform_from_url("https://example.org/video.mp4"), UNKNOWN_PLATFORM);
        assert_eq!(platform_from_url("not a url"), UNKNOWN_PLATFORM);
    }

    #[test]
    fn lookalike_hosts_do_not_match() {
        assert_eq!(platform_from_url("https://notyoutube.com/watch"), UNKNOWN_PLATFORM);
        assert_eq!(platform_from_url("https://box.com/file"), UNKNOWN_PLATFORM);
    }

    #[test]
    fn file_sizes_use_binary_units() {
        assert_eq!(format_file_size(0), "0B");
        assert_eq!(format_file_size(512), "512.0B");
        assert_eq!(format_file_size(1536), "1.5KB");
        assert_eq!(format_file_size(50 * 1024 * 1024), "50.0MB");
        assert_eq!(format_file_size(2 * 1024 * 1024 * 1024), "2.0GB");
    }

    #[test]
    fn durations_switch_to_hours() {
        assert_eq!(format_duration_secs(0), "Unknown");
        assert_eq!(format_duration_secs(75), "01:15");
        assert_eq!(format_duration_secs(3725), "01:02:05");
    }

    fn clip(title: &str, uploader: &str) -> MediaInfo {
        MediaInfo {
            title: title.to_string(),
            uploader: uploader.to_string(),
            duration_secs: 61,
            filesize: None,
            formats: Vec::new(),
        }
    }

    #[test]
    fn markdown_specials_are_escaped() {
        assert_eq!(escape_markdown("my_clip *final*"), "my\\_clip \\*final\\*");
        assert_eq!(escape_markdown("[live] `raw`"), "\\[live] \\`raw\\`");
        assert_eq!(escape_markdown("plain title"), "plain title");
    }

    #[test]
    fn source_text_is_escaped_in_summary_and_caption() {
        let info = clip("my_clip *final*", "some_channel");

        let caption = caption(&info, 1024);
        let summary = media_summary(&info, "YouTube");

        assert!(caption.contains("my\\_clip \\*final\\*"));
        assert!(caption.contains("some\\_channel"));
        assert!(summary.contains("my\\_clip \\*final\\*"));
        assert!(!summary.contains("my_clip"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("ñandú", 3), "ñan");
        assert_eq!(truncate_chars("short", 50), "short");
    }
}
