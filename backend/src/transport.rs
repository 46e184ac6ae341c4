use std::path::Path;

use async_trait::async_trait;

use crate::{ChatId, error::TransportError};

pub const CAPTION_LIMIT: usize = 1024;

const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mkv", "mov", "webm"];
const AUDIO_EXTENSIONS: [&str; 4] = ["mp3", "m4a", "wav", "ogg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Video,
    Audio,
    Document,
}

impl FileKind {
    pub fn for_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            Self::Audio
        } else {
            Self::Document
        }
    }
}

/// A previously sent message that can be edited or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}

#[derive(Debug, Clone)]
pub struct Upload<'a> {
    pub path: &'a Path,
    pub caption: String,
    pub kind: FileKind,
    pub title: &'a str,
    pub performer: &'a str,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef, TransportError>;

    async fn edit_text(&self, message: MessageRef, text: &str) -> Result<(), TransportError>;

    async fn delete_message(&self, message: MessageRef) -> Result<(), TransportError>;

    /// `upload.caption` must already fit [`CAPTION_LIMIT`]; see [`truncate_caption`].
    async fn send_file(&self, chat_id: ChatId, upload: Upload<'_>) -> Result<(), TransportError>;
}

pub fn truncate_caption(caption: &str) -> String {
    caption.chars().take(CAPTION_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_extension() {
        assert_eq!(FileKind::for_path(Path::new("a/b.MP4")), FileKind::Video);
        assert_eq!(FileKind::for_path(Path::new("b.webm")), FileKind::Video);
        assert_eq!(FileKind::for_path(Path::new("b.m4a")), FileKind::Audio);
        assert_eq!(FileKind::for_path(Path::new("b.pdf")), FileKind::Document);
        assert_eq!(FileKind::for_path(Path::new("noext")), FileKind::Document);
    }

    #[test]
    fn captions_are_cut_at_the_limit() {
        let long = "é".repeat(CAPTION_LIMIT + 10);

        assert_eq!(truncate_caption(&long).chars().count(), CAPTION_LIMIT);
        assert_eq!(truncate_caption("short"), "short");
    }
}
