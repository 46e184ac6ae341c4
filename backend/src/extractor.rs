use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::{error::ExtractorError, progress::ProgressSender};

const PROGRESS_MARKER: &str = "relay-progress";
const PARTIAL_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub title: String,
    pub uploader: String,
    pub duration_secs: u64,
    pub filesize: Option<u64>,
    pub formats: Vec<FormatOption>,
}

/// One selectable video quality, distinct by height.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatOption {
    pub format_id: String,
    pub height: u32,
    pub filesize: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    Best,
    Explicit(String),
}

impl FormatSelector {
    pub fn to_arg(&self) -> String {
        match self {
            Self::Best => "bestvideo+bestaudio/best".to_string(),
            Self::Explicit(format_id) => format!("{format_id}+bestaudio/best"),
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractorError>;

    /// Downloads into `output_base` with an extractor-chosen extension and
    /// returns the final path. Progress flows through `progress` until the call
    /// returns.
    async fn fetch(
        &self,
        url: &str,
        selector: &FormatSelector,
        output_base: &Path,
        progress: ProgressSender,
    ) -> Result<PathBuf, ExtractorError>;
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    vcodec: Option<String>,
    height: Option<u32>,
    tbr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    max_filesize: u64,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, max_filesize: u64) -> Self {
        Self {
            binary: binary.into(),
            max_filesize,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true).stdin(Stdio::null());
        command
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractorError> {
        let output = self
            .command()
            .args(["-J", "--no-playlist", "--no-warnings", url])
            .output()
            .await
            .map_err(spawn_error)?;

        if !output.status.success() {
            return Err(ExtractorError::Failed(run_error_message(&output.stderr)));
        }

        parse_media_info(&output.stdout)
    }

    async fn fetch(
        &self,
        url: &str,
        selector: &FormatSelector,
        output_base: &Path,
        mut progress: ProgressSender,
    ) -> Result<PathBuf, ExtractorError> {
        let output_template = format!("{}.%(ext)s", output_base.to_string_lossy());
        let progress_template = format!("download:{PROGRESS_MARKER} %(progress._percent_str)s");
        let max_filesize = self.max_filesize.to_string();
        let selector = selector.to_arg();
        let mut child = self
            .command()
            .args([
                "--no-playlist",
                "--no-warnings",
                "--newline",
                "--progress",
                "--progress-template",
                progress_template.as_str(),
                "--print",
                "after_move:filepath",
                "--max-filesize",
                max_filesize.as_str(),
                "--merge-output-format",
                "mp4",
                "-f",
                selector.as_str(),
                "-o",
                output_template.as_str(),
                url,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorError::Failed("yt-dlp stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractorError::Failed("yt-dlp stderr was not captured".to_string()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut printed_path = None;
        let mut stderr_tail = Vec::new();
        let (mut stdout_open, mut stderr_open) = (true, true);

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => match line? {
                    Some(line) => {
                        if let Some(percent) = parse_progress_line(&line) {
                            progress.report(percent);
                        } else if !line.trim().is_empty() {
                            printed_path = Some(line.trim().to_string());
                        }
                    }
                    None => stdout_open = false,
                },
                line = stderr_lines.next_line(), if stderr_open => match line? {
                    Some(line) => {
                        if let Some(percent) = parse_progress_line(&line) {
                            progress.report(percent);
                        } else {
                            stderr_tail.push(line);
                        }
                    }
                    None => stderr_open = false,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ExtractorError::Failed(run_error_message(
                stderr_tail.join("\n").as_bytes(),
            )));
        }

        resolve_downloaded_file(output_base, printed_path.as_deref()).await
    }
}

fn spawn_error(error: std::io::Error) -> ExtractorError {
    if error.kind() == ErrorKind::NotFound {
        ExtractorError::NotInstalled
    } else {
        ExtractorError::Io(error)
    }
}

fn parse_media_info(stdout: &[u8]) -> Result<MediaInfo, ExtractorError> {
    let info: YtDlpVideoInfo =
        serde_json::from_slice(stdout).map_err(|error| ExtractorError::Malformed(error.to_string()))?;

    Ok(MediaInfo {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Unknown Title".to_string()),
        uploader: info
            .uploader
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        duration_secs: info
            .duration
            .filter(|value| value.is_finite() && *value > 0.0)
            .map(|value| value.round() as u64)
            .unwrap_or_default(),
        filesize: info.filesize.or(info.filesize_approx).map(|bytes| bytes as u64),
        formats: build_quality_options(&info.formats),
    })
}

/// One option per distinct height, highest first; within a height the entry
/// with the highest bitrate wins.
fn build_quality_options(formats: &[YtDlpFormat]) -> Vec<FormatOption> {
    let mut best_by_height: HashMap<u32, (f32, FormatOption)> = HashMap::new();

    for item in formats {
        if !matches!(item.vcodec.as_deref(), Some(value) if value != "none") {
            continue;
        }
        let Some(height) = item.height.filter(|height| *height > 0) else {
            continue;
        };

        let tbr = item.tbr.unwrap_or_default();
        let candidate = FormatOption {
            format_id: item.format_id.clone(),
            height,
            filesize: item.filesize.or(item.filesize_approx).map(|bytes| bytes as u64),
        };

        match best_by_height.get(&height) {
            Some((existing_tbr, _)) if *existing_tbr >= tbr => {}
            _ => {
                best_by_height.insert(height, (tbr, candidate));
            }
        }
    }

    let mut options: Vec<FormatOption> = best_by_height.into_values().map(|(_, option)| option).collect();
    options.sort_by(|a, b| b.height.cmp(&a.height));
    options
}

fn parse_progress_line(line: &str) -> Option<f32> {
    let trimmed = line.trim();
    let rest = trimmed
        .strip_prefix(PROGRESS_MARKER)
        .or_else(|| trimmed.strip_prefix("[download]"))?;
    let token = rest.split_whitespace().find(|part| part.ends_with('%'))?;
    let numeric: String = token
        .chars()
        .filter(|character| character.is_ascii_digit() || *character == '.')
        .collect();
    numeric.parse::<f32>().ok()
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "Unsupported or invalid URL.".to_string()
    } else {
        message
    }
}

async fn resolve_downloaded_file(
    output_base: &Path,
    printed_path: Option<&str>,
) -> Result<PathBuf, ExtractorError> {
    let dir = output_base.parent().unwrap_or_else(|| Path::new("."));
    let canonical_dir = tokio::fs::canonicalize(dir).await?;

    if let Some(path_value) = printed_path
        && let Some(valid_path) = resolve_candidate(&canonical_dir, Path::new(path_value)).await?
    {
        return Ok(valid_path);
    }

    let Some(stem) = output_base.file_name().and_then(|name| name.to_str()) else {
        return Err(ExtractorError::MissingOutput);
    };
    let dotted = format!("{stem}.");

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&dotted) || PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        if let Some(valid_path) = resolve_candidate(&canonical_dir, &entry.path()).await? {
            return Ok(valid_path);
        }
    }

    Err(ExtractorError::MissingOutput)
}

async fn resolve_candidate(
    canonical_dir: &Path,
    candidate_path: &Path,
) -> Result<Option<PathBuf>, ExtractorError> {
    let metadata = match tokio::fs::metadata(candidate_path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate_path).await?;
    if !canonical_candidate.starts_with(canonical_dir) {
        warn!(
            "Ignoring extractor output outside the temporary directory: {}",
            canonical_candidate.display()
        );
        return Ok(None);
    }

    debug!("Resolved downloaded file {}", canonical_candidate.display());
    Ok(Some(canonical_candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_is_reduced_to_distinct_heights() {
        let json = br#"{
            "title": "Clip",
            "uploader": "someone",
            "duration": 61.6,
            "filesize_approx": 1048576,
            "formats": [
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a"},
                {"format_id": "160", "ext": "mp4", "vcodec": "avc1", "height": 144, "tbr": 100.0},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "height": 1080, "tbr": 4000.0},
                {"format_id": "248", "ext": "webm", "vcodec": "vp9", "height": 1080, "tbr": 2500.0},
                {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "height": 720, "filesize": 5000.0},
                {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "height": 90}
            ]
        }"#;

        let info = parse_media_info(json).unwrap();

        assert_eq!(info.title, "Clip");
        assert_eq!(info.duration_secs, 62);
        assert_eq!(info.filesize, Some(1_048_576));
        let ids: Vec<&str> = info.formats.iter().map(|option| option.format_id.as_str()).collect();
        assert_eq!(ids, vec!["137", "22", "160"]);
        assert_eq!(info.formats[1].filesize, Some(5000));
    }

    #[test]
    fn missing_metadata_gets_placeholders() {
        let info = parse_media_info(br#"{"title": "  "}"#).unwrap();

        assert_eq!(info.title, "Unknown Title");
        assert_eq!(info.uploader, "Unknown");
        assert_eq!(info.duration_secs, 0);
        assert!(info.formats.is_empty());
    }

    #[test]
    fn garbage_probe_output_is_malformed() {
        assert!(matches!(
            parse_media_info(b"not json"),
            Err(ExtractorError::Malformed(_))
        ));
    }

    #[test]
    fn progress_lines_are_recognised() {
        assert_eq!(parse_progress_line("relay-progress  45.2%"), Some(45.2));
        assert_eq!(
            parse_progress_line("[download]  99.0% of 10.00MiB at 1.00MiB/s ETA 00:01"),
            Some(99.0)
        );
        assert_eq!(parse_progress_line("[download] Destination: x.mp4"), None);
        assert_eq!(parse_progress_line("/tmp/download_1.mp4"), None);
    }

    #[test]
    fn selector_arguments() {
        assert_eq!(FormatSelector::Best.to_arg(), "bestvideo+bestaudio/best");
        assert_eq!(
            FormatSelector::Explicit("137".to_string()).to_arg(),
            "137+bestaudio/best"
        );
    }

    #[test]
    fn unsupported_url_errors_are_rewritten() {
        assert_eq!(
            run_error_message(b"WARNING: x\nERROR: Unsupported URL: https://example.com"),
            "Unsupported or invalid URL."
        );
        assert_eq!(run_error_message(b"ERROR: HTTP Error 403"), "ERROR: HTTP Error 403");
    }

    #[tokio::test]
    async fn output_is_found_by_reservation_stem() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("download_1_abc_0");
        tokio::fs::write(dir.path().join("download_1_abc_0.mp4.part"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("download_1_abc_0.mp4"), b"x").await.unwrap();

        let resolved = resolve_downloaded_file(&base, Some("/elsewhere/file.mp4")).await.unwrap();

        assert_eq!(resolved.file_name().unwrap(), "download_1_abc_0.mp4");
    }

    #[tokio::test]
    async fn missing_output_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("download_2_abc_0");

        assert!(matches!(
            resolve_downloaded_file(&base, None).await,
            Err(ExtractorError::MissingOutput)
        ));
    }
}
