use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{process::Command, time::timeout};
use tracing::{info, warn};

use crate::error::CompressionError;

#[async_trait]
pub trait Compressor: Send + Sync {
    /// Writes a re-encoded copy next to `input` and returns its path. The
    /// caller owns both files afterwards.
    async fn compress(&self, input: &Path) -> Result<PathBuf, CompressionError>;
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: String,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub async fn is_available(&self) -> bool {
        let mut probe = Command::new(&self.binary);
        probe
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(Duration::from_secs(10), probe.status()).await {
            Ok(Ok(status)) if status.success() => {
                info!("FFmpeg is available for video compression");
                true
            }
            _ => {
                warn!("FFmpeg not found. Video compression will be disabled.");
                false
            }
        }
    }
}

pub fn compressed_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("download");
    input.with_file_name(format!("{stem}_compressed.mp4"))
}

#[async_trait]
impl Compressor for Ffmpeg {
    async fn compress(&self, input: &Path) -> Result<PathBuf, CompressionError> {
        let output_path = compressed_path(input);
        let mut command = Command::new(&self.binary);
        command
            .arg("-i")
            .arg(input)
            .args([
                "-vcodec",
                "libx264",
                "-crf",
                "28",
                "-preset",
                "fast",
                "-vf",
                "scale=-2:720",
                "-acodec",
                "aac",
                "-b:a",
                "128k",
                "-movflags",
                "+faststart",
                "-y",
            ])
            .arg(&output_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| CompressionError::TimedOut(self.timeout))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    CompressionError::NotInstalled
                } else {
                    CompressionError::Io(error)
                }
            })?;

        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .next_back()
                .unwrap_or("unknown error")
                .to_string();
            return Err(CompressionError::Failed(reason));
        }

        Ok(output_path)
    }
}
