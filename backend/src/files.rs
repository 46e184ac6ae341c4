use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

const KEEP_FILE: &str = ".gitkeep";

/// Owns the temporary artifact directory. Paths handed out by
/// [`FileManager::reserve_path`] carry no extension; the extractor appends one.
#[derive(Debug)]
pub struct FileManager {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl FileManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    pub fn reserve_path(&self, request_key: &str) -> PathBuf {
        let digest = Sha256::digest(request_key.as_bytes());
        let hash = format!("{digest:x}");
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        self.dir
            .join(format!("download_{timestamp}_{}_{sequence}", &hash[..12]))
    }

    pub async fn release(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("Cleaned up file: {}", path.display()),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove temporary file {}: {error}", path.display()),
        }
    }

    /// Removes every file that belongs to a reservation: the final artifact,
    /// partial `.part` files and compressed copies.
    pub async fn release_reservation(&self, reservation: &Path) {
        let Some(stem) = reservation.file_name().and_then(|name| name.to_str()) else {
            return;
        };

        for path in self.files_of_reservation(stem).await {
            self.release(&path).await;
        }
    }

    async fn files_of_reservation(&self, stem: &str) -> Vec<PathBuf> {
        let mut matches = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not open temporary directory {}: {error}", self.dir.display());
                }
                return matches;
            }
        };

        let dotted = format!("{stem}.");
        let suffixed = format!("{stem}_");
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == stem || name.starts_with(&dotted) || name.starts_with(&suffixed) {
                matches.push(entry.path());
            }
        }

        matches
    }

    pub async fn size_of(&self, path: &Path) -> std::io::Result<u64> {
        tokio::fs::metadata(path).await.map(|metadata| metadata.len())
    }

    /// Deletes managed files whose modification time is at least `max_age` old
    /// and returns how many were removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not open temporary directory for cleanup: {error}");
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let maybe_entry = match entries.next_entry().await {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not iterate temporary directory for cleanup: {error}");
                    break;
                }
            };

            let Some(entry) = maybe_entry else {
                break;
            };

            if entry.file_name() == KEEP_FILE {
                continue;
            }

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("Could not read metadata of {}: {error}", path.display());
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified_at| now.duration_since(modified_at).ok())
                .unwrap_or(Duration::ZERO);
            if age < max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not remove stale file {}: {error}", path.display()),
            }
        }

        debug!("Sweep removed {removed} stale file(s)");
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn reserved_paths_never_collide() {
        let manager = FileManager::new("/tmp/relay-test");

        let paths: HashSet<PathBuf> = (0..200)
            .map(|index| manager.reserve_path(if index % 2 == 0 { "https://a/1" } else { "https://b/2" }))
            .collect();

        assert_eq!(paths.len(), 200);
        assert!(paths.iter().all(|path| path.starts_with("/tmp/relay-test")));
    }

    #[test]
    fn distinct_keys_give_distinct_paths() {
        let manager = FileManager::new("/tmp/relay-test");

        assert_ne!(
            manager.reserve_path("https://youtu.be/a"),
            manager.reserve_path("https://youtu.be/b")
        );
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path());
        let path = manager.reserve_path("https://example.com/v").with_extension("mp4");
        tokio::fs::write(&path, b"video").await.unwrap();

        manager.release(&path).await;
        assert!(!path.exists());
        manager.release(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn release_reservation_removes_partial_and_compressed_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path());
        let reservation = manager.reserve_path("https://example.com/v");
        let other = manager.reserve_path("https://example.com/w");
        let stem = reservation.file_name().unwrap().to_str().unwrap().to_string();

        let owned = [
            dir.path().join(format!("{stem}.mp4")),
            dir.path().join(format!("{stem}.mp4.part")),
            dir.path().join(format!("{stem}_compressed.mp4")),
        ];
        for path in &owned {
            tokio::fs::write(path, b"x").await.unwrap();
        }
        let unrelated = other.with_extension("mp4");
        tokio::fs::write(&unrelated, b"x").await.unwrap();

        manager.release_reservation(&reservation).await;

        assert!(owned.iter().all(|path| !path.exists()));
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn sweep_respects_age_and_keep_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path());
        tokio::fs::write(dir.path().join(".gitkeep"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("download_old.mp4"), b"x").await.unwrap();

        assert_eq!(manager.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(manager.sweep(Duration::ZERO).await, 1);
        assert!(dir.path().join(".gitkeep").exists());
        assert!(!dir.path().join("download_old.mp4").exists());
    }

    #[tokio::test]
    async fn sweep_of_missing_directory_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path().join("absent"));

        assert_eq!(manager.sweep(Duration::ZERO).await, 0);
    }
}
