//! Admission and lifecycle of one download request per user.
//!
//! A request moves `Admitted -> Probing -> [AwaitingFormatChoice] -> Downloading
//! -> SizeChecking -> [Compressing -> SizeChecking] -> Uploading -> Done`, and
//! may drop to `Failed` from any phase. While a request is running its user
//! holds a slot in the active set; a second request is rejected, never queued.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::mpsc,
    time::{Instant, timeout},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    ChatId, UserId,
    compress::Compressor,
    config::Config,
    error::{DownloadError, ExtractorError},
    extractor::{Extractor, FormatOption, FormatSelector, MediaInfo},
    files::FileManager,
    messages,
    progress,
    rate_limiter::RateLimiter,
    stats::UserStats,
    transport::{FileKind, MessageRef, Transport, Upload, truncate_caption},
};

pub const MAX_FORMAT_OPTIONS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Admitted,
    Probing,
    AwaitingFormatChoice,
    Downloading,
    SizeChecking,
    Compressing,
    Uploading,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct RequestState {
    pub user_id: UserId,
    pub url: String,
    pub platform: &'static str,
    pub phase: Phase,
    pub selected_format: Option<FormatSelector>,
    pub started_at: Instant,
}

impl RequestState {
    fn new(user_id: UserId, url: &str, phase: Phase) -> Self {
        Self {
            user_id,
            url: url.to_string(),
            platform: messages::platform_from_url(url),
            phase,
            selected_format: None,
            started_at: Instant::now(),
        }
    }

    fn advance(&mut self, phase: Phase) {
        if self.phase.is_terminal() {
            warn!(user_id = self.user_id, phase = ?self.phase, next = ?phase, "request already finished");
            return;
        }
        debug!(
            user_id = self.user_id,
            from = ?self.phase,
            to = ?phase,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "request phase change"
        );
        self.phase = phase;
    }
}

/// Where a request reports to: the user and the status message it edits.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub status: MessageRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Delivered { bytes: u64, compressed: bool },
    NeedsFormatChoice(FormatChoices),
}

/// Explicit options, highest quality first; "best" is always implied.
/// `token` identifies this offer; answers carrying another token are stale.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatChoices {
    pub info: MediaInfo,
    pub platform: &'static str,
    pub options: Vec<FormatOption>,
    pub token: u64,
}

/// An answer to a [`FormatChoices`] offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatChoice {
    Best,
    /// Index into [`FormatChoices::options`].
    Option(usize),
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub max_upload_size: u64,
    pub max_download_size: u64,
    pub probe_timeout: Duration,
    pub fetch_timeout: Duration,
    pub pending_choice_ttl: Duration,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_upload_size: config.max_upload_size,
            max_download_size: config.max_download_size,
            probe_timeout: config.probe_timeout,
            fetch_timeout: config.download_timeout,
            pending_choice_ttl: config.pending_choice_ttl,
            rate_limit_requests: config.rate_limit_requests,
            rate_limit_window: config.rate_limit_window,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ActiveDownloads {
    users: Arc<Mutex<HashSet<UserId>>>,
}

/// Holds a user's slot in the active set; the slot is freed on drop, which
/// covers early returns, panics and cancelled futures alike.
#[derive(Debug)]
struct ActiveGuard {
    users: Arc<Mutex<HashSet<UserId>>>,
    user_id: UserId,
}

impl ActiveDownloads {
    fn try_acquire(&self, user_id: UserId) -> Option<ActiveGuard> {
        let inserted = self
            .users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id);

        inserted.then(|| ActiveGuard {
            users: Arc::clone(&self.users),
            user_id,
        })
    }

    fn contains(&self, user_id: UserId) -> bool {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&user_id)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.user_id);
    }
}

#[derive(Debug, Clone)]
struct PendingChoice {
    token: u64,
    url: String,
    info: MediaInfo,
    options: Vec<FormatOption>,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct PendingChoices {
    entries: Mutex<HashMap<UserId, PendingChoice>>,
}

impl PendingChoices {
    fn insert(&self, user_id: UserId, choice: PendingChoice) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id, choice);
    }

    /// Removes the user's choice only when `token` matches it, so an answer
    /// to an older offer leaves the current one in place.
    fn take(&self, user_id: UserId, token: u64, ttl: Duration) -> Option<PendingChoice> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries
            .get(&user_id)
            .is_none_or(|choice| choice.token != token)
        {
            return None;
        }
        entries
            .remove(&user_id)
            .filter(|choice| choice.created_at.elapsed() <= ttl)
    }

    fn discard(&self, user_id: UserId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&user_id)
            .is_some()
    }

    fn purge_expired(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, choice| choice.created_at.elapsed() <= ttl);
        before - entries.len()
    }
}

pub struct DownloadController {
    settings: ControllerSettings,
    rate_limiter: RateLimiter,
    files: Arc<FileManager>,
    stats: Arc<UserStats>,
    extractor: Arc<dyn Extractor>,
    compressor: Option<Arc<dyn Compressor>>,
    transport: Arc<dyn Transport>,
    active: ActiveDownloads,
    pending: PendingChoices,
    next_token: AtomicU64,
}

impl DownloadController {
    pub fn new(
        settings: ControllerSettings,
        files: Arc<FileManager>,
        stats: Arc<UserStats>,
        extractor: Arc<dyn Extractor>,
        compressor: Option<Arc<dyn Compressor>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            rate_limiter: RateLimiter::new(settings.rate_limit_requests, settings.rate_limit_window),
            settings,
            files,
            stats,
            extractor,
            compressor,
            transport,
            active: ActiveDownloads::default(),
            pending: PendingChoices::default(),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn is_active(&self, user_id: UserId) -> bool {
        self.active.contains(user_id)
    }

    /// Forgets the user's open format choice, if any.
    pub fn cancel_choice(&self, user_id: UserId) {
        if self.pending.discard(user_id) {
            debug!(user_id, "Pending format choice cancelled");
        }
    }

    /// Drops expired format choices and idle rate windows.
    pub fn purge_idle_state(&self) {
        let expired = self.pending.purge_expired(self.settings.pending_choice_ttl);
        if expired > 0 {
            debug!("Dropped {expired} expired format choice(s)");
        }
        self.rate_limiter.prune(Utc::now());
    }

    pub async fn handle(&self, context: RequestContext, url: &str) -> Result<Outcome, DownloadError> {
        let Some(_guard) = self.active.try_acquire(context.user_id) else {
            return Err(DownloadError::AlreadyInProgress);
        };

        let url = url.trim();
        if !is_valid_url(url) {
            return Err(DownloadError::InvalidUrl);
        }

        let now = Utc::now();
        if !self.rate_limiter.admit(context.user_id, now) {
            return Err(DownloadError::RateLimited {
                reset_in: self.rate_limiter.time_to_reset(context.user_id, now),
            });
        }

        if self.pending.discard(context.user_id) {
            debug!(user_id = context.user_id, "Pending format choice superseded by a new link");
        }

        let mut state = RequestState::new(context.user_id, url, Phase::Admitted);
        info!(
            "Processing download for user {}: {} ({})",
            context.user_id, state.url, state.platform
        );

        let result = self.probe_and_run(context, &mut state).await;
        self.finish(&mut state, result)
    }

    /// Resumes the request paused at offer `token`. A stale token, an expired
    /// offer or an index outside the offered options is `SessionExpired`.
    pub async fn select_format(
        &self,
        context: RequestContext,
        token: u64,
        choice: FormatChoice,
    ) -> Result<Outcome, DownloadError> {
        let Some(_guard) = self.active.try_acquire(context.user_id) else {
            return Err(DownloadError::AlreadyInProgress);
        };

        let Some(pending) = self
            .pending
            .take(context.user_id, token, self.settings.pending_choice_ttl)
        else {
            return Err(DownloadError::SessionExpired);
        };

        let selector = match choice {
            FormatChoice::Best => FormatSelector::Best,
            FormatChoice::Option(index) => match pending.options.get(index) {
                Some(option) => FormatSelector::Explicit(option.format_id.clone()),
                None => return Err(DownloadError::SessionExpired),
            },
        };

        let mut state = RequestState::new(context.user_id, &pending.url, Phase::AwaitingFormatChoice);
        state.selected_format = Some(selector.clone());
        info!(
            "User {} selected format {:?} for {}",
            context.user_id, selector, state.url
        );

        let result = self
            .run_download(context, &mut state, &pending.info, selector)
            .await;
        self.finish(&mut state, result)
    }

    fn finish(
        &self,
        state: &mut RequestState,
        result: Result<Outcome, DownloadError>,
    ) -> Result<Outcome, DownloadError> {
        if let Err(error) = &result {
            warn!(
                user_id = state.user_id,
                url = %state.url,
                phase = ?state.phase,
                "Download request failed: {error}"
            );
            state.advance(Phase::Failed);
        }
        result
    }

    async fn probe_and_run(
        &self,
        context: RequestContext,
        state: &mut RequestState,
    ) -> Result<Outcome, DownloadError> {
        state.advance(Phase::Probing);
        self.show(context, messages::ANALYZING).await;

        let info = match timeout(self.settings.probe_timeout, self.extractor.probe(&state.url)).await {
            Ok(Ok(info)) => info,
            Ok(Err(error)) => {
                debug!("Probe failed for {}: {error}", state.url);
                return Err(DownloadError::UnsupportedOrUnreachable);
            }
            Err(_) => {
                debug!("Probe timed out for {}", state.url);
                return Err(DownloadError::UnsupportedOrUnreachable);
            }
        };

        if let Some(size) = info.filesize
            && size > self.settings.max_download_size
        {
            return Err(DownloadError::FileTooLarge {
                size,
                limit: self.settings.max_download_size,
            });
        }

        if info.formats.len() > 1 {
            state.advance(Phase::AwaitingFormatChoice);
            let options = top_options(&info.formats);
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            self.pending.insert(
                context.user_id,
                PendingChoice {
                    token,
                    url: state.url.clone(),
                    info: info.clone(),
                    options: options.clone(),
                    created_at: Instant::now(),
                },
            );
            return Ok(Outcome::NeedsFormatChoice(FormatChoices {
                info,
                platform: state.platform,
                options,
                token,
            }));
        }

        state.selected_format = Some(FormatSelector::Best);
        self.run_download(context, state, &info, FormatSelector::Best)
            .await
    }

    async fn run_download(
        &self,
        context: RequestContext,
        state: &mut RequestState,
        info: &MediaInfo,
        selector: FormatSelector,
    ) -> Result<Outcome, DownloadError> {
        let summary = messages::media_summary(info, state.platform);
        let reservation = self.files.reserve_path(&state.url);

        let result = self
            .fetch_and_deliver(context, state, info, &summary, &selector, &reservation)
            .await;
        self.files.release_reservation(&reservation).await;
        result
    }

    async fn fetch_and_deliver(
        &self,
        context: RequestContext,
        state: &mut RequestState,
        info: &MediaInfo,
        summary: &str,
        selector: &FormatSelector,
        reservation: &Path,
    ) -> Result<Outcome, DownloadError> {
        state.advance(Phase::Downloading);
        self.show(context, &messages::downloading(summary)).await;

        let (progress_tx, progress_rx) = progress::channel();
        let fetch = self
            .extractor
            .fetch(&state.url, selector, reservation, progress_tx);
        let fetched = timeout(
            self.settings.fetch_timeout,
            self.relay_progress(context, summary, fetch, progress_rx),
        )
        .await;

        let artifact = match fetched {
            Ok(Ok(path)) => path,
            Ok(Err(error)) => return Err(DownloadError::DownloadFailed(error)),
            Err(_) => return Err(DownloadError::DownloadTimedOut(self.settings.fetch_timeout)),
        };

        state.advance(Phase::SizeChecking);
        let size = self
            .files
            .size_of(&artifact)
            .await
            .map_err(|error| DownloadError::DownloadFailed(ExtractorError::Io(error)))?;

        let (artifact, size, compressed) = if size <= self.settings.max_upload_size {
            (artifact, size, false)
        } else {
            self.shrink(context, state, summary, artifact, size).await?
        };

        state.advance(Phase::Uploading);
        self.show(context, &messages::uploading(summary)).await;

        let upload = Upload {
            path: &artifact,
            caption: truncate_caption(&messages::caption(info, size)),
            kind: FileKind::for_path(&artifact),
            title: &info.title,
            performer: &info.uploader,
        };
        self.transport
            .send_file(context.chat_id, upload)
            .await
            .map_err(DownloadError::DeliveryFailed)?;

        self.stats
            .record(context.user_id, state.platform, size, Utc::now());
        state.advance(Phase::Done);
        info!(
            "Delivered {} to user {} ({} bytes, compressed: {compressed})",
            artifact.display(),
            context.user_id,
            size
        );

        Ok(Outcome::Delivered {
            bytes: size,
            compressed,
        })
    }

    /// Drives the fetch while forwarding throttled progress to the status
    /// message. The receiver lives only as long as this call.
    async fn relay_progress<F>(
        &self,
        context: RequestContext,
        summary: &str,
        fetch: F,
        mut progress_rx: mpsc::Receiver<u8>,
    ) -> Result<PathBuf, ExtractorError>
    where
        F: Future<Output = Result<PathBuf, ExtractorError>>,
    {
        tokio::pin!(fetch);
        loop {
            tokio::select! {
                result = &mut fetch => return result,
                Some(percent) = progress_rx.recv() => {
                    self.show(context, &messages::progress(summary, percent)).await;
                }
            }
        }
    }

    /// One compression attempt. Returns the artifact to deliver or
    /// `FileTooLarge`; whichever copy is not delivered is removed here.
    async fn shrink(
        &self,
        context: RequestContext,
        state: &mut RequestState,
        summary: &str,
        original: PathBuf,
        original_size: u64,
    ) -> Result<(PathBuf, u64, bool), DownloadError> {
        let limit = self.settings.max_upload_size;
        let too_large = |size| DownloadError::FileTooLarge { size, limit };

        let Some(compressor) = &self.compressor else {
            return Err(too_large(original_size));
        };

        state.advance(Phase::Compressing);
        self.show(context, &messages::compressing(summary)).await;

        let compressed = match compressor.compress(&original).await {
            Ok(path) => path,
            Err(error) => {
                warn!("{}", DownloadError::CompressionFailed(error));
                return Err(too_large(original_size));
            }
        };

        state.advance(Phase::SizeChecking);
        let compressed_size = match self.files.size_of(&compressed).await {
            Ok(size) => size,
            Err(error) => {
                warn!("Compressed file {} is unreadable: {error}", compressed.display());
                self.files.release(&compressed).await;
                return Err(too_large(original_size));
            }
        };

        if compressed_size >= original_size {
            info!(
                "Compression did not help ({original_size} -> {compressed_size} bytes), keeping original"
            );
            self.files.release(&compressed).await;
            return Err(too_large(original_size));
        }

        info!(
            "Compressed {} -> {}",
            messages::format_file_size(original_size),
            messages::format_file_size(compressed_size)
        );
        self.files.release(&original).await;

        if compressed_size > limit {
            self.files.release(&compressed).await;
            return Err(too_large(compressed_size));
        }

        Ok((compressed, compressed_size, true))
    }

    async fn show(&self, context: RequestContext, text: &str) {
        if let Err(error) = self.transport.edit_text(context.status, text).await {
            debug!("Could not update status message: {error}");
        }
    }
}

pub fn is_valid_url(input: &str) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };

    matches!(parsed.scheme(), "http" | "https")
        && parsed
            .host_str()
            .is_some_and(|host| !host.is_empty())
}

fn top_options(formats: &[FormatOption]) -> Vec<FormatOption> {
    let mut options = formats.to_vec();
    options.sort_by(|a, b| b.height.cmp(&a.height));
    options.truncate(MAX_FORMAT_OPTIONS);
    options
}
