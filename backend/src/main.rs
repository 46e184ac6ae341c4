mod bot;
mod compress;
mod config;
mod controller;
mod error;
mod extractor;
mod files;
mod health;
mod messages;
mod progress;
mod rate_limiter;
mod stats;
mod telegram;
mod transport;

use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bot::Bot,
    compress::{Compressor, Ffmpeg},
    config::Config,
    controller::{ControllerSettings, DownloadController},
    error::StartupError,
    extractor::YtDlp,
    files::FileManager,
    stats::UserStats,
    telegram::TelegramClient,
};

pub type UserId = i64;
pub type ChatId = i64;

const FIRST_SWEEP_DELAY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_relay_bot=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Startup error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Arc::new(Config::from_env()?);

    let files = Arc::new(FileManager::new(&config.temp_dir));
    files
        .ensure_dir()
        .await
        .map_err(|source| StartupError::TempDir {
            path: config.temp_dir.display().to_string(),
            source,
        })?;
    let swept = files.sweep(config.max_artifact_age).await;
    if swept > 0 {
        info!("Removed {swept} leftover file(s) from {}", config.temp_dir.display());
    }

    let ffmpeg = Ffmpeg::new(&config.ffmpeg_bin, config.compression_timeout);
    let compressor: Option<Arc<dyn Compressor>> = if ffmpeg.is_available().await {
        Some(Arc::new(ffmpeg))
    } else {
        None
    };

    let http = reqwest::Client::builder().build()?;
    let client = Arc::new(TelegramClient::new(
        http,
        &config.telegram_api_url,
        &config.bot_token,
    ));
    let stats = Arc::new(UserStats::new());
    let controller = Arc::new(DownloadController::new(
        ControllerSettings::from_config(&config),
        Arc::clone(&files),
        Arc::clone(&stats),
        Arc::new(YtDlp::new(&config.yt_dlp_bin, config.max_download_size)),
        compressor,
        client.clone(),
    ));

    let shutdown = CancellationToken::new();
    let health = health::serve(&config.health_addr, shutdown.clone().cancelled_owned()).await?;
    let sweeper = tokio::spawn(sweep_periodically(
        Arc::clone(&files),
        Arc::clone(&controller),
        config.cleanup_interval,
        config.max_artifact_age,
        shutdown.clone(),
    ));

    client
        .drop_pending_updates()
        .await
        .map_err(StartupError::Polling)?;

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    info!(
        "Bot started (upload limit {}, rate limit {} per {}s)",
        messages::format_file_size(config.max_upload_size),
        config.rate_limit_requests,
        config.rate_limit_window.as_secs()
    );
    let bot = Arc::new(Bot::new(Arc::clone(&config), client, controller, stats));
    bot.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(error) = health.await {
        warn!("Health server task failed: {error}");
    }
    if let Err(error) = sweeper.await {
        warn!("Cleanup task failed: {error}");
    }
    info!("Bot stopped");
    Ok(())
}

async fn sweep_periodically(
    files: Arc<FileManager>,
    controller: Arc<DownloadController>,
    every: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
) {
    let every = every.max(Duration::from_secs(1));
    let mut ticks = interval_at(Instant::now() + FIRST_SWEEP_DELAY, every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticks.tick() => {}
        }

        let removed = files.sweep(max_age).await;
        if removed > 0 {
            info!("Cleanup removed {removed} stale file(s)");
        }
        controller.purge_idle_state();
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Could not listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
