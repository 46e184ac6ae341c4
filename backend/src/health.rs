use std::future::Future;

use axum::{Json, Router, routing::get};
use chrono::Utc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::StartupError;

pub const SERVICE_NAME: &str = "media-relay-bot";

pub fn router() -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Binds before returning so a bad address fails startup; serving then runs
/// until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<tokio::task::JoinHandle<()>, StartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::HealthBind {
            addr: addr.to_string(),
            source,
        })?;

    info!("Health endpoint listening on http://{addr}/health");

    Ok(tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router())
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("Health server stopped: {error}");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_service_and_timestamp() {
        let Json(body) = health().await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE_NAME);
        assert!(body["timestamp"].as_str().is_some_and(|ts| ts.contains('T')));
    }

    #[tokio::test]
    async fn serves_over_tcp_until_shutdown() {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let handle = serve(&addr, async move {
            let _ = stop_rx.await;
        })
        .await
        .unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn occupied_address_fails_startup() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        assert!(matches!(
            serve(&addr, std::future::pending()).await,
            Err(StartupError::HealthBind { .. })
        ));
    }
}
