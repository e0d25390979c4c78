//! Axum front for adwatch: the RSS feed, a health probe and a manual pass trigger.

mod feed;

use std::future::Future;
use std::sync::Arc;

use adwatch_sync::{IngestionCoordinator, Monitor, PassOutcome};
use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use feed::{render_rss, ChannelInfo, FeedAssembler, FeedError};

pub const CRATE_NAME: &str = "adwatch-web";
pub const RSS_CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub assembler: FeedAssembler,
    pub channel: ChannelInfo,
    pub coordinator: Arc<IngestionCoordinator>,
}

impl AppState {
    pub fn from_monitor(monitor: &Monitor) -> Self {
        Self {
            assembler: FeedAssembler::new(monitor.store.clone(), &monitor.config.feed),
            channel: ChannelInfo::from(&monitor.config.feed),
            coordinator: Arc::clone(&monitor.coordinator),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/rss", get(rss_handler))
        .route("/health", get(health_handler))
        .route("/passes", post(trigger_pass_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(monitor: &Monitor, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = monitor.config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "serving feed at /rss");
    axum::serve(listener, app(AppState::from_monitor(monitor)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")?;
    Ok(())
}

async fn rss_handler(State(state): State<Arc<AppState>>) -> Response {
    let items = state.assembler.build_feed().await;
    match render_rss(&state.channel, &items, Utc::now()) {
        Ok(xml) => ([(header::CONTENT_TYPE, RSS_CONTENT_TYPE)], xml).into_response(),
        Err(err) => {
            error!("rendering feed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "An error occurred while generating the RSS feed").into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn trigger_pass_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.coordinator.run_pass().await;
    let status = match &outcome {
        PassOutcome::Completed(_) => StatusCode::OK,
        PassOutcome::Skipped => StatusCode::CONFLICT,
        PassOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(outcome)).into_response()
}
