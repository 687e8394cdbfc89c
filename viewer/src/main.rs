mod display;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use camwatch_common::config::Config;
use camwatch_common::frame::Viewport;
use camwatch_common::latency::LatencyTrend;
use camwatch_poller::{FetcherOptions, PollTarget, Poller};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use display::{encode_jpeg, run_display, DisplayMsg, DisplaySink, DisplayState};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    display: Arc<RwLock<DisplayState>>,
    display_tx: mpsc::UnboundedSender<DisplayMsg>,
    poller: Mutex<Poller<DisplaySink>>,
    config: Mutex<Config>,
    config_path: PathBuf,
    viewport: Viewport,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FrameQuery {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Status {
    url: Option<String>,
    rate: Option<u32>,
    denoise: Option<u32>,
    observed_at: Option<String>,
    header: Option<String>,
    error: Option<String>,
    latency: LatencyTrend,
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    url: String,
    rate: u32,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /frame.jpg?width=&height= : latest frame fitted into the viewport
async fn frame_jpeg(State(state): State<Arc<AppState>>, Query(q): Query<FrameQuery>) -> Response {
    let Some(frame) = state.display.read().await.frame() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no frame yet").into_response();
    };
    let viewport = Viewport {
        width: q.width.unwrap_or(state.viewport.width),
        height: q.height.unwrap_or(state.viewport.height),
    };

    let result = tokio::task::spawn_blocking(move || encode_jpeg(&frame, viewport)).await;

    match result {
        Ok(Ok(jpeg)) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            jpeg,
        )
            .into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "JPEG encode failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    let (url, rate, denoise) = match state.poller.lock().await.target() {
        Some(t) => (Some(t.url().to_string()), Some(t.rate()), Some(t.denoise())),
        None => (None, None, None),
    };
    let display = state.display.read().await;
    Json(Status {
        url,
        rate,
        denoise,
        observed_at: display.observed_at().map(|at| at.to_rfc3339()),
        header: display.header(),
        error: display.error().map(str::to_owned),
        latency: display.latency(),
    })
}

/// POST /connect : point the poller at a new camera and remember it
/// Body: { "url": "http://...", "rate": 5 }
async fn connect(State(state): State<Arc<AppState>>, Json(body): Json<ConnectRequest>) -> Response {
    let mut config = state.config.lock().await;
    let target = match PollTarget::new(&body.url, body.rate, config.filter.denoise) {
        Ok(t) => t,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    config.source.url = target.url().to_string();
    config.source.rate = target.rate();
    if let Err(e) = config.save(&state.config_path) {
        error!(error = %e, "cannot persist config");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    drop(config);

    let mut poller = state.poller.lock().await;
    poller.stop().await;
    // Queued behind everything the old session published.
    let _ = state.display_tx.send(DisplayMsg::Reset);
    match poller.restart(target).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(error = %e, "cannot start poll session");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// POST /disconnect : stop polling, keep the last frame on screen
async fn disconnect(State(state): State<Arc<AppState>>) -> StatusCode {
    let mut poller = state.poller.lock().await;
    if let Some(target) = poller.target() {
        info!(url = %target.url(), "disconnecting");
    }
    poller.stop().await;
    StatusCode::NO_CONTENT
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/frame.jpg", get(frame_jpeg))
        .route("/status", get(status))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn app_state(config: Config, config_path: PathBuf) -> (Arc<AppState>, mpsc::UnboundedReceiver<DisplayMsg>) {
    let (display_tx, display_rx) = mpsc::unbounded_channel();
    let display = DisplayState::new(config.poll.latency_samples, config.display.time_format.clone());
    let poller = Poller::new(
        FetcherOptions::from_config(&config),
        DisplaySink::new(display_tx.clone()),
    );
    let viewport = Viewport {
        width: config.display.max_width,
        height: config.display.max_height,
    };
    let state = Arc::new(AppState {
        display: Arc::new(RwLock::new(display)),
        display_tx,
        poller: Mutex::new(poller),
        config: Mutex::new(config),
        config_path,
        viewport,
    });
    (state, display_rx)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, shutting down");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let target = match config.validate().and_then(|()| PollTarget::from_config(&config)) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Invalid config {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    let addr = config.display.bind.clone();
    let (state, display_rx) = app_state(config, config_path);
    let display_task = tokio::spawn(run_display(display_rx, Arc::clone(&state.display)));

    if let Err(e) = state.poller.lock().await.restart(target).await {
        eprintln!("Failed to start polling: {e}");
        std::process::exit(1);
    }

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    info!(addr, "camwatch viewer starting");

    if let Err(e) = axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    state.poller.lock().await.stop().await;
    display_task.abort();
    info!("camwatch viewer stopped");
}
