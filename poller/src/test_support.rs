//! In-process snapshot server for tests.

use axum::extract::State;
use axum::http::header::ETAG;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A small solid-colour PNG; different shades give different payloads.
pub fn png_frame(shade: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(16, 12, Rgb([shade, 255 - shade, shade / 3]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

#[derive(Default)]
struct StubState {
    body: Vec<u8>,
    etag: Option<String>,
    status: Option<u16>,
    delay: Duration,
    /// Serve a new image (without a validator) on every hit.
    rotate: bool,
    hits: usize,
}

pub struct CameraStub {
    addr: SocketAddr,
    state: Arc<Mutex<StubState>>,
}

impl CameraStub {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(StubState::default()));
        let app = Router::new()
            .route("/snap.jpg", get(snap))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/snap.jpg", self.addr)
    }

    pub fn set_frame(&self, body: Vec<u8>, etag: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.body = body;
        state.etag = etag.map(str::to_owned);
        state.status = None;
    }

    pub fn set_status(&self, status: u16) {
        self.state.lock().unwrap().status = Some(status);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn rotate_frames(&self) {
        let mut state = self.state.lock().unwrap();
        state.rotate = true;
        state.etag = None;
    }

    pub fn hits(&self) -> usize {
        self.state.lock().unwrap().hits
    }
}

async fn snap(State(state): State<Arc<Mutex<StubState>>>) -> Response {
    let (delay, status, body, etag) = {
        let mut s = state.lock().unwrap();
        s.hits += 1;
        if s.rotate {
            s.body = png_frame(s.hits as u8);
        }
        (s.delay, s.status, s.body.clone(), s.etag.clone())
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if let Some(code) = status {
        let code = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (code, "camera unavailable").into_response();
    }

    let mut headers = HeaderMap::new();
    if let Some(etag) = etag {
        headers.insert(ETAG, HeaderValue::from_str(&etag).unwrap());
    }
    (StatusCode::OK, headers, body).into_response()
}
