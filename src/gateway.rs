//! HTTP listener gateway.
//!
//! Two routes: `/stream.mp3` hands each connection its own buffer cursor and
//! forwards bytes until the segment ends or the client goes away, `/status`
//! reports what is on air. The buffer's blocking reads run on the blocking
//! thread pool and reach the async response body through a bounded channel.

use std::io;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::buffer::{BroadcastBuffer, Cursor, ReadOutcome};
use crate::config::StationSettings;
use crate::orchestrator::NowPlaying;

/// Upper bound per cursor read; one HTTP chunk per read.
const READ_CHUNK_BYTES: usize = 32 * 1024;

/// Chunks in flight between the reader thread and the response body.
const FORWARD_QUEUE: usize = 8;

#[derive(Clone)]
pub struct GatewayState {
    pub buffer: Arc<BroadcastBuffer>,
    pub now_playing: NowPlaying,
    pub station: StationSettings,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/stream.mp3", get(stream))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: GatewayState) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, router(state)).await
}

async fn stream(State(state): State<GatewayState>) -> Response {
    let Some(track) = state.now_playing.get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "not yet broadcasting").into_response();
    };
    debug!(track = %track.display, "listener attached");

    let cursor = state.buffer.attach();
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(FORWARD_QUEUE);
    let buffer = state.buffer.clone();
    tokio::task::spawn_blocking(move || forward(&buffer, &cursor, tx));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header("icy-name", sanitize_header(&state.station.name))
        .header("icy-description", sanitize_header(&state.station.description))
        .header("icy-pub", if state.station.public { "1" } else { "0" })
        .body(Body::from_stream(ReceiverStream::new(rx)));
    match response {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "failed to build stream response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Blocking read loop for one listener. Runs until end-of-segment, segment
/// failure or client disconnect, then releases the cursor.
fn forward(buffer: &BroadcastBuffer, cursor: &Cursor, tx: mpsc::Sender<Result<Bytes, io::Error>>) {
    loop {
        match buffer.read(cursor, READ_CHUNK_BYTES) {
            ReadOutcome::Data { bytes, skipped } => {
                if skipped > 0 {
                    debug!(skipped, "listener lagged past the eviction floor");
                }
                // A closed channel means the client is gone.
                if tx.blocking_send(Ok(bytes)).is_err() {
                    break;
                }
            }
            ReadOutcome::EndOfSegment => break,
            ReadOutcome::Failed => {
                let _ = tx.blocking_send(Err(io::Error::other("broadcast segment failed")));
                break;
            }
            ReadOutcome::Detached => break,
        }
    }
    buffer.detach(cursor);
}

/// ICY metadata travels in plain HTTP headers, so strip anything a header
/// value cannot carry.
fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

async fn status(State(state): State<GatewayState>) -> Response {
    let now = state.now_playing.get();
    Json(json!({
        "station": state.station.name,
        "description": state.station.description,
        "playing": now.is_some(),
        "now_playing": now.as_ref().map(|t| json!({
            "title": t.title,
            "artist": t.artist,
            "display": t.display,
            "duration_secs": t.duration.as_secs(),
        })),
    }))
    .into_response()
}
