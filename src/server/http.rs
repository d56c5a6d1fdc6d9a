//! REST handlers
//!
//! The small non-WebSocket surface: on-demand screen capture, the recording
//! toggle, and a status snapshot.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::server::ServerState;
use crate::types::DropSnapshot;

/// Longest extracted-text echo returned by `/api/capture`.
const CAPTURE_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub message: &'static str,
    pub extracted_text: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub recording: bool,
    pub breaker: &'static str,
    pub dropped: DropSnapshot,
}

/// `GET /api/capture` — capture and OCR the screen right now.
pub async fn capture_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match state.manager.capture_screen_now().await {
        Ok(text) => (
            StatusCode::OK,
            Json(CaptureResponse {
                message: "Screen processed",
                extracted_text: truncate_chars(&text, CAPTURE_PREVIEW_CHARS),
            }),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "on-demand screen capture failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// `POST /api/recording/start`
pub async fn recording_start_handler(State(state): State<ServerState>) -> impl IntoResponse {
    state.manager.set_recording(true);
    (StatusCode::OK, Json(json!({ "status": "recording_started" })))
}

/// `POST /api/recording/stop`
pub async fn recording_stop_handler(State(state): State<ServerState>) -> impl IntoResponse {
    state.manager.set_recording(false);
    (StatusCode::OK, Json(json!({ "status": "recording_stopped" })))
}

/// `GET /api/status`
pub async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let response = StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        recording: state.manager.is_recording(),
        breaker: state.manager.breaker_state().as_str(),
        dropped: state.manager.dropped(),
    };
    (StatusCode::OK, Json(response))
}

/// Truncate on a char boundary, appending "..." when anything was cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}
