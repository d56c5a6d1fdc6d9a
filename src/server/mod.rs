//! HTTP + WebSocket server
//!
//! Serves the UI surface: the `/ws` event/chat socket, on-demand capture,
//! the recording toggle, and status. CORS is wide open (localhost daemon,
//! no authentication by design); REST routes carry a request timeout, and
//! shutdown drains in-flight work for a bounded grace period.

pub mod http;
pub mod ratelimit;
pub mod ws;

pub use ratelimit::{IpRateLimiter, RateLimitConfig};
pub use ws::{Connections, ServerMessage};

use crate::manager::{Manager, ManagerChannels};
use crate::trace::{self, TraceContext};
use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::Method,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

/// Read/write budget for one REST request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long in-flight work may drain after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared server state.
#[derive(Clone)]
pub struct ServerState {
    pub manager: Arc<Manager>,
    pub connections: Arc<Connections>,
    pub rate_limiter: Arc<IpRateLimiter>,
}

/// Build the router for the given state.
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/capture", get(http::capture_handler))
        .route("/api/recording/start", post(http::recording_start_handler))
        .route("/api/recording/stop", post(http::recording_stop_handler))
        .route("/api/status", get(http::status_handler))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .merge(api)
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn(attach_trace))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Extract (or mint) the trace context from the custom headers and run the
/// rest of the request inside its logging span.
async fn attach_trace(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let ctx = TraceContext::extract(
        headers
            .get(trace::TRACE_ID_KEY)
            .and_then(|v| v.to_str().ok()),
        headers
            .get(trace::SPAN_ID_KEY)
            .and_then(|v| v.to_str().ok()),
    );
    let span = trace::logger(&ctx);
    request.extensions_mut().insert(ctx);
    next.run(request).instrument(span).await
}

/// Serve until `shutdown` resolves, then drain for the grace period.
///
/// Broadcaster tasks are spawned here; they run until the Manager's event
/// channels close.
pub async fn serve(
    bind_addr: &str,
    manager: Arc<Manager>,
    channels: ManagerChannels,
    rate_limit: RateLimitConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let connections = Arc::new(Connections::default());
    let state = ServerState {
        manager,
        connections: connections.clone(),
        rate_limiter: Arc::new(IpRateLimiter::new(rate_limit)),
    };
    let broadcasters = ws::spawn_broadcasters(connections, channels);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "server listening");

    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
    let signal = async move {
        shutdown.await;
        info!("shutdown signal received, draining connections");
        let _ = drained_tx.send(());
    };

    let app = router(state);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal);

    let mut server = std::pin::pin!(std::future::IntoFuture::into_future(server));
    tokio::select! {
        result = &mut server => result.context("server error")?,
        _ = drained_rx => {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
                warn!(grace = ?SHUTDOWN_GRACE, "drain grace elapsed, aborting connections");
            }
        }
    }

    for task in broadcasters {
        task.abort();
    }
    Ok(())
}
