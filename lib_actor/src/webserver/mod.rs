//! # Local secure server
//!
//! TLS-only HTTP server bound on every interface at the listen port, with
//! two surfaces sharing one certificate (the one the broker returned on
//! `ready`/`unmanaged`):
//!
//! - **public** (`/actor/{token}/{method}`) — broker facing; the `{token}`
//!   path segment must equal the per-process capability token, everything
//!   else is a 403.
//! - **private** (`/private/...`) — user-client facing, loopback only,
//!   no token; includes the WebSocket that carries the user-egress queue.
//!
//! Every non-WebSocket response embeds `{result, stamp, version}` and a
//! `Server: UDSActor/N` header.

pub mod private;
pub mod public;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::{json, Value};

use crate::consts;
use crate::error::{ActorError, Result};
use crate::router::{QueueReceiver, QueueSender};
use crate::security;
use crate::types::{ActorKind, CertificateInfo};

/// Shared state of the local server.
pub struct AppState {
    pub actor_kind: ActorKind,
    /// Stored broker token, exposed only on the managed `uuid` route.
    pub config_token: Option<String>,
    /// Producer side of broker-ingress.
    pub ingress: QueueSender,
    /// Producer side of user-egress (public logout/message/screenshot).
    pub user_egress: QueueSender,
    /// Consumer side of user-egress; owned by the active WebSocket
    /// connection, one at a time.
    pub user_egress_rx: tokio::sync::Mutex<QueueReceiver>,
}

/// `{result, stamp, version}` envelope shared with the broker protocol.
pub fn rest_response(result: Value) -> Json<Value> {
    Json(json!({
        "result": result,
        "stamp": stamp(),
        "version": consts::VERSION,
    }))
}

/// Error envelope; `result` is null and the status code tells the rest.
pub fn rest_error(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(json!({
            "result": Value::Null,
            "error": error,
            "stamp": stamp(),
            "version": consts::VERSION,
        })),
    )
        .into_response()
}

fn stamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn server_header(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::SERVER,
        HeaderValue::from_static(consts::SERVER_IDENTITY),
    );
    response
}

/// Index page; exempt from the token check.
async fn index() -> &'static str {
    consts::VERSION
}

/// Builds the full route table over the shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/actor/{token}/{method}",
            get(public::handle_get).post(public::handle_post),
        )
        .route("/private/user_login", post(private::user_login))
        .route("/private/user_logout", post(private::user_logout))
        .route("/private/log", post(private::log_record))
        .route("/private/ws", get(ws::websocket))
        .layer(axum::middleware::from_fn(server_header))
        .layer(DefaultBodyLimit::max(consts::CLIENT_MAX_SIZE))
        .with_state(state)
}

/// Runs the TLS server until cancelled. Binds all interfaces so both the
/// broker and the loopback client reach the same listener.
pub async fn serve(state: Arc<AppState>, certificate: &CertificateInfo) -> Result<()> {
    let tls = security::server_tls_config(certificate)?;
    let config = RustlsConfig::from_config(Arc::new(tls));
    let addr = SocketAddr::from(([0, 0, 0, 0], consts::LISTEN_PORT));

    log::info!("Local secure server listening on {addr}");
    axum_server::bind_rustls(addr, config)
        .serve(build_router(state).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ActorError::Platform(format!("local server: {e}")))
}
