//! Private (user-client facing) REST surface.
//!
//! Reachable only from the loopback addresses; no token involved. The
//! interesting handler is `user_login`, which parks the HTTP request on a
//! reply channel until the router has spoken to the broker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::consts;
use crate::types::{MessageKind, UdsMessage};
use tokio::sync::oneshot;

use super::AppState;

fn local_only(addr: &SocketAddr) -> Option<Response> {
    if addr.ip().is_loopback() {
        None
    } else {
        Some(StatusCode::FORBIDDEN.into_response())
    }
}

pub async fn user_login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<Value>,
) -> Response {
    if let Some(denied) = local_only(&addr) {
        return denied;
    }

    let data = json!({
        "username": payload.get("username").cloned().unwrap_or_else(|| json!("")),
        "session_type": payload
            .get("session_type")
            .cloned()
            .unwrap_or_else(|| json!(consts::UNKNOWN)),
    });

    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .ingress
        .send(UdsMessage::with_callback(MessageKind::Login, data, reply_tx))
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    // The router fulfils the reply once the actor has answered
    match reply_rx.await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(reason)) => {
            log::error!("Error processing login: {reason}");
            (StatusCode::BAD_REQUEST, reason).into_response()
        }
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

pub async fn user_logout(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<Value>,
) -> Response {
    if let Some(denied) = local_only(&addr) {
        return denied;
    }

    let data = json!({
        "username": payload.get("username").cloned().unwrap_or_else(|| json!("")),
        "session_type": payload.get("session_type").cloned().unwrap_or_else(|| json!("")),
        "session_id": payload.get("session_id").cloned().unwrap_or_else(|| json!("")),
    });

    // Fire and forget; the client does not wait on broker bookkeeping
    let _ = state
        .ingress
        .send(UdsMessage::new(MessageKind::Logout, data));
    Json(json!(consts::OK)).into_response()
}

pub async fn log_record(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<Value>,
) -> Response {
    if let Some(denied) = local_only(&addr) {
        return denied;
    }

    let _ = state.ingress.send(UdsMessage::new(MessageKind::Log, payload));
    Json(json!(consts::OK)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorProcessor;
    use crate::error::Result;
    use crate::router::MessageRouter;
    use crate::types::{
        CertificateInfo, InterfaceInfo, LogLevel, LoginResponse, PreconnectRequest,
    };
    use crate::webserver::testing::{loopback, remote, test_server};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct StubActor;

    #[async_trait]
    impl ActorProcessor for StubActor {
        async fn initialize(
            &self,
            _interfaces: &[InterfaceInfo],
        ) -> Result<Option<CertificateInfo>> {
            Ok(None)
        }
        async fn login(&self, _username: &str, _session_type: &str) -> Result<LoginResponse> {
            Ok(LoginResponse {
                ip: "0.1.2.3".into(),
                hostname: "h".into(),
                dead_line: Some(1234),
                max_idle: Some(900),
                session_id: Some("S".into()),
            })
        }
        async fn logout(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn preconnect(&self, _request: &PreconnectRequest) -> Result<()> {
            Ok(())
        }
    }

    fn post(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_private_surface_is_loopback_only() {
        let server = test_server(crate::types::ActorKind::Managed, remote());
        let response = server
            .app
            .oneshot(post("/private/user_logout", json!({"username": "a"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_user_login_roundtrip_through_router() {
        // S5: the HTTP reply is the actor's LoginResponse dict and the same
        // payload shows up on user-egress as a Login message.
        let server = test_server(crate::types::ActorKind::Managed, loopback());

        // Real router consuming the server's ingress
        let (egress_probe_tx, mut egress_probe_rx) = crate::router::queue();
        let router = MessageRouter::new(Arc::new(StubActor), server.ingress_rx, egress_probe_tx);
        let router_task = tokio::spawn(router.run());

        let response = server
            .app
            .oneshot(post(
                "/private/user_login",
                json!({"username": "alice", "session_type": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["ip"], "0.1.2.3");
        assert_eq!(body["session_id"], "S");
        assert_eq!(body["max_idle"], 900);
        assert_eq!(body["dead_line"], 1234);

        let forwarded = egress_probe_rx.recv().await.unwrap();
        assert_eq!(forwarded.msg_type, MessageKind::Login);
        assert_eq!(forwarded.data, body);

        drop(server.state);
        router_task.abort();
    }

    #[tokio::test]
    async fn test_user_logout_is_fire_and_forget() {
        let mut server = test_server(crate::types::ActorKind::Managed, loopback());
        let response = server
            .app
            .oneshot(post(
                "/private/user_logout",
                json!({"username": "alice", "session_type": "x", "session_id": "S"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!("ok"));

        let queued = server.ingress_rx.try_recv().unwrap();
        assert_eq!(queued.msg_type, MessageKind::Logout);
        assert_eq!(queued.data["username"], "alice");
        // Locally originated: never marked as coming from the broker
        assert!(queued.data.get("from_broker").is_none());
    }

    #[tokio::test]
    async fn test_private_log_enqueues() {
        let mut server = test_server(crate::types::ActorKind::Managed, loopback());
        let response = server
            .app
            .oneshot(post(
                "/private/log",
                json!({"level": LogLevel::Info.value(), "message": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let queued = server.ingress_rx.try_recv().unwrap();
        assert_eq!(queued.msg_type, MessageKind::Log);
        assert_eq!(queued.data["message"], "hello");
    }
}
