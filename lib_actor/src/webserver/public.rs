//! Public (broker facing) REST surface: `/actor/{token}/{method}`.
//!
//! The path token is the only authenticator; a mismatch is a 403 before any
//! method dispatch happens.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::consts;
use crate::types::{
    to_value, ActorKind, LogoutRequest, MessageKind, PreconnectRequest, ScriptRequest, UdsMessage,
};

use super::{rest_error, rest_response, AppState};

fn authorized(token: &str) -> bool {
    token == *consts::OWN_AUTH_TOKEN
}

pub async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path((token, method)): Path<(String, String)>,
) -> Response {
    if !authorized(&token) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match method.as_str() {
        "information" => rest_response(json!(format!(
            "UDS Actor v{} Secure Server",
            consts::VERSION
        )))
        .into_response(),
        // The stored token doubles as machine uuid, but only a managed
        // machine has a stable one worth reporting
        "uuid" => {
            let uuid = if state.actor_kind == ActorKind::Managed {
                state.config_token.clone().unwrap_or_default()
            } else {
                String::new()
            };
            rest_response(json!(uuid)).into_response()
        }
        _ => rest_error(StatusCode::NOT_FOUND, "unknown method"),
    }
}

pub async fn handle_post(
    State(state): State<Arc<AppState>>,
    Path((token, method)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if !authorized(&token) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match method.as_str() {
        // preConnect is the historical spelling, kept for older brokers
        "preconnect" | "preConnect" => preconnect(&state, &body),
        "logout" => {
            // Inform the user client; the actor is not involved from here
            let message = UdsMessage::new(
                MessageKind::Logout,
                to_value(&LogoutRequest::null(true)),
            );
            let _ = state.user_egress.send(message);
            rest_response(json!(consts::OK)).into_response()
        }
        "message" => match serde_json::from_slice::<Value>(&body) {
            Ok(data) => {
                let _ = state
                    .user_egress
                    .send(UdsMessage::new(MessageKind::Message, data));
                rest_response(json!(consts::OK)).into_response()
            }
            Err(e) => rest_error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        "screenshot" => {
            let _ = state
                .user_egress
                .send(UdsMessage::bare(MessageKind::Screenshot));
            rest_response(json!(consts::OK)).into_response()
        }
        "script" => match serde_json::from_slice::<ScriptRequest>(&body) {
            Ok(request) => {
                let _ = state
                    .ingress
                    .send(UdsMessage::new(MessageKind::Script, to_value(&request)));
                rest_response(json!(consts::OK)).into_response()
            }
            Err(e) => rest_error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        _ => rest_error(StatusCode::NOT_FOUND, "unknown method"),
    }
}

fn preconnect(state: &AppState, body: &[u8]) -> Response {
    match serde_json::from_slice::<PreconnectRequest>(body) {
        Ok(request) => {
            let _ = state
                .ingress
                .send(UdsMessage::new(MessageKind::Preconnect, to_value(&request)));
            rest_response(json!(consts::OK)).into_response()
        }
        Err(e) => {
            log::warn!("Error processing preconnect: {e}");
            rest_error(StatusCode::BAD_REQUEST, &e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webserver::testing::{loopback, test_server};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrong_token_is_forbidden() {
        let server = test_server(ActorKind::Managed, loopback());
        for (method, uri) in [
            ("GET", "/actor/wrong-token/information"),
            ("POST", "/actor/wrong-token/logout"),
        ] {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = server.app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn test_index_needs_no_token() {
        let server = test_server(ActorKind::Managed, loopback());
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = server.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("server").unwrap(),
            consts::SERVER_IDENTITY
        );
    }

    #[tokio::test]
    async fn test_information() {
        let server = test_server(ActorKind::Managed, loopback());
        let uri = format!("/actor/{}/information", *consts::OWN_AUTH_TOKEN);
        let request = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        let response = server.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert!(body["result"].as_str().unwrap().starts_with("UDS Actor v"));
        assert_eq!(body["version"], consts::VERSION);
        assert!(body["stamp"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_public_logout_forwards_to_user_client() {
        // S4: response is ok, one from_broker logout lands on user-egress
        // and nothing reaches the router's ingress.
        let mut server = test_server(ActorKind::Managed, loopback());
        let uri = format!("/actor/{}/logout", *consts::OWN_AUTH_TOKEN);
        let response = server
            .app
            .clone()
            .oneshot(post(&uri, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"], "ok");

        let forwarded = server
            .state
            .user_egress_rx
            .lock()
            .await
            .try_recv()
            .unwrap();
        assert_eq!(forwarded.msg_type, MessageKind::Logout);
        let request: LogoutRequest = serde_json::from_value(forwarded.data).unwrap();
        assert!(request.from_broker);
        assert!(server.ingress_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_preconnect_legacy_alias() {
        // S6: the legacy spelling and schema decode to the same request
        let mut server = test_server(ActorKind::Managed, loopback());
        let uri = format!("/actor/{}/preConnect", *consts::OWN_AUTH_TOKEN);
        let response = server
            .app
            .oneshot(post(
                &uri,
                json!({
                    "user": "bob",
                    "protocol": "rdp",
                    "ip": "1.2.3.4",
                    "hostname": "h",
                    "udsuser": "u"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let queued = server.ingress_rx.try_recv().unwrap();
        assert_eq!(queued.msg_type, MessageKind::Preconnect);
        let request: PreconnectRequest = serde_json::from_value(queued.data).unwrap();
        assert_eq!(request.username, "bob");
        assert_eq!(request.protocol, "rdp");
    }

    #[tokio::test]
    async fn test_message_and_screenshot_go_to_user_egress() {
        let server = test_server(ActorKind::Managed, loopback());
        let message_uri = format!("/actor/{}/message", *consts::OWN_AUTH_TOKEN);
        let screenshot_uri = format!("/actor/{}/screenshot", *consts::OWN_AUTH_TOKEN);

        server
            .app
            .clone()
            .oneshot(post(&message_uri, json!({"text": "maintenance in 5"})))
            .await
            .unwrap();
        server
            .app
            .clone()
            .oneshot(post(&screenshot_uri, json!({})))
            .await
            .unwrap();

        let mut egress = server.state.user_egress_rx.lock().await;
        let first = egress.try_recv().unwrap();
        assert_eq!(first.msg_type, MessageKind::Message);
        assert_eq!(first.data["text"], "maintenance in 5");
        assert_eq!(egress.try_recv().unwrap().msg_type, MessageKind::Screenshot);
    }

    #[tokio::test]
    async fn test_script_goes_to_ingress() {
        let mut server = test_server(ActorKind::Managed, loopback());
        let uri = format!("/actor/{}/script", *consts::OWN_AUTH_TOKEN);
        server
            .app
            .oneshot(post(&uri, json!({"script": "echo hi", "as_user": true})))
            .await
            .unwrap();

        let queued = server.ingress_rx.try_recv().unwrap();
        assert_eq!(queued.msg_type, MessageKind::Script);
        assert_eq!(queued.data["as_user"], true);
    }

    #[tokio::test]
    async fn test_uuid_depends_on_actor_kind() {
        let token_uri = format!("/actor/{}/uuid", *consts::OWN_AUTH_TOKEN);

        let managed = test_server(ActorKind::Managed, loopback());
        let request = Request::builder()
            .uri(&token_uri)
            .body(Body::empty())
            .unwrap();
        let response = managed.app.oneshot(request).await.unwrap();
        assert_eq!(body_json(response).await["result"], "stored-token");

        let unmanaged = test_server(ActorKind::Unmanaged, loopback());
        let request = Request::builder()
            .uri(&token_uri)
            .body(Body::empty())
            .unwrap();
        let response = unmanaged.app.oneshot(request).await.unwrap();
        assert_eq!(body_json(response).await["result"], "");
    }

    #[tokio::test]
    async fn test_bad_payload_is_rejected() {
        let server = test_server(ActorKind::Managed, loopback());
        let uri = format!("/actor/{}/message", *consts::OWN_AUTH_TOKEN);
        let request = Request::builder()
            .method("POST")
            .uri(&uri)
            .body(Body::from("{not json"))
            .unwrap();
        let response = server.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["result"].is_null());
        assert!(body["error"].is_string());
    }
}
