//! # Message router
//!
//! The central hub between three peers: the broker (through the public REST
//! handlers), the user-space client (through the WebSocket) and the local
//! actor. It owns the two message queues and the single `logged_in` flag:
//!
//! - **broker-ingress** — everything pushed by the public handlers and the
//!   WebSocket reader; consumed here, strictly in enqueue order.
//! - **user-egress** — everything addressed to the user client; drained by
//!   the WebSocket writer.
//!
//! A failing handler is logged and the next message is processed; the router
//! never stops on a bad message.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::actor::ActorProcessor;
use crate::error::{ActorError, Result};
use crate::types::{
    to_value, LogRequest, LoginRequest, LogoutRequest, MessageKind, PreconnectRequest,
    ReplySender, ScriptRequest, UdsMessage,
};

/// Sender half of a message queue.
pub type QueueSender = mpsc::UnboundedSender<UdsMessage>;
/// Receiver half of a message queue.
pub type QueueReceiver = mpsc::UnboundedReceiver<UdsMessage>;

/// Creates one of the two actor queues.
pub fn queue() -> (QueueSender, QueueReceiver) {
    mpsc::unbounded_channel()
}

pub struct MessageRouter {
    actor: Arc<dyn ActorProcessor>,
    ingress: QueueReceiver,
    user_egress: QueueSender,
    logged_in: bool,
}

impl MessageRouter {
    pub fn new(
        actor: Arc<dyn ActorProcessor>,
        ingress: QueueReceiver,
        user_egress: QueueSender,
    ) -> Self {
        MessageRouter {
            actor,
            ingress,
            user_egress,
            logged_in: false,
        }
    }

    /// Consumes broker-ingress until the channel closes or a stop is
    /// requested from inside a handler.
    pub async fn run(mut self) {
        log::debug!("Message router running");
        while let Some(message) = self.ingress.recv().await {
            match self.dispatch(message).await {
                Ok(()) => {}
                Err(ActorError::RequestStop) => break,
                Err(e) => log::error!("Error processing message: {e}"),
            }
        }
        log::debug!("Message router stopped");
    }

    async fn dispatch(&mut self, message: UdsMessage) -> Result<()> {
        match message.msg_type {
            MessageKind::Login => self.handle_login(message).await,
            MessageKind::Logout => self.handle_logout(message).await,
            // A closed user connection counts as a local logout
            MessageKind::Close => {
                self.handle_logout(UdsMessage::new(
                    MessageKind::Logout,
                    to_value(&LogoutRequest::null(false)),
                ))
                .await
            }
            MessageKind::Log => self.handle_log(message).await,
            MessageKind::Script => self.handle_script(message).await,
            MessageKind::Preconnect => self.handle_preconnect(message).await,
            // Pure user-space concerns are forwarded untouched
            MessageKind::Message | MessageKind::Screenshot => {
                self.forward(message);
                Ok(())
            }
            // Keepalive never reaches the router; it lives in the ws layer
            MessageKind::Ping | MessageKind::Pong | MessageKind::Ok => {
                log::warn!("Unexpected message kind {:?} on ingress", message.msg_type);
                Ok(())
            }
        }
    }

    fn forward(&self, message: UdsMessage) {
        // The receiver only disappears at teardown; messages for a not yet
        // connected client stay queued.
        let _ = self.user_egress.send(message);
    }

    fn fulfil(callback: Option<ReplySender>, result: std::result::Result<Value, String>) {
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    async fn handle_login(&mut self, message: UdsMessage) -> Result<()> {
        let request: LoginRequest = serde_json::from_value(message.data.clone())
            .map_err(|e| ActorError::Config(format!("login payload: {e}")))?;

        self.logged_in = true;
        match self
            .actor
            .login(&request.username, &request.session_type)
            .await
        {
            Ok(response) => {
                let payload = to_value(&response);
                Self::fulfil(message.callback, Ok(payload.clone()));
                self.forward(UdsMessage::new(MessageKind::Login, payload));
                Ok(())
            }
            Err(e) => {
                Self::fulfil(message.callback, Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn handle_logout(&mut self, message: UdsMessage) -> Result<()> {
        let request: LogoutRequest = serde_json::from_value(message.data.clone())
            .map_err(|e| ActorError::Config(format!("logout payload: {e}")))?;

        if request.from_broker {
            // The broker wants the user client informed; the actor itself
            // has nothing to do with it.
            self.forward(message);
            return Ok(());
        }

        if !self.logged_in {
            Self::fulfil(message.callback, Ok(Value::Null));
            return Ok(());
        }
        self.logged_in = false;

        match self
            .actor
            .logout(&request.username, &request.session_type, &request.session_id)
            .await
        {
            Ok(()) => {
                Self::fulfil(message.callback, Ok(Value::Null));
                Ok(())
            }
            Err(e) => {
                Self::fulfil(message.callback, Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn handle_log(&mut self, message: UdsMessage) -> Result<()> {
        let request: LogRequest = serde_json::from_value(message.data)
            .map_err(|e| ActorError::Config(format!("log payload: {e}")))?;
        self.actor.log(request.level, &request.message).await
    }

    async fn handle_script(&mut self, message: UdsMessage) -> Result<()> {
        let request: ScriptRequest = serde_json::from_value(message.data.clone())
            .map_err(|e| ActorError::Config(format!("script payload: {e}")))?;
        if request.as_user {
            self.forward(message);
            Ok(())
        } else {
            self.actor.script(&request.script).await
        }
    }

    async fn handle_preconnect(&mut self, message: UdsMessage) -> Result<()> {
        let request: PreconnectRequest = serde_json::from_value(message.data)
            .map_err(|e| ActorError::Config(format!("preconnect payload: {e}")))?;
        self.actor.preconnect(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogLevel, LoginResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Actor that records every call, with scriptable login failure.
    #[derive(Default)]
    struct RecordingActor {
        calls: Mutex<Vec<String>>,
        fail_login: bool,
    }

    impl RecordingActor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActorProcessor for RecordingActor {
        async fn initialize(
            &self,
            _interfaces: &[crate::types::InterfaceInfo],
        ) -> Result<Option<crate::types::CertificateInfo>> {
            Ok(None)
        }

        async fn login(&self, username: &str, session_type: &str) -> Result<LoginResponse> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("login:{username}:{session_type}"));
            if self.fail_login {
                return Err(ActorError::Broker("login refused".into()));
            }
            Ok(LoginResponse {
                ip: "0.1.2.3".into(),
                hostname: "h".into(),
                dead_line: Some(1234),
                max_idle: Some(900),
                session_id: Some("S".into()),
            })
        }

        async fn logout(
            &self,
            username: &str,
            _session_type: &str,
            session_id: &str,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("logout:{username}:{session_id}"));
            Ok(())
        }

        async fn log(&self, level: LogLevel, message: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("log:{}:{message}", level.value()));
            Ok(())
        }

        async fn script(&self, script: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("script:{script}"));
            Ok(())
        }

        async fn preconnect(&self, request: &PreconnectRequest) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("preconnect:{}", request.username));
            Ok(())
        }
    }

    struct Rig {
        actor: Arc<RecordingActor>,
        ingress_tx: QueueSender,
        egress_rx: QueueReceiver,
        router: tokio::task::JoinHandle<()>,
    }

    fn rig(actor: RecordingActor) -> Rig {
        let actor = Arc::new(actor);
        let (ingress_tx, ingress_rx) = queue();
        let (egress_tx, egress_rx) = queue();
        let router =
            tokio::spawn(MessageRouter::new(actor.clone(), ingress_rx, egress_tx).run());
        Rig {
            actor,
            ingress_tx,
            egress_rx,
            router,
        }
    }

    impl Rig {
        /// Closes ingress and waits for the router to drain everything.
        async fn finish(self) -> (Arc<RecordingActor>, QueueReceiver) {
            drop(self.ingress_tx);
            self.router.await.unwrap();
            (self.actor, self.egress_rx)
        }
    }

    #[tokio::test]
    async fn test_broker_logout_forwards_without_actor_call() {
        let rig = rig(RecordingActor::default());
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Logout,
                to_value(&LogoutRequest::null(true)),
            ))
            .unwrap();

        let (actor, mut egress) = rig.finish().await;

        // The actor was never asked to log out...
        assert!(actor.calls().is_empty());
        // ...but the user client gets the message verbatim
        let forwarded = egress.try_recv().unwrap();
        assert_eq!(forwarded.msg_type, MessageKind::Logout);
        let request: LogoutRequest = serde_json::from_value(forwarded.data).unwrap();
        assert!(request.from_broker);
    }

    #[tokio::test]
    async fn test_login_sets_flag_and_forwards_response() {
        let rig = rig(RecordingActor::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        rig.ingress_tx
            .send(UdsMessage::with_callback(
                MessageKind::Login,
                serde_json::json!({"username": "alice", "session_type": "x"}),
                reply_tx,
            ))
            .unwrap();

        // The callback resolves with the actor's response
        let reply = reply_rx.await.unwrap().unwrap();
        assert_eq!(reply["ip"], "0.1.2.3");
        assert_eq!(reply["session_id"], "S");

        let (actor, mut egress) = rig.finish().await;
        assert_eq!(actor.calls(), vec!["login:alice:x"]);

        // The same payload is forwarded to the user client
        let forwarded = egress.try_recv().unwrap();
        assert_eq!(forwarded.msg_type, MessageKind::Login);
        assert_eq!(forwarded.data["session_id"], "S");
    }

    #[tokio::test]
    async fn test_local_logout_requires_login_first() {
        let rig = rig(RecordingActor::default());

        // Logout before any login: ignored
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Logout,
                to_value(&LogoutRequest {
                    username: "alice".into(),
                    session_id: "S".into(),
                    ..LogoutRequest::null(false)
                }),
            ))
            .unwrap();
        // Login, then logout: actor called once
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Login,
                serde_json::json!({"username": "alice", "session_type": "x"}),
            ))
            .unwrap();
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Logout,
                to_value(&LogoutRequest {
                    username: "alice".into(),
                    session_id: "S".into(),
                    ..LogoutRequest::null(false)
                }),
            ))
            .unwrap();

        let (actor, _egress) = rig.finish().await;
        assert_eq!(actor.calls(), vec!["login:alice:x", "logout:alice:S"]);
    }

    #[tokio::test]
    async fn test_close_counts_as_local_logout() {
        let rig = rig(RecordingActor::default());
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Login,
                serde_json::json!({"username": "alice", "session_type": "x"}),
            ))
            .unwrap();
        rig.ingress_tx
            .send(UdsMessage::bare(MessageKind::Close))
            .unwrap();

        let (actor, _egress) = rig.finish().await;
        // Close after login triggers a logout with empty identifiers
        assert_eq!(actor.calls(), vec!["login:alice:x", "logout::"]);
    }

    #[tokio::test]
    async fn test_dispatch_order_and_error_isolation() {
        let rig = rig(RecordingActor {
            fail_login: true,
            ..Default::default()
        });

        // First message fails inside the actor, later ones still dispatch,
        // in enqueue order.
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Login,
                serde_json::json!({"username": "a", "session_type": "x"}),
            ))
            .unwrap();
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Log,
                serde_json::json!({"level": 30000, "message": "m1"}),
            ))
            .unwrap();
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Preconnect,
                serde_json::json!({"user": "bob", "protocol": "rdp"}),
            ))
            .unwrap();

        let (actor, _egress) = rig.finish().await;
        assert_eq!(
            actor.calls(),
            vec!["login:a:x", "log:30000:m1", "preconnect:bob"]
        );
    }

    #[tokio::test]
    async fn test_script_routing() {
        let rig = rig(RecordingActor::default());
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Script,
                serde_json::json!({"script": "echo hi", "as_user": false}),
            ))
            .unwrap();
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Script,
                serde_json::json!({"script": "echo user", "as_user": true}),
            ))
            .unwrap();

        let (actor, mut egress) = rig.finish().await;
        // Service-side script executed by the actor...
        assert_eq!(actor.calls(), vec!["script:echo hi"]);
        // ...user script forwarded instead
        let forwarded = egress.try_recv().unwrap();
        assert_eq!(forwarded.msg_type, MessageKind::Script);
        assert_eq!(forwarded.data["script"], "echo user");
    }

    #[tokio::test]
    async fn test_message_and_screenshot_forward() {
        let rig = rig(RecordingActor::default());
        rig.ingress_tx
            .send(UdsMessage::new(
                MessageKind::Message,
                serde_json::json!({"text": "hello"}),
            ))
            .unwrap();
        rig.ingress_tx
            .send(UdsMessage::bare(MessageKind::Screenshot))
            .unwrap();

        let (actor, mut egress) = rig.finish().await;
        assert!(actor.calls().is_empty());
        assert_eq!(egress.try_recv().unwrap().msg_type, MessageKind::Message);
        assert_eq!(egress.try_recv().unwrap().msg_type, MessageKind::Screenshot);
    }
}
