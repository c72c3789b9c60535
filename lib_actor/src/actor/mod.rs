//! Actor lifecycles.
//!
//! Both flavours share the same contract towards the router and the server:
//! initialize until a serving certificate is available, then handle session
//! events. They differ only in how `initialize` treats the token exchange.

pub mod managed;
pub mod unmanaged;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::broker::BrokerApi;
use crate::error::Result;
use crate::platform::Platform;
use crate::types::{
    ActorConfiguration, ActorKind, CertificateInfo, InterfaceInfo, LogLevel, LoginResponse,
    PreconnectRequest,
};
use crate::utils;

/// What the router and the lifecycle need from an actor.
#[async_trait]
pub trait ActorProcessor: Send + Sync {
    /// Drives the broker handshake until a serving certificate is available.
    /// `None` means the actor (and the process) must exit: either a reboot
    /// was triggered or a runonce command took over.
    async fn initialize(&self, interfaces: &[InterfaceInfo]) -> Result<Option<CertificateInfo>>;

    async fn login(&self, username: &str, session_type: &str) -> Result<LoginResponse>;

    async fn logout(&self, username: &str, session_type: &str, session_id: &str) -> Result<()>;

    /// Redirects a user-client log record to the service log (and from there
    /// to the broker through the shipper).
    async fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        let local_level = match level {
            LogLevel::Other | LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error | LogLevel::Critical => log::Level::Error,
        };
        log::log!(local_level, "SESSION: {message}");
        Ok(())
    }

    /// Executes a broker-pushed script on the service side.
    async fn script(&self, script: &str) -> Result<()> {
        utils::execute(script, "script").await;
        Ok(())
    }

    /// A user is about to connect; gives the pre-connect hook a chance.
    async fn preconnect(&self, request: &PreconnectRequest) -> Result<()>;
}

/// State shared by both lifecycles: platform, broker API and the working
/// copy of the configuration, with the boot-time snapshot kept aside for
/// the unmanaged token restore.
pub struct ActorBase {
    pub platform: Arc<Platform>,
    pub api: Arc<dyn BrokerApi>,
    initial: ActorConfiguration,
    current: Mutex<ActorConfiguration>,
}

impl ActorBase {
    pub fn new(
        platform: Arc<Platform>,
        api: Arc<dyn BrokerApi>,
        config: ActorConfiguration,
    ) -> Self {
        ActorBase {
            platform,
            api,
            initial: config.clone(),
            current: Mutex::new(config),
        }
    }

    /// Working copy of the configuration.
    pub fn config(&self) -> ActorConfiguration {
        self.current.lock().expect("config lock poisoned").clone()
    }

    /// Updates the in-memory configuration only.
    pub fn set_config(&self, config: ActorConfiguration) {
        *self.current.lock().expect("config lock poisoned") = config;
    }

    /// Updates the in-memory configuration and persists it.
    pub async fn persist(&self, config: &ActorConfiguration) -> Result<()> {
        self.set_config(config.clone());
        self.platform.store.write(config).await
    }

    /// Swaps back to the boot-time snapshot (token included) without
    /// touching the disk.
    pub fn restore_snapshot(&self) {
        self.set_config(self.initial.clone());
        self.api.set_token(self.initial.token.clone());
    }

    /// Notifies the broker of a session start and runs the logon hook.
    /// Broker failures are logged, never fatal: the session proceeds with a
    /// null response.
    pub async fn notify_login(
        &self,
        kind: ActorKind,
        username: &str,
        session_type: &str,
    ) -> LoginResponse {
        let session_type = if session_type.is_empty() {
            crate::consts::UNKNOWN
        } else {
            session_type
        };
        match self.api.notify_login(kind, username, session_type).await {
            Ok(response) => {
                let script = self.platform.store.script_on_login().await;
                if !script.is_empty() {
                    log::info!("Executing script on login: {script}");
                    let line = format!("{script} {username} {session_type} {kind}");
                    utils::execute(&line, "Logon").await;
                }
                response
            }
            Err(e) => {
                log::error!("Error notifying login: {e}");
                LoginResponse::null()
            }
        }
    }

    /// Notifies the broker of a session end. Failures are logged only.
    pub async fn notify_logout(
        &self,
        kind: ActorKind,
        username: &str,
        session_type: &str,
        session_id: &str,
    ) {
        if let Err(e) = self
            .api
            .notify_logout(kind, username, session_type, session_id)
            .await
        {
            log::error!("Error notifying logout: {e}");
        }
    }

    /// Runs the pre-connect hook when configured.
    pub async fn run_preconnect(&self, request: &PreconnectRequest) -> Result<()> {
        let config = self.config();
        if let Some(pre_command) = config.pre_command {
            let line = format!(
                "{pre_command} {} {}",
                request.username, request.protocol
            );
            utils::execute(&line, "preConnect").await;
        }
        Ok(())
    }
}
