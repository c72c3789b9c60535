//! Unmanaged actor lifecycle.
//!
//! The machine keeps its shared install token: the broker assigns
//! per-user-service tokens only when a session starts. Serving therefore
//! begins with just a certificate fetch, and the real token exchange happens
//! inside the login flow, in memory only. After logout the boot-time
//! snapshot is swapped back so the next session starts from the shared
//! token again.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::BrokerApi;
use crate::consts;
use crate::error::Result;
use crate::platform::ops::list_valid_interfaces;
use crate::platform::Platform;
use crate::types::{
    ActorConfiguration, CertificateInfo, DataConfiguration, InterfaceInfo, LoginResponse,
    PreconnectRequest,
};

use super::{ActorBase, ActorProcessor};

pub struct UnmanagedActor {
    base: ActorBase,
}

impl UnmanagedActor {
    pub fn new(
        platform: Arc<Platform>,
        api: Arc<dyn BrokerApi>,
        config: ActorConfiguration,
    ) -> Self {
        UnmanagedActor {
            base: ActorBase::new(platform, api, config),
        }
    }

    pub fn base(&self) -> &ActorBase {
        &self.base
    }

    /// Login-time initialize. The broker may hand out a per-service token;
    /// it is adopted in memory only, never persisted, so the shared token
    /// survives on disk for the next user service.
    async fn initialize_for_login(&self) {
        let mut cfg = self.base.config();
        let interfaces = match list_valid_interfaces(
            &*self.base.platform.operations,
            cfg.restrict_net.as_deref(),
        )
        .await
        {
            Ok(interfaces) => interfaces,
            Err(e) => {
                log::error!("Could not list interfaces for login: {e}");
                return;
            }
        };

        match self.base.api.initialize(&interfaces, cfg.actor_kind).await {
            Ok(init) => {
                if let Some(token) = init.token {
                    if cfg.token.as_deref() != Some(token.as_str()) {
                        log::debug!("Token changed by broker on login initialize");
                        cfg.token = Some(token);
                        cfg.initialized = true;
                    }
                }
                cfg.data_config = Some(DataConfiguration {
                    unique_id: init.unique_id,
                    os: init.os,
                });
                // In memory only: disk keeps the shared token
                self.base.set_config(cfg.clone());
                self.base.api.set_token(cfg.token.clone());
            }
            Err(e) => {
                log::warn!("Error validating with broker: {e}");
            }
        }
    }
}

#[async_trait]
impl ActorProcessor for UnmanagedActor {
    async fn initialize(&self, interfaces: &[InterfaceInfo]) -> Result<Option<CertificateInfo>> {
        log::info!("Starting unmanaged actor");

        self.base.api.set_token(self.base.config().token.clone());

        // An unmanaged actor simply obtains a registered certificate to
        // start the local server; configuration never touches the OS.
        let certificate = self
            .base
            .api
            .unmanaged_ready(interfaces, consts::LISTEN_PORT)
            .await?;
        Ok(Some(certificate))
    }

    async fn login(&self, username: &str, session_type: &str) -> Result<LoginResponse> {
        // The per-service token has to be in place before notifying
        self.initialize_for_login().await;

        let kind = self.base.config().actor_kind;
        Ok(self.base.notify_login(kind, username, session_type).await)
    }

    async fn logout(&self, username: &str, session_type: &str, session_id: &str) -> Result<()> {
        let kind = self.base.config().actor_kind;
        self.base
            .notify_logout(kind, username, session_type, session_id)
            .await;

        // Back to the shared token for the next user service
        self.base.restore_snapshot();
        Ok(())
    }

    async fn preconnect(&self, request: &PreconnectRequest) -> Result<()> {
        self.base.run_preconnect(request).await
    }
}
