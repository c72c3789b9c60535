//! Managed actor lifecycle.
//!
//! The broker assigns this machine a stable identity on first contact. The
//! initialize phase exchanges the install token for a machine-bound one,
//! applies the requested OS action (rename / domain join, with their reboot
//! semantics), runs the one-shot hooks and finally announces readiness to
//! obtain the serving certificate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::BrokerApi;
use crate::consts;
use crate::error::Result;
use crate::platform::ops::hl_rename;
use crate::platform::Platform;
use crate::types::{
    ActorConfiguration, CertificateInfo, DataConfiguration, InterfaceInfo, LoginResponse,
    OsAction, PreconnectRequest,
};
use crate::utils;

use super::{ActorBase, ActorProcessor};

pub struct ManagedActor {
    base: ActorBase,
}

/// Outcome of one configuration attempt.
enum Configure {
    Done,
    /// A reboot was triggered (or a runonce command owns the machine now);
    /// the actor must exit without serving.
    Exit,
}

impl ManagedActor {
    pub fn new(
        platform: Arc<Platform>,
        api: Arc<dyn BrokerApi>,
        config: ActorConfiguration,
    ) -> Self {
        ManagedActor {
            base: ActorBase::new(platform, api, config),
        }
    }

    pub fn base(&self) -> &ActorBase {
        &self.base
    }

    /// Token exchange. Retries indefinitely: the machine is useless without
    /// a machine-bound token, so there is nothing better to do.
    async fn exchange_token(&self, interfaces: &[InterfaceInfo]) -> Result<()> {
        let mut error_logged = false;
        loop {
            let mut cfg = self.base.config();
            match self.base.api.initialize(interfaces, cfg.actor_kind).await {
                Ok(init) => {
                    if let Some(token) = init.token {
                        if cfg.token.as_deref() != Some(token.as_str()) {
                            log::debug!("Token changed by broker on initialize");
                            cfg.token = Some(token);
                        }
                    }
                    cfg.initialized = true;
                    cfg.data_config = Some(DataConfiguration {
                        unique_id: init.unique_id,
                        os: init.os,
                    });
                    self.base.persist(&cfg).await?;
                    self.base.api.set_token(cfg.token.clone());
                    return Ok(());
                }
                Err(e) => {
                    if !error_logged {
                        log::warn!("Error validating with broker: {e}");
                        error_logged = true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(consts::WAIT_RETRY)).await;
        }
    }

    /// Applies the pending OS action once. Reboot-requiring steps trigger
    /// the reboot themselves and request an exit.
    async fn configure_step(&self) -> Result<Configure> {
        let mut cfg = self.base.config();
        let Some(data_config) = cfg.data_config.clone() else {
            return Ok(Configure::Done);
        };
        let Some(os) = data_config.os.clone() else {
            return Ok(Configure::Done);
        };

        let custom = os.custom.clone().unwrap_or_default();
        let ops = &*self.base.platform.operations;

        let already_done = custom
            .get("udsdone")
            .map(|v| v.as_bool().unwrap_or(!v.is_null()))
            .unwrap_or(false);

        if !already_done {
            match os.action {
                OsAction::Rename => {
                    let username = custom.get("username").and_then(serde_json::Value::as_str);
                    let password = custom.get("password").and_then(serde_json::Value::as_str);
                    let new_password =
                        custom.get("new_password").and_then(serde_json::Value::as_str);
                    if hl_rename(ops, &os.name, username, password, new_password).await? {
                        ops.reboot(0).await?;
                        return Ok(Configure::Exit);
                    }
                }
                OsAction::RenameAd => {
                    if ops.hl_join_domain(&os.name, &custom).await? {
                        ops.reboot(0).await?;
                        return Ok(Configure::Exit);
                    }
                }
                OsAction::None => {}
            }
        } else {
            log::info!("Configuration already done, skipping");
        }

        // Configuration applied: drop the OS data (credentials included)
        cfg.data_config = Some(DataConfiguration {
            unique_id: data_config.unique_id,
            os: None,
        });
        cfg.data = None;
        self.base.persist(&cfg).await?;
        Ok(Configure::Done)
    }

    /// Announces ip:port and obtains the serving certificate.
    async fn notify_ready(&self, interfaces: &[InterfaceInfo]) -> Result<Option<CertificateInfo>> {
        let cfg = self.base.config();
        let unique_id = cfg
            .data_config
            .as_ref()
            .and_then(|d| d.unique_id.clone())
            .unwrap_or_default();

        // The service interface is the one whose MAC the broker bound us to
        let service_interface = interfaces
            .iter()
            .find(|i| i.mac.to_lowercase() == unique_id)
            .or_else(|| interfaces.first())
            .cloned()
            .ok_or_else(|| crate::error::ActorError::Platform("no usable interface".into()))?;

        let mut retries = consts::RETRIES * 10;
        let mut error_logged = false;
        loop {
            match self
                .base
                .api
                .ready(&service_interface.ip, consts::LISTEN_PORT)
                .await
            {
                Ok(certificate) => return Ok(Some(certificate)),
                Err(e) => {
                    if !error_logged {
                        log::warn!("Error notifying broker of readiness: {e}");
                        error_logged = true;
                    }
                    retries -= 1;
                }
            }
            if retries == 0 {
                log::error!("Could not notify broker of readiness, rebooting");
                self.base.platform.operations.reboot(0).await?;
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_secs(consts::WAIT_RETRY)).await;
        }
    }
}

#[async_trait]
impl ActorProcessor for ManagedActor {
    async fn initialize(&self, interfaces: &[InterfaceInfo]) -> Result<Option<CertificateInfo>> {
        log::info!("Starting managed actor");

        if !self.base.config().initialized {
            self.exchange_token(interfaces).await?;
        } else {
            self.base.api.set_token(self.base.config().token.clone());
        }

        // One-shot command: it owns the machine from here on (including the
        // reboot), the service just steps aside.
        let mut cfg = self.base.config();
        if let Some(runonce) = cfg.runonce_command.take() {
            self.base.persist(&cfg).await?;
            if utils::execute(&runonce, "runOnce").await {
                return Ok(None);
            }
            // A runonce that could not even start is ignored and
            // configuration proceeds as if it never existed
        }

        let mut retries = consts::RETRIES * 4;
        loop {
            match self.configure_step().await {
                Ok(Configure::Done) => break,
                Ok(Configure::Exit) => return Ok(None),
                Err(e) => {
                    retries -= 1;
                    log::error!("Error configuring machine: {e} (retries left {retries})");
                    if retries == 0 {
                        log::info!("Rebooting machine for recovery");
                        self.base.platform.operations.reboot(0).await?;
                        return Ok(None);
                    }
                    tokio::time::sleep(Duration::from_secs(consts::WAIT_RETRY)).await;
                }
            }
        }

        // Post-config hook runs exactly once, synchronously, result ignored
        let mut cfg = self.base.config();
        if let Some(post_command) = cfg.post_command.take() {
            utils::execute(&post_command, "postConfig").await;
            self.base.persist(&cfg).await?;
        }

        self.notify_ready(interfaces).await
    }

    async fn login(&self, username: &str, session_type: &str) -> Result<LoginResponse> {
        let kind = self.base.config().actor_kind;
        Ok(self.base.notify_login(kind, username, session_type).await)
    }

    async fn logout(&self, username: &str, session_type: &str, session_id: &str) -> Result<()> {
        let kind = self.base.config().actor_kind;
        self.base
            .notify_logout(kind, username, session_type, session_id)
            .await;
        Ok(())
    }

    async fn preconnect(&self, request: &PreconnectRequest) -> Result<()> {
        self.base.run_preconnect(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::testing::FakeBroker;
    use crate::platform::config::testing::MemoryConfigStore;
    use crate::platform::ops::testing::FakeOperations;
    use crate::types::{ActorKind, InitializationResult, OsConfiguration};

    struct Fixture {
        actor: ManagedActor,
        broker: Arc<FakeBroker>,
        ops: Arc<FakeOperations>,
        store: Arc<MemoryConfigStore>,
    }

    fn fixture(config: ActorConfiguration, broker: FakeBroker) -> Fixture {
        let broker = Arc::new(broker);
        let ops = Arc::new(FakeOperations::default());
        let store = Arc::new(MemoryConfigStore::new(config.clone()));
        let platform = Arc::new(Platform::new(ops.clone(), store.clone()));
        let actor = ManagedActor::new(platform, broker.clone(), config);
        Fixture {
            actor,
            broker,
            ops,
            store,
        }
    }

    fn base_config() -> ActorConfiguration {
        ActorConfiguration {
            host: "broker".into(),
            token: Some("T0".into()),
            actor_kind: ActorKind::Managed,
            validate_certificate: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_boot_rename_requires_reboot() {
        // Managed first boot: the broker hands out a new token and asks for
        // a rename; the rename needs a reboot, so the lifecycle must reboot
        // and return without serving.
        let broker = FakeBroker::default();
        *broker.init_result.lock().unwrap() = InitializationResult {
            token: Some("T1".into()),
            unique_id: Some("00:11:22:33:44:55".into()),
            os: Some(OsConfiguration {
                action: OsAction::Rename,
                name: "PC-01".into(),
                custom: None,
            }),
        };

        let fx = fixture(base_config(), broker);
        let interfaces = fx.ops.interfaces.clone();

        let result = fx.actor.initialize(&interfaces).await.unwrap();
        assert!(result.is_none());

        // 1. Configuration rewritten with the exchanged token
        let written = fx.store.current.lock().unwrap().clone();
        assert_eq!(written.token.as_deref(), Some("T1"));
        assert!(written.initialized);

        // 2. Rename attempted and reboot requested
        let recorded = fx.ops.recorded.lock().unwrap();
        assert_eq!(recorded.renames, vec!["PC-01"]);
        assert_eq!(recorded.reboots, 1);

        // 3. Serving never announced
        assert_eq!(fx.broker.count("ready"), 0);
    }

    #[tokio::test]
    async fn test_runonce_executes_and_exits() {
        // A pending runonce command takes over the machine: it is executed,
        // cleared from the stored configuration, and the lifecycle returns
        // without ever calling ready.
        let config = ActorConfiguration {
            initialized: true,
            runonce_command: Some("/bin/true".into()),
            ..base_config()
        };
        let fx = fixture(config, FakeBroker::default());
        let interfaces = fx.ops.interfaces.clone();

        let result = fx.actor.initialize(&interfaces).await.unwrap();
        assert!(result.is_none());

        let written = fx.store.current.lock().unwrap().clone();
        assert!(written.runonce_command.is_none());
        assert_eq!(fx.broker.count("ready"), 0);
        assert_eq!(fx.ops.recorded.lock().unwrap().reboots, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_exhaustion_reboots() {
        // ready fails with connection errors forever: once the budget is
        // exhausted the machine reboots and serving never starts.
        let broker = FakeBroker::default();
        broker
            .ready_failures
            .store(u32::MAX, std::sync::atomic::Ordering::SeqCst);

        let config = ActorConfiguration {
            initialized: true,
            ..base_config()
        };
        let fx = fixture(config, broker);
        let interfaces = fx.ops.interfaces.clone();

        let result = fx.actor.initialize(&interfaces).await.unwrap();
        assert!(result.is_none());

        assert_eq!(fx.ops.recorded.lock().unwrap().reboots, 1);
        assert_eq!(fx.broker.count("ready") as u32, consts::RETRIES * 10);
        assert_eq!(fx.broker.count("login"), 0);
    }

    #[tokio::test]
    async fn test_ready_picks_interface_by_unique_id() {
        // The certificate request must carry the IP of the interface whose
        // MAC the broker bound the machine to.
        let broker = FakeBroker::default();
        let config = ActorConfiguration {
            initialized: true,
            data_config: Some(DataConfiguration {
                unique_id: Some("aa:bb:cc:dd:ee:ff".into()),
                os: None,
            }),
            ..base_config()
        };
        let fx = fixture(config, broker);
        let interfaces = vec![
            InterfaceInfo {
                name: "eth0".into(),
                mac: "00:11:22:33:44:55".into(),
                ip: "10.0.0.10".into(),
            },
            InterfaceInfo {
                name: "eth1".into(),
                mac: "AA:BB:CC:DD:EE:FF".into(),
                ip: "10.0.0.11".into(),
            },
        ];

        let result = fx.actor.initialize(&interfaces).await.unwrap();
        assert!(result.is_some());
        assert_eq!(fx.broker.count("ready"), 1);
        assert!(fx
            .broker
            .calls
            .lock()
            .unwrap()
            .contains(&"ready:10.0.0.11".to_string()));
    }

    #[tokio::test]
    async fn test_post_command_runs_once() {
        let config = ActorConfiguration {
            initialized: true,
            post_command: Some("/bin/true".into()),
            ..base_config()
        };
        let fx = fixture(config, FakeBroker::default());
        let interfaces = fx.ops.interfaces.clone();

        let result = fx.actor.initialize(&interfaces).await.unwrap();
        assert!(result.is_some());
        // Cleared after execution so it never runs again
        assert!(fx
            .store
            .current
            .lock()
            .unwrap()
            .post_command
            .is_none());
    }

    #[tokio::test]
    async fn test_login_notifies_broker() {
        let fx = fixture(
            ActorConfiguration {
                initialized: true,
                ..base_config()
            },
            FakeBroker::default(),
        );
        let response = fx.actor.login("alice", "x11").await.unwrap();
        assert_eq!(response.session_id.as_deref(), Some("S"));
        assert_eq!(fx.broker.count("login"), 1);
    }
}
