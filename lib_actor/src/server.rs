//! # Actor service loop
//!
//! Owns the runtime and the task set: log shipper, message router, the
//! lifecycle itself and, once a certificate is available, the local secure
//! server. The enclosing service wrapper keeps control of the process; this
//! type only parks the calling thread on a current-thread runtime and
//! watches the stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::actor::managed::ManagedActor;
use crate::actor::unmanaged::UnmanagedActor;
use crate::actor::ActorProcessor;
use crate::broker::{BrokerApi, BrokerClient};
use crate::consts;
use crate::log::{LogShipper, RemoteLogForwarder};
use crate::platform::ops::list_valid_interfaces;
use crate::platform::Platform;
use crate::router::{queue, MessageRouter};
use crate::types::{ActorKind, InterfaceInfo, LogLevel};
use crate::webserver::{self, AppState};

/// Process-wide cooperative stop signal, shared with the signal handlers.
pub type StopFlag = Arc<AtomicBool>;

pub fn stop_flag() -> StopFlag {
    Arc::new(AtomicBool::new(false))
}

type LogFeed = (
    mpsc::UnboundedReceiver<(LogLevel, String)>,
    Arc<AtomicBool>,
);

pub struct ActorService {
    platform: Arc<Platform>,
    stop: StopFlag,
    log_feed: Mutex<Option<LogFeed>>,
}

impl ActorService {
    pub fn new(platform: Arc<Platform>, stop: StopFlag) -> Self {
        ActorService {
            platform,
            stop,
            log_feed: Mutex::new(None),
        }
    }

    /// Attaches the remote leg of the logger so the shipper can drain it
    /// into the broker once a client exists.
    pub fn with_remote_log(
        self,
        forwarder: &RemoteLogForwarder,
        rx: mpsc::UnboundedReceiver<(LogLevel, String)>,
    ) -> Self {
        *self.log_feed.lock().expect("log feed lock") = Some((rx, forwarder.guard()));
        self
    }

    /// Blocking entry point: hosts a single-threaded runtime on the calling
    /// thread and runs the service until stopped.
    pub fn run(&self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("Could not build runtime: {e}");
                return;
            }
        };
        runtime.block_on(self.run_async());
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// The whole lifecycle: Boot, AwaitNetwork, Initialize/Configure,
    /// NotifyReady (inside the actor), Serving, Teardown.
    pub async fn run_async(&self) {
        // --- Boot: without a usable configuration there is no service ---
        let config = self.platform.store.read().await;
        if config.is_null() {
            log::info!("UDS Actor is not configured, stopping service");
            return;
        }

        self.platform.operations.set_process_title("udsactor");

        let api: Arc<dyn BrokerApi> = match BrokerClient::new(
            &config.host,
            config.validate_certificate,
            config.token.clone(),
        ) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                log::error!("Could not build broker client: {e}");
                return;
            }
        };

        let actor: Arc<dyn ActorProcessor> = match config.actor_kind {
            ActorKind::Managed => Arc::new(ManagedActor::new(
                self.platform.clone(),
                api.clone(),
                config.clone(),
            )),
            ActorKind::Unmanaged => Arc::new(UnmanagedActor::new(
                self.platform.clone(),
                api.clone(),
                config.clone(),
            )),
        };

        let (ingress_tx, ingress_rx) = queue();
        let (egress_tx, egress_rx) = queue();

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if let Some((rx, guard)) = self.log_feed.lock().expect("log feed lock").take() {
            let shipper = LogShipper::new(api.clone(), rx, guard);
            tasks.push(("log-shipper", tokio::spawn(shipper.run())));
        }

        let router = MessageRouter::new(actor.clone(), ingress_rx, egress_tx.clone());
        tasks.push(("router", tokio::spawn(router.run())));

        // --- AwaitNetwork: nothing works without a usable interface ---
        log::info!("Waiting for network connectivity");
        let interfaces = loop {
            if self.stopped() {
                self.teardown(tasks).await;
                return;
            }
            match list_valid_interfaces(
                &*self.platform.operations,
                config.restrict_net.as_deref(),
            )
            .await
            {
                Ok(interfaces) if !interfaces.is_empty() => break interfaces,
                Ok(_) => {}
                Err(e) => log::warn!("Could not list interfaces: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(consts::WAIT_RETRY)).await;
        };
        log::info!(
            "Detected network interfaces: {}",
            interfaces
                .iter()
                .map(InterfaceInfo::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        // --- Initialize / Configure / NotifyReady ---
        let certificate = match actor.initialize(&interfaces).await {
            Ok(Some(certificate)) => certificate,
            Ok(None) => {
                // Reboot requested or runonce took over; leave quietly
                self.teardown(tasks).await;
                return;
            }
            Err(e) => {
                log::error!("Actor initialization failed: {e}");
                self.teardown(tasks).await;
                return;
            }
        };

        // --- Serving ---
        let state = Arc::new(AppState {
            actor_kind: config.actor_kind,
            config_token: self.platform.store.read().await.token,
            ingress: ingress_tx,
            user_egress: egress_tx,
            user_egress_rx: tokio::sync::Mutex::new(egress_rx),
        });
        let web = tokio::spawn(async move {
            if let Err(e) = webserver::serve(state, &certificate).await {
                log::error!("Local server failed: {e}");
            }
        });
        tasks.push(("webserver", web));

        while !self.stopped() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some((name, _)) = tasks.iter().find(|(_, t)| t.is_finished()) {
                log::warn!("Task {name} finished unexpectedly, stopping service");
                break;
            }
        }

        // --- Teardown ---
        self.teardown(tasks).await;
    }

    /// Cooperative cancellation with a bounded grace window; cancellations
    /// are clean exits, anything else ends up in the log.
    async fn teardown(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) {
        for (_, task) in &tasks {
            task.abort();
        }
        for (name, task) in tasks {
            match tokio::time::timeout(Duration::from_secs(consts::TEARDOWN_GRACE), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => log::error!("Task {name} ended with error: {e}"),
                Err(_) => log::warn!("Task {name} did not stop within the grace window"),
            }
        }
        log::debug!("Service stopped");
    }
}
