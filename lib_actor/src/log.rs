//! Remote log shipping.
//!
//! A `log::Log` leg (chained into the service logger) pushes records onto a
//! queue; the shipper task drains that queue into the broker `log` endpoint.
//! The `shipping` guard breaks the feedback loop: anything logged while a
//! record is being shipped stays local.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::BrokerApi;
use crate::types::LogLevel;

/// Targets whose records are worth shipping: our own crates only, so HTTP
/// internals can never feed back into the shipper.
const SHIPPED_TARGETS: &[&str] = &["lib_actor", "udsactor", "service"];

type LogEntry = (LogLevel, String);

/// Creates the forwarder (to chain into the logger) and the receiver half
/// handed to [`LogShipper`].
pub fn remote_log_channel() -> (RemoteLogForwarder, mpsc::UnboundedReceiver<LogEntry>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RemoteLogForwarder {
            tx,
            shipping: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

/// `log::Log` implementation that enqueues records for the broker.
pub struct RemoteLogForwarder {
    tx: mpsc::UnboundedSender<LogEntry>,
    shipping: Arc<AtomicBool>,
}

impl RemoteLogForwarder {
    pub(crate) fn guard(&self) -> Arc<AtomicBool> {
        self.shipping.clone()
    }

    fn wants(&self, record: &log::Record) -> bool {
        record.level() <= log::Level::Info
            && SHIPPED_TARGETS
                .iter()
                .any(|t| record.target().starts_with(t))
    }
}

impl log::Log for RemoteLogForwarder {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.shipping.load(Ordering::Relaxed) || !self.wants(record) {
            return;
        }
        let _ = self
            .tx
            .send((record.level().into(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// Drains the forwarder queue into the broker. Runs for the lifetime of the
/// serving phase; dies quietly when the forwarder goes away.
pub struct LogShipper {
    api: Arc<dyn BrokerApi>,
    rx: mpsc::UnboundedReceiver<LogEntry>,
    shipping: Arc<AtomicBool>,
}

impl LogShipper {
    pub fn new(
        api: Arc<dyn BrokerApi>,
        rx: mpsc::UnboundedReceiver<LogEntry>,
        shipping: Arc<AtomicBool>,
    ) -> Self {
        LogShipper { api, rx, shipping }
    }

    pub async fn run(mut self) {
        while let Some((level, message)) = self.rx.recv().await {
            self.shipping.store(true, Ordering::Relaxed);
            // Failures are swallowed: a broker that cannot take logs must
            // not take the service down with it.
            let _ = self.api.log(level, &message).await;
            self.shipping.store(false, Ordering::Relaxed);
        }
    }
}
