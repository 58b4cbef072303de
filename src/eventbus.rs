//! [`EventBus`] implementation that just logs; a GUI or wallet consumer
//! would instead fan these out to its own update channels.

use {super::*, async_trait::async_trait};

pub(crate) struct TracingEventBus;

#[async_trait]
impl EventBus for TracingEventBus {
    async fn blockchain_updated(&self) {
        info!("blockchain updated");
    }

    async fn network_updated(&self) {
        debug!("network state updated");
    }

    async fn cert_mismatch(&self, server: &ServerAddr) {
        warn!(%server, "certificate fingerprint mismatch");
    }
}
