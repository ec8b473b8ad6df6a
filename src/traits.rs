use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::control;
use crate::error::Result;
use crate::router::{self, Envelope};
use crate::transport;
use crate::types::{Manager, PeerId, TaskId};

/// Outbound delivery seam. The live implementation is the WebSocket
/// connection map; tests swap in a mock to exercise send-failure handling.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerSender: Send + Sync {
    /// Delivers one framed message to a connected peer. Fails when the peer
    /// has no open session.
    async fn send(&self, peer_id: &PeerId, envelope: Envelope) -> Result<()>;
}

/// The manager's operational surface: everything the transports and the
/// runtime drive. Implemented for `Arc<Manager>` by delegating into the
/// subsystem modules.
#[async_trait]
pub trait ManagerInteractor {
    /// Runs the node: accrual replay, control loop, both transports. Returns
    /// after a shutdown signal completes the graceful drain.
    async fn start_manager(&self) -> Result<()>;

    /// Routes one inbound message from `sender` and returns the reply.
    async fn handle_envelope(&self, sender: &PeerId, envelope: Envelope)
        -> Result<Option<Envelope>>;

    /// Runs a dispatch step immediately and returns how many offers went out.
    async fn run_dispatch(&self) -> Result<usize>;

    /// Runs the recovery sweep immediately and returns the reclaimed tasks.
    async fn run_sweep(&self) -> Result<Vec<TaskId>>;

    /// Graceful drain and stop.
    async fn stop_manager(&self) -> Result<()>;
}

#[async_trait]
impl ManagerInteractor for Arc<Manager> {
    async fn start_manager(&self) -> Result<()> {
        info!("Starting manager {}...", self.peer_id);
        info!(
            "Listening on {:?}, announcing {:?}",
            self.config.listen, self.config.announce
        );

        let replayed = self.accruals.replay_pending().await?;
        if replayed > 0 {
            info!("Replayed {} unprocessed accruals", replayed);
        }

        tokio::spawn(control::run_control_loop(self.clone()));
        tokio::spawn(transport::serve_p2p(self.clone()));
        tokio::spawn(crate::admin::serve_http(self.clone()));

        info!("Waiting for workers...");
        tokio::signal::ctrl_c()
            .await
            .map_err(crate::error::Error::Io)?;
        self.stop_manager().await
    }

    async fn handle_envelope(
        &self,
        sender: &PeerId,
        envelope: Envelope,
    ) -> Result<Option<Envelope>> {
        router::handle_message(self, sender, envelope).await
    }

    async fn run_dispatch(&self) -> Result<usize> {
        control::dispatch_and_deliver(self).await
    }

    async fn run_sweep(&self) -> Result<Vec<TaskId>> {
        let mut engine = self.engine.lock().await;
        let mut registry = self.registry.lock().await;
        engine.sweep(&mut registry, crate::types::now_ms())
    }

    async fn stop_manager(&self) -> Result<()> {
        control::stop(self).await
    }
}
