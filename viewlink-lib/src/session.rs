mod coordinator;
mod error;
pub mod peer_session;
pub mod signaling;
pub mod status;

use anyhow::{Context, Result};
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    task::JoinHandle,
};
use tracing::debug;

pub use coordinator::{CoordinatorState, NegotiationCoordinator};
pub use error::SessionError;
pub use peer_session::{MediaDirections, PeerSessionFactory, RemoteMedia};
pub use signaling::channel::{create_local_channel, ChannelEvent, LocalBroker, SignalingChannel};
pub use signaling::IceServer;
pub use status::ConnectionStatus;

/// Owner-side handle of a running viewer session.
///
/// Dropping the handle requests teardown.
pub struct SessionHandle {
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<ConnectionStatus>,
    ice_servers_rx: watch::Receiver<Vec<IceServer>>,
    remote_media_rx: Option<UnboundedReceiver<RemoteMedia>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn(
        channel: SignalingChannel,
        factory: impl PeerSessionFactory + 'static,
        directions: MediaDirections,
    ) -> Self {
        let mut coordinator = NegotiationCoordinator::new(channel, Box::new(factory), directions);
        let status_rx = coordinator.subscribe_status();
        let ice_servers_rx = coordinator.subscribe_ice_servers();
        let remote_media_rx = coordinator.take_remote_media();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.run(shutdown_rx));
        Self {
            shutdown_tx,
            status_rx,
            ice_servers_rx,
            remote_media_rx,
            task,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers_rx.borrow().clone()
    }

    pub fn ice_server_count(&self) -> usize {
        self.ice_servers_rx.borrow().len()
    }

    pub fn subscribe_ice_servers(&self) -> watch::Receiver<Vec<IceServer>> {
        self.ice_servers_rx.clone()
    }

    pub fn take_remote_media(&mut self) -> Option<UnboundedReceiver<RemoteMedia>> {
        self.remote_media_rx.take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Requests teardown. Any step in flight is abandoned.
    pub fn teardown(&self) {
        if self.shutdown_tx.send_replace(true) {
            debug!("teardown already requested");
        }
    }

    /// Waits until the session has released its peer session and channel.
    pub async fn join(self) -> Result<()> {
        let Self {
            shutdown_tx, task, ..
        } = self;
        let result = task.await.context("Session task failed");
        drop(shutdown_tx);
        result
    }
}
