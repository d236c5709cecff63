use std::fmt;

use anyhow::{Context, Result};
use tokio::{
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
};
use tracing::{debug, error, info, trace, warn};

use super::{
    error::SessionError,
    peer_session::{
        MediaDirections, PeerConnectionState, PeerEvent, PeerSession, PeerSessionFactory,
        RemoteMedia,
    },
    signaling::{
        channel::{ChannelEvent, SignalingChannel},
        IceCandidate, IceServer, SessionDescription, SignalingMessage,
    },
    status::{ConnectionStatus, SessionStateTracker},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    AwaitingIceServers,
    Negotiating,
    Active,
    Failed,
    Terminated,
}

impl CoordinatorState {
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }

    fn has_peer_session(self) -> bool {
        matches!(self, Self::Negotiating | Self::Active)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AwaitingIceServers => "awaiting-ice-servers",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

enum Input {
    Channel(ChannelEvent),
    Peer(PeerEvent),
}

async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a request.
    let _ = shutdown_rx.wait_for(|&shutdown| shutdown).await;
}

/// Drives one viewer session: asks the broker for ICE servers, creates the
/// single peer session, sends the offer, applies the answer and trades
/// candidates until the channel closes or teardown is requested.
pub struct NegotiationCoordinator {
    state: CoordinatorState,
    channel: SignalingChannel,
    factory: Box<dyn PeerSessionFactory>,
    directions: MediaDirections,
    peer: Option<Box<dyn PeerSession>>,
    peer_created: bool,
    offer_created: bool,
    remote_description_attempted: bool,
    peer_events_tx: UnboundedSender<PeerEvent>,
    peer_events_rx: UnboundedReceiver<PeerEvent>,
    tracker: SessionStateTracker,
    ice_servers_tx: watch::Sender<Vec<IceServer>>,
    remote_media_tx: UnboundedSender<RemoteMedia>,
    remote_media_rx: Option<UnboundedReceiver<RemoteMedia>>,
}

impl NegotiationCoordinator {
    pub fn new(
        channel: SignalingChannel,
        factory: Box<dyn PeerSessionFactory>,
        directions: MediaDirections,
    ) -> Self {
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (ice_servers_tx, _) = watch::channel(Vec::new());
        let (remote_media_tx, remote_media_rx) = mpsc::unbounded_channel();
        Self {
            state: CoordinatorState::Idle,
            channel,
            factory,
            directions,
            peer: None,
            peer_created: false,
            offer_created: false,
            remote_description_attempted: false,
            peer_events_tx,
            peer_events_rx,
            tracker: SessionStateTracker::new(),
            ice_servers_tx,
            remote_media_tx,
            remote_media_rx: Some(remote_media_rx),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.tracker.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.tracker.subscribe()
    }

    pub fn subscribe_ice_servers(&self) -> watch::Receiver<Vec<IceServer>> {
        self.ice_servers_tx.subscribe()
    }

    pub fn take_remote_media(&mut self) -> Option<UnboundedReceiver<RemoteMedia>> {
        self.remote_media_rx.take()
    }

    /// Processes events one at a time until the session terminates. A
    /// shutdown request cancels whatever step is in flight and tears the
    /// session down.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        while !self.state.is_terminal() {
            if *shutdown_rx.borrow() {
                break;
            }
            // Channel and peer events come from independent sources; neither
            // is preferred over the other.
            let input = select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                event = self.channel.recv() => Input::Channel(event.unwrap_or(ChannelEvent::Closed)),
                Some(event) = self.peer_events_rx.recv() => Input::Peer(event),
            };
            let cancelled = select! {
                biased;
                _ = shutdown_requested(&mut shutdown_rx) => true,
                _ = self.dispatch(input) => false,
            };
            if cancelled {
                info!("teardown requested while {} step was in flight", self.state);
                break;
            }
        }
        self.teardown().await;
    }

    async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Channel(event) => self.handle_channel_event(event).await,
            Input::Peer(event) => self.handle_peer_event(event).await,
        }
    }

    pub async fn handle_channel_event(&mut self, event: ChannelEvent) {
        if self.state.is_terminal() {
            trace!("ignored channel event after teardown: {:?}", event);
            return;
        }
        match event {
            ChannelEvent::Opened => self.on_channel_opened(),
            ChannelEvent::Message(msg) => self.on_message(msg).await,
            ChannelEvent::Error(description) => warn!("signaling channel error: {}", description),
            ChannelEvent::Closed => {
                info!("signaling channel closed");
                self.teardown().await;
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.state.is_terminal() {
            trace!("ignored peer event after teardown: {:?}", event);
            return;
        }
        match event {
            PeerEvent::ConnectionStateChanged(state) => self.on_transport_state(state),
            PeerEvent::IceCandidate(Some(candidate)) => {
                if self.state.has_peer_session() {
                    self.channel.send(&SignalingMessage::candidate(candidate));
                } else {
                    debug!("dropped local candidate in state {}", self.state);
                }
            }
            PeerEvent::IceCandidate(None) => debug!("local candidate gathering complete"),
            PeerEvent::Track(media) => {
                info!("remote {:?} track available", media.kind());
                if self.remote_media_tx.send(media).is_err() {
                    debug!("no consumer for remote media");
                }
            }
        }
    }

    /// Releases the peer session and the channel. Safe to call repeatedly and
    /// before any peer session exists.
    pub async fn teardown(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(mut peer) = self.peer.take() {
            if let Err(err) = peer.close().await {
                warn!("failed to close peer session: {:#}", err);
            }
        }
        self.peer_events_rx.close();
        self.channel.close();
        self.tracker.on_channel_closed();
        self.state = CoordinatorState::Terminated;
        info!("session terminated");
    }

    fn on_channel_opened(&mut self) {
        if self.state != CoordinatorState::Idle {
            debug!("ignored channel open in state {}", self.state);
            return;
        }
        self.channel.send(&SignalingMessage::IceServersRequest);
        self.state = CoordinatorState::AwaitingIceServers;
        debug!("requested ICE servers");
    }

    async fn on_message(&mut self, msg: SignalingMessage) {
        debug!("received {} in state {}", msg.msg_type(), self.state);
        match msg {
            SignalingMessage::IceServersResponse { ice_servers } => {
                self.on_ice_servers(ice_servers).await
            }
            SignalingMessage::IceServersError { error } => {
                warn!("broker could not provide ICE servers: {}", error)
            }
            SignalingMessage::SdpAnswer { data } => self.on_answer(data.into()).await,
            SignalingMessage::IceCandidateReply { data } => {
                if let Err(err) = self.add_remote_candidate(data).await {
                    warn!("dropped remote candidate: {:#}", err);
                }
            }
            SignalingMessage::Unknown => debug!("ignored message of unknown type"),
            SignalingMessage::IceServersRequest
            | SignalingMessage::SdpOffer { .. }
            | SignalingMessage::IceCandidate { .. } => {
                debug!("ignored broker-bound {} message", msg.msg_type())
            }
        }
    }

    async fn on_ice_servers(&mut self, ice_servers: Vec<IceServer>) {
        if self.peer_created {
            warn!("ignored ICE servers: {}", SessionError::PeerSessionExists);
            return;
        }
        if self.state != CoordinatorState::AwaitingIceServers {
            warn!("ignored ICE servers in state {}", self.state);
            return;
        }
        info!("received {} ICE server(s)", ice_servers.len());
        self.peer_created = true;
        self.ice_servers_tx.send_replace(ice_servers.clone());

        let peer = match self
            .factory
            .create(&ice_servers, self.peer_events_tx.clone())
            .await
        {
            Ok(peer) => peer,
            Err(err) => {
                error!("failed to create peer session: {:#}", err);
                self.state = CoordinatorState::Failed;
                return;
            }
        };
        self.peer = Some(peer);
        if let Err(err) = self.send_offer().await {
            error!("failed to send offer: {:#}", err);
        }
        self.state = CoordinatorState::Negotiating;
    }

    async fn send_offer(&mut self) -> Result<()> {
        let peer = self.peer.as_mut().ok_or(SessionError::NoPeerSession)?;
        if self.offer_created {
            debug!("offer already created");
            return Ok(());
        }
        self.offer_created = true;
        let offer = peer
            .create_offer(self.directions)
            .await
            .context("Failed to create offer")?;
        peer.set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        self.channel.send(&SignalingMessage::offer(offer));
        info!("sent offer");
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if self.state != CoordinatorState::Negotiating {
            warn!("ignored answer in state {}", self.state);
            return;
        }
        let Some(peer) = self.peer.as_mut() else {
            warn!("ignored answer: {}", SessionError::NoPeerSession);
            return;
        };
        self.remote_description_attempted = true;
        match peer.set_remote_description(answer).await {
            Ok(()) => {
                info!("applied remote answer");
                self.state = CoordinatorState::Active;
            }
            Err(err) => warn!("failed to apply remote description: {:#}", err),
        }
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let peer = self.peer.as_mut().ok_or(SessionError::NoPeerSession)?;
        if !self.state.has_peer_session() {
            debug!("ignored remote candidate in state {}", self.state);
            return Ok(());
        }
        if !self.remote_description_attempted {
            return Err(SessionError::MissingRemoteDescription.into());
        }
        peer.add_remote_candidate(candidate)
            .await
            .context("Failed to add remote candidate")?;
        trace!("added remote candidate");
        Ok(())
    }

    fn on_transport_state(&mut self, state: PeerConnectionState) {
        info!("peer connection state: {}", state);
        self.tracker.on_transport_state(state);
        if state == PeerConnectionState::Failed
            && matches!(
                self.state,
                CoordinatorState::AwaitingIceServers
                    | CoordinatorState::Negotiating
                    | CoordinatorState::Active
            )
        {
            error!("peer transport failed; a new session is required");
            self.state = CoordinatorState::Failed;
        }
    }
}
