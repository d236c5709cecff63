mod rtc_peer_session;

use std::{fmt, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use derive_new::new;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::track::track_remote::TrackRemote;

use super::signaling::{IceCandidate, IceServer, SessionDescription};

pub use rtc_peer_session::{RtcPeerSession, RtcPeerSessionFactory};

/// Transport-level connection state reported by the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Which media the offer asks the remote side to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, new)]
pub struct MediaDirections {
    pub receive_video: bool,
    pub receive_audio: bool,
}

impl Default for MediaDirections {
    fn default() -> Self {
        Self {
            receive_video: true,
            receive_audio: false,
        }
    }
}

/// Opaque handle to remote media, passed through to the presentation layer.
#[derive(Clone)]
pub struct RemoteMedia {
    kind: MediaKind,
    track_id: String,
    stream_id: String,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteMedia {
    pub fn new(kind: MediaKind, track_id: String, stream_id: String) -> Self {
        Self {
            kind,
            track_id,
            stream_id,
            track: None,
        }
    }

    pub fn from_track(kind: MediaKind, track: Arc<TrackRemote>) -> Self {
        Self {
            kind,
            track_id: track.id(),
            stream_id: track.stream_id(),
            track: Some(track),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("kind", &self.kind)
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[derive(Debug)]
pub enum PeerEvent {
    ConnectionStateChanged(PeerConnectionState),
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<IceCandidate>),
    Track(RemoteMedia),
}

/// One peer connection. Every step may fail; a failed step leaves the
/// session usable.
#[async_trait]
pub trait PeerSession: Send {
    async fn create_offer(&mut self, directions: MediaDirections) -> Result<SessionDescription>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()>;
    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()>;
    /// Releases the connection. Safe to call any number of times.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait PeerSessionFactory: Send {
    async fn create(
        &mut self,
        ice_servers: &[IceServer],
        events: UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerSession>>;
}
