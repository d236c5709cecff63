use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use derive_new::new;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::track_remote::TrackRemote,
};

use crate::session::signaling::{IceCandidate, IceServer, SdpType, SessionDescription};

use super::{
    MediaDirections, MediaKind, PeerConnectionState, PeerEvent, PeerSession, PeerSessionFactory,
    RemoteMedia,
};

fn to_rtc_ice_servers(ice_servers: &[IceServer]) -> Vec<RTCIceServer> {
    ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_session_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn to_peer_connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::Unspecified => return None,
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    })
}

fn to_ice_candidate(candidate: &RTCIceCandidate) -> Result<IceCandidate> {
    let init = candidate.to_json()?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

async fn create_peer_connection(
    ice_servers: &[IceServer],
    ice_failed_timeout: Option<Duration>,
) -> Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let mut setting_engine = SettingEngine::default();
    if ice_failed_timeout.is_some() {
        setting_engine.set_ice_timeouts(None, ice_failed_timeout, None);
    }
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build()
        .new_peer_connection(RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        })
        .await?)
}

#[derive(Clone, Default, new)]
pub struct RtcPeerSessionFactory {
    ice_failed_timeout: Option<Duration>,
}

#[async_trait]
impl PeerSessionFactory for RtcPeerSessionFactory {
    async fn create(
        &mut self,
        ice_servers: &[IceServer],
        events: UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerSession>> {
        let session = RtcPeerSession::new(ice_servers, self.ice_failed_timeout, events).await?;
        Ok(Box::new(session))
    }
}

/// [`PeerSession`] backed by a `webrtc` peer connection.
///
/// Connection callbacks only forward [`PeerEvent`]s, and only while `alive` is
/// set. `close` clears it before releasing the connection, so callbacks that
/// fire during or after shutdown are dropped.
pub struct RtcPeerSession {
    rtc: Arc<RTCPeerConnection>,
    alive: Arc<AtomicBool>,
    transceivers_added: bool,
}

impl Drop for RtcPeerSession {
    fn drop(&mut self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        trace!("drop peer session");
        let rtc = self.rtc.clone();
        // An established connection stays up until it is closed explicitly.
        let close = async move {
            let _ = rtc.close().await;
            trace!("peer connection closed");
        };
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(close);
            return;
        }
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt.block_on(close),
            Err(err) => warn!("failed to close peer connection on drop: {}", err),
        }
    }
}

impl RtcPeerSession {
    pub async fn new(
        ice_servers: &[IceServer],
        ice_failed_timeout: Option<Duration>,
        events: UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let rtc = create_peer_connection(ice_servers, ice_failed_timeout)
            .await
            .context("Failed to create peer connection")?;
        let alive = Arc::new(AtomicBool::new(true));

        {
            let events = events.clone();
            let alive = alive.clone();
            rtc.on_peer_connection_state_change(Box::new(move |state| {
                debug!("on_peer_connection_state_change {}", state);
                if alive.load(Ordering::Acquire) {
                    if let Some(state) = to_peer_connection_state(state) {
                        let _ = events.send(PeerEvent::ConnectionStateChanged(state));
                    }
                }
                Box::pin(async {})
            }));
        }
        {
            let events = events.clone();
            let alive = alive.clone();
            rtc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if alive.load(Ordering::Acquire) {
                    match candidate.as_ref().map(to_ice_candidate).transpose() {
                        Ok(candidate) => {
                            let _ = events.send(PeerEvent::IceCandidate(candidate));
                        }
                        Err(err) => warn!("failed to serialize local candidate: {}", err),
                    }
                }
                Box::pin(async {})
            }));
        }
        {
            let alive = alive.clone();
            rtc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
                if alive.load(Ordering::Acquire) {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        _ => MediaKind::Video,
                    };
                    debug!("on_track {:?} {}", kind, track.id());
                    let _ = events.send(PeerEvent::Track(RemoteMedia::from_track(kind, track)));
                }
                Box::pin(async {})
            }));
        }

        Ok(Self {
            rtc: Arc::new(rtc),
            alive,
            transceivers_added: false,
        })
    }

    async fn add_receive_only_transceivers(&mut self, directions: MediaDirections) -> Result<()> {
        if self.transceivers_added {
            return Ok(());
        }
        let kinds = [
            (directions.receive_video, RTPCodecType::Video),
            (directions.receive_audio, RTPCodecType::Audio),
        ];
        for (_, kind) in kinds.into_iter().filter(|(wanted, _)| *wanted) {
            self.rtc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        self.transceivers_added = true;
        Ok(())
    }
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn create_offer(&mut self, directions: MediaDirections) -> Result<SessionDescription> {
        self.add_receive_only_transceivers(directions)
            .await
            .context("Failed to add transceivers")?;
        let offer = self.rtc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_session_description(desc)?;
        self.rtc.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_session_description(desc)?;
        self.rtc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.rtc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.rtc.close().await?;
        debug!("peer connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        sync::mpsc,
        time::{sleep, timeout},
    };

    use super::*;

    #[test]
    fn test_ice_servers_are_used_verbatim() {
        let servers = to_rtc_ice_servers(&[
            IceServer::new(vec!["stun:stun.example.com:3478".to_owned()]),
            IceServer::with_credentials(
                vec![
                    "turn:turn.example.com:3478?transport=udp".to_owned(),
                    "turn:turn.example.com:3478?transport=tcp".to_owned(),
                ],
                "user".to_owned(),
                "secret".to_owned(),
            ),
        ]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[0].username, "");
        assert_eq!(servers[1].urls.len(), 2);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_unspecified_state_is_not_reported() {
        assert_eq!(
            to_peer_connection_state(RTCPeerConnectionState::Unspecified),
            None
        );
        assert_eq!(
            to_peer_connection_state(RTCPeerConnectionState::Failed),
            Some(PeerConnectionState::Failed)
        );
    }

    #[tokio::test]
    async fn test_offer_receives_video_only() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut session = RtcPeerSession::new(&[], None, events_tx).await.unwrap();
        let offer = session
            .create_offer(MediaDirections::default())
            .await
            .unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(!offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("a=recvonly"));
        session.set_local_description(offer).await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_fails() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut session = RtcPeerSession::new(&[], None, events_tx).await.unwrap();
        let result = session
            .add_remote_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".to_owned(),
                sdp_mid: Some("0".to_owned()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .await;
        assert!(result.is_err());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_answer_fails_without_closing() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut session = RtcPeerSession::new(&[], None, events_tx).await.unwrap();
        let offer = session
            .create_offer(MediaDirections::default())
            .await
            .unwrap();
        session.set_local_description(offer).await.unwrap();
        let result = session
            .set_remote_description(SessionDescription::answer("not sdp".to_owned()))
            .await;
        assert!(result.is_err());
        assert!(session.alive.load(Ordering::Acquire));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_events_after_close() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut session = RtcPeerSession::new(&[], None, events_tx).await.unwrap();
        let offer = session
            .create_offer(MediaDirections::default())
            .await
            .unwrap();
        session.set_local_description(offer).await.unwrap();
        timeout(Duration::from_secs(10), async {
            while let Some(event) = events_rx.recv().await {
                if matches!(event, PeerEvent::IceCandidate(None)) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        while events_rx.try_recv().is_ok() {}

        session.close().await.unwrap();
        sleep(Duration::from_millis(300)).await;
        let late: Vec<_> = std::iter::from_fn(|| events_rx.try_recv().ok()).collect();
        assert!(late.is_empty(), "{:?}", late);
    }

    #[test]
    fn test_drop_outside_runtime_closes_connection() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (session, rtc) = rt.block_on(async {
            let (events_tx, _events_rx) = mpsc::unbounded_channel();
            let session = RtcPeerSession::new(&[], None, events_tx).await.unwrap();
            let rtc = session.rtc.clone();
            (session, rtc)
        });
        drop(session);
        assert_eq!(rtc.connection_state(), RTCPeerConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut session = RtcPeerSession::new(&[], None, events_tx).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
    }
}
