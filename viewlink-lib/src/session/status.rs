use std::fmt;

use tokio::sync::watch;

use super::peer_session::PeerConnectionState;

/// The single status value exposed to the presentation layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl From<PeerConnectionState> for ConnectionStatus {
    fn from(state: PeerConnectionState) -> Self {
        match state {
            PeerConnectionState::New | PeerConnectionState::Connecting => Self::Connecting,
            PeerConnectionState::Connected => Self::Connected,
            PeerConnectionState::Disconnected | PeerConnectionState::Closed => Self::Disconnected,
            PeerConnectionState::Failed => Self::Failed,
        }
    }
}

/// Derives [`ConnectionStatus`] from the latest transport state and whether
/// the signaling channel has closed, and publishes every change.
pub struct SessionStateTracker {
    last_transport_state: Option<PeerConnectionState>,
    channel_closed: bool,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Default for SessionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateTracker {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            last_transport_state: None,
            channel_closed: false,
            status_tx,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.channel_closed {
            return ConnectionStatus::Disconnected;
        }
        self.last_transport_state
            .map(ConnectionStatus::from)
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn on_transport_state(&mut self, state: PeerConnectionState) {
        self.last_transport_state = Some(state);
        self.publish();
    }

    pub fn on_channel_closed(&mut self) {
        self.channel_closed = true;
        self.publish();
    }

    fn publish(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PeerConnectionState::*;

    fn replay(states: &[PeerConnectionState], channel_closed: bool) -> ConnectionStatus {
        let mut tracker = SessionStateTracker::new();
        states.iter().for_each(|&state| tracker.on_transport_state(state));
        if channel_closed {
            tracker.on_channel_closed();
        }
        tracker.status()
    }

    #[test]
    fn test_initial_status_is_disconnected() {
        assert_eq!(
            SessionStateTracker::new().status(),
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_transport_states_map_one_to_one() {
        assert_eq!(replay(&[New], false), ConnectionStatus::Connecting);
        assert_eq!(replay(&[Connecting], false), ConnectionStatus::Connecting);
        assert_eq!(replay(&[Connected], false), ConnectionStatus::Connected);
        assert_eq!(replay(&[Disconnected], false), ConnectionStatus::Disconnected);
        assert_eq!(replay(&[Closed], false), ConnectionStatus::Disconnected);
        assert_eq!(replay(&[Failed], false), ConnectionStatus::Failed);
    }

    #[test]
    fn test_latest_state_wins() {
        assert_eq!(
            replay(&[New, Connecting, Connected, Failed], false),
            ConnectionStatus::Failed
        );
        assert_eq!(
            replay(&[Connecting, Disconnected, Connected], false),
            ConnectionStatus::Connected
        );
    }

    #[test]
    fn test_channel_close_forces_disconnected() {
        assert_eq!(replay(&[Connected], true), ConnectionStatus::Disconnected);
        assert_eq!(replay(&[Failed], true), ConnectionStatus::Disconnected);
        assert_eq!(replay(&[], true), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let sequence = [New, Connecting, Connected, Disconnected, Connecting, Connected];
        assert_eq!(replay(&sequence, false), replay(&sequence, false));
    }

    #[test]
    fn test_subscribers_see_changes() {
        let mut tracker = SessionStateTracker::new();
        let rx = tracker.subscribe();
        tracker.on_transport_state(Connecting);
        assert_eq!(*rx.borrow(), ConnectionStatus::Connecting);
        tracker.on_transport_state(Failed);
        assert_eq!(*rx.borrow(), ConnectionStatus::Failed);
        tracker.on_channel_closed();
        assert_eq!(*rx.borrow(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_unchanged_status_is_not_republished() {
        let mut tracker = SessionStateTracker::new();
        let mut rx = tracker.subscribe();
        tracker.on_transport_state(New);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        tracker.on_transport_state(Connecting);
        assert!(!rx.has_changed().unwrap());
    }
}
