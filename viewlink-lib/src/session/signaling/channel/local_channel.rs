use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::session::signaling::SignalingMessage;

use super::{parse_frame, ChannelEvent, SignalingChannel};

/// Pairs a [`SignalingChannel`] with an in-process broker end. Frames cross the
/// pair as JSON text, the same way they cross a WebSocket.
pub fn create_local_channel() -> (SignalingChannel, LocalBroker) {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        SignalingChannel::new(outgoing_tx, event_rx),
        LocalBroker {
            event_tx,
            outgoing_rx,
        },
    )
}

pub struct LocalBroker {
    event_tx: UnboundedSender<ChannelEvent>,
    outgoing_rx: UnboundedReceiver<String>,
}

impl LocalBroker {
    fn push(&self, event: ChannelEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("local channel is gone");
        }
    }

    pub fn open(&self) {
        self.push(ChannelEvent::Opened);
    }

    pub fn deliver(&self, msg: &SignalingMessage) {
        match msg.to_json() {
            Ok(text) => self.deliver_text(&text),
            Err(err) => warn!("failed to serialize {}: {}", msg.msg_type(), err),
        }
    }

    pub fn deliver_text(&self, text: &str) {
        self.push(parse_frame(text));
    }

    pub fn fail(&self, description: &str) {
        self.push(ChannelEvent::Error(description.to_owned()));
    }

    pub fn close(&self) {
        self.push(ChannelEvent::Closed);
    }

    /// Next frame sent by the client, or `None` once the client released the
    /// channel.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            let text = self.outgoing_rx.recv().await?;
            if let Some(msg) = Self::decode(&text) {
                return Some(msg);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        while let Ok(text) = self.outgoing_rx.try_recv() {
            if let Some(msg) = Self::decode(&text) {
                return Some(msg);
            }
        }
        None
    }

    /// True once the client side has released its sender.
    pub fn is_released(&self) -> bool {
        self.outgoing_rx.is_closed()
    }

    fn decode(text: &str) -> Option<SignalingMessage> {
        match SignalingMessage::from_json(text) {
            Ok(msg) => Some(msg),
            Err(err) => {
                warn!("client sent a malformed frame: {}", err);
                None
            }
        }
    }
}
