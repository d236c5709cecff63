mod local_channel;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    select, spawn,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use super::SignalingMessage;

pub use local_channel::{create_local_channel, LocalBroker};

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message(SignalingMessage),
    Error(String),
    Closed,
}

fn parse_frame(text: &str) -> ChannelEvent {
    match SignalingMessage::from_json(text) {
        Ok(msg) => ChannelEvent::Message(msg),
        Err(err) => ChannelEvent::Error(format!("malformed frame: {}", err)),
    }
}

/// Duplex message channel to the negotiation broker.
///
/// The transport runs in its own task and reports everything it observes as a
/// [`ChannelEvent`]. Outgoing frames are handed to that task through a queue,
/// so sending never blocks the caller.
pub struct SignalingChannel {
    outgoing_tx: Option<UnboundedSender<String>>,
    event_rx: UnboundedReceiver<ChannelEvent>,
    open: bool,
    closed: bool,
}

impl SignalingChannel {
    fn new(outgoing_tx: UnboundedSender<String>, event_rx: UnboundedReceiver<ChannelEvent>) -> Self {
        Self {
            outgoing_tx: Some(outgoing_tx),
            event_rx,
            open: false,
            closed: false,
        }
    }

    /// Starts connecting to `endpoint` in the background. The endpoint is used
    /// verbatim; credentials and device identifiers are expected to be part of
    /// it already. The outcome arrives as `Opened`, or as `Error` followed by
    /// `Closed`.
    pub fn connect(endpoint: String) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        spawn(run_websocket(endpoint, event_tx, outgoing_rx));
        Self::new(outgoing_tx, event_rx)
    }

    pub fn is_open(&self) -> bool {
        self.open && self.outgoing_tx.is_some()
    }

    /// Queues `msg` for the broker. When the channel is not open the message
    /// is dropped and logged.
    pub fn send(&self, msg: &SignalingMessage) {
        let Some(outgoing_tx) = self.outgoing_tx.as_ref().filter(|_| self.open) else {
            warn!("signaling channel is not open, dropped {}", msg.msg_type());
            return;
        };
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to serialize {}: {}", msg.msg_type(), err);
                return;
            }
        };
        trace!("send {}", text);
        if outgoing_tx.send(text).is_err() {
            warn!("signaling transport is gone, dropped {}", msg.msg_type());
        }
    }

    /// Next lifecycle or message event, in arrival order. `Closed` is reported
    /// once; afterwards this returns `None`.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        let event = self.event_rx.recv().await.unwrap_or(ChannelEvent::Closed);
        match &event {
            ChannelEvent::Opened => self.open = true,
            ChannelEvent::Closed => {
                self.open = false;
                self.closed = true;
                self.outgoing_tx = None;
            }
            ChannelEvent::Message(_) | ChannelEvent::Error(_) => {}
        }
        Some(event)
    }

    /// Releases the transport. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        self.open = false;
        if self.outgoing_tx.take().is_some() {
            debug!("signaling channel closed");
        }
    }
}

async fn run_websocket(
    endpoint: String,
    event_tx: UnboundedSender<ChannelEvent>,
    mut outgoing_rx: UnboundedReceiver<String>,
) {
    let ws_stream = match connect_async(endpoint.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(err) => {
            let _ = event_tx.send(ChannelEvent::Error(format!("connect failed: {}", err)));
            let _ = event_tx.send(ChannelEvent::Closed);
            return;
        }
    };
    info!("signaling channel connected");
    let _ = event_tx.send(ChannelEvent::Opened);

    let (mut write, mut read) = ws_stream.split();
    loop {
        select! {
            outgoing = outgoing_rx.recv() => {
                let Some(text) = outgoing else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    let _ = event_tx.send(ChannelEvent::Error(format!("send failed: {}", err)));
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        trace!("recv {}", text);
                        let _ = event_tx.send(parse_frame(&text));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("broker closed the channel: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        let _ = event_tx.send(ChannelEvent::Error(format!("receive failed: {}", err)));
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    let _ = event_tx.send(ChannelEvent::Closed);
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    #[tokio::test]
    async fn test_send_before_open_is_dropped() {
        let (channel, mut broker) = create_local_channel();
        channel.send(&SignalingMessage::IceServersRequest);
        assert!(broker.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (mut channel, broker) = create_local_channel();
        broker.open();
        broker.deliver(&SignalingMessage::IceServersError {
            error: "first".to_owned(),
        });
        broker.deliver(&SignalingMessage::IceServersError {
            error: "second".to_owned(),
        });

        assert_eq!(channel.recv().await, Some(ChannelEvent::Opened));
        let Some(ChannelEvent::Message(SignalingMessage::IceServersError { error })) =
            channel.recv().await
        else {
            panic!("unexpected event");
        };
        assert_eq!(error, "first");
        let Some(ChannelEvent::Message(SignalingMessage::IceServersError { error })) =
            channel.recv().await
        else {
            panic!("unexpected event");
        };
        assert_eq!(error, "second");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_an_error_event() {
        let (mut channel, broker) = create_local_channel();
        broker.open();
        broker.deliver_text("{not json");
        assert_eq!(channel.recv().await, Some(ChannelEvent::Opened));
        assert!(matches!(channel.recv().await, Some(ChannelEvent::Error(_))));
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut channel, mut broker) = create_local_channel();
        broker.open();
        assert_eq!(channel.recv().await, Some(ChannelEvent::Opened));
        channel.close();
        channel.close();
        assert!(!channel.is_open());
        channel.send(&SignalingMessage::IceServersRequest);
        assert!(broker.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_is_reported_once() {
        let (mut channel, broker) = create_local_channel();
        broker.open();
        broker.close();
        assert_eq!(channel.recv().await, Some(ChannelEvent::Opened));
        assert_eq!(channel.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_broker_reads_as_closed() {
        let (mut channel, broker) = create_local_channel();
        drop(broker);
        assert_eq!(channel.recv().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_error_then_closed() {
        let mut channel = SignalingChannel::connect("ws://127.0.0.1:1/".to_owned());
        assert!(matches!(channel.recv().await, Some(ChannelEvent::Error(_))));
        assert_eq!(channel.recv().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn test_websocket_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let Some(Ok(Message::Text(request))) = ws.next().await else {
                panic!("expected a text frame");
            };
            for text in [
                r#"{"type":"ice_servers_response","iceServers":[]}"#,
                r#"{"type":"keepalive"}"#,
                "{not json",
            ] {
                ws.send(Message::Text(text.to_owned())).await.unwrap();
            }
            ws.close(None).await.unwrap();
            request
        });

        let mut channel = SignalingChannel::connect(format!("ws://{}/", addr));
        assert_eq!(channel.recv().await, Some(ChannelEvent::Opened));
        assert!(channel.is_open());
        channel.send(&SignalingMessage::IceServersRequest);

        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Message(SignalingMessage::IceServersResponse {
                ice_servers: vec![]
            }))
        );
        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Message(SignalingMessage::Unknown))
        );
        assert!(matches!(channel.recv().await, Some(ChannelEvent::Error(_))));
        assert_eq!(channel.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(channel.recv().await, None);
        assert!(!channel.is_open());

        assert_eq!(broker.await.unwrap(), r#"{"type":"ice_servers_request"}"#);
    }
}
