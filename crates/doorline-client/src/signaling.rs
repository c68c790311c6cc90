//! WebSocket link to the hub.
//!
//! One writer task drains the outbound queue in order; one reader task
//! decodes frames and forwards them as [`LinkEvent`]s. Malformed frames are
//! logged and dropped here so they never reach the controller. There is no
//! reconnect: a dropped link flips `is_open()` to false and emits a single
//! [`LinkEvent::Closed`].

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage, WebSocketStream};
use tracing::{debug, info, warn};

use doorline_common::SignalMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(SignalMessage),
    Closed,
}

pub struct SignalingLink {
    outbound: Option<mpsc::UnboundedSender<SignalMessage>>,
    open: Arc<watch::Sender<bool>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingLink {
    /// Connects to `url`. The second value carries inbound messages.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("connected to signaling endpoint {}", url);
        Ok(Self::attach(ws_stream))
    }

    /// Runs the link over an established WebSocket.
    pub fn attach<S>(ws: WebSocketStream<S>) -> (Self, mpsc::UnboundedReceiver<LinkEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (open, _) = watch::channel(true);
        let open = Arc::new(open);
        let (mut write, mut read) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_open = Arc::clone(&open);
        let writer_events = inbound_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode {} message: {}", msg.event(), e);
                        continue;
                    }
                };
                debug!("signaling -> {}", msg.event());
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    warn!("failed to send signaling message: {}", e);
                    if writer_open.send_replace(false) {
                        let _ = writer_events.send(LinkEvent::Closed);
                    }
                    return;
                }
            }
            let _ = write.close().await;
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let decoded = match frame {
                    Ok(WsMessage::Text(text)) => SignalMessage::from_json(&text),
                    Ok(WsMessage::Binary(data)) => SignalMessage::from_slice(&data),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("signaling WebSocket error: {}", e);
                        break;
                    }
                };
                match decoded {
                    Ok(msg) => {
                        debug!("signaling <- {}", msg.event());
                        if inbound_tx.send(LinkEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("dropping malformed signaling message: {}", e),
                }
            }
            // Whichever side notices first reports the close.
            if reader_open.send_replace(false) {
                let _ = inbound_tx.send(LinkEvent::Closed);
            }
            info!("signaling link closed");
        });

        let link = Self {
            outbound: Some(outbound_tx),
            open,
            reader,
            writer,
        };
        (link, inbound_rx)
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    pub fn subscribe_open(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }

    /// Queues `msg`. Returns false, without sending, if the link is not open.
    pub fn send(&self, msg: SignalMessage) -> bool {
        if !self.is_open() {
            debug!("signaling link not open; {} not sent", msg.event());
            return false;
        }
        match &self.outbound {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Flushes queued messages, sends a close frame and stops reading.
    pub fn close(&mut self) {
        self.open.send_replace(false);
        // Dropping the sender lets the writer drain and close the socket.
        self.outbound.take();
        self.reader.abort();
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        self.reader.abort();
        if self.outbound.is_some() {
            self.writer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::hub_pair;
    use doorline_common::{IceCandidateInit, SessionDescription};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Never yields a byte and refuses every write.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways_in_order() {
        let (link, mut inbound, mut hub) = hub_pair().await;
        assert!(link.is_open());

        assert!(link.send(SignalMessage::Offer(SessionDescription::offer("v=0\r\n"))));
        assert!(link.send(SignalMessage::Candidate(IceCandidateInit::new("candidate:1"))));
        assert!(matches!(hub.recv().await, SignalMessage::Offer(_)));
        assert!(matches!(hub.recv().await, SignalMessage::Candidate(_)));

        hub.send(&SignalMessage::Bye).await;
        assert_eq!(inbound.recv().await, Some(LinkEvent::Message(SignalMessage::Bye)));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (_link, mut inbound, mut hub) = hub_pair().await;

        hub.send_raw("not json at all").await;
        hub.send_raw(r#"{"event":"ring"}"#).await;
        hub.send_raw(r#"{"event":"answer"}"#).await;
        hub.send(&SignalMessage::Answer(SessionDescription::answer("v=0\r\n")))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .expect("inbound event");
        assert!(matches!(
            event,
            Some(LinkEvent::Message(SignalMessage::Answer(_)))
        ));
    }

    #[tokio::test]
    async fn test_remote_close_flips_open_flag() {
        let (link, mut inbound, hub) = hub_pair().await;
        let mut open = link.subscribe_open();

        hub.close().await;

        assert_eq!(inbound.recv().await, Some(LinkEvent::Closed));
        open.wait_for(|open| !*open).await.unwrap();
        assert!(!link.is_open());
        assert!(!link.send(SignalMessage::Bye));
    }

    #[tokio::test]
    async fn test_close_flushes_and_stops_sending() {
        let (mut link, _inbound, mut hub) = hub_pair().await;

        assert!(link.send(SignalMessage::Bye));
        link.close();

        assert_eq!(hub.recv().await, SignalMessage::Bye);
        assert!(!link.is_open());
        assert!(!link.send(SignalMessage::Bye));
    }

    #[tokio::test]
    async fn test_write_failure_reports_closed_once() {
        let ws = WebSocketStream::from_raw_socket(BrokenPipe, Role::Client, None).await;
        let (link, mut inbound) = SignalingLink::attach(ws);
        let mut open = link.subscribe_open();

        assert!(link.send(SignalMessage::Bye));

        let event = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .expect("closed event");
        assert_eq!(event, Some(LinkEvent::Closed));
        open.wait_for(|open| !*open).await.unwrap();
        assert!(!link.send(SignalMessage::Bye));
        assert!(tokio::time::timeout(Duration::from_millis(100), inbound.recv())
            .await
            .is_err());
    }
}
