//! In-process stand-ins for the capture device, the peer connection and the hub.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};
use tokio_tungstenite::WebSocketStream;

use doorline_common::{IceCandidateInit, SessionDescription, SignalMessage};

use crate::error::AcquisitionError;
use crate::media::{CaptureBackend, LocalStream, LocalTrack, MediaConstraints};
use crate::peer::{PeerConnection, PeerEvent, PeerEventSink, PeerFactory};
use crate::signaling::{LinkEvent, SignalingLink};
use crate::types::{MediaView, RemoteTrack, SignalingState};

pub struct FakeCapture {
    supported: bool,
    opened: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    failure: Mutex<Option<AcquisitionError>>,
    streams: Mutex<Vec<LocalStream>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            supported: true,
            opened: AtomicUsize::new(0),
            gate: Mutex::new(None),
            failure: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Holds every later `open` until the returned handle is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_next(&self, err: AcquisitionError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    /// Every stream handed out so far.
    pub fn streams(&self) -> Vec<LocalStream> {
        self.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, AcquisitionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let failure = self.failure.lock().unwrap().take();
        if let Some(err) = failure {
            return Err(err);
        }
        let stream = LocalStream::from_constraints(constraints)?;
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

#[derive(Default)]
struct FakePeerState {
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidateInit>,
    senders: Vec<String>,
    closed: bool,
    reject_candidates: bool,
    reject_answers: bool,
}

pub struct FakePeer {
    sink: PeerEventSink,
    fail_offers: bool,
    state: Mutex<FakePeerState>,
}

impl FakePeer {
    pub fn emit(&self, event: PeerEvent) {
        self.sink.emit(event);
    }

    pub fn local_descriptions(&self) -> usize {
        self.state.lock().unwrap().local.len()
    }

    pub fn remote_descriptions(&self) -> usize {
        self.state.lock().unwrap().remote.len()
    }

    pub fn candidates(&self) -> Vec<IceCandidateInit> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn senders(&self) -> Vec<String> {
        self.state.lock().unwrap().senders.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn reject_candidates(&self, reject: bool) {
        self.state.lock().unwrap().reject_candidates = reject;
    }

    pub fn reject_answers(&self, reject: bool) {
        self.state.lock().unwrap().reject_answers = reject;
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.fail_offers {
            return Err(anyhow!("offer generation failed"));
        }
        Ok(SessionDescription::offer(format!(
            "v=0\r\na=door-offer:{}\r\n",
            self.sink.generation()
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.lock().unwrap().local.push(desc);
        self.sink
            .emit(PeerEvent::SignalingStateChanged(SignalingState::HaveLocalOffer));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.reject_answers {
                return Err(anyhow!("malformed remote description"));
            }
            state.remote.push(desc);
        }
        self.sink
            .emit(PeerEvent::SignalingStateChanged(SignalingState::Stable));
        Ok(())
    }

    async fn has_local_description(&self) -> bool {
        !self.state.lock().unwrap().local.is_empty()
    }

    async fn has_remote_description(&self) -> bool {
        !self.state.lock().unwrap().remote.is_empty()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.reject_candidates {
            return Err(anyhow!("invalid candidate {}", candidate.candidate));
        }
        if state.remote.is_empty() {
            return Err(anyhow!("remote description not set"));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.state.lock().unwrap().senders.push(track.id().to_string());
        Ok(())
    }

    async fn sender_count(&self) -> usize {
        self.state.lock().unwrap().senders.len()
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail_creates: AtomicBool,
    fail_offers: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created connection.
    pub fn last(&self) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer created yet")
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Connections created from now on fail to produce an offer.
    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(anyhow!("peer connection unavailable"));
        }
        let peer = Arc::new(FakePeer {
            sink: events,
            fail_offers: self.fail_offers.load(Ordering::SeqCst),
            state: Mutex::new(FakePeerState::default()),
        });
        self.peers.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer as Arc<dyn PeerConnection>)
    }
}

/// What the controller has pushed to the view.
#[derive(Debug, Default, Clone)]
pub struct ViewLog {
    pub preview: Option<String>,
    pub remote: Option<RemoteTrack>,
    pub preview_updates: usize,
}

#[derive(Clone, Default)]
pub struct RecordingView {
    log: Arc<Mutex<ViewLog>>,
}

impl RecordingView {
    pub fn snapshot(&self) -> ViewLog {
        self.log.lock().unwrap().clone()
    }
}

impl MediaView for RecordingView {
    fn show_preview(&mut self, stream: Option<&LocalStream>) {
        let mut log = self.log.lock().unwrap();
        log.preview = stream.map(|s| s.id().to_string());
        log.preview_updates += 1;
    }

    fn attach_remote(&mut self, track: RemoteTrack) {
        self.log.lock().unwrap().remote = Some(track);
    }

    fn detach_remote(&mut self) {
        self.log.lock().unwrap().remote = None;
    }
}

/// The hub's end of an in-memory signaling link.
pub struct Hub {
    ws: WebSocketStream<DuplexStream>,
}

impl Hub {
    pub async fn send(&mut self, msg: &SignalMessage) {
        self.send_raw(&msg.to_json().unwrap()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    /// Next message from the door; panics after two seconds of silence.
    pub async fn recv(&mut self) -> SignalMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for the door")
                .expect("link ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = frame {
                return SignalMessage::from_json(&text).unwrap();
            }
        }
    }

    /// Next message from the door, if one arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<SignalMessage> {
        loop {
            match tokio::time::timeout(wait, self.ws.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    return Some(SignalMessage::from_json(&text).unwrap())
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// A door-side link wired to a [`Hub`] over an in-memory pipe.
pub async fn hub_pair() -> (SignalingLink, mpsc::UnboundedReceiver<LinkEvent>, Hub) {
    let (door_io, hub_io) = tokio::io::duplex(64 * 1024);
    let door_ws = WebSocketStream::from_raw_socket(door_io, Role::Client, None).await;
    let hub_ws = WebSocketStream::from_raw_socket(hub_io, Role::Server, None).await;
    let (link, events) = SignalingLink::attach(door_ws);
    (link, events, Hub { ws: hub_ws })
}
