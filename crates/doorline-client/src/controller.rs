//! The call state machine.
//!
//! A [`CallController`] is an actor: one task owns the signaling link, the
//! capture stream and the peer session, and processes user commands, hub
//! messages, peer events and media completions one at a time. Callers talk
//! to it through a cloneable [`CallHandle`] and watch [`CallStatus`].
//!
//! Every cleanup bumps the generation. Media acquisition runs off the actor
//! and reports back tagged with the generation it started at, so a result
//! that arrives after a hangup or a remote bye is stopped instead of
//! resurrecting the call.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use doorline_common::{IceCandidateInit, SessionDescription, SignalMessage};

use crate::error::{AcquisitionError, CallError, PreconditionError};
use crate::media::{CaptureBackend, LocalStream, MediaSource};
use crate::peer::{PeerEvent, PeerFactory, PeerSession, SessionEvent};
use crate::signaling::{LinkEvent, SignalingLink};
use crate::types::{CallStatus, ControllerOptions, IceConnectionState, MediaView, SignalingState};

const COMMAND_QUEUE: usize = 32;

enum Command {
    Ring(oneshot::Sender<Result<(), CallError>>),
    Hangup(oneshot::Sender<()>),
    SetPreview(bool, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

enum Internal {
    MediaAcquired {
        generation: u64,
        result: Result<LocalStream, AcquisitionError>,
    },
}

struct PendingRing {
    generation: u64,
    reply: oneshot::Sender<Result<(), CallError>>,
}

/// Collaborators injected into the controller.
pub struct CallDeps {
    pub capture: Arc<dyn CaptureBackend>,
    pub peers: Arc<dyn PeerFactory>,
    pub view: Box<dyn MediaView>,
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    /// Starts a call. Resolves once the offer is on the wire.
    pub async fn ring(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Ring(tx))
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    pub async fn hangup(&self) {
        self.request(Command::Hangup).await;
    }

    pub async fn set_preview(&self, on: bool) {
        self.request(|tx| Command::SetPreview(on, tx)).await;
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Releases everything without telling the hub. Later commands fail with `Stopped`.
    pub async fn shutdown(&self) {
        self.request(Command::Shutdown).await;
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct CallController {
    link: SignalingLink,
    media: MediaSource,
    peers: Arc<dyn PeerFactory>,
    view: Box<dyn MediaView>,
    options: ControllerOptions,
    session: Option<PeerSession>,
    generation: u64,
    pending_ring: Option<PendingRing>,
    preview: bool,
    peer_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    status: CallStatus,
    status_tx: watch::Sender<CallStatus>,
}

impl CallController {
    /// Opens the first peer session and spawns the controller task.
    pub async fn start(
        link: SignalingLink,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        deps: CallDeps,
        options: ControllerOptions,
    ) -> Result<CallHandle> {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let generation = 1;
        let session = PeerSession::open(deps.peers.as_ref(), generation, peer_tx.clone()).await?;

        let status = CallStatus {
            link_open: link.is_open(),
            preview: options.show_preview,
            ..Default::default()
        };
        let (status_tx, status_rx) = watch::channel(status.clone());

        let controller = Self {
            link,
            media: MediaSource::new(deps.capture, options.secure_context),
            peers: deps.peers,
            view: deps.view,
            preview: options.show_preview,
            options,
            session: Some(session),
            generation,
            pending_ring: None,
            peer_tx,
            internal_tx,
            status,
            status_tx,
        };
        tokio::spawn(controller.run(command_rx, link_events, peer_rx, internal_rx));
        info!("call controller started");

        Ok(CallHandle {
            commands: command_tx,
            status: status_rx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut peer_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut link_events_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.teardown().await;
                        internal.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all call handles dropped");
                        self.teardown().await;
                        internal.close();
                        break;
                    }
                },
                event = link_events.recv(), if link_events_open => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => link_events_open = false,
                },
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                Some(done) = internal.recv() => self.handle_internal(done).await,
            }
            self.publish();
        }
        // Captures that finished before the channel closed are stale by now.
        while let Ok(done) = internal.try_recv() {
            self.handle_internal(done).await;
        }
        info!("call controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Ring(reply) => self.ring(reply).await,
            Command::Hangup(reply) => {
                self.hangup().await;
                self.publish();
                let _ = reply.send(());
            }
            Command::SetPreview(on, reply) => {
                self.set_preview(on);
                self.publish();
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn call_in_progress(&self) -> bool {
        self.pending_ring.is_some() || self.status.ringing || self.status.connected
    }

    fn check_ring(&self) -> Result<(), PreconditionError> {
        if self.call_in_progress() {
            return Err(PreconditionError::CallInProgress);
        }
        if !self.media.secure_context() {
            return Err(PreconditionError::InsecureContext);
        }
        if !self.media.is_supported() {
            return Err(PreconditionError::Unsupported);
        }
        if !self.link.is_open() {
            return Err(PreconditionError::LinkNotOpen);
        }
        if self.session.is_none() {
            return Err(PreconditionError::NoPeerSession);
        }
        Ok(())
    }

    async fn ring(&mut self, reply: oneshot::Sender<Result<(), CallError>>) {
        self.status.last_error = None;
        if let Err(e) = self.check_ring() {
            warn!("ring rejected: {}", e);
            self.status.last_error = Some(e.to_string());
            self.reply_ring(reply, Err(e.into()));
            return;
        }

        if self.media.is_active() {
            self.finish_ring(reply).await;
            return;
        }

        let pending = match self.media.begin_acquire(&self.options.constraints) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("ring failed: {}", e);
                self.status.last_error = Some(e.to_string());
                self.reply_ring(reply, Err(e.into()));
                return;
            }
        };

        let generation = self.generation;
        self.pending_ring = Some(PendingRing { generation, reply });
        info!(generation, "ring requested; acquiring local media");

        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = pending.run().await;
            if let Err(SendError(Internal::MediaAcquired {
                result: Ok(stream), ..
            })) = internal_tx.send(Internal::MediaAcquired { generation, result })
            {
                debug!(stream = %stream.id(), "controller gone; stopping capture stream");
                stream.stop();
            }
        });
    }

    async fn handle_internal(&mut self, done: Internal) {
        match done {
            Internal::MediaAcquired { generation, result } => {
                let current = matches!(&self.pending_ring, Some(p) if p.generation == generation);
                if !current {
                    if let Ok(stream) = result {
                        debug!(generation, stream = %stream.id(), "discarding late capture stream");
                        stream.stop();
                    }
                    return;
                }
                let Some(pending) = self.pending_ring.take() else {
                    return;
                };
                match result {
                    Ok(stream) => {
                        self.media.adopt(stream);
                        if self.preview {
                            self.view.show_preview(self.media.active());
                        }
                        self.finish_ring(pending.reply).await;
                    }
                    Err(e) => {
                        warn!("media acquisition failed: {}", e);
                        self.status.last_error = Some(e.to_string());
                        self.reply_ring(pending.reply, Err(e.into()));
                    }
                }
            }
        }
    }

    /// Adds tracks, creates the offer and sends it. Any failure unwinds the attempt.
    async fn finish_ring(&mut self, reply: oneshot::Sender<Result<(), CallError>>) {
        match self.send_offer().await {
            Ok(()) => {
                self.status.ringing = true;
                info!(generation = self.generation, "ringing");
                self.reply_ring(reply, Ok(()));
            }
            Err(e) => {
                warn!("ring failed: {}", e);
                self.cleanup().await;
                self.status.last_error = Some(e.to_string());
                self.reply_ring(reply, Err(e));
            }
        }
    }

    /// Publishes first so the caller observes the outcome in `status()`.
    fn reply_ring(
        &mut self,
        reply: oneshot::Sender<Result<(), CallError>>,
        result: Result<(), CallError>,
    ) {
        self.publish();
        let _ = reply.send(result);
    }

    async fn send_offer(&mut self) -> Result<(), CallError> {
        let stream = self
            .media
            .active()
            .cloned()
            .ok_or_else(|| AcquisitionError::DeviceError("no active capture stream".into()))?;
        let session = self
            .session
            .as_mut()
            .ok_or(PreconditionError::NoPeerSession)?;

        session
            .add_local_tracks(&stream)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        let offer = session
            .create_offer()
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;

        if !self.link.send(SignalMessage::Offer(offer)) {
            return Err(PreconditionError::LinkNotOpen.into());
        }
        Ok(())
    }

    async fn hangup(&mut self) {
        if self.status.ringing || self.status.connected {
            info!(generation = self.generation, "hanging up");
            if !self.link.send(SignalMessage::Bye) {
                debug!("bye not sent; signaling link is closed");
            }
        }
        self.cleanup().await;
    }

    fn set_preview(&mut self, on: bool) {
        self.preview = on;
        if on {
            self.view.show_preview(self.media.active());
        } else {
            self.view.show_preview(None);
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Message(SignalMessage::Answer(answer)) => self.on_answer(answer).await,
            LinkEvent::Message(SignalMessage::Candidate(candidate)) => {
                self.on_remote_candidate(candidate).await
            }
            LinkEvent::Message(SignalMessage::Bye) => {
                info!(generation = self.generation, "remote hung up");
                self.cleanup().await;
            }
            LinkEvent::Message(SignalMessage::Offer(_)) => {
                warn!("ignoring remote offer; the door only places calls");
            }
            LinkEvent::Closed => {
                warn!("signaling link closed");
                self.status.link_open = false;
            }
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if !self.status.ringing && !self.status.connected {
            warn!("answer received with no call in progress; ignored");
            return;
        }
        if let Some(session) = self.session.as_mut() {
            let outcome = session.apply_remote_answer(answer).await;
            debug!(?outcome, "remote answer processed");
            self.status.negotiation_failures = session.candidate_failures();
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidateInit) {
        if !self.status.ringing && !self.status.connected {
            debug!("remote candidate with no call in progress dropped");
            return;
        }
        if let Some(session) = self.session.as_mut() {
            let outcome = session.apply_remote_candidate(candidate).await;
            debug!(?outcome, "remote candidate processed");
            self.status.negotiation_failures = session.candidate_failures();
        }
    }

    async fn handle_peer_event(&mut self, event: SessionEvent) {
        let current = self.session.as_ref().map(PeerSession::generation);
        if current != Some(event.generation) {
            debug!(generation = event.generation, "stale peer event ignored");
            return;
        }

        match event.event {
            PeerEvent::SignalingStateChanged(state) => {
                debug!(%state, "signaling state changed");
                self.status.signaling_state = state;
            }
            PeerEvent::IceConnectionStateChanged(state) => self.on_ice_state(state).await,
            PeerEvent::RemoteTrackReceived(track) => {
                info!(kind = %track.kind, id = %track.id, "remote track received");
                self.status.remote_media = true;
                self.view.attach_remote(track);
            }
            PeerEvent::LocalCandidate(candidate) => {
                if !self.link.send(SignalMessage::Candidate(candidate)) {
                    debug!("local candidate not sent; signaling link is closed");
                }
            }
        }
    }

    async fn on_ice_state(&mut self, state: IceConnectionState) {
        info!(%state, "ICE connection state changed");
        self.status.ice_state = state;
        if state.is_live() {
            self.status.connected = true;
            self.status.ringing = false;
        } else if state.is_terminal() {
            self.cleanup().await;
            self.status.last_error = Some(format!("transport failure: ICE {}", state));
        }
    }

    fn is_idle(&self) -> bool {
        self.pending_ring.is_none()
            && !self.media.is_active()
            && !self.status.ringing
            && !self.status.connected
            && !self.status.remote_media
            && self.session.as_ref().is_some_and(PeerSession::is_pristine)
    }

    /// Ends whatever call is in progress and readies a fresh session.
    async fn cleanup(&mut self) {
        if self.is_idle() {
            debug!("cleanup while idle; nothing to do");
            return;
        }
        self.generation += 1;

        if let Some(pending) = self.pending_ring.take() {
            debug!(generation = pending.generation, "cancelling in-flight ring");
            let _ = pending.reply.send(Err(CallError::Cancelled));
        }
        if self.media.release() {
            self.view.show_preview(None);
        }
        if self.status.remote_media {
            self.view.detach_remote();
        }
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.replace_session().await;

        self.status.ringing = false;
        self.status.connected = false;
        self.status.remote_media = false;
        self.status.ice_state = IceConnectionState::default();
        self.status.signaling_state = SignalingState::default();
        self.status.negotiation_failures = 0;
        info!(generation = self.generation, "call reset");
    }

    async fn replace_session(&mut self) {
        let peers = Arc::clone(&self.peers);
        match PeerSession::open(peers.as_ref(), self.generation, self.peer_tx.clone()).await {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                error!("failed to create replacement peer session: {e:#}");
                self.session = None;
            }
        }
    }

    async fn teardown(&mut self) {
        self.generation += 1;
        if let Some(pending) = self.pending_ring.take() {
            let _ = pending.reply.send(Err(CallError::Stopped));
        }
        if self.media.release() {
            self.view.show_preview(None);
        }
        if self.status.remote_media {
            self.view.detach_remote();
        }
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.link.close();

        self.status.ringing = false;
        self.status.connected = false;
        self.status.remote_media = false;
        self.status.ice_state = IceConnectionState::Closed;
        self.status.signaling_state = SignalingState::Closed;
        self.publish();
    }

    fn publish(&mut self) {
        self.status.link_open = self.link.is_open();
        self.status.media_ready = self.media.is_active();
        self.status.preview = self.preview;
        let next = self.status.clone();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
