//! One peer connection per call attempt.
//!
//! [`PeerSession`] wraps a [`PeerConnection`] and enforces the negotiation
//! rules the door relies on: a single offer, a single remote answer, tracks
//! added once, and remote candidates held back until the answer is applied.
//! Connection callbacks are registered once, at construction, through a
//! [`PeerEventSink`]; every event carries the session generation so the
//! controller can drop events from sessions it already replaced.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use doorline_common::{IceCandidateInit, SdpType, SessionDescription};

use crate::error::PeerError;
use crate::media::{LocalStream, LocalTrack};
use crate::types::{IceConnectionState, RemoteTrack, SignalingState};

#[derive(Debug, Clone)]
pub enum PeerEvent {
    SignalingStateChanged(SignalingState),
    IceConnectionStateChanged(IceConnectionState),
    RemoteTrackReceived(RemoteTrack),
    /// A local candidate was gathered and should be trickled to the hub.
    LocalCandidate(IceCandidateInit),
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: PeerEvent,
}

/// Where a connection's callbacks report to.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
    active: Arc<AtomicBool>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> (Self, Subscription) {
        let active = Arc::new(AtomicBool::new(true));
        let sink = Self {
            generation,
            tx,
            active: Arc::clone(&active),
        };
        (sink, Subscription { active })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(SessionEvent {
            generation: self.generation,
            event,
        });
    }
}

/// Unsubscribe handle for a [`PeerEventSink`]. Cancelled on drop.
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The underlying peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn has_local_description(&self) -> bool;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;
    /// Senders that currently carry a track.
    async fn sender_count(&self) -> usize;
    async fn close(&self) -> Result<()>;
}

/// Builds connections and wires their callbacks to `events`.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// A remote description was already set; nothing changed.
    Duplicate,
    /// No local offer exists yet; nothing changed.
    Unexpected,
    /// The connection refused the description; logged and swallowed.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Held until the remote answer is applied.
    Buffered,
    /// Session already closed.
    Dropped,
    /// The connection refused the candidate; logged and swallowed.
    Rejected,
}

pub struct PeerSession {
    generation: u64,
    conn: Arc<dyn PeerConnection>,
    subscription: Subscription,
    pending_candidates: Vec<IceCandidateInit>,
    offered: bool,
    remote_applied: bool,
    tracks_added: bool,
    closed: bool,
    failures: u32,
}

impl PeerSession {
    pub async fn open(
        factory: &dyn PeerFactory,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let (sink, subscription) = PeerEventSink::new(generation, events);
        let conn = factory.create(sink).await?;
        debug!(generation, "peer session opened");
        Ok(Self {
            generation,
            conn,
            subscription,
            pending_candidates: Vec::new(),
            offered: false,
            remote_applied: false,
            tracks_added: false,
            closed: false,
            failures: 0,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Nothing has been negotiated or attached on this session yet.
    pub fn is_pristine(&self) -> bool {
        !self.closed && !self.offered && !self.tracks_added && self.pending_candidates.is_empty()
    }

    /// Answer and candidate failures swallowed so far.
    pub fn candidate_failures(&self) -> u32 {
        self.failures
    }

    /// Creates an offer, installs it as the local description and returns it.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        if self.closed {
            return Err(PeerError::InvalidState("session is closed"));
        }
        if self.offered || self.conn.has_local_description().await {
            return Err(PeerError::InvalidState("local description already set"));
        }
        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(offer.clone()).await?;
        self.offered = true;
        info!(generation = self.generation, "local offer created");
        Ok(offer)
    }

    /// Applies the hub's answer once; later answers are ignored.
    pub async fn apply_remote_answer(&mut self, answer: SessionDescription) -> AnswerOutcome {
        if self.closed {
            debug!(generation = self.generation, "answer for closed session ignored");
            return AnswerOutcome::Unexpected;
        }
        if !self.offered {
            warn!(generation = self.generation, "answer received without a local offer; ignored");
            return AnswerOutcome::Unexpected;
        }
        if answer.sdp_type != SdpType::Answer {
            warn!(
                generation = self.generation,
                sdp_type = %answer.sdp_type,
                "remote description is not an answer; ignored"
            );
            return AnswerOutcome::Unexpected;
        }
        if self.remote_applied || self.conn.has_remote_description().await {
            warn!(generation = self.generation, "duplicate answer ignored");
            return AnswerOutcome::Duplicate;
        }

        if let Err(e) = self.conn.set_remote_description(answer).await {
            self.failures += 1;
            warn!(generation = self.generation, "setRemoteDescription(answer) failed: {e:#}");
            return AnswerOutcome::Rejected;
        }
        self.remote_applied = true;
        info!(generation = self.generation, "remote answer applied");

        let buffered = std::mem::take(&mut self.pending_candidates);
        if !buffered.is_empty() {
            debug!(
                generation = self.generation,
                count = buffered.len(),
                "applying buffered remote candidates"
            );
        }
        for candidate in buffered {
            self.add_candidate(candidate).await;
        }
        AnswerOutcome::Applied
    }

    /// Applies a remote candidate, or holds it until the answer arrives.
    pub async fn apply_remote_candidate(&mut self, candidate: IceCandidateInit) -> CandidateOutcome {
        if self.closed {
            debug!(generation = self.generation, "late candidate for closed session dropped");
            return CandidateOutcome::Dropped;
        }
        if !self.remote_applied {
            self.pending_candidates.push(candidate);
            return CandidateOutcome::Buffered;
        }
        self.add_candidate(candidate).await
    }

    async fn add_candidate(&mut self, candidate: IceCandidateInit) -> CandidateOutcome {
        match self.conn.add_ice_candidate(candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(e) => {
                self.failures += 1;
                warn!(generation = self.generation, "addIceCandidate failed: {e:#}");
                CandidateOutcome::Rejected
            }
        }
    }

    /// Adds every track of `stream`, once per session. Returns how many were added.
    pub async fn add_local_tracks(&mut self, stream: &LocalStream) -> Result<usize, PeerError> {
        if self.closed {
            return Err(PeerError::InvalidState("session is closed"));
        }
        if self.tracks_added || self.conn.sender_count().await > 0 {
            debug!(generation = self.generation, "local tracks already attached");
            return Ok(0);
        }
        for track in stream.tracks() {
            self.conn.add_track(track).await?;
        }
        self.tracks_added = true;
        Ok(stream.tracks().len())
    }

    /// Releases the connection. The session cannot be used afterwards.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.subscription.cancel();
        self.pending_candidates.clear();
        if let Err(e) = self.conn.close().await {
            debug!(generation = self.generation, "peer connection close failed: {e:#}");
        }
        debug!(generation = self.generation, "peer session closed");
    }
}
