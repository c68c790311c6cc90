//! Local capture: the door's camera and microphone.
//!
//! A [`MediaSource`] owns at most one [`LocalStream`]. Streams come from a
//! [`CaptureBackend`]; the production backend is [`SampleCapture`], whose
//! tracks are fed encoded samples by the device pipeline.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::AcquisitionError;

/// One 20 ms Opus frame of silence.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProcessing {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioProcessing {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to capture. `audio: None` means no microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: Option<AudioProcessing>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: Some(AudioProcessing::default()),
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::default()
        }
    }
}

/// A single captured track. Clones share the stopped flag.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    stopped: Arc<AtomicBool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind, Uuid::new_v4());
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Handle for adding the track to a peer connection.
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtc) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Pushes one encoded sample. Samples written after `stop()` are dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        self.rtc.write_sample(sample).await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Builds a stream with one track per requested kind.
    pub fn from_constraints(constraints: &MediaConstraints) -> Result<Self, AcquisitionError> {
        let id = format!("door-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(LocalTrack::new(TrackKind::Audio, &id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &id));
        }
        if tracks.is_empty() {
            return Err(AcquisitionError::DeviceError(
                "constraints request neither audio nor video".into(),
            ));
        }
        Ok(Self { id, tracks })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// Something that can open the device's camera and microphone.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn is_supported(&self) -> bool {
        true
    }

    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, AcquisitionError>;
}

/// Capture backed by sample-fed webrtc tracks.
///
/// The device's encoder pipeline watches [`SampleCapture::subscribe`] and
/// writes samples into whichever stream is currently open.
pub struct SampleCapture {
    supported: bool,
    feed: watch::Sender<Option<LocalStream>>,
}

impl SampleCapture {
    pub fn new() -> Self {
        let (feed, _) = watch::channel(None);
        Self {
            supported: true,
            feed,
        }
    }

    /// A backend for hardware without capture devices.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LocalStream>> {
        self.feed.subscribe()
    }
}

impl Default for SampleCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for SampleCapture {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, AcquisitionError> {
        if !self.supported {
            return Err(AcquisitionError::Unsupported);
        }
        let stream = LocalStream::from_constraints(constraints)?;
        self.feed.send_replace(Some(stream.clone()));
        Ok(stream)
    }
}

struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A claimed capture attempt; run it to get the stream.
pub struct PendingAcquisition {
    backend: Arc<dyn CaptureBackend>,
    constraints: MediaConstraints,
    _in_flight: InFlight,
}

impl PendingAcquisition {
    pub async fn run(self) -> Result<LocalStream, AcquisitionError> {
        self.backend.open(&self.constraints).await
    }
}

/// Owner of the door's single capture stream.
pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    secure_context: bool,
    in_flight: Arc<AtomicBool>,
    active: Option<LocalStream>,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CaptureBackend>, secure_context: bool) -> Self {
        Self {
            backend,
            secure_context,
            in_flight: Arc::new(AtomicBool::new(false)),
            active: None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.backend.is_supported()
    }

    pub fn secure_context(&self) -> bool {
        self.secure_context
    }

    pub fn active(&self) -> Option<&LocalStream> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Claims the single capture slot without waiting on the device.
    pub fn begin_acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<PendingAcquisition, AcquisitionError> {
        if !self.secure_context {
            return Err(AcquisitionError::InsecureContext);
        }
        if !self.backend.is_supported() {
            return Err(AcquisitionError::Unsupported);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AcquisitionError::AlreadyInProgress);
        }
        Ok(PendingAcquisition {
            backend: Arc::clone(&self.backend),
            constraints: constraints.clone(),
            _in_flight: InFlight(Arc::clone(&self.in_flight)),
        })
    }

    /// Takes ownership of a captured stream, stopping any previous one.
    pub fn adopt(&mut self, stream: LocalStream) -> &LocalStream {
        if let Some(previous) = self.active.take() {
            previous.stop();
        }
        info!(stream = %stream.id(), tracks = stream.tracks().len(), "local media ready");
        self.active.insert(stream)
    }

    /// Returns the active stream, opening one first if needed.
    pub async fn acquire(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<&LocalStream, AcquisitionError> {
        if self.active.is_none() {
            let stream = self.begin_acquire(constraints)?.run().await?;
            self.adopt(stream);
        }
        self.active
            .as_ref()
            .ok_or_else(|| AcquisitionError::DeviceError("capture stream vanished".into()))
    }

    /// Stops every track of the active stream. Returns whether anything was released.
    pub fn release(&mut self) -> bool {
        match self.active.take() {
            Some(stream) => {
                stream.stop();
                debug!(stream = %stream.id(), "local media released");
                true
            }
            None => false,
        }
    }
}
