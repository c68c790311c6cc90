//! Peer connections backed by webrtc-rs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use doorline_common::{IceCandidateInit, SdpType, SessionDescription};

use crate::media::{LocalTrack, TrackKind};
use crate::peer::{PeerConnection, PeerEvent, PeerEventSink, PeerFactory};
use crate::types::{IceConnectionState, RemoteTrack, SignalingState};

/// Creates webrtc-rs peer connections with the configured ICE servers.
#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut m)?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let sink = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(state) = ice_state(state) {
                    sink.emit(PeerEvent::IceConnectionStateChanged(state));
                }
            })
        }));

        let sink = events.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(state) = signaling_state(state) {
                    sink.emit(PeerEvent::SignalingStateChanged(state));
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => {
                            debug!("ignoring remote track of unknown kind");
                            return;
                        }
                    };
                    sink.emit(PeerEvent::RemoteTrackReceived(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                })
            },
        ));

        let sink = events;
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering; browsers do not need it trickled.
                let Some(candidate) = c else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerEvent::LocalCandidate(from_rtc_candidate(init))),
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        Ok(Arc::new(RtcPeer { pc }) as Arc<dyn PeerConnection>)
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn has_local_description(&self) -> bool {
        self.pc.local_description().await.is_some()
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.pc.add_ice_candidate(to_rtc_candidate(candidate)).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.pc.add_track(track.rtc_track()).await?;
        debug!(track = %track.id(), kind = %track.kind(), "local track added");
        Ok(())
    }

    async fn sender_count(&self) -> usize {
        let mut count = 0;
        for sender in self.pc.get_senders().await {
            if sender.track().await.is_some() {
                count += 1;
            }
        }
        count
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => return Err(anyhow!("rollback descriptions are not supported")),
    };
    Ok(rtc)
}

fn to_rtc_candidate(candidate: IceCandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => return None,
    })
}
