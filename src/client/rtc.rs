use crate::client::media::{LocalTrack, OutgoingTracks, TrackKind};
use crate::client::transport::{
    IceCandidate, PeerTransport, RemoteTrack, SessionDescription, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::utils::{Error, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Peer transport backed by a webrtc-rs `RTCPeerConnection`.
pub struct RtcTransport {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let offer = RTCSessionDescription::offer(offer.sdp)?;
        self.peer_connection.set_remote_description(offer).await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer.sdp)?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let sender = self.video_sender.lock().await;
        let sender = sender
            .as_ref()
            .ok_or_else(|| Error::Peer(format!("no outgoing video leg towards {}", self.peer_id)))?;
        let replacement = track.map(|t| t.rtc_track() as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice_urls: Vec<String>) -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: ice_urls,
                ..Default::default()
            }],
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        tracks: OutgoingTracks,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        if let Some(audio) = &tracks.audio {
            peer_connection
                .add_track(audio.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        let video_sender = match &tracks.video {
            Some(video) => Some(
                peer_connection
                    .add_track(video.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                    .await?,
            ),
            None => None,
        };

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Could not serialize local ICE candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                debug!("Peer connection to {} is {}", peer, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send(TransportEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(TransportEvent::Failed(format!("connection to {} failed", peer)));
                    }
                    _ => {}
                }
            })
        }));

        let track_events = events;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                let _ = events.send(TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));
            })
        }));

        info!("Created peer connection towards {}", peer_id);
        Ok(Box::new(RtcTransport {
            peer_id: peer_id.to_string(),
            peer_connection,
            video_sender: Mutex::new(video_sender),
        }))
    }
}
