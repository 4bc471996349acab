use crate::utils::{Error, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

/// A captured local track, shared read-only by every peer session.
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: &str) -> Arc<Self> {
        let id = format!("{:?}-{}", source, Uuid::new_v4()).to_lowercase();
        let mime_type = match source.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Arc::new(Self {
            id,
            source,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Releases the capture. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.set_enabled(false);
            debug!("Stopped local track {}", self.id);
        }
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// What a session sends: at most one audio and one video track.
#[derive(Debug, Clone, Default)]
pub struct OutgoingTracks {
    pub audio: Option<Arc<LocalTrack>>,
    pub video: Option<Arc<LocalTrack>>,
}

#[derive(Debug, Default)]
pub struct MediaTrackSet {
    pub camera: Option<Arc<LocalTrack>>,
    pub microphone: Option<Arc<LocalTrack>>,
    pub screen: Option<Arc<LocalTrack>>,
}

impl MediaTrackSet {
    /// Screen share wins over the camera on the outgoing leg.
    pub fn outgoing_video(&self) -> Option<Arc<LocalTrack>> {
        self.screen.clone().or_else(|| self.camera.clone())
    }

    pub fn outgoing(&self) -> OutgoingTracks {
        OutgoingTracks {
            audio: self.microphone.clone(),
            video: self.outgoing_video(),
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn stop_all(&mut self) {
        for track in [self.camera.take(), self.microphone.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
    }
}

pub struct UserMedia {
    pub camera: Option<Arc<LocalTrack>>,
    pub microphone: Option<Arc<LocalTrack>>,
}

/// Capture devices. Both calls may suspend on a permission prompt.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self) -> Result<UserMedia>;
    async fn display_media(&self) -> Result<Arc<LocalTrack>>;
}

/// Devices without real capture behind them, for headless participants.
/// Tracks exist and negotiate but carry no samples.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    stream_id: String,
    screen_available: bool,
}

impl SyntheticDevices {
    pub fn new(stream_id: impl Into<String>, screen_available: bool) -> Self {
        Self {
            stream_id: stream_id.into(),
            screen_available,
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self) -> Result<UserMedia> {
        Ok(UserMedia {
            camera: Some(LocalTrack::new(TrackSource::Camera, &self.stream_id)),
            microphone: Some(LocalTrack::new(TrackSource::Microphone, &self.stream_id)),
        })
    }

    async fn display_media(&self) -> Result<Arc<LocalTrack>> {
        if !self.screen_available {
            return Err(Error::MediaAcquisition("no display to capture".to_string()));
        }
        Ok(LocalTrack::new(TrackSource::Screen, &self.stream_id))
    }
}
