//! Local capture capability.
//!
//! Device capture itself lives outside this crate: a [`MediaSource`] hands
//! back tracks, and whoever owns the capture pipeline pushes encoded frames
//! into them with [`LocalTrack::write_sample`]. Enabling or disabling a
//! track only gates those writes, so mute and camera-off never touch the
//! negotiated session description.

use crate::config::MediaConfig;
use crate::error::MediaAccessError;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (codec, prefix) = match kind {
            TrackKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                "audio",
            ),
            TrackKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                "video",
            ),
        };
        let id = format!("{prefix}-{}", random_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Returns true only for the call that actually stopped the track.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Pushes one encoded frame. Returns `Ok(false)` if the frame was
    /// dropped because the track is disabled or stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, webrtc::Error> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Local capture handle, shared by every peer session of one call.
#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(stream_id: String, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { stream_id, tracks }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for t in self.tracks_of(kind) {
            t.set_enabled(enabled);
        }
    }

    /// Stops every track; returns how many were still running.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn is_released(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(c: &MediaConfig) -> Self {
        Self {
            audio: c.audio,
            video: c.video,
        }
    }
}

/// Where local tracks come from.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaAccessError>;
}

/// Builds Opus/VP8 sample tracks fed by an external capture pipeline.
#[derive(Debug, Default, Clone)]
pub struct SampleSource;

#[async_trait]
impl MediaSource for SampleSource {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaAccessError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaAccessError::NothingRequested);
        }
        let stream_id = format!("pairline-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Audio, &stream_id)));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video, &stream_id)));
        }
        Ok(LocalMedia::new(stream_id, tracks))
    }
}

struct CapabilityState {
    current: Option<Arc<LocalMedia>>,
    audio_enabled: bool,
    video_enabled: bool,
}

/// Acquire/release plus the mute and camera toggles.
pub struct MediaCapability {
    source: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    state: Mutex<CapabilityState>,
}

impl MediaCapability {
    pub fn new(source: Arc<dyn MediaSource>, config: &MediaConfig) -> Self {
        Self {
            source,
            constraints: config.into(),
            state: Mutex::new(CapabilityState {
                current: None,
                audio_enabled: !config.start_muted,
                video_enabled: !config.start_camera_off,
            }),
        }
    }

    /// Returns the live handle, opening the source if none is held.
    pub async fn acquire(&self) -> Result<Arc<LocalMedia>, MediaAccessError> {
        if let Some(current) = self.current() {
            return Ok(current);
        }
        let media = Arc::new(self.source.open(&self.constraints).await?);

        let mut st = self.state.lock();
        // a concurrent acquire may have won while the source was opening
        if let Some(current) = st.current.clone() {
            media.stop_all();
            return Ok(current);
        }
        media.set_enabled(TrackKind::Audio, st.audio_enabled);
        media.set_enabled(TrackKind::Video, st.video_enabled);
        info!(
            stream = media.stream_id(),
            tracks = media.tracks().len(),
            "local media acquired"
        );
        st.current = Some(media.clone());
        Ok(media)
    }

    /// Stops all tracks of the held handle. Returns false if nothing was held.
    pub fn release(&self) -> bool {
        let Some(media) = self.state.lock().current.take() else {
            return false;
        };
        let stopped = media.stop_all();
        info!(stream = media.stream_id(), stopped, "local media released");
        true
    }

    pub fn current(&self) -> Option<Arc<LocalMedia>> {
        self.state.lock().current.clone()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        let mut st = self.state.lock();
        st.audio_enabled = enabled;
        if let Some(m) = &st.current {
            m.set_enabled(TrackKind::Audio, enabled);
        }
        debug!(enabled, "audio toggled");
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        let mut st = self.state.lock();
        st.video_enabled = enabled;
        if let Some(m) = &st.current {
            m.set_enabled(TrackKind::Video, enabled);
        }
        debug!(enabled, "video toggled");
    }

    pub fn audio_enabled(&self) -> bool {
        self.state.lock().audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.state.lock().video_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeniedSource;

    #[async_trait]
    impl MediaSource for DeniedSource {
        async fn open(&self, _: &MediaConstraints) -> Result<LocalMedia, MediaAccessError> {
            Err(MediaAccessError::Denied("permission dismissed".into()))
        }
    }

    fn capability(config: MediaConfig) -> MediaCapability {
        MediaCapability::new(Arc::new(SampleSource), &config)
    }

    #[tokio::test]
    async fn acquire_is_idempotent() {
        let cap = capability(MediaConfig::default());
        let a = cap.acquire().await.unwrap();
        let b = cap.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.tracks().len(), 2);
    }

    #[tokio::test]
    async fn release_stops_every_track_once() {
        let cap = capability(MediaConfig::default());
        let media = cap.acquire().await.unwrap();
        assert!(cap.release());
        assert!(media.is_released());
        assert!(!cap.release());
        assert!(cap.current().is_none());
    }

    #[tokio::test]
    async fn toggles_before_acquire_are_applied() {
        let cap = capability(MediaConfig::default());
        cap.set_audio_enabled(false);
        let media = cap.acquire().await.unwrap();
        assert!(media.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));
        assert!(media.tracks_of(TrackKind::Video).all(|t| t.is_enabled()));

        cap.set_video_enabled(false);
        assert!(media.tracks_of(TrackKind::Video).all(|t| !t.is_enabled()));
    }

    #[tokio::test]
    async fn muted_track_drops_samples() {
        let cap = capability(MediaConfig {
            start_muted: true,
            ..Default::default()
        });
        let media = cap.acquire().await.unwrap();
        let audio = media.tracks_of(TrackKind::Audio).next().unwrap().clone();
        let written = audio
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!written);
    }

    #[tokio::test]
    async fn nothing_requested_is_an_error() {
        let cap = capability(MediaConfig {
            audio: false,
            video: false,
            ..Default::default()
        });
        assert_eq!(cap.acquire().await.unwrap_err(), MediaAccessError::NothingRequested);
    }

    #[tokio::test]
    async fn denied_source_surfaces_error() {
        let cap = MediaCapability::new(Arc::new(DeniedSource), &MediaConfig::default());
        assert!(matches!(cap.acquire().await, Err(MediaAccessError::Denied(_))));
        assert!(cap.current().is_none());
    }
}
