//! Local media device acquisition and track control.
//!
//! Device operations are decoupled from negotiation state: muting or
//! toggling video only flips a track flag and never touches the peer
//! connection.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CallError;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What to request from the device layer.
#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// One local device track (microphone or camera).
#[derive(Debug)]
pub struct MediaTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the enabled flag, returning the new value.
    pub fn toggle(&self) -> bool {
        // fetch_xor returns the previous value
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop the track, releasing the underlying device. Idempotent.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// The local camera + microphone stream owned by one call.
#[derive(Debug)]
pub struct LocalMediaStream {
    audio: Option<Arc<MediaTrack>>,
    video: Option<Arc<MediaTrack>>,
}

impl LocalMediaStream {
    pub fn new(constraints: MediaConstraints) -> Self {
        Self {
            audio: constraints
                .audio
                .then(|| Arc::new(MediaTrack::new(TrackKind::Audio))),
            video: constraints
                .video
                .then(|| Arc::new(MediaTrack::new(TrackKind::Video))),
        }
    }

    pub fn audio_track(&self) -> Option<&Arc<MediaTrack>> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&Arc<MediaTrack>> {
        self.video.as_ref()
    }

    /// Flip audio enabled. Returns `true` if audio is now muted.
    /// No-op (returns `false`) when there is no audio track.
    pub fn toggle_mute(&self) -> bool {
        match &self.audio {
            Some(track) => !track.toggle(),
            None => false,
        }
    }

    /// Flip video enabled. Returns `true` if video is now off.
    /// No-op (returns `false`) when there is no video track.
    pub fn toggle_video(&self) -> bool {
        match &self.video {
            Some(track) => !track.toggle(),
            None => false,
        }
    }

    /// Whether any track still holds a device handle.
    pub fn is_live(&self) -> bool {
        self.audio.as_ref().is_some_and(|t| t.is_live())
            || self.video.as_ref().is_some_and(|t| t.is_live())
    }

    /// Stop all tracks. Safe to call multiple times.
    pub fn release(&self) {
        if let Some(track) = &self.audio {
            track.stop();
        }
        if let Some(track) = &self.video {
            track.stop();
        }
        debug!("Released local media tracks");
    }
}

/// Device layer seam: acquires the local camera + microphone.
///
/// A denial or device error maps to [`CallError::MediaAccessDenied`].
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints)
    -> Result<Arc<LocalMediaStream>, CallError>;
}
