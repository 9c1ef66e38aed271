use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of media asset exposed by the device media index.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Music, podcasts and other audio-only files.
    Audio,
    /// Video files rendered on the video player surface.
    Video,
}

impl MediaKind {
    /// Stable lowercase label (`audio`/`video`).
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single discoverable media file.
///
/// Assets are immutable and owned by the catalog; sessions share them by reference.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaAsset {
    /// Stable identifier, unique per device asset.
    pub id: String,
    /// Human-readable name shown in lists and player headers.
    pub display_name: String,
    /// Audio or video.
    pub kind: MediaKind,
    /// Opaque source locator handed to the native resource provider.
    pub uri: String,
}

impl MediaAsset {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        kind: MediaKind,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind,
            uri: uri.into(),
        }
    }
}

/// Identifier assigned to a playback session (`session:<kind>:<uuid>`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport state of a playback session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Created, nothing requested from the native layer yet.
    Idle,
    /// Native resource is being acquired.
    Loading,
    /// Resource acquired, playback not started.
    Ready,
    Playing,
    Paused,
    /// A seek round trip is in flight.
    Seeking,
    /// Reached the end of the media without repeat.
    Ended,
    /// Load or playback failed; recover by creating a fresh session.
    Error,
    /// Resource released. Terminal.
    Unloaded,
}

impl PlaybackState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loading => "loading",
            PlaybackState::Ready => "ready",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Seeking => "seeking",
            PlaybackState::Ended => "ended",
            PlaybackState::Error => "error",
            PlaybackState::Unloaded => "unloaded",
        }
    }

    /// `true` for states in which the resource is polled for position/duration.
    pub fn accepts_progress(self) -> bool {
        matches!(
            self,
            PlaybackState::Ready
                | PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Seeking
        )
    }

    /// `true` when a session in this state can still be attached to and driven.
    pub fn is_usable(self) -> bool {
        !matches!(self, PlaybackState::Error | PlaybackState::Unloaded)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized playback progress republished by the progress tracker.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    /// Last observed position in milliseconds.
    pub position_ms: u64,
    /// Total length in milliseconds, `0` while unknown.
    pub duration_ms: u64,
    /// `position_ms / duration_ms` clamped to `[0, 1]`, `0` while duration is unknown.
    pub ratio: f64,
}

impl ProgressSnapshot {
    pub fn new(position_ms: u64, duration_ms: u64) -> Self {
        let ratio = if duration_ms > 0 {
            (position_ms as f64 / duration_ms as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            position_ms,
            duration_ms,
            ratio,
        }
    }
}

/// Serializable view of a playback session for UI layers and CLI output.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    /// Session identifier.
    pub session_id: SessionId,
    /// Identifier of the asset being played.
    pub asset_id: String,
    /// Current transport state.
    pub state: PlaybackState,
    /// Last known position in milliseconds.
    pub position_ms: u64,
    /// Total length in milliseconds, `0` while unknown.
    pub duration_ms: u64,
    /// Stored volume in `[0, 1]`, independent of mute.
    pub volume: f32,
    /// Whether output is muted.
    pub muted: bool,
    /// Playback speed multiplier.
    pub playback_rate: f32,
    /// Whether reaching the end restarts playback.
    pub repeat: bool,
    /// Message of the failure that moved the session to `Error`.
    pub last_error: Option<String>,
}

impl SessionStatus {
    /// Volume that actually reaches the output (`0` while muted).
    pub fn effective_volume(&self) -> f32 {
        if self.muted { 0.0 } else { self.volume }
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot::new(self.position_ms, self.duration_ms)
    }
}

/// Payload published to now-playing subscribers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NowPlayingInfo {
    /// Active session id.
    pub session_id: SessionId,
    /// Asset the active session plays.
    pub asset: MediaAsset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_ratio_is_zero_without_duration() {
        let snap = ProgressSnapshot::new(5_000, 0);
        assert_eq!(snap.ratio, 0.0);
    }

    #[test]
    fn progress_ratio_is_clamped() {
        assert_eq!(ProgressSnapshot::new(1_500, 3_000).ratio, 0.5);
        assert_eq!(ProgressSnapshot::new(9_000, 3_000).ratio, 1.0);
    }

    #[test]
    fn effective_volume_honours_mute() {
        let mut status = SessionStatus {
            session_id: SessionId("session:audio:test".to_string()),
            asset_id: "a".to_string(),
            state: PlaybackState::Playing,
            position_ms: 0,
            duration_ms: 0,
            volume: 0.8,
            muted: true,
            playback_rate: 1.0,
            repeat: false,
            last_error: None,
        };
        assert_eq!(status.effective_volume(), 0.0);
        status.muted = false;
        assert_eq!(status.effective_volume(), 0.8);
    }

    #[test]
    fn states_serialize_snake_case() {
        let json = serde_json::to_string(&PlaybackState::Unloaded).unwrap();
        assert_eq!(json, "\"unloaded\"");
        let kind: MediaKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, MediaKind::Video);
    }
}
