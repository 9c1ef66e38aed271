//! View models rendered by player screens and the mini-player bar.

use serde::Serialize;
use toonie_types::{PlaybackState, ProgressSnapshot, SessionStatus};

/// Title shown by the mini-player when nothing is active.
pub const IDLE_TITLE: &str = "No media playing";

/// Format milliseconds as `m:ss`, or `h:mm:ss` from one hour up.
pub fn format_clock(ms: u64) -> String {
    let total = ms / 1000;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Human-readable name from the last path segment of a URI.
pub fn display_name_from_uri(uri: &str) -> String {
    let segment = uri
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("");
    let decoded = urlencoding::decode(segment)
        .map(|name| name.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if decoded.is_empty() || decoded.contains("://") || decoded.ends_with(':') {
        "Unknown".to_string()
    } else {
        decoded
    }
}

/// Everything a player screen needs to render one frame.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HostView {
    pub title: String,
    pub state: PlaybackState,
    pub position_label: String,
    pub duration_label: String,
    pub ratio: f64,
    pub volume: f32,
    pub muted: bool,
    pub playback_rate: f32,
    pub repeat: bool,
    pub fullscreen: bool,
    /// This screen's session is the now-playing one.
    pub is_active: bool,
    pub error: Option<String>,
    /// Offer a retry affordance (fresh session for the same asset).
    pub can_retry: bool,
}

impl HostView {
    pub fn from_status(
        title: &str,
        status: &SessionStatus,
        progress: ProgressSnapshot,
        fullscreen: bool,
        is_active: bool,
        error: Option<String>,
    ) -> Self {
        let error = status.last_error.clone().or(error);
        Self {
            title: title.to_string(),
            state: status.state,
            position_label: format_clock(progress.position_ms),
            duration_label: format_clock(progress.duration_ms),
            ratio: progress.ratio,
            volume: status.volume,
            muted: status.muted,
            playback_rate: status.playback_rate,
            repeat: status.repeat,
            fullscreen,
            is_active,
            can_retry: status.state == PlaybackState::Error,
            error,
        }
    }

    /// View for a screen with nothing opened yet.
    pub fn empty() -> Self {
        Self {
            title: String::new(),
            state: PlaybackState::Idle,
            position_label: format_clock(0),
            duration_label: format_clock(0),
            ratio: 0.0,
            volume: 1.0,
            muted: false,
            playback_rate: 1.0,
            repeat: false,
            fullscreen: false,
            is_active: false,
            error: None,
            can_retry: false,
        }
    }

    /// One-line summary used by the CLI.
    pub fn status_line(&self) -> String {
        let mut line = format!(
            "[{:<8}] {} / {} ({:>3.0}%) {}",
            self.state.as_str(),
            self.position_label,
            self.duration_label,
            self.ratio * 100.0,
            self.title
        );
        if self.muted {
            line.push_str(" [muted]");
        }
        if self.playback_rate != 1.0 {
            line.push_str(&format!(" x{}", self.playback_rate));
        }
        if self.repeat {
            line.push_str(" [repeat]");
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" error: {error}"));
        }
        line
    }
}

/// Mini-player bar contents.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BarView {
    pub title: String,
    pub state: Option<PlaybackState>,
    pub ratio: f64,
    pub is_playing: bool,
}

impl BarView {
    pub fn idle() -> Self {
        Self {
            title: IDLE_TITLE.to_string(),
            state: None,
            ratio: 0.0,
            is_playing: false,
        }
    }
}
