//! Error types surfaced by the playback core.

use std::fmt;

use thiserror::Error;
use toonie_types::PlaybackState;

/// Operation that produced an error, used to tag failures for the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Load,
    Play,
    Pause,
    Seek,
    SetVolume,
    SetMuted,
    SetRate,
    Replay,
    SetRepeat,
    Activate,
    Poll,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Load => "load",
            Operation::Play => "play",
            Operation::Pause => "pause",
            Operation::Seek => "seek",
            Operation::SetVolume => "set_volume",
            Operation::SetMuted => "set_muted",
            Operation::SetRate => "set_rate",
            Operation::Replay => "replay",
            Operation::SetRepeat => "set_repeat",
            Operation::Activate => "activate",
            Operation::Poll => "poll",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a native resource or resource provider.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ResourceError {
    pub message: String,
}

impl ResourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors surfaced by sessions, the coordinator and the catalog boundary.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PlayerError {
    /// The user refused media access. Terminal; never retried silently.
    #[error("media permission denied")]
    PermissionDenied,
    /// The OS media index could not be queried.
    #[error("media catalog unavailable: {0}")]
    CatalogUnavailable(String),
    /// The native resource failed to load.
    #[error("failed to open {uri}: {reason}")]
    Open { uri: String, reason: String },
    /// Runtime failure during a transport or settings call.
    #[error("{op} failed: {reason}")]
    Playback { op: Operation, reason: String },
    /// Operation is illegal for the current state (or another call is still in flight).
    #[error(
        "{op} not allowed while {state}{}",
        .in_flight.map(|pending| format!(" ({pending} in flight)")).unwrap_or_default()
    )]
    InvalidState {
        op: Operation,
        state: PlaybackState,
        in_flight: Option<Operation>,
    },
    /// Playback rate must be a positive finite multiplier.
    #[error("invalid playback rate {0}")]
    InvalidRate(f32),
    /// A status poll failed; counted by the tracker and escalated only when repeated.
    #[error("status poll failed: {0}")]
    TransientPoll(String),
}

impl PlayerError {
    pub(crate) fn invalid_state(op: Operation, state: PlaybackState) -> Self {
        PlayerError::InvalidState {
            op,
            state,
            in_flight: None,
        }
    }

    pub(crate) fn playback(op: Operation, err: ResourceError) -> Self {
        PlayerError::Playback {
            op,
            reason: err.message,
        }
    }

    /// `true` for errors that deserve a user-visible message (and a retry affordance).
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            PlayerError::InvalidState { .. } | PlayerError::TransientPoll(_)
        )
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, PlayerError>;
