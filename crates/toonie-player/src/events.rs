//! In-process session event bus.
//!
//! Provides a lightweight broadcast channel for UI subscriptions. Dropping a
//! receiver is the unsubscribe.

use tokio::sync::broadcast;
use toonie_types::{PlaybackState, SessionId};

use crate::error::PlayerError;

const EVENT_CAPACITY: usize = 64;

/// Session event payloads published to subscribed screens.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport state moved from one state to another.
    StateChanged {
        session_id: SessionId,
        from: PlaybackState,
        to: PlaybackState,
    },
    /// Volume, mute, rate or repeat changed.
    SettingsChanged {
        session_id: SessionId,
        volume: f32,
        muted: bool,
        playback_rate: f32,
        repeat: bool,
    },
    /// A duration became known or a seek settled; position/duration changed outside polling.
    PositionChanged {
        session_id: SessionId,
        position_ms: u64,
        duration_ms: u64,
    },
    /// A failure the hosting UI should show to the user.
    Failed {
        session_id: SessionId,
        error: PlayerError,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::SettingsChanged { session_id, .. }
            | SessionEvent::PositionChanged { session_id, .. }
            | SessionEvent::Failed { session_id, .. } => session_id,
        }
    }
}

#[derive(Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}
