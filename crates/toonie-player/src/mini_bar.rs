//! Mini-player bar.
//!
//! Follows the now-playing coordinator across screens and runs its own
//! progress tracker against whichever session is active.

use tokio::sync::watch;
use toonie_types::{NowPlayingInfo, PlaybackState};

use crate::error::{Operation, PlayerError, Result};
use crate::host::PlayerContext;
use crate::session::PlaybackSession;
use crate::tracker::ProgressTracker;
use crate::view::BarView;

pub struct NowPlayingBar {
    context: PlayerContext,
    changes: watch::Receiver<Option<NowPlayingInfo>>,
    tracker: ProgressTracker,
    session: Option<PlaybackSession>,
}

impl NowPlayingBar {
    pub fn new(context: &PlayerContext) -> Self {
        let mut bar = Self {
            changes: context.now_playing().subscribe(),
            tracker: ProgressTracker::new(context.config()),
            context: context.clone(),
            session: None,
        };
        bar.sync();
        bar
    }

    /// Re-target the tracker at the coordinator's active session.
    /// Returns `true` when the followed session changed.
    pub fn sync(&mut self) -> bool {
        self.changes.borrow_and_update();
        let active = self.context.now_playing().get_active();
        let unchanged = match (&self.session, &active) {
            (Some(current), Some(next)) => current.same_as(next),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }
        match &active {
            Some(session) => self.tracker.start(session),
            None => self.tracker.stop(),
        }
        self.session = active;
        true
    }

    /// Wait for the next coordinator change and follow it.
    /// Returns `false` once the coordinator is gone.
    pub async fn changed(&mut self) -> bool {
        if self.changes.changed().await.is_err() {
            return false;
        }
        self.sync();
        true
    }

    pub fn view(&self) -> BarView {
        let Some(session) = self.session.as_ref().filter(|s| s.state() != PlaybackState::Unloaded)
        else {
            return BarView::idle();
        };
        let state = session.state();
        let ratio = self
            .tracker
            .snapshot()
            .map(|snapshot| snapshot.ratio)
            .unwrap_or_else(|| session.progress().ratio);
        BarView {
            title: session.asset().display_name.clone(),
            state: Some(state),
            ratio,
            is_playing: matches!(state, PlaybackState::Playing | PlaybackState::Seeking),
        }
    }

    /// Play/pause the active session from the bar.
    pub async fn toggle_play_pause(&mut self) -> Result<()> {
        self.sync();
        let Some(session) = self.session.clone() else {
            return Err(PlayerError::invalid_state(Operation::Play, PlaybackState::Idle));
        };
        match session.state() {
            PlaybackState::Playing | PlaybackState::Seeking => session.pause().await,
            PlaybackState::Ended => session.replay().await,
            _ => session.play().await,
        }
    }
}
