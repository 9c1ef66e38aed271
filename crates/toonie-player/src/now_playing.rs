//! Now-playing coordinator.
//!
//! Holds a non-owning reference to the single active session and publishes
//! changes over a watch channel. Activation is serialized: the previously
//! active session is yielded (paused, or its pending autoplay cancelled)
//! before the pointer moves. The coordinator never creates, loads or
//! releases sessions.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use toonie_types::{NowPlayingInfo, PlaybackState, SessionId};

use crate::error::{Operation, PlayerError, Result};
use crate::session::{next_hook_key, PlaybackSession, WeakSession};

struct CoordinatorShared {
    /// Release-hook key registered on the active session.
    key: u64,
    active: Mutex<Option<WeakSession>>,
    switch: tokio::sync::Mutex<()>,
    changes: watch::Sender<Option<NowPlayingInfo>>,
}

impl CoordinatorShared {
    fn lock(&self) -> MutexGuard<'_, Option<WeakSession>> {
        self.active.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn clear_id(&self, id: &SessionId) -> bool {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|current| current.id() == id) {
            *active = None;
            drop(active);
            self.changes.send_replace(None);
            tracing::info!(session_id = %id, "now playing cleared");
            true
        } else {
            false
        }
    }
}

/// Single source of truth for which session is currently active.
#[derive(Clone)]
pub struct NowPlaying {
    shared: Arc<CoordinatorShared>,
}

impl Default for NowPlaying {
    fn default() -> Self {
        Self::new()
    }
}

impl NowPlaying {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            shared: Arc::new(CoordinatorShared {
                key: next_hook_key(),
                active: Mutex::new(None),
                switch: tokio::sync::Mutex::new(()),
                changes,
            }),
        }
    }

    /// Make `session` the active one, yielding whichever session was active before.
    pub async fn set_active(&self, session: &PlaybackSession) -> Result<()> {
        let _switch = self.shared.switch.lock().await;
        if session.state() == PlaybackState::Unloaded {
            return Err(PlayerError::invalid_state(
                Operation::Activate,
                PlaybackState::Unloaded,
            ));
        }

        let previous = {
            let active = self.shared.lock();
            match active.as_ref() {
                Some(current) if current.id() == session.id() => return Ok(()),
                Some(current) => current.upgrade(),
                None => None,
            }
        };
        if let Some(previous) = &previous {
            if let Err(err) = previous.yield_playback().await {
                let still_playing = matches!(
                    previous.state(),
                    PlaybackState::Playing | PlaybackState::Seeking
                );
                tracing::warn!(
                    session_id = %previous.id(),
                    error = %err,
                    still_playing,
                    "previous session did not yield"
                );
                // only the active session may keep the output
                if still_playing {
                    return Err(err);
                }
            }
        }

        let state = session.state();
        if state == PlaybackState::Unloaded {
            return Err(PlayerError::invalid_state(Operation::Activate, state));
        }
        if let Some(previous) = &previous {
            previous.remove_release_hook(self.shared.key);
        }

        *self.shared.lock() = Some(session.downgrade());
        let weak: Weak<CoordinatorShared> = Arc::downgrade(&self.shared);
        let id = session.id().clone();
        session.add_release_hook(
            self.shared.key,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.clear_id(&id);
                }
            }),
        );
        self.shared.changes.send_replace(Some(NowPlayingInfo {
            session_id: session.id().clone(),
            asset: session.asset().as_ref().clone(),
        }));
        tracing::info!(
            session_id = %session.id(),
            asset_id = %session.asset().id,
            "now playing changed"
        );
        Ok(())
    }

    /// The active session, if it is still alive and not unloaded.
    pub fn get_active(&self) -> Option<PlaybackSession> {
        self.shared
            .lock()
            .as_ref()
            .and_then(WeakSession::upgrade)
            .filter(|session| session.state() != PlaybackState::Unloaded)
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.shared.lock().as_ref().map(|current| current.id().clone())
    }

    pub fn is_active(&self, session: &PlaybackSession) -> bool {
        self.shared
            .lock()
            .as_ref()
            .is_some_and(|current| current.id() == session.id())
    }

    /// Clear the pointer only if it refers to `session`.
    pub fn clear_if_active(&self, session: &PlaybackSession) -> bool {
        let cleared = self.shared.clear_id(session.id());
        if cleared {
            session.remove_release_hook(self.shared.key);
        }
        cleared
    }

    /// Watch the active session info (`None` when nothing is playing).
    pub fn subscribe(&self) -> watch::Receiver<Option<NowPlayingInfo>> {
        self.shared.changes.subscribe()
    }

    pub fn info(&self) -> Option<NowPlayingInfo> {
        self.shared.changes.borrow().clone()
    }

    /// Drop the active pointer without touching the session.
    pub fn shutdown(&self) {
        let previous = self.shared.lock().take();
        if let Some(previous) = previous {
            if let Some(session) = previous.upgrade() {
                session.remove_release_hook(self.shared.key);
            }
            self.shared.changes.send_replace(None);
            tracing::debug!(session_id = %previous.id(), "now playing shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlayerConfig;
    use crate::session::LoadOptions;
    use crate::sim::{SimOp, SimulatedBackend};
    use std::time::Duration;
    use toonie_types::{MediaAsset, MediaKind};

    fn session(backend: &SimulatedBackend, id: &str, autoplay: bool) -> PlaybackSession {
        let asset = Arc::new(MediaAsset::new(
            id,
            format!("{id}.mp4"),
            MediaKind::Video,
            format!("file:///movies/{id}.mp4"),
        ));
        let config = PlayerConfig {
            autoplay,
            ..PlayerConfig::default()
        };
        PlaybackSession::new(asset, Arc::new(backend.clone()), &config)
    }

    #[tokio::test(start_paused = true)]
    async fn activating_b_pauses_playing_a() {
        let backend = SimulatedBackend::new(60_000);
        let coordinator = NowPlaying::new();
        let a = session(&backend, "a", true);
        let b = session(&backend, "b", true);

        coordinator.set_active(&a).await.unwrap();
        a.load(LoadOptions::default()).await.unwrap();
        assert_eq!(a.state(), PlaybackState::Playing);

        coordinator.set_active(&b).await.unwrap();
        b.load(LoadOptions::default()).await.unwrap();
        assert_eq!(a.state(), PlaybackState::Paused);
        assert_eq!(b.state(), PlaybackState::Playing);
        assert!(coordinator.get_active().unwrap().same_as(&b));
        assert_eq!(backend.live_resources(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_yield_keeps_previous_session_active() {
        let backend = SimulatedBackend::new(60_000);
        let coordinator = NowPlaying::new();
        let a = session(&backend, "a", true);
        let b = session(&backend, "b", true);
        coordinator.set_active(&a).await.unwrap();
        a.load(LoadOptions::default()).await.unwrap();
        backend.last_resource().unwrap().fail_op(SimOp::Pause, 1);

        let err = coordinator.set_active(&b).await.unwrap_err();
        assert!(matches!(err, PlayerError::Playback { op: Operation::Pause, .. }));
        assert!(coordinator.is_active(&a));
        assert_eq!(a.state(), PlaybackState::Playing);

        coordinator.set_active(&b).await.unwrap();
        b.load(LoadOptions::default()).await.unwrap();
        assert_eq!(a.state(), PlaybackState::Paused);
        assert_eq!(b.state(), PlaybackState::Playing);
        let playing = backend
            .resources()
            .iter()
            .filter(|resource| resource.is_playing())
            .count();
        assert_eq!(playing, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn activating_cancels_pending_autoplay_of_loading_session() {
        let backend = SimulatedBackend::new(60_000);
        backend.set_open_delay(Duration::from_millis(200));
        let coordinator = NowPlaying::new();
        let a = session(&backend, "a", true);
        let b = session(&backend, "b", false);
        coordinator.set_active(&a).await.unwrap();

        let switch_soon = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            coordinator.set_active(&b).await
        };
        let (loaded, switched) = tokio::join!(a.load(LoadOptions::default()), switch_soon);
        loaded.unwrap();
        switched.unwrap();
        assert_eq!(a.state(), PlaybackState::Ready);
        assert!(coordinator.is_active(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_if_active_ignores_other_sessions() {
        let backend = SimulatedBackend::new(60_000);
        let coordinator = NowPlaying::new();
        let a = session(&backend, "a", false);
        let b = session(&backend, "b", false);
        coordinator.set_active(&a).await.unwrap();
        coordinator.set_active(&b).await.unwrap();

        assert!(!coordinator.clear_if_active(&a));
        assert!(coordinator.get_active().unwrap().same_as(&b));
        assert!(coordinator.clear_if_active(&b));
        assert!(coordinator.get_active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_active_session_clears_pointer_in_same_call() {
        let backend = SimulatedBackend::new(60_000);
        let coordinator = NowPlaying::new();
        let a = session(&backend, "a", true);
        coordinator.set_active(&a).await.unwrap();
        a.load(LoadOptions::default()).await.unwrap();
        let rx = coordinator.subscribe();

        a.release();
        assert!(coordinator.get_active().is_none());
        assert_eq!(coordinator.active_id(), None);
        assert_eq!(*rx.borrow(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_previous_session_keeps_new_pointer() {
        let backend = SimulatedBackend::new(60_000);
        let coordinator = NowPlaying::new();
        let a = session(&backend, "a", false);
        let b = session(&backend, "b", false);
        coordinator.set_active(&a).await.unwrap();
        coordinator.set_active(&b).await.unwrap();

        a.release();
        assert!(coordinator.is_active(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn unloaded_sessions_cannot_be_activated() {
        let backend = SimulatedBackend::new(60_000);
        let coordinator = NowPlaying::new();
        let a = session(&backend, "a", false);
        a.release();
        let err = coordinator.set_active(&a).await.unwrap_err();
        assert!(matches!(
            err,
            PlayerError::InvalidState { op: Operation::Activate, .. }
        ));
        assert!(coordinator.info().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_active_asset() {
        let backend = SimulatedBackend::new(60_000);
        let coordinator = NowPlaying::new();
        let mut rx = coordinator.subscribe();
        let a = session(&backend, "a", false);
        coordinator.set_active(&a).await.unwrap();

        assert!(rx.has_changed().unwrap());
        let info = rx.borrow_and_update().clone().unwrap();
        assert_eq!(info.session_id, *a.id());
        assert_eq!(info.asset.id, "a");

        coordinator.shutdown();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
        assert_eq!(a.state(), PlaybackState::Idle);
    }
}
