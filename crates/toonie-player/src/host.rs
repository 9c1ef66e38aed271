//! Screen-level session hosting.
//!
//! [`PlayerContext`] is created once at app start and injected into every
//! screen. It owns the backend, the configuration, the now-playing
//! coordinator and the registry of live sessions; sessions whose screen
//! unmounted while they were active stay parked here. [`SessionHost`] binds
//! one session to one player surface and turns user intents into session
//! operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use toonie_types::{MediaAsset, PlaybackState, ProgressSnapshot, SessionId, SessionStatus};

use crate::config::PlayerConfig;
use crate::error::{Operation, PlayerError, Result};
use crate::events::SessionEvent;
use crate::now_playing::NowPlaying;
use crate::resource::MediaBackend;
use crate::session::{next_hook_key, LoadOptions, PlaybackSession};
use crate::tracker::ProgressTracker;
use crate::view::HostView;

/// Kind of screen a host is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    AudioPlayer,
    VideoPlayer,
}

impl Surface {
    pub fn supports_fullscreen(self) -> bool {
        matches!(self, Surface::VideoPlayer)
    }
}

struct RegistryEntry {
    session: PlaybackSession,
    /// Hosts currently attached to the session.
    hosts: usize,
}

struct ContextShared {
    key: u64,
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    now_playing: NowPlaying,
    registry: Mutex<HashMap<SessionId, RegistryEntry>>,
}

impl ContextShared {
    fn registry(&self) -> MutexGuard<'_, HashMap<SessionId, RegistryEntry>> {
        self.registry.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// App-wide playback context shared by all screens.
#[derive(Clone)]
pub struct PlayerContext {
    shared: Arc<ContextShared>,
}

impl PlayerContext {
    pub fn new(backend: Arc<dyn MediaBackend>, config: PlayerConfig) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                key: next_hook_key(),
                config: config.normalized(),
                backend,
                now_playing: NowPlaying::new(),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.shared.config
    }

    pub fn now_playing(&self) -> &NowPlaying {
        &self.shared.now_playing
    }

    /// Status of every session still holding a resource.
    pub fn live_sessions(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<_> = self
            .shared
            .registry()
            .values()
            .map(|entry| entry.session.status())
            .collect();
        statuses.sort_by(|a, b| a.session_id.as_str().cmp(b.session_id.as_str()));
        statuses
    }

    /// Release every live session (app backgrounded or torn down).
    pub fn relinquish_focus(&self) {
        let sessions: Vec<PlaybackSession> = self
            .shared
            .registry()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        tracing::info!(count = sessions.len(), "relinquishing playback focus");
        for session in sessions {
            session.release();
        }
    }

    pub fn shutdown(&self) {
        self.relinquish_focus();
        self.shared.now_playing.shutdown();
    }

    /// Attach to a usable live session already playing `asset`.
    fn attach(&self, asset: &MediaAsset) -> Option<PlaybackSession> {
        let mut registry = self.shared.registry();
        let entry = registry.values_mut().find(|entry| {
            entry.session.asset().id == asset.id && entry.session.state().is_usable()
        })?;
        entry.hosts += 1;
        tracing::debug!(session_id = %entry.session.id(), hosts = entry.hosts, "host attached");
        Some(entry.session.clone())
    }

    /// Release parked sessions, then create and register a fresh one.
    fn create(&self, asset: Arc<MediaAsset>) -> PlaybackSession {
        let parked: Vec<PlaybackSession> = self
            .shared
            .registry()
            .values()
            .filter(|entry| entry.hosts == 0 && !self.shared.now_playing.is_active(&entry.session))
            .map(|entry| entry.session.clone())
            .collect();
        for session in parked {
            tracing::info!(session_id = %session.id(), "releasing parked session");
            session.release();
        }

        let session = PlaybackSession::new(asset, self.shared.backend.clone(), &self.shared.config);
        self.shared.registry().insert(
            session.id().clone(),
            RegistryEntry {
                session: session.clone(),
                hosts: 1,
            },
        );
        let weak = Arc::downgrade(&self.shared);
        let id = session.id().clone();
        session.add_release_hook(
            self.shared.key,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.registry().remove(&id);
                }
            }),
        );
        session
    }

    /// Returns the number of hosts still attached.
    fn detach(&self, session: &PlaybackSession) -> usize {
        let mut registry = self.shared.registry();
        match registry.get_mut(session.id()) {
            Some(entry) => {
                entry.hosts = entry.hosts.saturating_sub(1);
                entry.hosts
            }
            None => 0,
        }
    }
}

/// Binds one playback session to one player screen.
pub struct SessionHost {
    context: PlayerContext,
    surface: Surface,
    session: Option<PlaybackSession>,
    /// This host created (rather than attached to) the session.
    created: bool,
    tracker: ProgressTracker,
    events: Option<broadcast::Receiver<SessionEvent>>,
    fullscreen: bool,
    last_error: Option<PlayerError>,
}

impl SessionHost {
    pub fn new(context: &PlayerContext, surface: Surface) -> Self {
        Self {
            tracker: ProgressTracker::new(context.config()),
            context: context.clone(),
            surface,
            session: None,
            created: false,
            events: None,
            fullscreen: false,
            last_error: None,
        }
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    /// Show `asset`: attach to its live session or create, activate and load a new one.
    pub async fn open(&mut self, asset: Arc<MediaAsset>) -> Result<()> {
        self.unmount();
        self.last_error = None;

        if let Some(session) = self.context.attach(&asset) {
            self.bind(session, false);
            return Ok(());
        }

        let session = self.context.create(asset);
        self.bind(session.clone(), true);
        if let Err(err) = self.context.now_playing().set_active(&session).await {
            return Err(self.remember(err));
        }
        let loaded = session.load(LoadOptions::default()).await;
        loaded.map_err(|err| self.remember(err))
    }

    pub async fn play(&mut self) -> Result<()> {
        let session = self.require(Operation::Play)?;
        let result = async {
            self.context.now_playing().set_active(&session).await?;
            if session.state() == PlaybackState::Ended {
                session.replay().await
            } else {
                session.play().await
            }
        }
        .await;
        result.map_err(|err| self.remember(err))
    }

    pub async fn pause(&mut self) -> Result<()> {
        let session = self.require(Operation::Pause)?;
        let result = session.pause().await;
        result.map_err(|err| self.remember(err))
    }

    pub async fn toggle_play_pause(&mut self) -> Result<()> {
        let session = self.require(Operation::Play)?;
        match session.state() {
            PlaybackState::Playing | PlaybackState::Seeking => self.pause().await,
            _ => self.play().await,
        }
    }

    pub async fn seek(&mut self, target_ms: i64) -> Result<()> {
        let session = self.require(Operation::Seek)?;
        let result = session.seek(target_ms).await;
        result.map_err(|err| self.remember(err))
    }

    /// Seek-bar drag: `ratio` of the known duration. Ignored while the duration is unknown.
    pub async fn seek_ratio(&mut self, ratio: f64) -> Result<()> {
        let session = self.require(Operation::Seek)?;
        let duration_ms = session.progress().duration_ms;
        if duration_ms == 0 {
            tracing::debug!(session_id = %session.id(), "seek bar used before duration is known");
            return Ok(());
        }
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        self.seek((duration_ms as f64 * ratio).round() as i64).await
    }

    pub async fn set_volume(&mut self, volume: f32) -> Result<()> {
        let session = self.require(Operation::SetVolume)?;
        let result = session.set_volume(volume).await;
        result.map_err(|err| self.remember(err))
    }

    pub async fn set_muted(&mut self, muted: bool) -> Result<()> {
        let session = self.require(Operation::SetMuted)?;
        let result = session.set_muted(muted).await;
        result.map_err(|err| self.remember(err))
    }

    pub async fn toggle_mute(&mut self) -> Result<()> {
        let session = self.require(Operation::SetMuted)?;
        let muted = session.status().muted;
        self.set_muted(!muted).await
    }

    pub async fn set_rate(&mut self, rate: f32) -> Result<()> {
        let session = self.require(Operation::SetRate)?;
        let result = session.set_playback_rate(rate).await;
        result.map_err(|err| self.remember(err))
    }

    pub fn set_repeat(&mut self, repeat: bool) -> Result<()> {
        let session = self.require(Operation::SetRepeat)?;
        session.set_repeat(repeat).map_err(|err| self.remember(err))
    }

    pub async fn replay(&mut self) -> Result<()> {
        let session = self.require(Operation::Replay)?;
        let result = async {
            self.context.now_playing().set_active(&session).await?;
            session.replay().await
        }
        .await;
        result.map_err(|err| self.remember(err))
    }

    /// Flip fullscreen on video surfaces. Returns the new flag.
    pub fn toggle_fullscreen(&mut self) -> bool {
        if self.surface.supports_fullscreen() {
            self.fullscreen = !self.fullscreen;
        }
        self.fullscreen
    }

    pub fn progress(&self) -> watch::Receiver<Option<ProgressSnapshot>> {
        self.tracker.subscribe()
    }

    pub fn view(&self) -> HostView {
        let Some(session) = &self.session else {
            return HostView::empty();
        };
        let status = session.status();
        HostView::from_status(
            &session.asset().display_name,
            &status,
            status.progress(),
            self.fullscreen,
            self.context.now_playing().is_active(session),
            self.last_error.as_ref().map(ToString::to_string),
        )
    }

    /// Events received since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        let Some(events) = self.events.as_mut() else {
            return drained;
        };
        loop {
            match events.try_recv() {
                Ok(event) => drained.push(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "host lagged behind session events");
                }
                Err(_) => break,
            }
        }
        drained
    }

    /// Detach from the session. Releases it only when this host created it,
    /// it is not the now-playing session and no other host is attached.
    /// A failed session is released as soon as its last host leaves.
    pub fn unmount(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.tracker.stop();
        self.events = None;
        self.fullscreen = false;
        let remaining = self.context.detach(&session);
        let active = self.context.now_playing().is_active(&session);
        let failed = session.state() == PlaybackState::Error;
        if remaining == 0 && (failed || (self.created && !active)) {
            session.release();
        } else {
            tracing::debug!(
                session_id = %session.id(),
                active,
                remaining,
                "session left running after unmount"
            );
        }
        self.created = false;
    }

    fn bind(&mut self, session: PlaybackSession, created: bool) {
        self.events = Some(session.subscribe());
        self.tracker.start(&session);
        self.created = created;
        self.session = Some(session);
    }

    fn require(&self, op: Operation) -> Result<PlaybackSession> {
        self.session
            .clone()
            .ok_or_else(|| PlayerError::invalid_state(op, PlaybackState::Idle))
    }

    fn remember(&mut self, err: PlayerError) -> PlayerError {
        if err.is_user_facing() {
            self.last_error = Some(err.clone());
        }
        err
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBackend;
    use std::time::Duration;
    use toonie_types::MediaKind;

    fn asset(id: &str, kind: MediaKind) -> Arc<MediaAsset> {
        Arc::new(MediaAsset::new(
            id,
            format!("{id}.bin"),
            kind,
            format!("file:///media/{id}"),
        ))
    }

    fn context(backend: &SimulatedBackend) -> PlayerContext {
        PlayerContext::new(Arc::new(backend.clone()), PlayerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn second_screen_pauses_first_and_fresh_screen_shows_real_state() {
        let backend = SimulatedBackend::new(120_000);
        let ctx = context(&backend);
        let x = asset("x", MediaKind::Audio);
        let y = asset("y", MediaKind::Audio);

        let mut screen_a = SessionHost::new(&ctx, Surface::AudioPlayer);
        screen_a.open(x.clone()).await.unwrap();
        assert_eq!(screen_a.view().state, PlaybackState::Playing);

        let mut screen_b = SessionHost::new(&ctx, Surface::AudioPlayer);
        screen_b.open(y.clone()).await.unwrap();
        assert_eq!(screen_a.view().state, PlaybackState::Paused);
        assert_eq!(screen_b.view().state, PlaybackState::Playing);
        let active = ctx.now_playing().get_active().unwrap();
        assert_eq!(active.asset().id, "y");

        let mut fresh = SessionHost::new(&ctx, Surface::AudioPlayer);
        fresh.open(x.clone()).await.unwrap();
        let view = fresh.view();
        assert_ne!(view.state, PlaybackState::Playing);
        assert!(!view.is_active);
        assert!(fresh.session().unwrap().same_as(screen_a.session().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn unmounting_active_screen_parks_session() {
        let backend = SimulatedBackend::new(120_000);
        let ctx = context(&backend);
        let mut screen = SessionHost::new(&ctx, Surface::VideoPlayer);
        screen.open(asset("clip", MediaKind::Video)).await.unwrap();
        let session = screen.session().unwrap().clone();

        screen.unmount();
        assert_eq!(session.state(), PlaybackState::Playing);
        assert_eq!(ctx.live_sessions().len(), 1);
        assert!(ctx.now_playing().is_active(&session));
        assert_eq!(backend.live_resources(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_sessions_are_released_before_new_session() {
        let backend = SimulatedBackend::new(120_000);
        let ctx = context(&backend);

        let mut first = SessionHost::new(&ctx, Surface::AudioPlayer);
        first.open(asset("x", MediaKind::Audio)).await.unwrap();
        let x = first.session().unwrap().clone();
        drop(first);

        let mut second = SessionHost::new(&ctx, Surface::AudioPlayer);
        second.open(asset("y", MediaKind::Audio)).await.unwrap();
        let y = second.session().unwrap().clone();
        assert_eq!(x.state(), PlaybackState::Paused);
        drop(second);

        // x is parked and no longer active: opening z releases it first
        let mut third = SessionHost::new(&ctx, Surface::AudioPlayer);
        third.open(asset("z", MediaKind::Audio)).await.unwrap();
        assert_eq!(x.state(), PlaybackState::Unloaded);
        assert_eq!(y.state(), PlaybackState::Paused);
        assert_eq!(backend.live_resources(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unmounting_inactive_created_session_releases_it() {
        let backend = SimulatedBackend::new(120_000);
        let ctx = context(&backend);
        let mut a = SessionHost::new(&ctx, Surface::AudioPlayer);
        a.open(asset("x", MediaKind::Audio)).await.unwrap();
        let mut b = SessionHost::new(&ctx, Surface::AudioPlayer);
        b.open(asset("y", MediaKind::Audio)).await.unwrap();

        let x = a.session().unwrap().clone();
        a.unmount();
        assert_eq!(x.state(), PlaybackState::Unloaded);
        assert!(ctx.live_sessions().iter().all(|s| s.asset_id == "y"));
    }

    #[tokio::test(start_paused = true)]
    async fn attached_host_keeps_session_alive_for_creator_unmount() {
        let backend = SimulatedBackend::new(120_000);
        let ctx = context(&backend);
        let mut creator = SessionHost::new(&ctx, Surface::AudioPlayer);
        creator.open(asset("x", MediaKind::Audio)).await.unwrap();
        let mut viewer = SessionHost::new(&ctx, Surface::AudioPlayer);
        viewer.open(asset("x", MediaKind::Audio)).await.unwrap();
        let session = creator.session().unwrap().clone();
        ctx.now_playing().clear_if_active(&session);

        creator.unmount();
        assert_ne!(session.state(), PlaybackState::Unloaded);
        viewer.unmount();
        assert_ne!(session.state(), PlaybackState::Unloaded);
        assert_eq!(ctx.live_sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn intents_drive_session_and_view() {
        let backend = SimulatedBackend::new(200_000);
        let ctx = context(&backend);
        let mut host = SessionHost::new(&ctx, Surface::VideoPlayer);
        host.open(asset("v", MediaKind::Video)).await.unwrap();
        host.drain_events();

        host.toggle_play_pause().await.unwrap();
        assert_eq!(host.view().state, PlaybackState::Paused);
        host.seek_ratio(0.5).await.unwrap();
        assert_eq!(host.view().position_label, "1:40");
        host.set_volume(0.8).await.unwrap();
        host.toggle_mute().await.unwrap();
        host.set_rate(1.25).await.unwrap();
        host.set_repeat(true).unwrap();
        assert!(host.toggle_fullscreen());

        let view = host.view();
        assert!(view.muted);
        assert_eq!(view.volume, 0.8);
        assert_eq!(view.playback_rate, 1.25);
        assert!(view.repeat);
        assert!(view.fullscreen);

        let events = host.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::StateChanged { to: PlaybackState::Paused, .. }
        )));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::SettingsChanged { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn audio_surface_has_no_fullscreen() {
        let backend = SimulatedBackend::new(10_000);
        let ctx = context(&backend);
        let mut host = SessionHost::new(&ctx, Surface::AudioPlayer);
        assert!(!host.toggle_fullscreen());
        assert!(host.play().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_offers_retry_with_fresh_session() {
        let backend = SimulatedBackend::new(10_000);
        backend.fail_open(Some("unsupported"));
        let ctx = context(&backend);
        let mut host = SessionHost::new(&ctx, Surface::VideoPlayer);
        let clip = asset("clip", MediaKind::Video);

        assert!(host.open(clip.clone()).await.is_err());
        let view = host.view();
        assert_eq!(view.state, PlaybackState::Error);
        assert!(view.can_retry);

        backend.fail_open(None);
        host.open(clip).await.unwrap();
        assert_eq!(host.view().state, PlaybackState::Playing);
        assert!(host.view().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn relinquish_focus_releases_everything() {
        let backend = SimulatedBackend::new(10_000);
        let ctx = context(&backend);
        let mut a = SessionHost::new(&ctx, Surface::AudioPlayer);
        a.open(asset("x", MediaKind::Audio)).await.unwrap();
        a.unmount();
        let mut b = SessionHost::new(&ctx, Surface::VideoPlayer);
        b.open(asset("y", MediaKind::Video)).await.unwrap();

        ctx.relinquish_focus();
        assert!(ctx.live_sessions().is_empty());
        assert!(ctx.now_playing().get_active().is_none());
        assert_eq!(backend.live_resources(), 0);
        assert_eq!(b.view().state, PlaybackState::Unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reaches_the_view() {
        let backend = SimulatedBackend::new(100_000);
        let ctx = context(&backend);
        let mut host = SessionHost::new(&ctx, Surface::AudioPlayer);
        host.open(asset("x", MediaKind::Audio)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_010)).await;
        let view = host.view();
        assert_eq!(view.position_label, "0:03");
        assert!(view.ratio > 0.0);
    }
}
