//! Playback session state machine.
//!
//! A session owns exactly one native resource between `Loading` and
//! `Unloaded`. Transitions happen only once the resource confirms a call;
//! the pending call is recorded as `in_flight` and a second transport call
//! is rejected instead of queued. Interior state sits behind a std mutex that
//! is never held across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use toonie_types::{MediaAsset, PlaybackState, ProgressSnapshot, SessionId, SessionStatus};
use uuid::Uuid;

use crate::config::PlayerConfig;
use crate::error::{Operation, PlayerError, ResourceError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::resource::{MediaBackend, MediaResource, ResourceStatus};

/// Callback run once when the session is released.
pub(crate) type ReleaseHook = Box<dyn FnOnce() + Send>;

static NEXT_HOOK_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique key for release hooks and tracker bindings.
pub(crate) fn next_hook_key() -> u64 {
    NEXT_HOOK_KEY.fetch_add(1, Ordering::Relaxed)
}

/// Per-load overrides.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    /// Overrides the configured autoplay flag for this load.
    pub autoplay: Option<bool>,
}

impl LoadOptions {
    pub fn autoplay(autoplay: bool) -> Self {
        Self {
            autoplay: Some(autoplay),
        }
    }
}

/// Result of folding one polled resource status into the session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum StatusOutcome {
    /// The poll belongs to a released or failed resource.
    Stale,
    /// The session is in a state that does not track progress.
    Ignored,
    Applied(ProgressSnapshot),
    /// Playback reached the end and the session entered `Ended`.
    Ended(ProgressSnapshot),
    /// Playback reached the end with repeat enabled; caller should `replay()`.
    RepeatRequested,
}

/// Session position a progress poll was started from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PollMark {
    epoch: u64,
    transitions: u64,
}

struct SessionInner {
    state: PlaybackState,
    position_ms: u64,
    duration_ms: u64,
    volume: f32,
    muted: bool,
    rate: f32,
    repeat: bool,
    autoplay: bool,
    last_error: Option<PlayerError>,
    resource: Option<Arc<dyn MediaResource>>,
    in_flight: Option<Operation>,
    /// State a pending seek settles back into.
    seek_return: PlaybackState,
    /// Pause as soon as an in-flight play settles.
    yield_pending: bool,
    /// Bumped whenever the current resource stops being usable.
    epoch: u64,
    /// Bumped on every confirmed transition; polls started before a bump
    /// carry stale position data.
    transitions: u64,
    release_hooks: Vec<(u64, ReleaseHook)>,
    trackers: Vec<(u64, CancellationToken)>,
}

struct SessionShared {
    id: SessionId,
    asset: Arc<MediaAsset>,
    backend: Arc<dyn MediaBackend>,
    config: PlayerConfig,
    inner: Mutex<SessionInner>,
    events: EventBus,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|err| err.into_inner());
        if let Some(resource) = inner.resource.take() {
            tracing::debug!(session_id = %self.id, "closing resource of dropped session");
            resource.close();
        }
        for (_, token) in inner.trackers.drain(..) {
            token.cancel();
        }
    }
}

/// Shared handle to one load-to-unload playback lifecycle.
#[derive(Clone)]
pub struct PlaybackSession {
    shared: Arc<SessionShared>,
}

/// Non-owning reference to a session.
#[derive(Clone)]
pub struct WeakSession {
    id: SessionId,
    shared: Weak<SessionShared>,
}

impl WeakSession {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn upgrade(&self) -> Option<PlaybackSession> {
        self.shared.upgrade().map(|shared| PlaybackSession { shared })
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.shared.id)
            .field("asset_id", &self.shared.asset.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PlaybackSession {
    /// Create an `Idle` session for `asset`. Nothing is opened until [`load`](Self::load).
    pub fn new(
        asset: Arc<MediaAsset>,
        backend: Arc<dyn MediaBackend>,
        config: &PlayerConfig,
    ) -> Self {
        let config = config.clone().normalized();
        let id = SessionId(format!("session:{}:{}", asset.kind, Uuid::new_v4()));
        let inner = SessionInner {
            state: PlaybackState::Idle,
            position_ms: 0,
            duration_ms: 0,
            volume: config.default_volume,
            muted: false,
            rate: config.default_rate,
            repeat: false,
            autoplay: config.autoplay,
            last_error: None,
            resource: None,
            in_flight: None,
            seek_return: PlaybackState::Paused,
            yield_pending: false,
            epoch: 0,
            transitions: 0,
            release_hooks: Vec::new(),
            trackers: Vec::new(),
        };
        tracing::debug!(session_id = %id, asset_id = %asset.id, "session created");
        Self {
            shared: Arc::new(SessionShared {
                id,
                asset,
                backend,
                config,
                inner: Mutex::new(inner),
                events: EventBus::new(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub fn asset(&self) -> &Arc<MediaAsset> {
        &self.shared.asset
    }

    pub fn state(&self) -> PlaybackState {
        self.lock().state
    }

    /// Operation currently awaiting the resource, if any.
    pub fn in_flight(&self) -> Option<Operation> {
        self.lock().in_flight
    }

    pub fn last_error(&self) -> Option<PlayerError> {
        self.lock().last_error.clone()
    }

    pub fn autoplay(&self) -> bool {
        self.lock().autoplay
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let inner = self.lock();
        ProgressSnapshot::new(inner.position_ms, inner.duration_ms)
    }

    /// Serializable read model of the session.
    pub fn status(&self) -> SessionStatus {
        let inner = self.lock();
        SessionStatus {
            session_id: self.shared.id.clone(),
            asset_id: self.shared.asset.id.clone(),
            state: inner.state,
            position_ms: inner.position_ms,
            duration_ms: inner.duration_ms,
            volume: inner.volume,
            muted: inner.muted,
            playback_rate: inner.rate,
            repeat: inner.repeat,
            last_error: inner.last_error.as_ref().map(ToString::to_string),
        }
    }

    /// Subscribe to state, settings and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            id: self.shared.id.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// `true` when both handles refer to the same session.
    pub fn same_as(&self, other: &PlaybackSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Acquire the native resource. Only valid from `Idle`.
    pub async fn load(&self, options: LoadOptions) -> Result<()> {
        let epoch = {
            let mut inner = self.lock();
            if inner.in_flight.is_some() || inner.state != PlaybackState::Idle {
                return Err(self.reject(&inner, Operation::Load));
            }
            if let Some(autoplay) = options.autoplay {
                inner.autoplay = autoplay;
            }
            inner.in_flight = Some(Operation::Load);
            self.set_state(&mut inner, PlaybackState::Loading);
            inner.epoch
        };

        let asset = &self.shared.asset;
        let open = self.shared.backend.open(&asset.uri, asset.kind);
        let opened = match self.shared.config.load_timeout() {
            Some(limit) => match tokio::time::timeout(limit, open).await {
                Ok(result) => result,
                Err(_) => Err(ResourceError::new(format!(
                    "timed out after {} ms",
                    limit.as_millis()
                ))),
            },
            None => open.await,
        };

        let resource = match opened {
            Ok(resource) => resource,
            Err(err) => {
                let error = PlayerError::Open {
                    uri: asset.uri.clone(),
                    reason: err.message,
                };
                let mut inner = self.lock();
                if inner.epoch != epoch {
                    return Err(PlayerError::invalid_state(Operation::Load, inner.state));
                }
                inner.in_flight = None;
                self.fail(&mut inner, error.clone());
                return Err(error);
            }
        };

        let (volume, muted, rate) = {
            let mut inner = self.lock();
            if inner.epoch != epoch || inner.state != PlaybackState::Loading {
                let state = inner.state;
                drop(inner);
                tracing::info!(session_id = %self.shared.id, "closing resource opened after release");
                resource.close();
                return Err(PlayerError::invalid_state(Operation::Load, state));
            }
            inner.resource = Some(resource.clone());
            (inner.volume, inner.muted, inner.rate)
        };

        if let Err(err) = resource.set_volume(volume).await {
            tracing::warn!(session_id = %self.shared.id, error = %err, "initial volume not applied");
        }
        if muted {
            if let Err(err) = resource.set_muted(true).await {
                tracing::warn!(session_id = %self.shared.id, error = %err, "initial mute not applied");
            }
        }
        if rate != 1.0 {
            if let Err(err) = resource.set_rate(rate).await {
                tracing::warn!(session_id = %self.shared.id, error = %err, "initial rate not applied");
            }
        }
        let initial = resource.status().await.ok();

        let autoplay = {
            let mut inner = self.lock();
            if inner.epoch != epoch || inner.state != PlaybackState::Loading {
                return Err(PlayerError::invalid_state(Operation::Load, inner.state));
            }
            inner.in_flight = None;
            if let Some(duration_ms) = initial.and_then(|status| status.duration_ms) {
                inner.duration_ms = duration_ms;
            }
            self.set_state(&mut inner, PlaybackState::Ready);
            inner.autoplay
        };
        tracing::info!(
            session_id = %self.shared.id,
            uri = %asset.uri,
            autoplay,
            "session loaded"
        );

        if autoplay {
            self.play().await?;
        }
        Ok(())
    }

    /// Start or resume playback.
    ///
    /// From `Ended` this restarts only when repeat is enabled; otherwise the
    /// session stays `Ended` (use [`replay`](Self::replay) to restart).
    pub async fn play(&self) -> Result<()> {
        let begun = {
            let mut inner = self.lock();
            match inner.state {
                PlaybackState::Playing if inner.in_flight.is_none() => return Ok(()),
                PlaybackState::Ended if !inner.repeat => return Ok(()),
                PlaybackState::Ended => None,
                PlaybackState::Ready | PlaybackState::Paused => {
                    Some(self.begin(&mut inner, Operation::Play)?)
                }
                _ => return Err(self.reject(&inner, Operation::Play)),
            }
        };
        let Some((resource, epoch)) = begun else {
            return self.restart(Operation::Play).await;
        };

        let result = resource.play().await;
        self.settle_play(Operation::Play, resource, epoch, result).await
    }

    pub async fn pause(&self) -> Result<()> {
        let (resource, epoch, during_seek) = {
            let mut inner = self.lock();
            match inner.state {
                PlaybackState::Paused if inner.in_flight.is_none() => return Ok(()),
                PlaybackState::Seeking => {
                    let Some(resource) = inner.resource.clone() else {
                        return Err(self.reject(&inner, Operation::Pause));
                    };
                    let previous = std::mem::replace(&mut inner.seek_return, PlaybackState::Paused);
                    (resource, inner.epoch, Some(previous))
                }
                PlaybackState::Playing => {
                    let (resource, epoch) = self.begin(&mut inner, Operation::Pause)?;
                    (resource, epoch, None)
                }
                _ => return Err(self.reject(&inner, Operation::Pause)),
            }
        };
        if let Some(previous) = during_seek {
            return self.pause_during_seek(resource, epoch, previous).await;
        }

        let result = resource.pause().await;
        let mut inner = self.settle(Operation::Pause, epoch)?;
        match result {
            Ok(()) => {
                self.set_state(&mut inner, PlaybackState::Paused);
                Ok(())
            }
            Err(err) => Err(self.report(Operation::Pause, err)),
        }
    }

    /// Move to `target_ms`, clamped to `[0, duration]` once the duration is known.
    pub async fn seek(&self, target_ms: i64) -> Result<()> {
        let target_ms = target_ms.max(0) as u64;
        let (resource, epoch, target_ms, prior) = {
            let mut inner = self.lock();
            if !matches!(inner.state, PlaybackState::Playing | PlaybackState::Paused) {
                return Err(self.reject(&inner, Operation::Seek));
            }
            let target_ms = if inner.duration_ms > 0 {
                target_ms.min(inner.duration_ms)
            } else {
                target_ms
            };
            let prior = inner.state;
            let (resource, epoch) = self.begin(&mut inner, Operation::Seek)?;
            inner.seek_return = prior;
            self.set_state(&mut inner, PlaybackState::Seeking);
            (resource, epoch, target_ms, prior)
        };

        let result = resource.seek(target_ms).await;
        let mut inner = self.settle(Operation::Seek, epoch)?;
        let back = if inner.state == PlaybackState::Seeking {
            inner.seek_return
        } else {
            inner.state
        };
        match result {
            Ok(()) => {
                inner.position_ms = if inner.duration_ms > 0 {
                    target_ms.min(inner.duration_ms)
                } else {
                    target_ms
                };
                self.set_state(&mut inner, back);
                self.shared.events.publish(SessionEvent::PositionChanged {
                    session_id: self.shared.id.clone(),
                    position_ms: inner.position_ms,
                    duration_ms: inner.duration_ms,
                });
                tracing::debug!(session_id = %self.shared.id, target_ms, from = %prior, "seek settled");
                Ok(())
            }
            Err(err) => {
                self.set_state(&mut inner, back);
                Err(self.report(Operation::Seek, err))
            }
        }
    }

    /// Restart from the beginning and play.
    pub async fn replay(&self) -> Result<()> {
        {
            let inner = self.lock();
            if !matches!(
                inner.state,
                PlaybackState::Ended | PlaybackState::Playing | PlaybackState::Paused
            ) {
                return Err(self.reject(&inner, Operation::Replay));
            }
        }
        self.restart(Operation::Replay).await
    }

    /// Set the stored volume, clamped to `[0, 1]` (`NaN` becomes `0`).
    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        let Some((resource, epoch)) = self.settings_target(Operation::SetVolume, |inner| {
            inner.volume = volume;
        })?
        else {
            return Ok(());
        };
        let result = resource.set_volume(volume).await;
        self.settle_setting(Operation::SetVolume, epoch, result, |inner| {
            inner.volume = volume;
        })
    }

    /// Mute or unmute without touching the stored volume.
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        let Some((resource, epoch)) = self.settings_target(Operation::SetMuted, |inner| {
            inner.muted = muted;
        })?
        else {
            return Ok(());
        };
        let result = resource.set_muted(muted).await;
        self.settle_setting(Operation::SetMuted, epoch, result, |inner| {
            inner.muted = muted;
        })
    }

    /// Set the playback speed multiplier (must be positive and finite).
    pub async fn set_playback_rate(&self, rate: f32) -> Result<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(PlayerError::InvalidRate(rate));
        }
        let Some((resource, epoch)) = self.settings_target(Operation::SetRate, |inner| {
            inner.rate = rate;
        })?
        else {
            return Ok(());
        };
        let result = resource.set_rate(rate).await;
        self.settle_setting(Operation::SetRate, epoch, result, |inner| {
            inner.rate = rate;
        })
    }

    /// Toggle restart-at-end. Handled in the core; never reaches the resource.
    pub fn set_repeat(&self, repeat: bool) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == PlaybackState::Unloaded {
            return Err(PlayerError::invalid_state(Operation::SetRepeat, inner.state));
        }
        if inner.repeat != repeat {
            inner.repeat = repeat;
            self.publish_settings(&inner);
        }
        Ok(())
    }

    /// Enable or cancel playback once the pending load completes.
    pub fn set_autoplay(&self, autoplay: bool) {
        self.lock().autoplay = autoplay;
    }

    /// Release the native resource and enter `Unloaded`. Idempotent.
    pub fn release(&self) {
        let (from, resource, hooks, trackers) = {
            let mut inner = self.lock();
            if inner.state == PlaybackState::Unloaded {
                return;
            }
            let from = inner.state;
            inner.state = PlaybackState::Unloaded;
            inner.epoch += 1;
            inner.in_flight = None;
            inner.yield_pending = false;
            inner.last_error = None;
            (
                from,
                inner.resource.take(),
                std::mem::take(&mut inner.release_hooks),
                std::mem::take(&mut inner.trackers),
            )
        };
        for (_, token) in trackers {
            token.cancel();
        }
        if let Some(resource) = resource {
            resource.close();
        }
        for (_, hook) in hooks {
            hook();
        }
        self.shared.events.publish(SessionEvent::StateChanged {
            session_id: self.shared.id.clone(),
            from,
            to: PlaybackState::Unloaded,
        });
        tracing::info!(session_id = %self.shared.id, from = %from, "session released");
    }

    /// Push-model hook: the resource reported end of media.
    pub async fn handle_end_reached(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if !matches!(
                inner.state,
                PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Seeking
            ) {
                return Ok(());
            }
            if !inner.repeat {
                self.enter_ended(&mut inner);
                return Ok(());
            }
            if inner.in_flight.is_some() {
                return Ok(());
            }
        }
        self.replay().await
    }

    /// Push-model hook: the resource reported a fatal playback error.
    pub fn handle_error_event(&self, error: PlayerError) {
        let mut inner = self.lock();
        if matches!(inner.state, PlaybackState::Unloaded | PlaybackState::Error) {
            return;
        }
        inner.in_flight = None;
        self.fail(&mut inner, error);
    }

    pub(crate) fn add_release_hook(&self, key: u64, hook: ReleaseHook) {
        let mut inner = self.lock();
        if inner.state == PlaybackState::Unloaded {
            drop(inner);
            hook();
            return;
        }
        inner.release_hooks.retain(|(existing, _)| *existing != key);
        inner.release_hooks.push((key, hook));
    }

    pub(crate) fn remove_release_hook(&self, key: u64) {
        self.lock().release_hooks.retain(|(existing, _)| *existing != key);
    }

    /// Register a tracker cancellation token. Returns `false` for unloaded sessions.
    pub(crate) fn bind_tracker(&self, key: u64, token: CancellationToken) -> bool {
        let mut inner = self.lock();
        if inner.state == PlaybackState::Unloaded {
            return false;
        }
        inner.trackers.retain(|(existing, _)| *existing != key);
        inner.trackers.push((key, token));
        true
    }

    pub(crate) fn unbind_tracker(&self, key: u64) {
        self.lock().trackers.retain(|(existing, _)| *existing != key);
    }

    /// Resource to poll and the mark to hand back with its status, when the
    /// state tracks progress.
    pub(crate) fn poll_target(&self) -> Option<(Arc<dyn MediaResource>, PollMark)> {
        let inner = self.lock();
        if !inner.state.accepts_progress() {
            return None;
        }
        let mark = PollMark {
            epoch: inner.epoch,
            transitions: inner.transitions,
        };
        inner.resource.clone().map(|resource| (resource, mark))
    }

    /// Fold a polled status into position/duration. Never changes state except
    /// for the end-of-media transition.
    ///
    /// A transition confirmed while the poll was in flight wins: only the
    /// duration is taken from such a status.
    pub(crate) fn apply_status(&self, mark: PollMark, status: ResourceStatus) -> StatusOutcome {
        let mut inner = self.lock();
        if inner.epoch != mark.epoch {
            return StatusOutcome::Stale;
        }
        if !inner.state.accepts_progress() {
            return StatusOutcome::Ignored;
        }
        let current = inner.transitions == mark.transitions;

        let mut revealed = false;
        if let Some(duration_ms) = status.duration_ms.filter(|duration| *duration > 0) {
            revealed = inner.duration_ms != duration_ms;
            inner.duration_ms = duration_ms;
        }
        if current && inner.state != PlaybackState::Seeking {
            inner.position_ms = status.position_ms;
        }
        if inner.duration_ms > 0 {
            inner.position_ms = inner.position_ms.min(inner.duration_ms);
        }
        if revealed {
            tracing::debug!(
                session_id = %self.shared.id,
                duration_ms = inner.duration_ms,
                "duration reported"
            );
            self.shared.events.publish(SessionEvent::PositionChanged {
                session_id: self.shared.id.clone(),
                position_ms: inner.position_ms,
                duration_ms: inner.duration_ms,
            });
        }

        if current
            && status.finished
            && inner.in_flight.is_none()
            && inner.state == PlaybackState::Playing
        {
            if inner.repeat {
                return StatusOutcome::RepeatRequested;
            }
            self.enter_ended(&mut inner);
            return StatusOutcome::Ended(ProgressSnapshot::new(
                inner.position_ms,
                inner.duration_ms,
            ));
        }
        StatusOutcome::Applied(ProgressSnapshot::new(inner.position_ms, inner.duration_ms))
    }

    /// Repeated poll failures: move to `Error` unless the resource already changed.
    pub(crate) fn fail_from_poll(&self, mark: PollMark, error: PlayerError) {
        let mut inner = self.lock();
        if inner.epoch != mark.epoch
            || matches!(inner.state, PlaybackState::Unloaded | PlaybackState::Error)
        {
            return;
        }
        inner.in_flight = None;
        self.fail(&mut inner, error);
    }

    /// Give up the foreground to another session without releasing.
    pub(crate) async fn yield_playback(&self) -> Result<()> {
        let pause = {
            let mut inner = self.lock();
            match (inner.state, inner.in_flight) {
                (_, Some(Operation::Play | Operation::Replay)) => {
                    inner.autoplay = false;
                    inner.yield_pending = true;
                    false
                }
                (PlaybackState::Idle | PlaybackState::Loading | PlaybackState::Ready, _) => {
                    inner.autoplay = false;
                    false
                }
                (PlaybackState::Playing | PlaybackState::Seeking, _) => true,
                _ => false,
            }
        };
        if pause {
            self.pause().await?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    fn reject(&self, inner: &SessionInner, op: Operation) -> PlayerError {
        tracing::debug!(
            session_id = %self.shared.id,
            op = %op,
            state = %inner.state,
            in_flight = ?inner.in_flight,
            "operation rejected"
        );
        PlayerError::InvalidState {
            op,
            state: inner.state,
            in_flight: inner.in_flight,
        }
    }

    /// Mark `op` in flight and hand back the resource to call.
    fn begin(
        &self,
        inner: &mut SessionInner,
        op: Operation,
    ) -> Result<(Arc<dyn MediaResource>, u64)> {
        if inner.in_flight.is_some() {
            return Err(self.reject(inner, op));
        }
        let Some(resource) = inner.resource.clone() else {
            return Err(self.reject(inner, op));
        };
        inner.in_flight = Some(op);
        Ok((resource, inner.epoch))
    }

    /// Re-lock after an awaited call; fails if the resource changed meanwhile.
    fn settle(&self, op: Operation, epoch: u64) -> Result<MutexGuard<'_, SessionInner>> {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            tracing::debug!(session_id = %self.shared.id, op = %op, "discarding stale completion");
            return Err(PlayerError::invalid_state(op, inner.state));
        }
        inner.in_flight = None;
        Ok(inner)
    }

    async fn settle_play(
        &self,
        op: Operation,
        resource: Arc<dyn MediaResource>,
        epoch: u64,
        result: std::result::Result<(), ResourceError>,
    ) -> Result<()> {
        let yield_now = {
            let mut inner = self.settle(op, epoch)?;
            if let Err(err) = result {
                let error = PlayerError::playback(op, err);
                self.fail(&mut inner, error.clone());
                return Err(error);
            }
            self.set_state(&mut inner, PlaybackState::Playing);
            if inner.yield_pending {
                inner.yield_pending = false;
                inner.in_flight = Some(Operation::Pause);
                true
            } else {
                false
            }
        };
        if !yield_now {
            return Ok(());
        }

        tracing::debug!(session_id = %self.shared.id, "pausing session that lost focus while starting");
        let result = resource.pause().await;
        let mut inner = self.settle(Operation::Pause, epoch)?;
        match result {
            Ok(()) => {
                self.set_state(&mut inner, PlaybackState::Paused);
                Ok(())
            }
            Err(err) => Err(self.report(Operation::Pause, err)),
        }
    }

    async fn restart(&self, op: Operation) -> Result<()> {
        let (resource, epoch) = {
            let mut inner = self.lock();
            self.begin(&mut inner, op)?
        };

        if let Err(err) = resource.seek(0).await {
            drop(self.settle(op, epoch)?);
            return Err(self.report(op, err));
        }
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return Err(PlayerError::invalid_state(op, inner.state));
            }
            inner.position_ms = 0;
        }
        let result = resource.play().await;
        self.settle_play(op, resource, epoch, result).await
    }

    async fn pause_during_seek(
        &self,
        resource: Arc<dyn MediaResource>,
        epoch: u64,
        previous: PlaybackState,
    ) -> Result<()> {
        match resource.pause().await {
            Ok(()) => {
                let mut inner = self.lock();
                if inner.epoch == epoch && inner.state == PlaybackState::Playing {
                    // seek already settled back into Playing
                    self.set_state(&mut inner, PlaybackState::Paused);
                }
                Ok(())
            }
            Err(err) => {
                let mut inner = self.lock();
                if inner.epoch == epoch && inner.state == PlaybackState::Seeking {
                    inner.seek_return = previous;
                }
                drop(inner);
                Err(self.report(Operation::Pause, err))
            }
        }
    }

    /// Store-only path when no resource exists yet; otherwise hand back the resource.
    fn settings_target(
        &self,
        op: Operation,
        store: impl FnOnce(&mut SessionInner),
    ) -> Result<Option<(Arc<dyn MediaResource>, u64)>> {
        let mut inner = self.lock();
        if inner.state == PlaybackState::Unloaded {
            return Err(self.reject(&inner, op));
        }
        match inner.resource.clone() {
            Some(resource) => Ok(Some((resource, inner.epoch))),
            None => {
                store(&mut *inner);
                self.publish_settings(&inner);
                Ok(None)
            }
        }
    }

    fn settle_setting(
        &self,
        op: Operation,
        epoch: u64,
        result: std::result::Result<(), ResourceError>,
        store: impl FnOnce(&mut SessionInner),
    ) -> Result<()> {
        if let Err(err) = result {
            return Err(self.report(op, err));
        }
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return Err(PlayerError::invalid_state(op, inner.state));
        }
        store(&mut *inner);
        self.publish_settings(&inner);
        Ok(())
    }

    fn publish_settings(&self, inner: &SessionInner) {
        self.shared.events.publish(SessionEvent::SettingsChanged {
            session_id: self.shared.id.clone(),
            volume: inner.volume,
            muted: inner.muted,
            playback_rate: inner.rate,
            repeat: inner.repeat,
        });
    }

    /// Surface a non-fatal failure without changing state.
    fn report(&self, op: Operation, err: ResourceError) -> PlayerError {
        let error = PlayerError::playback(op, err);
        tracing::warn!(session_id = %self.shared.id, op = %op, error = %error, "session operation failed");
        self.shared.events.publish(SessionEvent::Failed {
            session_id: self.shared.id.clone(),
            error: error.clone(),
        });
        error
    }

    fn fail(&self, inner: &mut SessionInner, error: PlayerError) {
        tracing::warn!(session_id = %self.shared.id, error = %error, "session failed");
        inner.epoch += 1;
        inner.yield_pending = false;
        inner.last_error = Some(error.clone());
        self.set_state(inner, PlaybackState::Error);
        self.shared.events.publish(SessionEvent::Failed {
            session_id: self.shared.id.clone(),
            error,
        });
    }

    fn enter_ended(&self, inner: &mut SessionInner) {
        if inner.in_flight.is_some() {
            inner.epoch += 1;
            inner.in_flight = None;
        }
        if inner.duration_ms > 0 {
            inner.position_ms = inner.duration_ms;
        }
        self.set_state(inner, PlaybackState::Ended);
    }

    fn set_state(&self, inner: &mut SessionInner, to: PlaybackState) {
        inner.transitions += 1;
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if to != PlaybackState::Error {
            inner.last_error = None;
        }
        tracing::info!(session_id = %self.shared.id, from = %from, to = %to, "session state changed");
        self.shared.events.publish(SessionEvent::StateChanged {
            session_id: self.shared.id.clone(),
            from,
            to,
        });
    }
}
