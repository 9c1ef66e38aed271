//! Progress tracker.
//!
//! Samples one session's resource on a fixed interval and republishes a
//! normalized [`ProgressSnapshot`] over a watch channel. Ticks only ever
//! update position/duration; repeated poll failures are escalated to the
//! session, which decides whether to enter `Error`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use toonie_types::{ProgressSnapshot, SessionId};

use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::session::{next_hook_key, PlaybackSession, StatusOutcome, WeakSession};

struct ActiveTrack {
    session: WeakSession,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TrackerInner {
    active: Option<ActiveTrack>,
    generation: u64,
}

struct TrackerShared {
    key: u64,
    interval: Duration,
    max_failures: u32,
    snapshot: watch::Sender<Option<ProgressSnapshot>>,
    inner: Mutex<TrackerInner>,
}

impl TrackerShared {
    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Publish only while `generation` is still the current, uncancelled track.
    fn publish(&self, generation: u64, cancel: &CancellationToken, snapshot: ProgressSnapshot) {
        let inner = self.lock();
        let current = inner
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if current && !cancel.is_cancelled() {
            self.snapshot.send_replace(Some(snapshot));
        }
    }
}

/// Polls the bound session and publishes progress snapshots.
pub struct ProgressTracker {
    shared: Arc<TrackerShared>,
}

impl ProgressTracker {
    pub fn new(config: &PlayerConfig) -> Self {
        let config = config.clone().normalized();
        let (snapshot, _) = watch::channel(None);
        Self {
            shared: Arc::new(TrackerShared {
                key: next_hook_key(),
                interval: config.poll_interval(),
                max_failures: config.max_poll_failures,
                snapshot,
                inner: Mutex::new(TrackerInner::default()),
            }),
        }
    }

    /// Begin sampling `session`. No-op when already tracking it; switching
    /// sessions stops the previous sampling first.
    pub fn start(&self, session: &PlaybackSession) {
        let mut inner = self.shared.lock();
        if let Some(active) = &inner.active {
            if active.session.id() == session.id() && !active.cancel.is_cancelled() {
                return;
            }
        }
        if let Some(previous) = inner.active.take() {
            Self::detach(&self.shared, previous);
        }

        let cancel = CancellationToken::new();
        if !session.bind_tracker(self.shared.key, cancel.clone()) {
            tracing::debug!(session_id = %session.id(), "not tracking unloaded session");
            self.shared.snapshot.send_replace(None);
            return;
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.active = Some(ActiveTrack {
            session: session.downgrade(),
            generation,
            cancel: cancel.clone(),
        });
        self.shared.snapshot.send_replace(Some(session.progress()));
        drop(inner);

        tracing::debug!(session_id = %session.id(), generation, "progress tracking started");
        tokio::spawn(run(
            self.shared.clone(),
            session.downgrade(),
            generation,
            cancel,
        ));
    }

    /// Halt sampling. No snapshot is published after this returns.
    pub fn stop(&self) {
        let previous = self.shared.lock().active.take();
        if let Some(previous) = previous {
            Self::detach(&self.shared, previous);
            self.shared.snapshot.send_replace(None);
        }
    }

    /// Session currently being sampled.
    pub fn tracking(&self) -> Option<SessionId> {
        self.shared
            .lock()
            .active
            .as_ref()
            .filter(|active| !active.cancel.is_cancelled())
            .map(|active| active.session.id().clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressSnapshot>> {
        self.shared.snapshot.subscribe()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        *self.shared.snapshot.borrow()
    }

    fn detach(shared: &TrackerShared, previous: ActiveTrack) {
        previous.cancel.cancel();
        if let Some(session) = previous.session.upgrade() {
            session.unbind_tracker(shared.key);
        }
        tracing::debug!(session_id = %previous.session.id(), "progress tracking stopped");
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    shared: Arc<TrackerShared>,
    session: WeakSession,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(current) = session.upgrade() else {
            break;
        };
        let Some((resource, mark)) = current.poll_target() else {
            failures = 0;
            continue;
        };

        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = resource.status() => polled,
        };
        match polled {
            Ok(status) => {
                failures = 0;
                match current.apply_status(mark, status) {
                    StatusOutcome::Applied(snapshot) | StatusOutcome::Ended(snapshot) => {
                        shared.publish(generation, &cancel, snapshot);
                    }
                    StatusOutcome::RepeatRequested => {
                        if let Err(err) = current.replay().await {
                            tracing::warn!(session_id = %session.id(), error = %err, "repeat restart failed");
                        }
                    }
                    StatusOutcome::Stale | StatusOutcome::Ignored => {}
                }
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(
                    session_id = %session.id(),
                    failures,
                    error = %err,
                    "progress poll failed"
                );
                if failures >= shared.max_failures {
                    current.fail_from_poll(mark, PlayerError::TransientPoll(err.message));
                    failures = 0;
                }
            }
        }
    }
    tracing::debug!(session_id = %session.id(), generation, "progress task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LoadOptions;
    use crate::sim::SimulatedBackend;
    use toonie_types::{MediaAsset, MediaKind, PlaybackState};

    fn config() -> PlayerConfig {
        PlayerConfig {
            autoplay: false,
            poll_interval_ms: 1_000,
            ..PlayerConfig::default()
        }
    }

    async fn loaded(backend: &SimulatedBackend, id: &str) -> PlaybackSession {
        let asset = Arc::new(MediaAsset::new(
            id,
            format!("{id}.mp3"),
            MediaKind::Audio,
            format!("file:///music/{id}.mp3"),
        ));
        let session = PlaybackSession::new(asset, Arc::new(backend.clone()), &config());
        session.load(LoadOptions::default()).await.unwrap();
        session
    }

    async fn settle_ticks(ticks: u64) {
        tokio::time::sleep(Duration::from_millis(1_000 * ticks + 10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_position_while_playing() {
        let backend = SimulatedBackend::new(10_000);
        let session = loaded(&backend, "a").await;
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);
        session.play().await.unwrap();

        settle_ticks(2).await;
        let snapshot = tracker.snapshot().unwrap();
        assert_eq!(snapshot.duration_ms, 10_000);
        assert!(snapshot.position_ms >= 2_000);
        assert!(snapshot.ratio > 0.0 && snapshot.ratio <= 1.0);
        assert_eq!(session.state(), PlaybackState::Playing);
        assert_eq!(tracker.tracking(), Some(session.id().clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_a_no_op_and_switch_rebinds() {
        let backend = SimulatedBackend::new(10_000);
        let first = loaded(&backend, "a").await;
        let second = loaded(&backend, "b").await;
        let tracker = ProgressTracker::new(&config());

        tracker.start(&first);
        tracker.start(&first);
        assert_eq!(tracker.tracking(), Some(first.id().clone()));

        tracker.start(&second);
        assert_eq!(tracker.tracking(), Some(second.id().clone()));
        first.release();
        assert_eq!(tracker.tracking(), Some(second.id().clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn no_snapshot_after_stop() {
        let backend = SimulatedBackend::new(10_000);
        let session = loaded(&backend, "a").await;
        session.play().await.unwrap();
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);
        settle_ticks(1).await;

        tracker.stop();
        let rx = tracker.subscribe();
        settle_ticks(3).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(tracker.snapshot(), None);
        assert_eq!(tracker.tracking(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn release_cancels_tracking() {
        let backend = SimulatedBackend::new(10_000);
        let session = loaded(&backend, "a").await;
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);
        session.release();
        assert_eq!(tracker.tracking(), None);

        let before = tracker.snapshot();
        settle_ticks(2).await;
        assert_eq!(tracker.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_poll_failures_move_session_to_error() {
        let backend = SimulatedBackend::new(60_000);
        let session = loaded(&backend, "a").await;
        session.play().await.unwrap();
        let tracker = ProgressTracker::new(&config());
        backend.last_resource().unwrap().fail_status(3);
        tracker.start(&session);

        // first tick fires immediately, then one per second
        tokio::time::sleep(Duration::from_millis(1_010)).await;
        assert_eq!(session.state(), PlaybackState::Playing);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(session.state(), PlaybackState::Error);
        assert!(session.status().last_error.unwrap().contains("status poll failed"));

        // a healthy fourth tick has no effect
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(session.state(), PlaybackState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_before_end_do_not_count_after_replay() {
        let backend = SimulatedBackend::new(60_000);
        let session = loaded(&backend, "a").await;
        session.play().await.unwrap();
        let resource = backend.last_resource().unwrap();
        resource.fail_status(2);
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);

        // ticks at 0 and 1000 fail
        tokio::time::sleep(Duration::from_millis(1_010)).await;
        session.handle_end_reached().await.unwrap();
        assert_eq!(session.state(), PlaybackState::Ended);

        // tick at 2000 sees nothing to poll
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        session.replay().await.unwrap();
        resource.fail_status(1);

        settle_ticks(1).await;
        assert_eq!(session.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_poll_does_not_override_a_later_seek() {
        let backend = SimulatedBackend::new(2_000);
        let session = loaded(&backend, "a").await;
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);
        session.play().await.unwrap();
        backend
            .last_resource()
            .unwrap()
            .set_status_delay(Duration::from_millis(400));

        // the tick at 2000 samples the finished clip and replies at 2400
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        session.seek(500).await.unwrap();
        assert_eq!(session.state(), PlaybackState::Playing);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(session.state(), PlaybackState::Playing);
        assert!(session.status().position_ms < 2_000);
        assert!(backend.last_resource().unwrap().is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn single_failure_is_swallowed() {
        let backend = SimulatedBackend::new(60_000);
        let session = loaded(&backend, "a").await;
        session.play().await.unwrap();
        backend.last_resource().unwrap().fail_status(2);
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);

        settle_ticks(4).await;
        assert_eq!(session.state(), PlaybackState::Playing);
        assert!(tracker.snapshot().unwrap().position_ms >= 3_000);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_media_is_detected_from_polls() {
        let backend = SimulatedBackend::new(2_500);
        let session = loaded(&backend, "a").await;
        session.play().await.unwrap();
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);

        settle_ticks(3).await;
        assert_eq!(session.state(), PlaybackState::Ended);
        assert_eq!(tracker.snapshot().unwrap().ratio, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_restarts_from_polls() {
        let backend = SimulatedBackend::new(2_500);
        let session = loaded(&backend, "a").await;
        session.set_repeat(true).unwrap();
        session.play().await.unwrap();
        let tracker = ProgressTracker::new(&config());
        tracker.start(&session);

        settle_ticks(3).await;
        assert_eq!(session.state(), PlaybackState::Playing);
        assert!(backend.last_resource().unwrap().position_ms() < 2_500);
    }
}
