//! Simulated media backend driven by the tokio clock.
//!
//! Resources advance their position in real (or paused test) time scaled by
//! the playback rate, so the whole core can be exercised without a platform
//! media layer. Faults can be injected per operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use toonie_types::MediaKind;

use crate::error::ResourceError;
use crate::resource::{MediaBackend, MediaResource, ResourceStatus};

/// Resource operation that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    Play,
    Pause,
    Seek,
    Volume,
    Muted,
    Rate,
}

#[derive(Default)]
struct BackendState {
    open_delay: Duration,
    hang_open: bool,
    fail_open: Option<String>,
    opened: Vec<Arc<SimResource>>,
}

/// Backend whose resources play silent media of a configured length.
#[derive(Clone)]
pub struct SimulatedBackend {
    duration_ms: u64,
    hidden_duration: bool,
    state: Arc<Mutex<BackendState>>,
}

impl SimulatedBackend {
    /// Every opened resource reports `duration_ms` immediately.
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            hidden_duration: false,
            state: Arc::new(Mutex::new(BackendState::default())),
        }
    }

    /// Resources keep their duration unknown until [`SimResource::reveal_duration`].
    pub fn with_hidden_duration(mut self) -> Self {
        self.hidden_duration = true;
        self
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    /// Make `open` never resolve.
    pub fn hang_open(&self, hang: bool) {
        self.lock().hang_open = hang;
    }

    /// Make `open` fail with `reason` (or succeed again with `None`).
    pub fn fail_open(&self, reason: Option<&str>) {
        self.lock().fail_open = reason.map(str::to_string);
    }

    /// All resources opened so far, oldest first.
    pub fn resources(&self) -> Vec<Arc<SimResource>> {
        self.lock().opened.clone()
    }

    pub fn last_resource(&self) -> Option<Arc<SimResource>> {
        self.lock().opened.last().cloned()
    }

    /// Number of opened resources that have not been closed.
    pub fn live_resources(&self) -> usize {
        self.lock()
            .opened
            .iter()
            .filter(|resource| !resource.is_closed())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait]
impl MediaBackend for SimulatedBackend {
    async fn open(
        &self,
        uri: &str,
        _kind: MediaKind,
    ) -> Result<Arc<dyn MediaResource>, ResourceError> {
        let (delay, hang, failure) = {
            let state = self.lock();
            (state.open_delay, state.hang_open, state.fail_open.clone())
        };
        let duration_ms = self.duration_ms;
        if hang {
            std::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(ResourceError::new(reason));
        }
        let resource = Arc::new(SimResource::new(uri, duration_ms, !self.hidden_duration));
        self.lock().opened.push(resource.clone());
        tracing::debug!(uri, duration_ms, "simulated resource opened");
        Ok(resource)
    }
}

struct SimState {
    duration_ms: u64,
    duration_known: bool,
    base_ms: u64,
    started_at: Option<Instant>,
    rate: f32,
    volume: f32,
    muted: bool,
    closed: bool,
    op_delay: Duration,
    failing: HashMap<SimOp, u32>,
    failing_status: u32,
    status_delay: Duration,
}

impl SimState {
    fn position_ms(&self, now: Instant) -> u64 {
        let played = self
            .started_at
            .map(|started| (now.duration_since(started).as_millis() as f64 * self.rate as f64) as u64)
            .unwrap_or(0);
        (self.base_ms + played).min(self.duration_ms)
    }

    /// Freeze the clock-derived position into `base_ms`.
    fn settle(&mut self, now: Instant) {
        self.base_ms = self.position_ms(now);
        if self.started_at.is_some() {
            self.started_at = Some(now);
        }
    }
}

/// One simulated native handle.
pub struct SimResource {
    uri: String,
    state: Mutex<SimState>,
}

impl SimResource {
    fn new(uri: &str, duration_ms: u64, duration_known: bool) -> Self {
        Self {
            uri: uri.to_string(),
            state: Mutex::new(SimState {
                duration_ms,
                duration_known,
                base_ms: 0,
                started_at: None,
                rate: 1.0,
                volume: 1.0,
                muted: false,
                closed: false,
                op_delay: Duration::ZERO,
                failing: HashMap::new(),
                failing_status: 0,
                status_delay: Duration::ZERO,
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Start reporting the duration in status polls.
    pub fn reveal_duration(&self) {
        self.lock().duration_known = true;
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_op(&self, op: SimOp, times: u32) {
        self.lock().failing.insert(op, times);
    }

    /// Fail the next `times` status polls.
    pub fn fail_status(&self, times: u32) {
        self.lock().failing_status = times;
    }

    /// Sample status immediately but deliver it `delay` later.
    pub fn set_status_delay(&self, delay: Duration) {
        self.lock().status_delay = delay;
    }

    /// Delay every transport and settings call by `delay`.
    pub fn set_op_delay(&self, delay: Duration) {
        self.lock().op_delay = delay;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_playing(&self) -> bool {
        let state = self.lock();
        state.started_at.is_some() && state.position_ms(Instant::now()) < state.duration_ms
    }

    pub fn position_ms(&self) -> u64 {
        self.lock().position_ms(Instant::now())
    }

    pub fn volume(&self) -> f32 {
        self.lock().volume
    }

    pub fn muted(&self) -> bool {
        self.lock().muted
    }

    pub fn rate(&self) -> f32 {
        self.lock().rate
    }

    /// Volume that actually reaches the output.
    pub fn output_volume(&self) -> f32 {
        let state = self.lock();
        if state.muted { 0.0 } else { state.volume }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    async fn call(
        &self,
        op: SimOp,
        apply: impl FnOnce(&mut SimState, Instant) + Send,
    ) -> Result<(), ResourceError> {
        let delay = self.lock().op_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.closed {
            return Err(ResourceError::new("resource closed"));
        }
        if let Some(remaining) = state.failing.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ResourceError::new(format!("simulated {op:?} failure")));
            }
        }
        apply(&mut *state, Instant::now());
        Ok(())
    }
}

#[async_trait]
impl MediaResource for SimResource {
    async fn play(&self) -> Result<(), ResourceError> {
        self.call(SimOp::Play, |state, now| {
            state.settle(now);
            if state.base_ms >= state.duration_ms {
                state.base_ms = 0;
            }
            state.started_at = Some(now);
        })
        .await
    }

    async fn pause(&self) -> Result<(), ResourceError> {
        self.call(SimOp::Pause, |state, now| {
            state.settle(now);
            state.started_at = None;
        })
        .await
    }

    async fn seek(&self, position_ms: u64) -> Result<(), ResourceError> {
        self.call(SimOp::Seek, move |state, now| {
            state.settle(now);
            state.base_ms = position_ms.min(state.duration_ms);
        })
        .await
    }

    async fn set_volume(&self, volume: f32) -> Result<(), ResourceError> {
        self.call(SimOp::Volume, move |state, _| state.volume = volume)
            .await
    }

    async fn set_muted(&self, muted: bool) -> Result<(), ResourceError> {
        self.call(SimOp::Muted, move |state, _| state.muted = muted)
            .await
    }

    async fn set_rate(&self, rate: f32) -> Result<(), ResourceError> {
        self.call(SimOp::Rate, move |state, now| {
            state.settle(now);
            state.rate = rate;
        })
        .await
    }

    async fn status(&self) -> Result<ResourceStatus, ResourceError> {
        let (sampled, delay) = {
            let mut state = self.lock();
            (sample(&mut *state), state.status_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        sampled
    }

    fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.started_at = None;
            tracing::debug!(uri = %self.uri, "simulated resource closed");
        }
    }
}

fn sample(state: &mut SimState) -> Result<ResourceStatus, ResourceError> {
    if state.closed {
        return Err(ResourceError::new("resource closed"));
    }
    if state.failing_status > 0 {
        state.failing_status -= 1;
        return Err(ResourceError::new("simulated status failure"));
    }
    let position_ms = state.position_ms(Instant::now());
    let finished = state.duration_ms > 0 && position_ms >= state.duration_ms;
    Ok(ResourceStatus {
        position_ms,
        duration_ms: state.duration_known.then_some(state.duration_ms),
        is_playing: state.started_at.is_some() && !finished,
        finished,
    })
}
