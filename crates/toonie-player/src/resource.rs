//! Native playback resource abstraction.
//!
//! Implementations translate session operations into calls on the platform
//! media layer. Every transport call is a suspension point; `close` is
//! synchronous so screens can release resources while unmounting.

use std::sync::Arc;

use async_trait::async_trait;
use toonie_types::MediaKind;

use crate::error::ResourceError;

/// Status reported by a native resource when polled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Current playback position in milliseconds.
    pub position_ms: u64,
    /// Total length in milliseconds once the resource knows it.
    pub duration_ms: Option<u64>,
    /// `true` while the resource is producing output.
    pub is_playing: bool,
    /// `true` once playback has reached the end of the media.
    pub finished: bool,
}

/// Handle to one loaded native media resource.
#[async_trait]
pub trait MediaResource: Send + Sync {
    async fn play(&self) -> Result<(), ResourceError>;
    async fn pause(&self) -> Result<(), ResourceError>;
    async fn seek(&self, position_ms: u64) -> Result<(), ResourceError>;
    async fn set_volume(&self, volume: f32) -> Result<(), ResourceError>;
    async fn set_muted(&self, muted: bool) -> Result<(), ResourceError>;
    async fn set_rate(&self, rate: f32) -> Result<(), ResourceError>;
    /// Query position/duration/playing flags.
    async fn status(&self) -> Result<ResourceStatus, ResourceError>;
    /// Release the native handle. Must be idempotent.
    fn close(&self);
}

/// Provider that opens native resources for a source URI.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn open(
        &self,
        uri: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn MediaResource>, ResourceError>;
}
