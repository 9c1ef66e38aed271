//! Playback session and now-playing coordination core.
//!
//! Sessions own one native resource each and run the transport state
//! machine; the progress tracker polls them; the now-playing coordinator
//! keeps exactly one of them active; hosts bind sessions to player screens.

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod mini_bar;
pub mod now_playing;
pub mod resource;
pub mod session;
pub mod sim;
pub mod tracker;
pub mod view;

pub use config::PlayerConfig;
pub use error::{Operation, PlayerError, ResourceError};
pub use events::SessionEvent;
pub use host::{PlayerContext, SessionHost, Surface};
pub use mini_bar::NowPlayingBar;
pub use now_playing::NowPlaying;
pub use resource::{MediaBackend, MediaResource, ResourceStatus};
pub use session::{LoadOptions, PlaybackSession, WeakSession};
pub use tracker::ProgressTracker;
