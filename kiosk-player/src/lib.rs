//! Client-side playback for kiosk displays: a playlist state machine that
//! cycles mirrored media, survives autoplay rejections and pauses while the
//! display is hidden.

mod backoff;
mod controller;
mod playlist;
mod runtime;
mod surface;
mod timer;

pub use backoff::Backoff;
pub use controller::{PlaybackController, PlayerConfig, PlayerState};
pub use playlist::{FetchError, PlaylistFetcher, PlaylistItem};
pub use runtime::{
    DEFAULT_REFRESH_INTERVAL, PlayerEvent, PlayerHandle, PlayerRuntime, PlayerStatus,
    TokioScheduler,
};
pub use surface::{MediaSurface, PlaybackError, SourceEpoch, SurfaceEvent, SurfaceEventKind};
pub use timer::{Scheduler, TimerId};
