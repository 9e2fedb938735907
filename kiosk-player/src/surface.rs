use thiserror::Error;

/// Identifies one attached source. Events carrying an older epoch come from
/// listeners of a source that has since been detached.
pub type SourceEpoch = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("playback was rejected: {0}")]
    Rejected(String),
    #[error("media failed: {0}")]
    Media(String),
    #[error("no source attached")]
    NoSource,
}

/// The display element the controller drives.
pub trait MediaSurface {
    /// Replaces the current source. Later events for it carry `epoch`.
    fn attach(&mut self, epoch: SourceEpoch, url: &str);
    fn detach(&mut self);
    fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    fn set_muted(&mut self, muted: bool) -> Result<(), PlaybackError>;
    /// Seeks back to the first frame.
    fn rewind(&mut self);
    /// Whether enough of the attached source is buffered to start playing.
    fn is_ready(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEventKind {
    Ready,
    Ended,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceEvent {
    pub epoch: SourceEpoch,
    pub kind: SurfaceEventKind,
}

impl SurfaceEvent {
    pub fn new(epoch: SourceEpoch, kind: SurfaceEventKind) -> Self {
        Self { epoch, kind }
    }
}
