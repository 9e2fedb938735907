//! Playlist playback state machine.
//!
//! The controller owns one [`MediaSurface`] and one timer slot. Every input is
//! applied synchronously through `&mut self`, and every transition cancels the
//! pending timer before it schedules a new one, so at most one timer is ever
//! live. Surface events tagged with an old [`SourceEpoch`] and timers other
//! than the owned one are dropped.

use std::time::Duration;

use crate::backoff::Backoff;
use crate::playlist::PlaylistItem;
use crate::surface::{MediaSurface, SourceEpoch, SurfaceEvent, SurfaceEventKind};
use crate::timer::{Scheduler, TimerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loading,
    Playing,
    RetryingAutoplay,
    Advancing,
    Suspended,
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Keep sound off after playback starts.
    pub muted: bool,
    pub loop_playlist: bool,
    pub max_play_retries: u32,
    pub backoff: Backoff,
    /// Pause before moving past a failed item.
    pub skip_delay: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            muted: true,
            loop_playlist: true,
            max_play_retries: 3,
            backoff: Backoff::default(),
            skip_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    RetryPlay,
    Advance,
}

#[derive(Debug, Clone, Copy)]
struct PendingTimer {
    id: TimerId,
    purpose: TimerPurpose,
}

pub struct PlaybackController<S: MediaSurface, T: Scheduler> {
    surface: S,
    scheduler: T,
    config: PlayerConfig,
    items: Vec<PlaylistItem>,
    index: usize,
    state: PlayerState,
    epoch: SourceEpoch,
    source: Option<String>,
    timer: Option<PendingTimer>,
    retry_attempt: u32,
    sound_applied: bool,
    resume_to: Option<PlayerState>,
}

impl<S: MediaSurface, T: Scheduler> PlaybackController<S, T> {
    /// `max_play_retries` is capped at [`Backoff::growing_attempts`] so every
    /// retry waits longer than the one before.
    pub fn new(surface: S, scheduler: T, mut config: PlayerConfig) -> Self {
        let growing = config.backoff.growing_attempts();
        if config.max_play_retries > growing {
            tracing::warn!(
                requested = config.max_play_retries,
                allowed = growing,
                "retry delays would stop growing at the backoff cap, lowering max_play_retries"
            );
            config.max_play_retries = growing;
        }
        Self {
            surface,
            scheduler,
            config,
            items: Vec::new(),
            index: 0,
            state: PlayerState::Idle,
            epoch: 0,
            source: None,
            timer: None,
            retry_attempt: 0,
            sound_applied: false,
            resume_to: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn epoch(&self) -> SourceEpoch {
        self.epoch
    }

    pub fn current_source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn current_item(&self) -> Option<&PlaylistItem> {
        self.source.as_ref().and_then(|_| self.items.get(self.index))
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn scheduler(&self) -> &T {
        &self.scheduler
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Replaces the playlist. If the item at the current index is the source
    /// already attached, playback carries on undisturbed.
    pub fn set_playlist(&mut self, items: Vec<PlaylistItem>) {
        self.items = items;
        if self.items.is_empty() {
            tracing::info!("playlist is empty");
            self.index = 0;
            self.go_idle();
            return;
        }
        if self.index >= self.items.len() {
            self.index = 0;
        }
        if self.source.is_some() && self.items[self.index].address() == self.source {
            tracing::debug!(index = self.index, "current source unchanged by playlist update");
            return;
        }
        self.load_from(self.index);
    }

    pub fn handle_surface_event(&mut self, event: SurfaceEvent) {
        if self.source.is_none() || event.epoch != self.epoch {
            tracing::trace!(
                event_epoch = event.epoch,
                current_epoch = self.epoch,
                "dropping event from a detached source"
            );
            return;
        }
        match (self.state, event.kind) {
            (PlayerState::Loading, SurfaceEventKind::Ready) => self.try_start(),
            (PlayerState::Playing, SurfaceEventKind::Ended) => self.on_ended(),
            (
                PlayerState::Loading | PlayerState::Playing | PlayerState::RetryingAutoplay,
                SurfaceEventKind::Error,
            ) => {
                tracing::warn!(source = ?self.source, "media error, skipping item");
                self.begin_advance();
            }
            (PlayerState::Suspended, SurfaceEventKind::Error) => {
                self.resume_to = Some(PlayerState::Advancing);
            }
            _ => {}
        }
    }

    pub fn on_timer(&mut self, id: TimerId) {
        let Some(pending) = self.timer else {
            return;
        };
        if pending.id != id {
            tracing::trace!(?id, "dropping stale timer");
            return;
        }
        self.timer = None;
        match (pending.purpose, self.state) {
            (TimerPurpose::RetryPlay, PlayerState::RetryingAutoplay) => self.retry_play(),
            (TimerPurpose::Advance, PlayerState::Advancing) => self.advance(),
            _ => {}
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        if visible {
            self.resume();
        } else {
            self.suspend();
        }
    }

    /// Cancels the timer and detaches the surface. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.cancel_timer();
        if self.source.take().is_some() {
            self.surface.detach();
        }
        self.resume_to = None;
        self.state = PlayerState::Idle;
    }

    fn suspend(&mut self) {
        if self.state == PlayerState::Suspended {
            return;
        }
        self.surface.pause();
        self.cancel_timer();
        self.resume_to = Some(self.state);
        self.state = PlayerState::Suspended;
        tracing::debug!(previous = ?self.resume_to, "suspended");
    }

    fn resume(&mut self) {
        if self.state != PlayerState::Suspended {
            return;
        }
        let previous = self.resume_to.take().unwrap_or(PlayerState::Idle);
        if self.source.is_none() || previous == PlayerState::Idle {
            self.state = PlayerState::Idle;
            return;
        }
        match previous {
            PlayerState::Advancing => {
                self.state = PlayerState::Advancing;
                self.advance();
            }
            PlayerState::Loading => {
                self.state = PlayerState::Loading;
                if self.surface.is_ready() {
                    self.try_start();
                }
            }
            _ => {
                if let Err(err) = self.surface.play() {
                    tracing::debug!(error = %err, "play on resume was rejected");
                }
                self.state = PlayerState::Playing;
                self.apply_sound_once();
            }
        }
    }

    fn load_from(&mut self, start: usize) {
        let len = self.items.len();
        let mut idx = start;
        for _ in 0..len {
            if let Some(address) = self.items[idx].address() {
                self.index = idx;
                self.attach(address);
                return;
            }
            tracing::warn!(index = idx, "playlist item has no address, skipping");
            match self.next_index(idx) {
                Some(next) => idx = next,
                None => {
                    self.hold();
                    return;
                }
            }
        }
        tracing::warn!("no playable item in playlist");
        self.go_idle();
    }

    fn attach(&mut self, address: String) {
        self.cancel_timer();
        self.retry_attempt = 0;
        self.sound_applied = false;
        self.epoch += 1;
        if self.source.is_some() {
            self.surface.detach();
        }
        if let Err(err) = self.surface.set_muted(true) {
            tracing::debug!(error = %err, "could not force mute");
        }
        tracing::info!(index = self.index, epoch = self.epoch, source = %address, "loading");
        self.surface.attach(self.epoch, &address);
        self.source = Some(address);

        if self.state == PlayerState::Suspended {
            self.resume_to = Some(PlayerState::Loading);
            return;
        }
        self.state = PlayerState::Loading;
        if self.surface.is_ready() {
            self.try_start();
        }
    }

    fn try_start(&mut self) {
        match self.surface.play() {
            Ok(()) => self.on_started(),
            Err(err) => {
                tracing::warn!(error = %err, "autoplay rejected, retrying muted");
                self.state = PlayerState::RetryingAutoplay;
                self.schedule(self.config.backoff.delay(0), TimerPurpose::RetryPlay);
            }
        }
    }

    fn retry_play(&mut self) {
        let _ = self.surface.set_muted(true);
        match self.surface.play() {
            Ok(()) => self.on_started(),
            Err(err) => {
                self.retry_attempt += 1;
                if self.retry_attempt >= self.config.max_play_retries {
                    tracing::warn!(
                        attempts = self.retry_attempt,
                        error = %err,
                        "giving up on item after repeated play failures"
                    );
                    self.begin_advance();
                } else {
                    let delay = self.config.backoff.delay(self.retry_attempt);
                    tracing::debug!(attempt = self.retry_attempt, ?delay, "play failed again");
                    self.schedule(delay, TimerPurpose::RetryPlay);
                }
            }
        }
    }

    fn on_started(&mut self) {
        self.state = PlayerState::Playing;
        self.retry_attempt = 0;
        self.apply_sound_once();
    }

    fn apply_sound_once(&mut self) {
        if self.config.muted || self.sound_applied {
            return;
        }
        self.sound_applied = true;
        if let Err(err) = self.surface.set_muted(false) {
            tracing::debug!(error = %err, "unmute rejected, staying muted");
        }
    }

    fn on_ended(&mut self) {
        if self.items.len() == 1 && self.config.loop_playlist {
            self.surface.rewind();
            self.retry_attempt = 0;
            self.try_start();
            return;
        }
        self.advance();
    }

    fn begin_advance(&mut self) {
        self.state = PlayerState::Advancing;
        self.schedule(self.config.skip_delay, TimerPurpose::Advance);
    }

    fn advance(&mut self) {
        self.cancel_timer();
        match self.next_index(self.index) {
            Some(next) => self.load_from(next),
            None => self.hold(),
        }
    }

    fn next_index(&self, current: usize) -> Option<usize> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }
        if current + 1 < len {
            Some(current + 1)
        } else if self.config.loop_playlist {
            Some(0)
        } else {
            None
        }
    }

    /// Stays on the last item without looping.
    fn hold(&mut self) {
        self.cancel_timer();
        self.surface.pause();
        if self.state == PlayerState::Suspended {
            self.resume_to = Some(PlayerState::Idle);
        } else {
            self.state = PlayerState::Idle;
        }
        tracing::info!(index = self.index, "end of playlist");
    }

    fn go_idle(&mut self) {
        self.cancel_timer();
        if self.source.take().is_some() {
            self.surface.detach();
        }
        if self.state == PlayerState::Suspended {
            self.resume_to = Some(PlayerState::Idle);
        } else {
            self.state = PlayerState::Idle;
        }
    }

    fn schedule(&mut self, delay: Duration, purpose: TimerPurpose) {
        self.cancel_timer();
        let id = self.scheduler.schedule(delay);
        self.timer = Some(PendingTimer { id, purpose });
    }

    fn cancel_timer(&mut self) {
        if let Some(pending) = self.timer.take() {
            self.scheduler.cancel(pending.id);
        }
    }
}

impl<S: MediaSurface, T: Scheduler> Drop for PlaybackController<S, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
