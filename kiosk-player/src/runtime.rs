use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::controller::{PlaybackController, PlayerConfig, PlayerState};
use crate::playlist::{FetchError, PlaylistFetcher, PlaylistItem};
use crate::surface::{MediaSurface, SurfaceEvent};
use crate::timer::{Scheduler, TimerId};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Playlist(Vec<PlaylistItem>),
    Surface(SurfaceEvent),
    Timer(TimerId),
    Visibility(bool),
    Shutdown,
}

/// Timers as sleeping tokio tasks that post [`PlayerEvent::Timer`] back to
/// the player task. Cancelling aborts the task.
pub struct TokioScheduler {
    events: mpsc::WeakUnboundedSender<PlayerEvent>,
    next_id: u64,
    tasks: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(events: &mpsc::UnboundedSender<PlayerEvent>) -> Self {
        Self {
            events: events.downgrade(),
            next_id: 0,
            tasks: HashMap::new(),
        }
    }

}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        self.tasks.retain(|_, task| !task.is_finished());
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(PlayerEvent::Timer(id));
            }
        });
        self.tasks.insert(id, task);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// Cheap handle for feeding inputs to a running player task. Every method
/// returns `false` once the task has stopped.
#[derive(Clone)]
pub struct PlayerHandle {
    events: mpsc::UnboundedSender<PlayerEvent>,
}

impl PlayerHandle {
    pub fn send(&self, event: PlayerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn set_playlist(&self, items: Vec<PlaylistItem>) -> bool {
        self.send(PlayerEvent::Playlist(items))
    }

    pub fn surface_event(&self, event: SurfaceEvent) -> bool {
        self.send(PlayerEvent::Surface(event))
    }

    pub fn set_visible(&self, visible: bool) -> bool {
        self.send(PlayerEvent::Visibility(visible))
    }

    pub fn shutdown(&self) -> bool {
        self.send(PlayerEvent::Shutdown)
    }
}

/// Snapshot published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub index: usize,
    pub source: Option<String>,
    pub title: Option<String>,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            state: PlayerState::Idle,
            index: 0,
            source: None,
            title: None,
        }
    }
}

struct Refresh {
    fetcher: Arc<PlaylistFetcher>,
    task: JoinHandle<()>,
}

impl Refresh {
    fn stop(self) {
        self.fetcher.abort();
        self.task.abort();
    }
}

pub struct PlayerRuntime {
    handle: PlayerHandle,
    pub status: tokio::sync::watch::Receiver<PlayerStatus>,
    task: JoinHandle<()>,
    refresh: Option<Refresh>,
}

impl PlayerRuntime {
    /// Spawns the task that owns the controller. It runs until
    /// [`PlayerHandle::shutdown`] or until every handle is dropped.
    pub fn spawn<S>(surface: S, config: PlayerConfig) -> Self
    where
        S: MediaSurface + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = tokio::sync::watch::channel(PlayerStatus::default());
        let scheduler = TokioScheduler::new(&tx);
        let task = tokio::spawn(async move {
            let mut controller = PlaybackController::new(surface, scheduler, config);
            while let Some(event) = rx.recv().await {
                match event {
                    PlayerEvent::Playlist(items) => controller.set_playlist(items),
                    PlayerEvent::Surface(event) => controller.handle_surface_event(event),
                    PlayerEvent::Timer(id) => controller.on_timer(id),
                    PlayerEvent::Visibility(visible) => controller.set_visible(visible),
                    PlayerEvent::Shutdown => {
                        controller.shutdown();
                        let _ = status_tx.send(status_of(&controller));
                        break;
                    }
                }
                status_tx.send_if_modified(|current| {
                    let next = status_of(&controller);
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });
            }
            tracing::debug!("player task stopped");
        });

        Self {
            handle: PlayerHandle { events: tx },
            status: status_rx,
            task,
            refresh: None,
        }
    }

    pub fn handle(&self) -> PlayerHandle {
        self.handle.clone()
    }

    /// Refreshes the playlist every `interval`, starting immediately. A failed
    /// refresh keeps whatever is playing. Replaces any earlier refresh loop,
    /// and [`PlayerRuntime::shutdown`] aborts the fetcher along with the loop.
    pub fn spawn_refresh(&mut self, fetcher: Arc<PlaylistFetcher>, interval: Duration) {
        let handle = self.handle();
        let task = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move {
                loop {
                    match fetcher.fetch().await {
                        Ok(items) => {
                            tracing::info!(items = items.len(), "playlist refreshed");
                            if !handle.set_playlist(items) {
                                break;
                            }
                        }
                        Err(FetchError::Superseded) => {}
                        Err(FetchError::Aborted) => break,
                        Err(err) => {
                            tracing::warn!(error = %err, "playlist refresh failed, keeping current playlist");
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        });
        if let Some(previous) = self.refresh.replace(Refresh { fetcher, task }) {
            previous.task.abort();
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.stop();
        }
        self.handle.shutdown();
        let _ = self.task.await;
    }
}

fn status_of<S: MediaSurface, T: Scheduler>(controller: &PlaybackController<S, T>) -> PlayerStatus {
    PlayerStatus {
        state: controller.state(),
        index: controller.index(),
        source: controller.current_source().map(str::to_string),
        title: controller.current_item().and_then(|item| item.title.clone()),
    }
}
