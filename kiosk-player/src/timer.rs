use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// One-shot timers. A fired timer is delivered back to the controller
/// through `PlaybackController::on_timer`.
pub trait Scheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId;
    fn cancel(&mut self, id: TimerId);
}
