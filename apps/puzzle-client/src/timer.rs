//! Timer service: the pre-shuffle countdown and the per-level timeout run
//! as cancellable tokio tasks owned by a single [`TimerService`].
//!
//! Each start bumps a generation number. Events carry the generation they
//! were emitted under so ticks already queued by a stopped timer can be
//! told apart from the live one.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Visible countdown before the shuffle.
    Countdown,
    /// Countdown-to-timeout for the current level attempt.
    LevelTimeout,
}

/// One tick. `remaining == 0` is the final event of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub kind: TimerKind,
    pub generation: u64,
    pub remaining: u32,
}

impl TimerEvent {
    pub fn is_expiry(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Start { kind: TimerKind, seconds: u32 },
    Stop(TimerKind),
    StopAll,
}

struct ScheduledTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Drop for ScheduledTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TimerService {
    tx: mpsc::UnboundedSender<TimerEvent>,
    tick: Duration,
    next_generation: u64,
    countdown: Option<ScheduledTimer>,
    level_timeout: Option<ScheduledTimer>,
}

impl TimerService {
    pub fn new(tick: Duration) -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            tx,
            tick,
            next_generation: 0,
            countdown: None,
            level_timeout: None,
        };
        (service, rx)
    }

    pub fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Start { kind, seconds } => self.start(kind, seconds),
            TimerCommand::Stop(kind) => self.stop(kind),
            TimerCommand::StopAll => self.stop_all(),
        }
    }

    /// Starts `kind`, replacing (and cancelling) any timer of that kind.
    pub fn start(&mut self, kind: TimerKind, seconds: u32) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = tokio::spawn(run_timer(kind, generation, seconds, self.tick, self.tx.clone()));
        trace!(target: "puzzle::timer", ?kind, generation, seconds, "timer started");
        *self.slot(kind) = Some(ScheduledTimer { generation, handle });
    }

    pub fn stop(&mut self, kind: TimerKind) {
        if self.slot(kind).take().is_some() {
            trace!(target: "puzzle::timer", ?kind, "timer stopped");
        }
    }

    pub fn stop_all(&mut self) {
        self.stop(TimerKind::Countdown);
        self.stop(TimerKind::LevelTimeout);
    }

    /// Whether `event` comes from the live timer of its kind.
    pub fn accepts(&self, event: &TimerEvent) -> bool {
        let slot = match event.kind {
            TimerKind::Countdown => &self.countdown,
            TimerKind::LevelTimeout => &self.level_timeout,
        };
        slot.as_ref()
            .is_some_and(|timer| timer.generation == event.generation)
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<ScheduledTimer> {
        match kind {
            TimerKind::Countdown => &mut self.countdown,
            TimerKind::LevelTimeout => &mut self.level_timeout,
        }
    }
}

async fn run_timer(
    kind: TimerKind,
    generation: u64,
    seconds: u32,
    tick: Duration,
    tx: mpsc::UnboundedSender<TimerEvent>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut remaining = seconds;
    loop {
        // first tick completes immediately so the starting value is shown
        interval.tick().await;
        let event = TimerEvent {
            kind,
            generation,
            remaining,
        };
        if tx.send(event).is_err() || remaining == 0 {
            return;
        }
        remaining -= 1;
    }
}
