use std::time::Duration;
use tokio::time::Instant;

/// Per-worker reentrancy lock with a cooldown measured from the start of the
/// guarded action.
///
/// Owned by the worker's event loop; no atomics are needed because only that
/// loop ever touches it.
#[derive(Debug, Default)]
pub struct ExecutionGuard {
    busy: bool,
    started_at: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-set. Returns `false` while an action is in flight or its
    /// cooldown has not yet elapsed.
    pub fn try_enter(&mut self) -> bool {
        let now = Instant::now();
        self.expire(now);

        if self.busy {
            return false;
        }

        self.busy = true;
        self.started_at = Some(now);
        self.cooldown_until = None;
        true
    }

    /// Schedules the busy flag to clear `after_delay` past the start of the
    /// current action, whatever its outcome was.
    pub fn release(&mut self, after_delay: Duration) {
        if let Some(started_at) = self.started_at {
            self.cooldown_until = Some(started_at + after_delay);
        }
        self.expire(Instant::now());
    }

    pub fn is_busy(&mut self) -> bool {
        self.expire(Instant::now());
        self.busy
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    fn expire(&mut self, now: Instant) {
        if let Some(until) = self.cooldown_until {
            if now >= until {
                self.busy = false;
                self.started_at = None;
                self.cooldown_until = None;
            }
        }
    }
}
