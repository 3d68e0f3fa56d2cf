use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Generation,
    Review,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Review => "review",
        }
    }
}

/// Spaces consecutive billed calls of the same kind by a fixed delay,
/// shared by every session in a run.
#[derive(Debug)]
pub struct CallPacer {
    min_interval: Duration,
    next_slot: Mutex<HashMap<CallKind, Instant>>,
}

impl CallPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Blocks until a call of `kind` may start and returns the time waited.
    ///
    /// The slot is claimed under the lock and the sleep happens outside it,
    /// so callers of different kinds never queue behind each other.
    pub fn wait(&self, kind: CallKind) -> Duration {
        if self.min_interval.is_zero() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let start = {
            let mut slots = self
                .next_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let start = slots
                .get(&kind)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            slots.insert(kind, start + self.min_interval);
            start
        };
        let delay = start.saturating_duration_since(now);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{CallKind, CallPacer};

    #[test]
    fn disabled_pacer_never_waits() {
        let pacer = CallPacer::disabled();
        assert_eq!(pacer.wait(CallKind::Generation), Duration::ZERO);
        assert_eq!(pacer.wait(CallKind::Generation), Duration::ZERO);
    }

    #[test]
    fn same_kind_calls_are_spaced() {
        let pacer = CallPacer::new(Duration::from_millis(40));
        let started = Instant::now();
        assert_eq!(pacer.wait(CallKind::Generation), Duration::ZERO);
        pacer.wait(CallKind::Generation);
        assert!(started.elapsed() >= Duration::from_millis(35));
    }

    #[test]
    fn different_kinds_do_not_block_each_other() {
        let pacer = CallPacer::new(Duration::from_secs(5));
        assert_eq!(pacer.wait(CallKind::Generation), Duration::ZERO);
        assert_eq!(pacer.wait(CallKind::Review), Duration::ZERO);
    }
}
