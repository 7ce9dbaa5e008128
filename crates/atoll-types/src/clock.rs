//! Monotonic wall-anchored clock.
//!
//! Redirect URLs carry a timestamp that targets use for request-age
//! checks, and the cluster-map owner stamps bucket creation times. Both
//! need strictly increasing values even when the wall clock stalls or
//! steps backwards, so the clock returns `max(wall, last) + 1`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Strictly monotonic nanosecond clock. Thread-safe via `AtomicU64`.
pub struct MonoClock {
    last: AtomicU64,
}

impl MonoClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(wall_nanos()),
        }
    }

    /// Advance and return a new unique timestamp (ns since UNIX epoch).
    pub fn tick(&self) -> u64 {
        loop {
            let prev = self.last.load(Ordering::SeqCst);
            let candidate = prev.max(wall_nanos()) + 1;
            if self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Current value without advancing.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock nanoseconds since the UNIX epoch.
pub fn wall_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_strictly_increasing() {
        let clock = MonoClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_concurrent_ticks_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let clock = Arc::new(MonoClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..500).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "duplicate timestamp");
            }
        }
    }
}
