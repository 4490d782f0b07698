use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Per-address connection attempt counter.
#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    count: u32,
    started: Instant,
}

/// Fixed-window limiter for new connections, keyed by originating address.
///
/// Each address may open `max_attempts` connections per `window`. The window
/// starts at the first attempt and resets on the first attempt after it has
/// fully elapsed. Check and increment happen under the map's shard lock, so
/// concurrent attempts from one address can never exceed the cap.
#[derive(Debug)]
pub struct ConnectionRateLimiter {
    windows: DashMap<String, AttemptWindow>,
    max_attempts: u32,
    window: Duration,
}

impl ConnectionRateLimiter {
    /// Creates a limiter allowing `max_attempts` per `window` per address.
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_attempts,
            window,
        }
    }

    /// Records an attempt from `addr` and returns whether it is allowed.
    pub fn check(&self, addr: &str) -> bool {
        self.check_at(addr, Instant::now())
    }

    fn check_at(&self, addr: &str, now: Instant) -> bool {
        match self.windows.entry(addr.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(AttemptWindow {
                    count: 1,
                    started: now,
                });
                true
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if now.saturating_duration_since(state.started) >= self.window {
                    state.count = 1;
                    state.started = now;
                    true
                } else if state.count < self.max_attempts {
                    state.count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Drops entries whose window has fully elapsed. Returns how many were removed.
    ///
    /// An expired entry would be reset by the next attempt anyway, so evicting
    /// it does not change any admission decision.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    fn sweep_expired_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.saturating_duration_since(state.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Returns `true` if no address is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// The configured window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}
