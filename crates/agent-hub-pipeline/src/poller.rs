//! Adaptive polling (§5): base 1s, cap 10s, backoff factor 1.5x, reset to
//! base on any activity.

use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_secs(1);
const DEFAULT_CAP: Duration = Duration::from_secs(10);
const DEFAULT_FACTOR: f64 = 1.5;

pub struct AdaptivePoller {
    base: Duration,
    cap: Duration,
    factor: f64,
    current: Duration,
}

impl Default for AdaptivePoller {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
            factor: DEFAULT_FACTOR,
            current: DEFAULT_BASE,
        }
    }
}

impl AdaptivePoller {
    pub fn new(base: Duration, cap: Duration, factor: f64) -> Self {
        Self { base, cap, factor, current: base }
    }

    /// Returns the delay to sleep before the next poll, then grows it for
    /// next time (capped).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.mul_f64(self.factor);
        self.current = grown.min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically_up_to_cap() {
        let mut poller = AdaptivePoller::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        assert_eq!(poller.next_delay(), Duration::from_secs(1));
        assert_eq!(poller.next_delay(), Duration::from_secs(2));
        assert_eq!(poller.next_delay(), Duration::from_secs(4));
        assert_eq!(poller.next_delay(), Duration::from_secs(8));
        assert_eq!(poller.next_delay(), Duration::from_secs(10));
        assert_eq!(poller.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut poller = AdaptivePoller::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        poller.next_delay();
        poller.next_delay();
        poller.reset();
        assert_eq!(poller.next_delay(), Duration::from_secs(1));
    }
}
