//! Exponential backoff with a ceiling and bounded jitter.

use std::time::Duration;

use rand::Rng;

/// Per-item exponential backoff. There is no attempt limit: callers retry
/// until they succeed or the process stops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for Backoff {
    /// 5ms doubling up to 1000s, 10% jitter.
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000), 0.1)
    }
}

impl Backoff {
    /// `jitter` is a fraction of the delay, clamped to `[0, 1]`. Keeping it
    /// below the doubling factor keeps successive delays non-decreasing.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self { base, max: max.max(base), jitter }
    }

    pub fn base(&self) -> Duration { self.base }
    pub fn max(&self) -> Duration { self.max }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let nanos = (self.base.as_nanos()).saturating_mul(factor as u128);
        let capped = nanos.min(self.max.as_nanos());
        Duration::from_nanos(capped.min(u64::MAX as u128) as u64)
    }

    /// Delay before retry number `attempt`, jittered upward and capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let extra = nominal.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        (nominal + extra).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_doubles_until_ceiling() {
        let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(3600), 0.0);
        assert_eq!(b.nominal(1), Duration::from_secs(5));
        assert_eq!(b.nominal(2), Duration::from_secs(10));
        assert_eq!(b.nominal(3), Duration::from_secs(20));
        assert_eq!(b.nominal(11), Duration::from_secs(3600));
        assert_eq!(b.nominal(u32::MAX), Duration::from_secs(3600));
        assert_eq!(b.nominal(0), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delays_never_decrease_and_respect_ceiling() {
        let b = Backoff::new(Duration::from_millis(5), Duration::from_secs(2), 1.0);
        for _ in 0..50 {
            let mut prev = Duration::ZERO;
            for attempt in 1..40 {
                let d = b.delay(attempt);
                assert!(d >= prev, "attempt {} went from {:?} to {:?}", attempt, prev, d);
                assert!(d <= Duration::from_secs(2));
                prev = d;
            }
            assert_eq!(prev, Duration::from_secs(2));
        }
    }

    #[test]
    fn jitter_is_clamped() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 7.5);
        assert!(b.delay(1) <= Duration::from_millis(20));
        let nan = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), f64::NAN);
        assert_eq!(nan.delay(1), Duration::from_millis(10));
    }
}
