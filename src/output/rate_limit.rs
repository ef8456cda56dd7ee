use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Fixed point scale so partial tokens survive between refills.
const SCALE: u64 = 1000;

/// Lock-free token bucket allowing `rate` acquisitions per second.
///
/// The burst size equals the rate, so an idle sink can absorb one second
/// worth of traffic at once. Acquisition never waits.
pub(crate) struct TokenBucket {
    capacity: u64,
    refill_nanos: u64,
    tokens: AtomicU64,
    last_refill: AtomicU64,
    start: Instant,
}

impl TokenBucket {
    pub(crate) fn per_second(rate: u64) -> Self {
        let rate = rate.max(1);
        let capacity = rate.saturating_mul(SCALE);
        Self {
            capacity,
            refill_nanos: (1_000_000_000 / rate).max(1),
            tokens: AtomicU64::new(capacity),
            last_refill: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Take one token if available.
    pub(crate) fn try_acquire(&self) -> bool {
        self.refill();

        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < SCALE {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - SCALE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn refill(&self) {
        let now = self.start.elapsed().as_nanos() as u64;
        let last = self.last_refill.load(Ordering::Acquire);
        let intervals = now.saturating_sub(last) / self.refill_nanos;
        if intervals == 0 {
            return;
        }

        // Only the thread that advances the refill clock adds tokens.
        let advanced = last + intervals * self.refill_nanos;
        if self
            .last_refill
            .compare_exchange(last, advanced, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let added = intervals.saturating_mul(SCALE);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(added).min(self.capacity))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_empty() {
        let bucket = TokenBucket::per_second(3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_refills_over_time() {
        let bucket = TokenBucket::per_second(10);
        while bucket.try_acquire() {}

        std::thread::sleep(Duration::from_millis(250));
        assert!(bucket.try_acquire());
    }
}
