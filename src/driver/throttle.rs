// # Apply Throttle
//
// Token bucket guarding dataplane applies: capacity 10, one token
// refilled per tick, one token consumed per apply. Owned by the
// single-threaded driver, so a plain counter suffices.

use tracing::info;

#[derive(Debug)]
pub struct Throttle {
    tokens: u32,
    capacity: u32,
    throttled_logged: bool,
}

impl Throttle {
    pub fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            throttled_logged: false,
        }
    }

    /// Take one token if available. Logs once on the transition into
    /// throttling; the log resets when tokens return.
    pub fn try_acquire(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            self.throttled_logged = false;
            true
        } else {
            if !self.throttled_logged {
                info!("dataplane applies throttled, waiting for refill");
                self.throttled_logged = true;
            }
            false
        }
    }

    pub fn refill(&mut self) {
        if self.tokens < self.capacity {
            self.tokens += 1;
        }
    }

    pub fn available(&self) -> u32 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_drains_and_refills() {
        let mut throttle = Throttle::new(2);
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());

        throttle.refill();
        assert!(throttle.try_acquire());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let mut throttle = Throttle::new(2);
        throttle.refill();
        throttle.refill();
        throttle.refill();
        assert_eq!(throttle.available(), 2);
    }
}
