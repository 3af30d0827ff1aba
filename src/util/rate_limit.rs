//! Per-connection input rate limiting

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Max client messages per second on one socket
pub const INPUT_RATE_LIMIT: u32 = 30;

/// Input budget of one participant's socket
pub struct InputRateLimiter {
    limiter: Limiter,
    dropped: u64,
}

impl InputRateLimiter {
    pub fn new(per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: RateLimiter::direct(quota),
            dropped: 0,
        }
    }

    /// True if the message may pass; otherwise it is counted as dropped
    pub fn check(&mut self) -> bool {
        if self.limiter.check().is_ok() {
            return true;
        }
        self.dropped += 1;
        false
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for InputRateLimiter {
    fn default() -> Self {
        Self::new(INPUT_RATE_LIMIT)
    }
}
