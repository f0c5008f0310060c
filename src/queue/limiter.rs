//! Rate-limit and backoff arithmetic, kept pure: time is always an explicit
//! argument, so every path is testable without sleeping.

use crate::model::Ms;

/// Per-gateway token bucket. Capacity and refill rate derive from a
/// sends-per-minute budget; fractional tokens accumulate between takes.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: Ms,
}

impl TokenBucket {
    /// A bucket allowing `rate` sends per minute, starting full.
    pub fn per_minute(rate: u32, now: Ms) -> Self {
        let capacity = rate.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / 60_000.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Ms) {
        let elapsed = (now - self.last_refill).max(0) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume one token if available.
    pub fn try_take(&mut self, now: Ms) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`, without consuming.
    pub fn available(&mut self, now: Ms) -> f64 {
        self.refill(now);
        self.tokens
    }
}

/// Exponential backoff: `base × 2^attempts`, saturating, capped.
pub fn backoff_delay_ms(attempts: u32, base_ms: Ms, cap_ms: Ms) -> Ms {
    let factor = 1i64.checked_shl(attempts.min(32)).unwrap_or(i64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}
