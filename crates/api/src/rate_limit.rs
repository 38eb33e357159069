//! Per-Token Rate Limiting using GCRA Algorithm
//!
//! Pings are limited per monitor token rather than per client IP: one noisy
//! job must not starve the rest, and a single NAT'd fleet of agents must not
//! trip a shared limit. Uses `governor`'s keyed GCRA state, which enforces
//! the quota without background processes.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

/// Keyed limiter over monitor tokens.
pub type TokenRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Build the ping limiter for `per_minute` requests per token.
///
/// A zero configuration value falls back to 1; a limiter that admits
/// nothing is never what an operator meant.
pub fn ping_limiter(per_minute: u32) -> TokenRateLimiter {
    let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
    RateLimiter::keyed(Quota::per_minute(per_minute))
}
