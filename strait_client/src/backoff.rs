//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Capped exponential ladder, milliseconds.
const LADDER_MS: [u64; 5] = [500, 1_000, 2_000, 4_000, 8_000];

/// The default backoff: capped exponential with up to 50% random jitter.
///
/// `attempt` counts from 1 (the first retry).
#[must_use]
pub fn default_backoff(attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1) as usize).min(LADDER_MS.len() - 1);
    let base = LADDER_MS[idx];
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        for attempt in 1..=10u32 {
            let d = default_backoff(attempt);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(12_000));
        }
        // Late attempts sit at the cap (plus jitter).
        assert!(default_backoff(100) >= Duration::from_millis(8_000));
    }
}
