//! Checkin timing: startup skew and the per-iteration sleep budget.

use std::time::Duration;

use rand::Rng;

/// Random startup delay in `[0, max_skew)` at millisecond granularity.
///
/// Spreads the first checkin of a fleet booted at the same moment.
pub fn startup_skew<R: Rng + ?Sized>(rng: &mut R, max_skew: Duration) -> Duration {
    let max_ms = u64::try_from(max_skew.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.gen_range(0..max_ms))
}

/// Time left in the checkin window after an iteration took `elapsed`.
pub fn remaining_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn skew_stays_below_configured_maximum() {
        let mut rng = StdRng::seed_from_u64(7);
        let max = Duration::from_secs(5);
        for _ in 0..1000 {
            assert!(startup_skew(&mut rng, max) < max);
        }
    }

    #[test]
    fn zero_skew_never_sleeps() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(startup_skew(&mut rng, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn remaining_sleep_is_never_negative() {
        let interval = Duration::from_secs(30);
        assert_eq!(
            remaining_sleep(interval, Duration::from_secs(10)),
            Duration::from_secs(20)
        );
        assert_eq!(remaining_sleep(interval, Duration::from_secs(45)), Duration::ZERO);
        assert_eq!(remaining_sleep(interval, interval), Duration::ZERO);
    }
}
