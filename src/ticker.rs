use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Default tick interval in milliseconds
pub const DEFAULT_TICK_MS: u64 = 1000;

/// Get tick duration
pub fn tick_duration() -> Duration {
    Duration::from_millis(DEFAULT_TICK_MS)
}

/// Build an interval for a scheduled loop.
///
/// The first tick fires after one full period. Ticks missed while the
/// runtime was busy are skipped rather than replayed in a burst, so a stalled
/// process does not credit elapsed seconds it never observed.
pub fn interval(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_duration() {
        let duration = tick_duration();
        assert_eq!(duration, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_first_tick_after_one_period() {
        let start = tokio::time::Instant::now();
        let mut ticks = interval(Duration::from_secs(1));
        ticks.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        ticks.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_zero_period_is_clamped() {
        let mut ticks = interval(Duration::ZERO);
        ticks.tick().await;
        assert_eq!(ticks.period(), Duration::from_millis(1));
    }
}
