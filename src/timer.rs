//! Software interval timers derived from the monotonic clock.
//!
//! The control loop polls these once per iteration; the number of elapsed
//! periods is computed from `Instant`, so a slow iteration never stretches
//! the period and a stalled loop catches up on the next poll.

use embassy_time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct IntervalTimer {
    period: Duration,
    last: Instant,
}

impl IntervalTimer {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self { period, last: now }
    }

    /// Number of whole periods elapsed since the last poll.
    pub fn poll(&mut self, now: Instant) -> u32 {
        let period_ticks = self.period.as_ticks();
        if period_ticks == 0 {
            return 0;
        }
        let elapsed = match now.checked_duration_since(self.last) {
            Some(elapsed) => elapsed.as_ticks(),
            None => return 0,
        };
        let periods = elapsed / period_ticks;
        if periods > 0 {
            // Advance by whole periods so the phase stays locked to the clock.
            self.last = self.last + Duration::from_ticks(periods * period_ticks);
        }
        periods.min(u32::MAX as u64) as u32
    }

    /// True once at least one period has elapsed since the last poll.
    pub fn expired(&mut self, now: Instant) -> bool {
        self.poll(now) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_whole_periods_without_drift() {
        let mut timer = IntervalTimer::new(Duration::from_secs(1), Instant::from_millis(0));
        assert_eq!(timer.poll(Instant::from_millis(999)), 0);
        assert_eq!(timer.poll(Instant::from_millis(1000)), 1);
        // 1.7 s later than start of the second period: one more whole second.
        assert_eq!(timer.poll(Instant::from_millis(2700)), 1);
        // Remaining 0.3 s of the third period is not lost.
        assert_eq!(timer.poll(Instant::from_millis(3000)), 1);
    }

    #[test]
    fn catches_up_after_a_stall() {
        let mut timer = IntervalTimer::new(Duration::from_secs(1), Instant::from_millis(0));
        assert_eq!(timer.poll(Instant::from_millis(3500)), 3);
        assert_eq!(timer.poll(Instant::from_millis(4000)), 1);
    }

    #[test]
    fn clock_going_backwards_is_ignored() {
        let mut timer = IntervalTimer::new(Duration::from_secs(10), Instant::from_millis(5000));
        assert_eq!(timer.poll(Instant::from_millis(1000)), 0);
        assert!(timer.expired(Instant::from_millis(15_000)));
    }
}
