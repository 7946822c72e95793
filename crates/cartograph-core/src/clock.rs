// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Injectable time source. Production code uses [`SystemClock`]; tests use
/// [`ManualClock`] to assert exact restart delays and health-watchdog timing
/// without sleeping.
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for elapsed-time comparisons (backoff,
    /// health watchdog silence detection).
    fn now(&self) -> Instant;
    /// Wall-clock timestamp, used for persisted and broadcast timestamps.
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only advances when told to. `Instant` has no fixed epoch, so
/// this anchors a base `Instant` taken at construction and offsets it by an
/// accumulated [`Duration`]; the wall-clock side is tracked independently.
pub struct ManualClock {
    base: Instant,
    state: Mutex<ManualClockState>,
}

struct ManualClockState {
    elapsed: Duration,
    utc: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(start_utc: DateTime<Utc>) -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new(ManualClockState {
                elapsed: Duration::ZERO,
                utc: start_utc,
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().expect("clock mutex poisoned");
        state.elapsed += by;
        state.utc += chrono::Duration::from_std(by).expect("duration fits in chrono::Duration");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.state.lock().expect("clock mutex poisoned");
        self.base + state.elapsed
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.state.lock().expect("clock mutex poisoned").utc
    }
}

/// Delay before the `crash_count`-th restart: `min(base * 2^(crash_count-1), max)`.
/// `crash_count` is 1-indexed; a `crash_count` of 0 returns a zero delay.
pub fn restart_delay(crash_count: u32, base: Duration, max: Duration) -> Duration {
    if crash_count == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64.checked_shl(crash_count - 1).unwrap_or(u64::MAX);
    let millis = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis.min(max.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_zero_at_crash_count_zero() {
        assert_eq!(
            restart_delay(0, Duration::from_millis(100), Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn restart_delay_follows_seed_scenario_3() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(restart_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(restart_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(restart_delay(3, base, max), Duration::from_millis(400));
    }

    #[test]
    fn restart_delay_saturates_at_max() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(15);
        // 2 * 2^9 = 1024s, far past the 15s ceiling.
        assert_eq!(restart_delay(10, base, max), max);
    }

    #[test]
    fn manual_clock_advances_both_instant_and_utc() {
        let start = "2026-01-01T00:00:00Z".parse().unwrap();
        let clock = ManualClock::new(start);
        let t0 = clock.now();
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now() - t0, Duration::from_millis(500));
        assert_eq!(
            clock.now_utc(),
            start + chrono::Duration::milliseconds(500)
        );
    }
}
