//! Adaptive Idle Waiter
//!
//! Per-worker-thread controller that picks a sleep/yield/spin strategy from
//! the observed work rate over a rolling window. Invoked only after an
//! empty dequeue, so busy periods never pay the sleep.

use std::thread;
use std::time::Duration;

/// Load regimes, from quietest to busiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLevel {
    /// No work observed: sleep 5 ms.
    Idle,
    /// Under 1% busy: sleep 1 ms.
    Low,
    /// Up to 10% busy: sleep 100 us.
    Warming,
    /// Up to 50% busy: sleep 1 us.
    Active,
    /// Busy-spin, no sleep or yield.
    Peak,
}

impl LoadLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadLevel::Idle => "idle",
            LoadLevel::Low => "low",
            LoadLevel::Warming => "warming",
            LoadLevel::Active => "active",
            LoadLevel::Peak => "peak",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            LoadLevel::Idle => 0,
            LoadLevel::Low => 1,
            LoadLevel::Warming => 2,
            LoadLevel::Active => 3,
            LoadLevel::Peak => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> LoadLevel {
        match raw {
            0 => LoadLevel::Idle,
            1 => LoadLevel::Low,
            2 => LoadLevel::Warming,
            3 => LoadLevel::Active,
            _ => LoadLevel::Peak,
        }
    }
}

const MEASUREMENT_WINDOW: u32 = 1000;
const LOW_THRESHOLD: u32 = 10;
const WARMING_THRESHOLD: u32 = 100;
const ACTIVE_THRESHOLD: u32 = 500;
/// Windows a proposed switch must persist before it takes effect.
const SWITCH_DELAY_WINDOWS: u32 = 100;

const SLEEP_IDLE: Duration = Duration::from_millis(5);
const SLEEP_LOW: Duration = Duration::from_millis(1);
const SLEEP_WARMING: Duration = Duration::from_micros(100);
const SLEEP_ACTIVE: Duration = Duration::from_micros(1);

/// Rolling work-rate tracker with hysteresis. Owned by a single thread.
pub struct AdaptiveWaiter {
    level: LoadLevel,
    iterations: u32,
    work_count: u32,
    switch_delay: u32,
}

impl AdaptiveWaiter {
    pub fn new() -> Self {
        Self {
            level: LoadLevel::Idle,
            iterations: 0,
            work_count: 0,
            switch_delay: 0,
        }
    }

    pub fn level(&self) -> LoadLevel {
        self.level
    }

    /// Record one loop iteration. Call after every dequeue attempt.
    pub fn record_iteration(&mut self, did_work: bool) {
        self.iterations += 1;
        if did_work {
            self.work_count += 1;
        }
        if self.iterations >= MEASUREMENT_WINDOW {
            self.update_level();
        }
    }

    /// Sleep/yield according to the current regime. Call only when the last
    /// dequeue came back empty.
    pub fn wait_for_work(&self) {
        match self.level {
            LoadLevel::Idle => thread::sleep(SLEEP_IDLE),
            LoadLevel::Low => thread::sleep(SLEEP_LOW),
            LoadLevel::Warming => thread::sleep(SLEEP_WARMING),
            LoadLevel::Active => thread::sleep(SLEEP_ACTIVE),
            LoadLevel::Peak => {}
        }
    }

    fn update_level(&mut self) {
        let work = self.work_count;
        self.iterations = 0;
        self.work_count = 0;

        let proposed = if work == 0 {
            LoadLevel::Idle
        } else if work <= LOW_THRESHOLD {
            LoadLevel::Low
        } else if work <= WARMING_THRESHOLD {
            LoadLevel::Warming
        } else if work <= ACTIVE_THRESHOLD {
            LoadLevel::Active
        } else {
            LoadLevel::Peak
        };

        if proposed != self.level {
            if self.switch_delay > 0 {
                self.switch_delay -= 1;
            } else {
                self.level = proposed;
                self.switch_delay = SWITCH_DELAY_WINDOWS;
            }
        } else {
            self.switch_delay = 0;
        }
    }
}

impl Default for AdaptiveWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_window(waiter: &mut AdaptiveWaiter, busy: u32) {
        for i in 0..MEASUREMENT_WINDOW {
            waiter.record_iteration(i < busy);
        }
    }

    #[test]
    fn test_starts_idle() {
        let waiter = AdaptiveWaiter::new();
        assert_eq!(waiter.level(), LoadLevel::Idle);
    }

    #[test]
    fn test_switch_rearms_delay() {
        let mut waiter = AdaptiveWaiter::new();
        run_window(&mut waiter, MEASUREMENT_WINDOW);
        assert_eq!(waiter.level(), LoadLevel::Peak);

        // A fresh switch arms the delay: the level holds through the next
        // SWITCH_DELAY_WINDOWS quiet windows.
        for _ in 0..SWITCH_DELAY_WINDOWS {
            run_window(&mut waiter, 0);
            assert_eq!(waiter.level(), LoadLevel::Peak);
        }
        run_window(&mut waiter, 0);
        assert_eq!(waiter.level(), LoadLevel::Idle);
    }

    #[test]
    fn test_threshold_bands() {
        let mut waiter = AdaptiveWaiter::new();
        waiter.switch_delay = 0;
        run_window(&mut waiter, 5);
        assert_eq!(waiter.level(), LoadLevel::Low);

        waiter.switch_delay = 0;
        run_window(&mut waiter, 50);
        assert_eq!(waiter.level(), LoadLevel::Warming);

        waiter.switch_delay = 0;
        run_window(&mut waiter, 300);
        assert_eq!(waiter.level(), LoadLevel::Active);
    }

    #[test]
    fn test_level_roundtrip() {
        for level in [
            LoadLevel::Idle,
            LoadLevel::Low,
            LoadLevel::Warming,
            LoadLevel::Active,
            LoadLevel::Peak,
        ] {
            assert_eq!(LoadLevel::from_u8(level.as_u8()), level);
        }
    }
}
