//! Deterministic doubles for testing a [`crate::TaskScheduler`] without real
//! sleeps or real thread parking. Gated behind the `test-support` feature
//! (always enabled for this crate's own `#[cfg(test)]` modules), matching
//! the teacher crate's own `test-support`-gated `TestScheduler`/`TestClock`.

use crate::clock::Clock;
use crate::pump::{Pump, PumpDelegate, TimerSlackPolicy};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A settable clock for deterministic delayed-task tests: advance it
/// explicitly instead of sleeping in real time.
#[derive(Clone)]
pub struct TestClock {
    now: std::sync::Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new() -> Self {
        TestClock {
            now: std::sync::Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        TestClock {
            now: std::sync::Arc::new(Mutex::new(time)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock() = time;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// A non-blocking [`Pump`] for tests: `run` drains work until the delegate
/// reports nothing left to do (no ready task, no pending delayed task, no
/// idle work), then returns, instead of parking the thread indefinitely.
/// Advance a paired [`TestClock`] and call `run` again to let newly-due
/// delayed tasks proceed.
pub struct TestPump {
    quit_requested: AtomicBool,
    work_scheduled: AtomicBool,
}

impl Default for TestPump {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPump {
    pub fn new() -> Self {
        TestPump {
            quit_requested: AtomicBool::new(false),
            work_scheduled: AtomicBool::new(false),
        }
    }
}

impl Pump for TestPump {
    fn run(&self, delegate: &dyn PumpDelegate) {
        self.quit_requested.store(false, Ordering::SeqCst);
        loop {
            if self.quit_requested.load(Ordering::SeqCst) {
                break;
            }
            let did_work = delegate.do_work();
            let next_wake = delegate.do_delayed_work();
            if did_work || next_wake.is_some() {
                continue;
            }
            if self.quit_requested.load(Ordering::SeqCst) {
                break;
            }
            let did_idle = delegate.do_idle_work();
            if !did_idle {
                break;
            }
        }
    }

    fn quit(&self) {
        self.quit_requested.store(true, Ordering::SeqCst);
    }

    fn schedule_work(&self) {
        self.work_scheduled.store(true, Ordering::SeqCst);
    }

    fn schedule_delayed_work(&self, _run_time: DateTime<Utc>) {}

    fn set_timer_slack(&self, _policy: TimerSlackPolicy) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_deterministically() {
        let clock = TestClock::at(Utc::now());
        let before = clock.now();
        clock.advance(Duration::seconds(10));
        let after = clock.now();
        assert_eq!((after - before).num_seconds(), 10);
    }

    #[test]
    fn test_pump_returns_once_delegate_reports_no_work() {
        struct NoWork;
        impl PumpDelegate for NoWork {
            fn do_work(&self) -> bool {
                false
            }
            fn do_delayed_work(&self) -> Option<DateTime<Utc>> {
                None
            }
            fn do_idle_work(&self) -> bool {
                false
            }
        }
        let pump = TestPump::new();
        pump.run(&NoWork);
    }
}
