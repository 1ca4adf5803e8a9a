use chrono::{DateTime, Utc};

/// A source of monotonic-enough wall-clock time.
///
/// Indirecting through a trait (rather than calling `Utc::now()` directly)
/// is what lets delayed-task ordering be tested deterministically: tests use
/// a fake clock they control instead of sleeping in real time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock, backed by the system wall clock.
#[derive(Default, Debug, Clone, Copy)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
