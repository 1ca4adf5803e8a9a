use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration as StdDuration;

/// Opaque platform timer-coalescing hint. Neither variant changes this
/// crate's behavior; they exist so a [`Pump`] implementation with a real
/// platform timer underneath has somewhere to plug in `set_timer_slack`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TimerSlackPolicy {
    #[default]
    Default,
    Maximum,
}

/// Callbacks a [`Pump`] invokes on the bound thread once per wake, in order.
/// Implemented by [`crate::TaskScheduler`].
pub trait PumpDelegate {
    /// Runs as many ready tasks as the delegate chooses to; returns whether
    /// any work was done (a pump may use this to decide whether to also
    /// check `do_delayed_work`/`do_idle_work` before sleeping again).
    fn do_work(&self) -> bool;

    /// Runs any delayed tasks now due. Returns the next wake time, if any
    /// delayed task remains pending.
    fn do_delayed_work(&self) -> Option<DateTime<Utc>>;

    /// Runs idle-priority callbacks. Only called when `do_work` and
    /// `do_delayed_work` both reported no work.
    fn do_idle_work(&self) -> bool;
}

/// The external, possibly-platform-native event pump a [`crate::TaskScheduler`]
/// is bound to. This crate never implements a native event pump (GUI message
/// queue, epoll reactor, and so on) itself — [`SimplePump`] is the one
/// concrete, platform-nothing implementation provided so the scheduler is
/// runnable and testable standalone.
pub trait Pump: Send + Sync {
    /// Runs `delegate`'s callbacks in a loop until `quit` is called. Blocks
    /// the calling thread; nested calls (from within a task running on this
    /// same pump) are expected to be supported by implementations, mirroring
    /// nested `RunLoop`s in the source.
    fn run(&self, delegate: &dyn PumpDelegate);

    /// Causes the innermost `run` on this thread to return once its current
    /// iteration finishes.
    fn quit(&self);

    /// Wakes the pump to call `do_work` again. Safe from any thread.
    fn schedule_work(&self);

    /// Arranges for the pump to call `do_delayed_work` at or after
    /// `run_time`. Bound thread only, matching the source's restriction that
    /// only the loop owner reschedules its own timer.
    fn schedule_delayed_work(&self, run_time: DateTime<Utc>);

    fn set_timer_slack(&self, policy: TimerSlackPolicy);
}

struct SimplePumpState {
    /// Set by `quit()` to the depth of the innermost active `run` at the
    /// time it was called; cleared once that `run` notices and exits, so a
    /// `quit()` never escapes past the loop it targeted.
    quit_requested_at_depth: Option<usize>,
    delayed_wake: Option<DateTime<Utc>>,
    timer_slack: TimerSlackPolicy,
}

/// A production [`Pump`] with no platform event source: it parks the bound
/// thread between wakeups and unparks on `schedule_work`/`schedule_delayed_work`,
/// the same primitive the teacher's test scheduler parks on while waiting for
/// foreground work.
pub struct SimplePump {
    parker: parking::Parker,
    unparker: parking::Unparker,
    state: Mutex<SimplePumpState>,
    run_depth: std::sync::atomic::AtomicUsize,
}

impl Default for SimplePump {
    fn default() -> Self {
        Self::new()
    }
}

impl SimplePump {
    pub fn new() -> Self {
        let parker = parking::Parker::new();
        let unparker = parker.unparker();
        SimplePump {
            parker,
            unparker,
            state: Mutex::new(SimplePumpState {
                quit_requested_at_depth: None,
                delayed_wake: None,
                timer_slack: TimerSlackPolicy::default(),
            }),
            run_depth: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn park_until_woken_or_due(&self) {
        let wait_for = self.state.lock().delayed_wake;
        match wait_for {
            None => {
                self.parker.park();
            }
            Some(run_time) => {
                let now = Utc::now();
                if run_time <= now {
                    return;
                }
                let remaining = (run_time - now)
                    .to_std()
                    .unwrap_or(StdDuration::from_millis(0));
                self.parker.park_timeout(remaining);
            }
        }
    }
}

impl Pump for SimplePump {
    fn run(&self, delegate: &dyn PumpDelegate) {
        let depth = self.run_depth.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let quit_now = |state: &mut SimplePumpState| {
            if state.quit_requested_at_depth == Some(depth) {
                state.quit_requested_at_depth = None;
                true
            } else {
                false
            }
        };
        loop {
            if quit_now(&mut self.state.lock()) {
                break;
            }
            let did_work = delegate.do_work();
            let next_wake = delegate.do_delayed_work();
            self.state.lock().delayed_wake = next_wake;
            let did_idle = if !did_work && next_wake.is_none() {
                delegate.do_idle_work()
            } else {
                false
            };
            if quit_now(&mut self.state.lock()) {
                break;
            }
            if !did_work && !did_idle && next_wake.is_none() {
                self.park_until_woken_or_due();
            }
        }
        self.run_depth.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn quit(&self) {
        let depth = self.run_depth.load(std::sync::atomic::Ordering::SeqCst);
        self.state.lock().quit_requested_at_depth = Some(depth);
        self.unparker.unpark();
    }

    fn schedule_work(&self) {
        self.unparker.unpark();
    }

    fn schedule_delayed_work(&self, run_time: DateTime<Utc>) {
        let mut state = self.state.lock();
        let sooner = match state.delayed_wake {
            Some(existing) => run_time < existing,
            None => true,
        };
        if sooner {
            state.delayed_wake = Some(run_time);
        }
        drop(state);
        self.unparker.unpark();
    }

    fn set_timer_slack(&self, policy: TimerSlackPolicy) {
        self.state.lock().timer_slack = policy;
    }
}

pub(crate) fn shared_simple_pump() -> Arc<SimplePump> {
    Arc::new(SimplePump::new())
}
