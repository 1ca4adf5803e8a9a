use chrono::{DateTime, Utc};
use std::fmt;
use std::panic::Location;

/// Where a task (or a post call) originated, for diagnostics only.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Origin(&'static Location<'static>);

impl Origin {
    #[track_caller]
    pub fn caller() -> Self {
        Origin(Location::caller())
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.file(), self.0.line(), self.0.column())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::hash::Hash for Origin {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.file().hash(state);
        self.0.line().hash(state);
        self.0.column().hash(state);
    }
}

/// Whether a task may run while a nested [`crate::TaskScheduler::run`] is in
/// progress.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Nestable {
    Nestable,
    NonNestable,
}

/// A fixed-depth ring of the origins of ancestor tasks: `backtrace[0]` is the
/// task that queued this one, `backtrace[1]` is the task that queued *that*
/// one, and so on, up to four levels deep.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskBacktrace([Option<Origin>; 4]);

impl TaskBacktrace {
    pub fn empty() -> Self {
        Self([None; 4])
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|slot| slot.is_none())
    }

    pub fn as_slice(&self) -> &[Option<Origin>; 4] {
        &self.0
    }

    /// Shifts every slot down by one and writes `parent_origin` into slot 0,
    /// dropping whatever was in the last slot. Used by the task annotator
    /// when queuing a task while another task is running on this thread.
    fn push_front(&mut self, parent_origin: Origin) {
        for i in (1..self.0.len()).rev() {
            self.0[i] = self.0[i - 1];
        }
        self.0[0] = Some(parent_origin);
    }
}

impl fmt::Debug for TaskBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().filter_map(|slot| slot.as_ref()))
            .finish()
    }
}

/// A closure that may be posted into the scheduler.
///
/// Mirrors the source's `OnceClosure`, which can be bound to a weak pointer
/// and silently become a no-op ("cancelled") before it ever runs. Plain
/// `FnOnce` closures are never cancelled; [`crate::test_support`] and callers
/// binding to weak state can provide their own [`Cancellable`] impl.
pub trait Cancellable: Send {
    /// Returns true if running this closure should be skipped.
    fn is_cancelled(&self) -> bool {
        false
    }

    fn run(self: Box<Self>);
}

struct FnOnceClosure<F>(Option<F>);

impl<F: FnOnce() + Send> Cancellable for FnOnceClosure<F> {
    fn run(self: Box<Self>) {
        if let Some(f) = (*self).0 {
            f();
        }
    }
}

pub(crate) fn boxed_closure<F: FnOnce() + Send + 'static>(f: F) -> Box<dyn Cancellable> {
    Box::new(FnOnceClosure(Some(f)))
}

/// A pending unit of work together with all of the bookkeeping the queues
/// and the scheduler loop need: where it came from, when it may run, whether
/// it may run while nested, and its poster backtrace.
pub struct Task {
    pub(crate) closure: Box<dyn Cancellable>,
    pub origin: Origin,
    pub seq: u32,
    pub delayed_run_time: Option<DateTime<Utc>>,
    pub nestable: Nestable,
    pub high_res: bool,
    pub backtrace: TaskBacktrace,
}

impl Task {
    pub(crate) fn new(
        closure: Box<dyn Cancellable>,
        origin: Origin,
        delayed_run_time: Option<DateTime<Utc>>,
        nestable: Nestable,
        high_res: bool,
    ) -> Self {
        Task {
            closure,
            origin,
            // Assigned by the incoming queue under its lock; 0 is a
            // placeholder until then.
            seq: 0,
            delayed_run_time,
            nestable,
            high_res,
            backtrace: TaskBacktrace::empty(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.closure.is_cancelled()
    }

    pub fn run(self) {
        self.closure.run();
    }

    /// Records that `self` was queued while `parent_origin`'s task (whose
    /// own backtrace was `parent_backtrace`) was running.
    pub(crate) fn adopt_parent_backtrace(&mut self, parent_origin: Origin, parent_backtrace: &TaskBacktrace) {
        debug_assert!(self.backtrace.is_empty());
        self.backtrace = *parent_backtrace;
        self.backtrace.push_front(parent_origin);
    }
}

/// Orders delayed tasks by `(delayed_run_time, seq)`, smaller first, with
/// `seq` compared as a signed difference so a 32-bit wrap-around sequence
/// counter still orders correctly.
pub(crate) fn delayed_order_key(a: &Task, b: &Task) -> std::cmp::Ordering {
    match (&a.delayed_run_time, &b.delayed_run_time) {
        (Some(at), Some(bt)) => at.cmp(bt).then_with(|| seq_cmp(a.seq, b.seq)),
        _ => unreachable!("delayed_order_key is only meaningful for delayed tasks"),
    }
}

/// Compares two sequence numbers allowing for 32-bit roll-over, the same way
/// the source's `PendingTask::operator<` does by comparing the signed
/// difference rather than the raw values.
pub(crate) fn seq_cmp(a: u32, b: u32) -> std::cmp::Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}
