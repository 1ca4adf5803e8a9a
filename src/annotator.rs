use crate::task::{Origin, Task, TaskBacktrace};
use std::cell::RefCell;
use std::sync::OnceLock;

/// A snapshot of whichever task is currently running on this thread, pushed
/// by [`TaskAnnotator::run_task`] for the duration of the run.
#[derive(Clone, Copy)]
struct RunningTask {
    origin: Origin,
    backtrace: TaskBacktrace,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<RunningTask>> = const { RefCell::new(None) };
}

/// Opaque identifier correlating a task's queuing with its eventual run, for
/// external tracing systems. Not interpreted by this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TraceId(u64);

/// Observes tasks immediately before they run, across every
/// [`TaskAnnotator`] on the process. Analogous to the source's
/// `TaskAnnotator::ObserverForTesting`; there is exactly one observer at a
/// time, installed once via [`TaskAnnotator::set_observer`].
pub trait Observer: Send + Sync {
    fn before_run_task(&self, backtrace: &TaskBacktrace);
}

static OBSERVER: OnceLock<Box<dyn Observer>> = OnceLock::new();

/// Stamps outgoing tasks with a backtrace of their ancestry and reports each
/// task to the registered [`Observer`] immediately before it runs.
///
/// Stateless: every method reads or writes only the calling thread's
/// thread-local "currently running task" slot, so one `TaskAnnotator` (or
/// many, it makes no difference) can be shared freely across scheduler
/// instances on different threads.
#[derive(Default, Clone, Copy)]
pub struct TaskAnnotator;

impl TaskAnnotator {
    pub fn new() -> Self {
        TaskAnnotator
    }

    /// Registers the process-wide task observer. Intended for test harnesses;
    /// a second call is ignored (mirroring the source's single static
    /// registration) and returns `false`.
    pub fn set_observer(observer: Box<dyn Observer>) -> bool {
        OBSERVER.set(observer).is_ok()
    }

    /// Called just before `task` is queued, to adopt the backtrace of
    /// whichever task is currently running on this thread (if any).
    pub fn will_queue_task(&self, task: &mut Task) {
        CURRENT_TASK.with(|current| {
            if let Some(running) = *current.borrow() {
                task.adopt_parent_backtrace(running.origin, &running.backtrace);
            }
        });
    }

    /// Returns the backtrace of whichever task is currently running on this
    /// thread, or an empty backtrace if none is.
    pub fn current_backtrace(&self) -> TaskBacktrace {
        CURRENT_TASK.with(|current| current.borrow().map(|running| running.backtrace).unwrap_or_default())
    }

    /// Returns the origin of whichever task is currently running on this
    /// thread, or `None` if none is.
    pub fn current_origin(&self) -> Option<Origin> {
        CURRENT_TASK.with(|current| current.borrow().map(|running| running.origin))
    }

    /// Computes this task's trace id, combining its sequence number with its
    /// origin so that re-running a sequence counter from zero in a later
    /// process does not collide with an earlier trace.
    pub fn trace_id(task: &Task) -> TraceId {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        task.origin.hash(&mut hasher);
        task.seq.hash(&mut hasher);
        TraceId(hasher.finish())
    }

    /// Runs `task`, publishing it as the thread's "currently running task"
    /// for the duration of the call and notifying the registered observer
    /// immediately beforehand. Restores whatever task was running before
    /// (not `None`) once `task` finishes, so a nested run unwinds back to
    /// the outer task's identity rather than erasing it.
    pub fn run_task(&self, task: Task) {
        let running = RunningTask {
            origin: task.origin,
            backtrace: task.backtrace,
        };
        if let Some(observer) = OBSERVER.get() {
            observer.before_run_task(&task.backtrace);
        }
        let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace(running));
        task.run();
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
    }
}
