use crate::annotator::TaskAnnotator;
use crate::clock::Clock;
use crate::flag_set::AtomicFlagSet;
use crate::pump::{Pump, PumpDelegate};
use crate::queues::{IncomingQueueState, Queues};
use crate::task::Nestable;
use crate::task_runner::TaskRunner;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Notified once, right before a [`TaskScheduler`] tears down its queues.
/// Mirrors the source's `MessageLoop::DestructionObserver`.
pub trait DestructionObserver: Send + Sync {
    fn will_destroy_current_scheduler(&self);
}

/// A single-threaded cooperative scheduler bound to exactly one thread and
/// one [`Pump`]. All of `bind`, `run`, `do_work`/`do_delayed_work`/
/// `do_idle_work`, `quit`, and `destroy` are bound-thread only; `post`
/// (reached through a [`TaskRunner`]) and the scheduling side of the flag
/// set may be called from any thread.
pub struct TaskScheduler {
    pump: Arc<dyn Pump>,
    incoming: Arc<IncomingQueueState>,
    queues: Mutex<Queues>,
    annotator: TaskAnnotator,
    clock: Arc<dyn Clock>,
    flags: AtomicFlagSet,
    nesting_depth: AtomicUsize,
    started_scheduling: AtomicBool,
    destruction_observers: Mutex<Vec<Arc<dyn DestructionObserver>>>,
    /// If set, every post wakes the pump even while nested, matching
    /// platforms (Android/UI) the source special-cases; no `Pump` in this
    /// crate sets this today, but the field is wired end to end so a future
    /// one can.
    always_notify_pump: bool,
}

impl TaskScheduler {
    /// Constructs a scheduler bound to the calling thread. Mirrors the
    /// source's `MessageLoop` constructor binding itself to whichever thread
    /// creates it.
    pub fn new(pump: Arc<dyn Pump>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let incoming = IncomingQueueState::new(pump.clone(), clock.clone());
        incoming.bind_to_current_thread();
        Arc::new(TaskScheduler {
            pump,
            incoming,
            queues: Mutex::new(Queues::new()),
            annotator: TaskAnnotator::new(),
            clock,
            flags: AtomicFlagSet::new(),
            nesting_depth: AtomicUsize::new(0),
            started_scheduling: AtomicBool::new(false),
            destruction_observers: Mutex::new(Vec::new()),
            always_notify_pump: false,
        })
    }

    /// Marks the scheduler ready to notify its pump. Posts made before this
    /// call are queued but do not wake the pump (there is nothing running it
    /// yet to wake); `run` calls this implicitly on first entry if it has
    /// not been called already.
    pub fn start_scheduling(&self) {
        self.started_scheduling.store(true, Ordering::SeqCst);
        self.incoming.start_scheduling();
    }

    /// Returns a handle any thread may use to post work into this scheduler,
    /// independent of the scheduler's own lifetime.
    pub fn task_runner(&self) -> TaskRunner {
        TaskRunner::new(self.incoming.clone(), self.annotator)
    }

    pub fn flags(&self) -> &AtomicFlagSet {
        &self.flags
    }

    pub fn add_destruction_observer(&self, observer: Arc<dyn DestructionObserver>) {
        self.destruction_observers.lock().push(observer);
    }

    /// Posts a task directly, as if through this scheduler's own
    /// `TaskRunner`. Exists so call sites already holding a `TaskScheduler`
    /// don't need to also hold a `TaskRunner`.
    #[track_caller]
    pub fn post_task(&self, f: impl FnOnce() + Send + 'static) {
        self.task_runner().post(f);
    }

    /// Runs the bound pump until `quit` is called. Nested calls are allowed:
    /// a task running inside an outer `run` may call `run` again, and
    /// non-nestable tasks posted while nested are deferred until every
    /// nested `run` has returned.
    pub fn run(&self) {
        self.start_scheduling();
        self.nesting_depth.fetch_add(1, Ordering::SeqCst);
        self.pump.run(self);
        self.nesting_depth.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn quit(&self) {
        self.pump.quit();
    }

    pub fn is_nested(&self) -> bool {
        self.nesting_depth.load(Ordering::SeqCst) > 1
    }

    pub fn is_scheduling_started(&self) -> bool {
        self.started_scheduling.load(Ordering::SeqCst)
    }

    pub fn notifies_pump_while_nested(&self) -> bool {
        self.always_notify_pump
    }

    /// Notifies destruction observers, stops accepting new posts, and drops
    /// every task still sitting in the queues without running it — mirroring
    /// the source's deletion of an undrained `MessageLoop`'s tasks.
    pub fn destroy(&self) {
        for observer in self.destruction_observers.lock().drain(..) {
            observer.will_destroy_current_scheduler();
        }
        self.incoming.stop_accepting_new_tasks();
        drop(self.incoming.reload());
        let mut queues = self.queues.lock();
        queues.triage.clear();
        queues.deferred.clear();
        // Drains the delayed heap unconditionally (not just what's due) —
        // teardown does not wait on delayed tasks' timers.
        while queues.pop_due_delayed().is_some() {}
    }
}

impl PumpDelegate for TaskScheduler {
    fn do_work(&self) -> bool {
        let mut queues = self.queues.lock();
        if queues.triage.is_empty() {
            let batch = self.incoming.reload();
            queues.reload_triage(batch);
        }
        let nested = self.is_nested();
        while let Some(task) = queues.triage.pop_front() {
            if task.is_cancelled() {
                continue;
            }
            if task.delayed_run_time.is_some() {
                // See `Queues::requeue_deferred_to_triage` for the
                // documented high-res double-counting caveat this task may
                // hit later if it comes due while nested.
                queues.push_delayed(task);
                continue;
            }
            if task.nestable == Nestable::NonNestable && nested {
                queues.deferred.push_back(task);
                continue;
            }
            drop(queues);
            self.annotator.run_task(task);
            return true;
        }
        false
    }

    fn do_delayed_work(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let mut queues = self.queues.lock();
        let now = self.clock.now();
        if queues.delayed_is_due(now) {
            if let Some(task) = queues.pop_due_delayed() {
                let high_res = task.high_res;
                if task.nestable == Nestable::NonNestable && self.is_nested() {
                    // See `Queues::requeue_deferred_to_triage` for the
                    // documented high-res double-counting caveat this hits.
                    queues.deferred.push_back(task);
                    return None;
                }
                drop(queues);
                self.annotator.run_task(task);
                if high_res {
                    self.incoming.decrement_pending_high_res_tasks();
                }
                return None;
            }
        }
        let next = queues.next_delayed_run_time();
        drop(queues);
        if let Some(next) = next {
            self.pump.schedule_delayed_work(next);
        }
        next
    }

    fn do_idle_work(&self) -> bool {
        if !self.is_nested() {
            let mut queues = self.queues.lock();
            if !queues.deferred.is_empty() {
                queues.requeue_deferred_to_triage();
                drop(queues);
                self.pump.schedule_work();
                return true;
            }
        }
        self.flags.run_active();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use crate::pump::SimplePump;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fifo_same_thread_posts_run_in_order() {
        let scheduler = TaskScheduler::new(Arc::new(SimplePump::new()), Arc::new(RealClock));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            scheduler.post_task(move || order.lock().push(i));
        }
        let s2 = scheduler.clone();
        let order2 = order.clone();
        scheduler.post_task(move || {
            assert_eq!(*order2.lock(), vec![0, 1, 2, 3, 4]);
            s2.quit();
        });
        scheduler.run();
    }

    #[test]
    fn non_nestable_task_is_deferred_while_nested() {
        let scheduler = TaskScheduler::new(Arc::new(SimplePump::new()), Arc::new(RealClock));
        let ran = Arc::new(AtomicUsize::new(0));

        let runner = scheduler.task_runner();
        let ran_clone = ran.clone();
        runner.post_non_nestable(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Simulate being nested without actually blocking in a pump: bump
        // the depth counter the same way `run` would, then drive `do_work`
        // directly.
        scheduler.nesting_depth.fetch_add(2, Ordering::SeqCst);
        assert!(scheduler.do_work());
        assert_eq!(
            ran.load(Ordering::SeqCst),
            0,
            "non-nestable task must not run while nested"
        );

        scheduler.nesting_depth.fetch_sub(2, Ordering::SeqCst);
        assert!(scheduler.do_idle_work());
        assert!(scheduler.do_work());
        assert_eq!(ran.load(Ordering::SeqCst), 1, "deferred task runs once no longer nested");
    }
}
