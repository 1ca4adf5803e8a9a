use crate::clock::Clock;
use crate::pump::Pump;
use crate::task::{delayed_order_key, Task};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

/// The thread-safe landing zone every [`crate::TaskRunner`] posts into.
///
/// Shared via `Arc` between the scheduler and every live `TaskRunner` handle,
/// the same way the source's `IncomingTaskQueue` is `RefCountedThreadSafe` and
/// outlives the `MessageLoop` that created it until the last handle drops. It
/// also holds the scheduler's pump directly, the way the source's
/// `IncomingTaskQueue` holds a raw pointer back to its `MessageLoop` so a
/// post from any thread can call `ScheduleWork` without going through the
/// scheduler itself.
pub(crate) struct IncomingQueueState {
    pump: Arc<dyn Pump>,
    clock: Arc<dyn Clock>,
    inner: Mutex<IncomingInner>,
}

struct IncomingInner {
    tasks: Vec<Task>,
    next_sequence_num: u32,
    accept_new_tasks: bool,
    pending_high_res_tasks: i32,
    bound_thread: Option<std::thread::ThreadId>,
    /// Mirrors the source's `ready_for_scheduling_`: until
    /// `start_scheduling` has been called once, posts queue up quietly
    /// without poking the pump, since nothing is running it yet.
    ready_for_scheduling: bool,
}

impl IncomingQueueState {
    pub fn new(pump: Arc<dyn Pump>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(IncomingQueueState {
            pump,
            clock,
            inner: Mutex::new(IncomingInner {
                tasks: Vec::new(),
                next_sequence_num: 0,
                accept_new_tasks: true,
                pending_high_res_tasks: 0,
                bound_thread: None,
                ready_for_scheduling: false,
            }),
        })
    }

    pub fn bind_to_current_thread(&self) {
        self.inner.lock().bound_thread = Some(std::thread::current().id());
    }

    /// Marks the queue ready to notify the pump and wakes it once for
    /// anything already queued. Idempotent.
    pub fn start_scheduling(&self) {
        let mut inner = self.inner.lock();
        if inner.ready_for_scheduling {
            return;
        }
        inner.ready_for_scheduling = true;
        let has_backlog = !inner.tasks.is_empty();
        drop(inner);
        if has_backlog {
            self.pump.schedule_work();
        }
    }

    pub fn runs_tasks_in_current_sequence(&self) -> bool {
        self.inner.lock().bound_thread == Some(std::thread::current().id())
    }

    /// The scheduler's clock, so a `TaskRunner` can turn a relative delay
    /// into an absolute `delayed_run_time` consistently with however the
    /// bound scheduler loop tells time (real or, in tests, fake).
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Appends `task` to the incoming queue and wakes the pump if needed.
    /// Returns `Err(task)` un-adopted if the queue is no longer accepting
    /// new tasks, so the caller can drop the closure outside the lock (see
    /// `TaskRunner::post`'s caveat).
    pub fn push(&self, mut task: Task) -> Result<(), Task> {
        let delayed_run_time = task.delayed_run_time;
        let mut inner = self.inner.lock();
        if !inner.accept_new_tasks {
            return Err(task);
        }
        task.seq = inner.next_sequence_num;
        inner.next_sequence_num = inner.next_sequence_num.wrapping_add(1);
        if task.high_res {
            inner.pending_high_res_tasks += 1;
        }
        let was_empty = inner.tasks.is_empty();
        inner.tasks.push(task);
        let ready = inner.ready_for_scheduling;
        drop(inner);

        if ready {
            if let Some(run_time) = delayed_run_time {
                // The pump itself only moves its wake time earlier, never
                // later, so it is always safe to just tell it about this one.
                self.pump.schedule_delayed_work(run_time);
            } else if was_empty {
                self.pump.schedule_work();
            }
        }

        Ok(())
    }

    /// Swaps out the whole batch of incoming tasks for the bound thread to
    /// triage, leaving the incoming queue empty for new posts.
    pub fn reload(&self) -> Vec<Task> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.tasks)
    }

    pub fn stop_accepting_new_tasks(&self) {
        self.inner.lock().accept_new_tasks = false;
    }

    pub fn is_accepting_new_tasks(&self) -> bool {
        self.inner.lock().accept_new_tasks
    }

    pub fn pending_high_res_tasks(&self) -> i32 {
        self.inner.lock().pending_high_res_tasks
    }

    /// Called once a high-res delayed task has actually run (or been
    /// cancelled), to balance the count incremented in `push`.
    pub fn decrement_pending_high_res_tasks(&self) {
        let mut inner = self.inner.lock();
        inner.pending_high_res_tasks -= 1;
        debug_assert!(inner.pending_high_res_tasks >= 0);
    }
}

/// Min-heap ordering wrapper: earliest `delayed_run_time` (then lowest `seq`)
/// sorts to the top of the `BinaryHeap`, which is otherwise a max-heap.
struct DelayedEntry(Task);

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.delayed_run_time == other.0.delayed_run_time && self.0.seq == other.0.seq
    }
}
impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        delayed_order_key(&other.0, &self.0)
    }
}

/// The bound-thread-only working queues a [`crate::TaskScheduler`] drains.
///
/// `triage` holds tasks freshly reloaded from the incoming queue, in posting
/// order, not yet sorted into "ready now" vs. "ready later". `delayed` holds
/// tasks with a future `delayed_run_time`. `deferred` holds non-nestable
/// tasks that came due while a nested run loop was active.
pub(crate) struct Queues {
    pub triage: VecDeque<Task>,
    delayed: BinaryHeap<DelayedEntry>,
    pub deferred: VecDeque<Task>,
}

impl Queues {
    pub fn new() -> Self {
        Queues {
            triage: VecDeque::new(),
            delayed: BinaryHeap::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn reload_triage(&mut self, tasks: Vec<Task>) {
        self.triage.extend(tasks);
    }

    pub fn push_delayed(&mut self, task: Task) {
        self.delayed.push(DelayedEntry(task));
    }

    /// Drops cancelled entries off the top of the heap and returns whether
    /// the earliest surviving task is due. Scanning only the top is
    /// intentional: a cancelled task buried under live ones is reaped lazily
    /// when it eventually surfaces, never by an eager sweep.
    pub fn delayed_is_due(&mut self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.reap_cancelled_delayed_top();
        match self.delayed.peek() {
            Some(entry) => entry.0.delayed_run_time.expect("delayed entries always carry a time") <= now,
            None => false,
        }
    }

    pub fn next_delayed_run_time(&mut self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.reap_cancelled_delayed_top();
        self.delayed.peek().and_then(|entry| entry.0.delayed_run_time)
    }

    /// Pops the earliest-due delayed task unconditionally, after reaping any
    /// cancelled entries ahead of it. Callers that only want to run tasks
    /// that have actually come due should check `delayed_is_due` first;
    /// teardown callers that want to drain everything regardless of time
    /// call this directly in a loop.
    pub fn pop_due_delayed(&mut self) -> Option<Task> {
        self.reap_cancelled_delayed_top();
        self.delayed.pop().map(|entry| entry.0)
    }

    fn reap_cancelled_delayed_top(&mut self) {
        while let Some(entry) = self.delayed.peek() {
            if entry.0.is_cancelled() {
                self.delayed.pop();
            } else {
                break;
            }
        }
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Moves every deferred task back in front of the triage queue, in the
    /// order they were deferred, so they get first crack at the next
    /// non-nested `do_work`.
    ///
    /// caveat: a high-res delayed task that becomes due while nested is
    /// popped out of `delayed` (and so should logically stop counting
    /// against `pending_high_res_tasks`) but is pushed here into `deferred`
    /// instead of run, and nothing decrements the counter until it actually
    /// runs later — it is double-counted for that whole stretch. This
    /// matches the source's own documented behavior in
    /// `incoming_task_queue.cc` and is left as-is rather than "fixed".
    pub fn requeue_deferred_to_triage(&mut self) {
        while let Some(task) = self.deferred.pop_front() {
            self.triage.push_front(task);
        }
    }
}
