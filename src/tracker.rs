use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

/// How a task behaves when shutdown has been requested.
///
/// Mirrors the source's three `TaskShutdownBehavior` values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShutdownBehavior {
    /// Shutdown waits for this task to complete before finishing.
    BlockShutdown,
    /// The task is dropped, unrun, once shutdown starts; if it is already
    /// running, shutdown waits for it to finish.
    SkipOnShutdown,
    /// The task may keep running after shutdown starts and is never waited
    /// on.
    ContinueOnShutdown,
}

/// Scheduling priority for the bounded background-admission layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Priority {
    Background,
    UserVisible,
    UserBlocking,
}

/// Opaque latency-recording sink, standing in for the source's
/// `(priority, may-block)` UMA histogram. The default implementation is a
/// no-op; install a real one to export metrics.
pub trait TaskLatencyRecorder: Send + Sync {
    fn record_queue_latency(&self, _priority: Priority, _latency: std::time::Duration) {}
}

struct NoopRecorder;
impl TaskLatencyRecorder for NoopRecorder {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ShutdownState {
    NotRequested,
    /// Shutdown requested; block-shutdown tasks still admitted.
    InProgress,
    /// All block-shutdown tasks have completed; `shutdown()` may return.
    Complete,
}

struct TrackerInner {
    state: ShutdownState,
    /// Count of block-shutdown tasks currently posted-but-not-yet-run, plus
    /// those currently running. `shutdown()` blocks until this reaches zero.
    pending_block_shutdown: u32,
}

struct BackgroundSlot {
    priority: Priority,
    seq: u32,
}

impl PartialEq for BackgroundSlot {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for BackgroundSlot {}
impl PartialOrd for BackgroundSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for BackgroundSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; among equals, earlier sequence first (so
        // `Reverse`-free a max-heap still pops the "most deserving" entry).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded admission for background-priority sequences: at most
/// `max_scheduled` may run concurrently; the rest wait in a priority-ordered
/// queue and are admitted as running ones finish.
struct BackgroundAdmission {
    max_scheduled: u32,
    num_scheduled: u32,
    preempted: BinaryHeap<BackgroundSlot>,
    next_seq: u32,
}

impl BackgroundAdmission {
    fn new(max_scheduled: u32) -> Self {
        BackgroundAdmission {
            max_scheduled,
            num_scheduled: 0,
            preempted: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Returns `true` if the caller may run immediately; otherwise the
    /// sequence is queued and will be admitted later via `on_task_finished`.
    /// Foreground priorities (`UserVisible`/`UserBlocking`) are never
    /// bounded — only `Background` sequences compete for `max_scheduled`.
    fn try_admit(&mut self, priority: Priority) -> bool {
        if priority != Priority::Background {
            return true;
        }
        if self.num_scheduled < self.max_scheduled {
            self.num_scheduled += 1;
            true
        } else {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.preempted.push(BackgroundSlot { priority, seq });
            false
        }
    }

    /// Called when a running background sequence finishes; admits the
    /// highest-priority (then oldest) preempted sequence, if any is waiting.
    /// Returns `true` if a waiter was admitted and must be woken by the
    /// caller.
    fn on_task_finished(&mut self) -> bool {
        match self.preempted.pop() {
            Some(_) => true,
            None => {
                self.num_scheduled -= 1;
                false
            }
        }
    }
}

/// Shutdown-aware admission gate sitting in front of a thread-pool-style
/// consumer of this crate's task queues.
///
/// `TaskTracker` does not itself run tasks; it decides whether a task may be
/// posted (`will_post_task`) and, once it is about to run, whether it should
/// actually run, be skipped, or block shutdown until it completes
/// (`will_run_task`/`run_finished`), mirroring the source's
/// `TaskTracker::WillPostTask`/`RunAndPopNextTask`.
pub struct TaskTracker {
    inner: Mutex<TrackerInner>,
    shutdown_complete: Condvar,
    background: Mutex<BackgroundAdmission>,
    latency_recorder: Arc<dyn TaskLatencyRecorder>,
    num_tasks_run: AtomicU32,
}

impl TaskTracker {
    pub fn new(max_scheduled_background: u32) -> Self {
        Self::with_latency_recorder(max_scheduled_background, Arc::new(NoopRecorder))
    }

    pub fn with_latency_recorder(
        max_scheduled_background: u32,
        latency_recorder: Arc<dyn TaskLatencyRecorder>,
    ) -> Self {
        TaskTracker {
            inner: Mutex::new(TrackerInner {
                state: ShutdownState::NotRequested,
                pending_block_shutdown: 0,
            }),
            shutdown_complete: Condvar::new(),
            background: Mutex::new(BackgroundAdmission::new(max_scheduled_background)),
            latency_recorder,
            num_tasks_run: AtomicU32::new(0),
        }
    }

    /// Returns `true` if a task with `behavior` may be posted right now.
    /// Once shutdown has started, neither `SkipOnShutdown` nor
    /// `ContinueOnShutdown` tasks are accepted — only `BlockShutdown`, which
    /// shutdown is already waiting on anyway.
    pub fn will_post_task(&self, behavior: ShutdownBehavior) -> bool {
        let mut inner = self.inner.lock();
        match (inner.state, behavior) {
            (ShutdownState::NotRequested, _) => {
                if behavior == ShutdownBehavior::BlockShutdown {
                    inner.pending_block_shutdown += 1;
                }
                true
            }
            (_, ShutdownBehavior::BlockShutdown) => {
                inner.pending_block_shutdown += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if a task with `behavior`, already posted, may run now
    /// that its turn has come up. `SkipOnShutdown` tasks block shutdown for
    /// as long as they are running, the same as `BlockShutdown`, but do not
    /// block it before they start — once shutdown has begun, a
    /// `SkipOnShutdown` task that has not yet started is dropped instead.
    pub fn will_run_task(&self, behavior: ShutdownBehavior) -> bool {
        let mut inner = self.inner.lock();
        if behavior == ShutdownBehavior::SkipOnShutdown && inner.state != ShutdownState::NotRequested {
            return false;
        }
        if behavior == ShutdownBehavior::SkipOnShutdown {
            inner.pending_block_shutdown += 1;
        }
        true
    }

    /// Gates admission of a background-priority sequence onto the bounded
    /// pool. Returns `true` if it may run now.
    pub fn will_schedule_background(&self, priority: Priority) -> bool {
        self.background.lock().try_admit(priority)
    }

    /// Reports that a previously admitted background sequence finished
    /// running, potentially admitting the next preempted one. Returns
    /// `true` if the caller should wake the pool to pick up the newly
    /// admitted sequence.
    pub fn background_task_finished(&self) -> bool {
        self.background.lock().on_task_finished()
    }

    /// Reports a task (of the given shutdown behavior) has finished running,
    /// decrementing the block-shutdown counter and waking `shutdown()` if it
    /// was the last one outstanding. A running `SkipOnShutdown` task blocks
    /// shutdown the same way a `BlockShutdown` one does, per
    /// `will_run_task`'s bookkeeping.
    pub fn run_finished(&self, behavior: ShutdownBehavior) {
        self.num_tasks_run.fetch_add(1, AtomicOrdering::Relaxed);
        if behavior == ShutdownBehavior::ContinueOnShutdown {
            return;
        }
        let mut inner = self.inner.lock();
        debug_assert!(inner.pending_block_shutdown > 0);
        inner.pending_block_shutdown -= 1;
        if inner.pending_block_shutdown == 0 && inner.state == ShutdownState::InProgress {
            inner.state = ShutdownState::Complete;
            self.shutdown_complete.notify_all();
        }
    }

    /// Requests shutdown: no further `SkipOnShutdown` task is admitted, and
    /// blocks the calling thread until every already-admitted
    /// `BlockShutdown` task has called `run_finished`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ShutdownState::NotRequested {
            inner.state = if inner.pending_block_shutdown == 0 {
                ShutdownState::Complete
            } else {
                ShutdownState::InProgress
            };
        }
        while inner.state != ShutdownState::Complete {
            self.shutdown_complete.wait(&mut inner);
        }
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.inner.lock().state == ShutdownState::Complete
    }

    pub fn num_tasks_run(&self) -> u32 {
        self.num_tasks_run.load(AtomicOrdering::Relaxed)
    }

    pub fn latency_recorder(&self) -> &dyn TaskLatencyRecorder {
        &*self.latency_recorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn block_shutdown_task_delays_shutdown_completion() {
        let tracker = Arc::new(TaskTracker::new(4));
        assert!(tracker.will_post_task(ShutdownBehavior::BlockShutdown));

        let t2 = tracker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            t2.run_finished(ShutdownBehavior::BlockShutdown);
        });

        tracker.shutdown();
        handle.join().unwrap();
        assert!(tracker.is_shutdown_complete());
    }

    #[test]
    fn skip_and_continue_on_shutdown_rejected_once_started() {
        let tracker = TaskTracker::new(4);
        assert!(tracker.will_post_task(ShutdownBehavior::BlockShutdown));
        let t2 = Arc::new(tracker);
        let clone = t2.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            clone.run_finished(ShutdownBehavior::BlockShutdown);
        });
        t2.shutdown();
        handle.join().unwrap();
        assert!(!t2.will_post_task(ShutdownBehavior::SkipOnShutdown));
        assert!(!t2.will_post_task(ShutdownBehavior::ContinueOnShutdown));
        assert!(t2.will_post_task(ShutdownBehavior::BlockShutdown));
    }

    #[test]
    fn will_run_task_blocks_shutdown_for_skip_on_shutdown() {
        let tracker = Arc::new(TaskTracker::new(4));
        assert!(tracker.will_post_task(ShutdownBehavior::BlockShutdown));
        assert!(tracker.will_run_task(ShutdownBehavior::SkipOnShutdown));

        let t2 = tracker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(15));
            t2.run_finished(ShutdownBehavior::BlockShutdown);
            t2.run_finished(ShutdownBehavior::SkipOnShutdown);
        });

        tracker.shutdown();
        handle.join().unwrap();
        assert!(tracker.is_shutdown_complete());

        // A `SkipOnShutdown` task that has not yet started when shutdown
        // begins is not admitted to run at all.
        assert!(!tracker.will_run_task(ShutdownBehavior::SkipOnShutdown));
    }

    #[test]
    fn background_admission_bounds_only_background_priority() {
        let tracker = TaskTracker::new(1);
        assert!(tracker.will_schedule_background(Priority::Background));
        assert!(!tracker.will_schedule_background(Priority::Background));
        // Foreground priorities are never bounded by the background cap.
        assert!(tracker.will_schedule_background(Priority::UserVisible));
        assert!(tracker.will_schedule_background(Priority::UserBlocking));

        // Finishing the running background sequence admits the waiter.
        assert!(tracker.background_task_finished());
    }
}
