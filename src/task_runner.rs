use crate::annotator::TaskAnnotator;
use crate::queues::IncomingQueueState;
use crate::task::{boxed_closure, Nestable, Origin, Task};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

/// Highest plausible delayed-task delay before this crate starts warning
/// that the caller likely passed the wrong unit or computed the delay
/// incorrectly. Matches the source's `kMaxTimerLockInSec`-adjacent sanity
/// threshold in spirit, not value.
const EXCESSIVE_DELAY: ChronoDuration = ChronoDuration::days(365);

/// A cheap, cloneable handle any thread may use to post work into a
/// [`crate::TaskScheduler`], independent of that scheduler's own lifetime:
/// the underlying queue is reference-counted and outlives a destroyed
/// scheduler until every handle (and the scheduler itself) has dropped,
/// mirroring the source's `RefCountedThreadSafe<IncomingTaskQueue>`.
#[derive(Clone)]
pub struct TaskRunner {
    incoming: Arc<IncomingQueueState>,
    annotator: TaskAnnotator,
}

impl TaskRunner {
    pub(crate) fn new(incoming: Arc<IncomingQueueState>, annotator: TaskAnnotator) -> Self {
        TaskRunner { incoming, annotator }
    }

    #[track_caller]
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.post_task(f, None, Nestable::Nestable)
    }

    #[track_caller]
    pub fn post_non_nestable(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.post_task(f, None, Nestable::NonNestable)
    }

    #[track_caller]
    pub fn post_delayed(&self, f: impl FnOnce() + Send + 'static, delay: Duration) -> bool {
        self.post_task(f, Some(delay), Nestable::Nestable)
    }

    #[track_caller]
    pub fn post_non_nestable_delayed(&self, f: impl FnOnce() + Send + 'static, delay: Duration) -> bool {
        self.post_task(f, Some(delay), Nestable::NonNestable)
    }

    pub fn runs_tasks_in_current_sequence(&self) -> bool {
        self.incoming.runs_tasks_in_current_sequence()
    }

    #[track_caller]
    fn post_task(&self, f: impl FnOnce() + Send + 'static, delay: Option<Duration>, nestable: Nestable) -> bool {
        let origin = Origin::caller();
        // A zero delay is immediate, not a delayed task due at `now`.
        let delay = delay.filter(|d| !d.is_zero());
        let delayed_run_time = delay.map(|d| {
            let chrono_delay = ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero());
            if chrono_delay > EXCESSIVE_DELAY {
                log::warn!("task posted at {origin} with an excessive delay of {d:?}");
            }
            self.incoming.now() + chrono_delay
        });
        // "High resolution" here means sub-32ms, the same threshold the
        // source uses to decide whether a delayed task is worth activating a
        // high-resolution platform timer for.
        let high_res = matches!(delay, Some(d) if d < Duration::from_millis(32));

        let mut task = Task::new(boxed_closure(f), origin, delayed_run_time, nestable, high_res);
        self.annotator.will_queue_task(&mut task);

        match self.incoming.push(task) {
            // Waking the pump (if needed) already happened inside `push`,
            // which holds the pump handle directly.
            Ok(()) => true,
            Err(task) => {
                // Drop the closure outside of any lock, mirroring the
                // source's `PostPendingTask` doing the same "to prevent any
                // chance of self-deadlock if destroying a task also posts a
                // task to this queue".
                drop(task);
                false
            }
        }
    }
}
