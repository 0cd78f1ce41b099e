// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Queue entries.

use std::fmt;
use std::sync::Arc;

use crate::fiber::{Fiber, FiberState};
use crate::thread::Tid;

pub type Callback = Box<dyn FnOnce() + Send>;

/// What a worker runs: an existing fiber, or a callable it wraps in one.
pub enum Job {
    Fiber(Arc<Fiber>),
    Callback(Callback),
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Job::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A job plus the worker it is pinned to, if any.
#[derive(Debug)]
pub struct ScheduleTask {
    pub job: Job,
    pub thread: Option<Tid>,
}

impl ScheduleTask {
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Self {
            job: Job::Fiber(fiber),
            thread: None,
        }
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            job: Job::Callback(Box::new(f)),
            thread: None,
        }
    }

    /// Only run on the worker whose kernel tid is `thread`.
    pub fn pinned(mut self, thread: Tid) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Whether the worker with tid `thread` may take this task now.
    ///
    /// A fiber that is still switching out on another worker is not
    /// runnable yet even though it is already queued.
    pub(crate) fn runnable_on(&self, thread: Tid) -> bool {
        if self.thread.is_some_and(|pinned| pinned != thread) {
            return false;
        }
        match &self.job {
            Job::Fiber(fiber) => fiber.state() != FiberState::Running,
            Job::Callback(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinning_filters_threads() {
        let task = ScheduleTask::callback(|| {}).pinned(42);
        assert!(task.runnable_on(42));
        assert!(!task.runnable_on(43));

        let any = ScheduleTask::callback(|| {});
        assert!(any.runnable_on(1));
        assert!(any.runnable_on(2));
    }

    #[test]
    fn running_fiber_is_not_runnable() {
        let root = Fiber::current();
        let task = ScheduleTask::fiber(root);
        assert!(!task.runnable_on(crate::thread::current_tid()));

        let fresh = ScheduleTask::fiber(Fiber::new(|| {}).unwrap());
        assert!(fresh.runnable_on(crate::thread::current_tid()));
    }
}
