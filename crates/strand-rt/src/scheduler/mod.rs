// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! N:M fiber scheduler.
//!
//! A fixed pool of worker threads drains one FIFO queue. A worker resumes
//! queued fibers, wraps queued callables in a recycled fiber, and when
//! nothing is runnable resumes its idle fiber, which runs the scheduler's
//! [`Idle`] strategy and yields back. The worker exits once the idle fiber
//! terminates, which it does when `stopping()` holds.
//!
//! With `use_caller` the constructing thread is one of the workers: it gets
//! a scheduling fiber that runs the worker loop inside `stop()`.

mod task;

pub use task::{Callback, Job, ScheduleTask};

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread as std_thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberConfig, FiberState, Switch};
use crate::thread::{self, Thread, Tid};

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Weak<Shared>> = RefCell::new(Weak::new());
}

/// What a worker does when it has nothing to run.
pub trait Idle: Send + Sync + 'static {
    /// Runs on the worker's idle fiber; the fiber yields after it returns.
    fn idle(&self, scheduler: &Scheduler);

    /// Wake workers blocked in `idle`.
    fn tickle(&self, scheduler: &Scheduler);

    /// Extra shutdown condition on top of an empty queue.
    fn stopping(&self, _scheduler: &Scheduler) -> bool {
        true
    }
}

/// Sleeps a millisecond per idle round. Nothing to tickle.
#[derive(Debug, Default)]
pub struct SpinIdle;

impl Idle for SpinIdle {
    fn idle(&self, _scheduler: &Scheduler) {
        std_thread::sleep(Duration::from_millis(1));
    }

    fn tickle(&self, _scheduler: &Scheduler) {}
}

pub(crate) struct Shared {
    name: String,
    stack_size: usize,
    use_caller: bool,
    root_thread: Option<Tid>,
    /// Worker threads to spawn in `start`, the caller excluded.
    spawn_count: usize,

    tasks: Mutex<VecDeque<ScheduleTask>>,
    idle: Arc<dyn Idle>,
    idle_any: Arc<dyn Any + Send + Sync>,

    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<Tid>>,
    caller_fiber: Mutex<Option<Arc<Fiber>>>,

    /// Tasks popped and not yet switched out of.
    active: AtomicUsize,
    idle_threads: AtomicUsize,
    started: AtomicBool,
    stop_requested: AtomicBool,
}

/// Handle to a scheduler. Clones share the same pool.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Non-owning scheduler handle, for registrations that must not keep the
/// scheduler alive.
#[derive(Clone)]
pub(crate) struct WeakScheduler(Weak<Shared>);

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|shared| Scheduler { shared })
    }
}

impl Scheduler {
    /// Scheduler with the [`SpinIdle`] strategy.
    pub fn new(config: SchedulerConfig) -> Result<Scheduler> {
        Self::with_idle(config, Arc::new(SpinIdle))
    }

    pub fn with_idle<I: Idle>(config: SchedulerConfig, idle: Arc<I>) -> Result<Scheduler> {
        if config.threads == 0 {
            return Err(Error::Config(format!(
                "scheduler `{}` needs at least one thread",
                config.name
            )));
        }

        let mut spawn_count = config.threads;
        let mut root_thread = None;
        let mut thread_ids = Vec::new();
        if config.use_caller {
            assert!(
                Scheduler::current().is_none(),
                "thread already drives a scheduler"
            );
            spawn_count -= 1;
            let tid = thread::current_tid();
            root_thread = Some(tid);
            thread_ids.push(tid);
            Fiber::current();
        }

        let idle_any: Arc<dyn Any + Send + Sync> = idle.clone();
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            stack_size: config.stack_size,
            use_caller: config.use_caller,
            root_thread,
            spawn_count,
            tasks: Mutex::new(VecDeque::new()),
            idle,
            idle_any,
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(thread_ids),
            caller_fiber: Mutex::new(None),
            active: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        });

        if config.use_caller {
            // Weak: the fiber is owned by `shared`.
            let weak = Arc::downgrade(&shared);
            let caller = Fiber::with_config(
                move || {
                    if let Some(shared) = weak.upgrade() {
                        Scheduler { shared }.run();
                    }
                },
                FiberConfig::default()
                    .with_stack_size(config.stack_size)
                    .with_run_in_scheduler(false),
            )?;
            Fiber::set_scheduler_fiber(&caller);
            *shared.caller_fiber.lock() = Some(caller);
            set_current(&shared);
            thread::set_current_name(&config.name);
        }

        tracing::debug!(
            scheduler = %config.name,
            threads = config.threads,
            use_caller = config.use_caller,
            "scheduler created"
        );
        Ok(Scheduler { shared })
    }

    /// The scheduler the calling thread works for, if any.
    #[inline(never)]
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER
            .with(|current| current.borrow().upgrade())
            .map(|shared| Scheduler { shared })
    }

    #[inline(never)]
    fn is_current(&self) -> bool {
        CURRENT_SCHEDULER.with(|current| ptr_eq_weak(&current.borrow(), &self.shared))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Kernel tids of all workers, the caller first when `use_caller`.
    /// Complete once `start` returned.
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.shared.thread_ids.lock().clone()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.shared.idle_threads.load(Ordering::Acquire) > 0
    }

    /// The idle strategy, if it is an `I`.
    pub fn idle_strategy<I: Idle>(&self) -> Option<Arc<I>> {
        self.shared.idle_any.clone().downcast::<I>().ok()
    }

    /// Tasks waiting in the queue.
    pub(crate) fn queued(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Arc::downgrade(&self.shared))
    }

    /// Spawn the worker threads. Calling it again is a no-op; calling it
    /// after `stop` is an error.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.shared.threads.lock();
        if self.shared.stop_requested.load(Ordering::Acquire) {
            return Err(Error::Stopping(self.shared.name.clone()));
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for index in 0..self.shared.spawn_count {
            let scheduler = self.clone();
            let thread = Thread::spawn(format!("{}_{}", self.shared.name, index), move || {
                scheduler.run()
            })?;
            self.shared.thread_ids.lock().push(thread.id());
            threads.push(thread);
        }

        tracing::info!(
            scheduler = %self.shared.name,
            spawned = self.shared.spawn_count,
            use_caller = self.shared.use_caller,
            "scheduler started"
        );
        Ok(())
    }

    /// Queue a callable on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(ScheduleTask::callback(f));
    }

    /// Queue a callable on the worker with kernel tid `thread`.
    pub fn schedule_on<F>(&self, f: F, thread: Tid)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(ScheduleTask::callback(f).pinned(thread));
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(ScheduleTask::fiber(fiber));
    }

    pub fn schedule_task(&self, task: ScheduleTask) {
        let was_empty = {
            let mut tasks = self.shared.tasks.lock();
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    pub fn tickle(&self) {
        self.shared.idle.tickle(self);
    }

    /// Stop requested, nothing queued, nothing running, and the idle
    /// strategy agrees.
    pub fn stopping(&self) -> bool {
        self.base_stopping() && self.shared.idle.stopping(self)
    }

    fn base_stopping(&self) -> bool {
        if !self.shared.stop_requested.load(Ordering::Acquire) {
            return false;
        }
        // `active` is raised under the queue lock, so read it under it too.
        let tasks = self.shared.tasks.lock();
        tasks.is_empty() && self.shared.active.load(Ordering::Acquire) == 0
    }

    /// Drain the queue and join every worker.
    ///
    /// With `use_caller` this must run on the constructing thread, which
    /// works through the queue before returning. Otherwise it must not run
    /// on a worker.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.use_caller {
            assert_eq!(
                Some(thread::current_tid()),
                shared.root_thread,
                "{} must be stopped from the thread that created it",
                shared.name
            );
        } else {
            assert!(
                !self.is_current(),
                "{} stopped from one of its own workers",
                shared.name
            );
        }

        tracing::info!(scheduler = %shared.name, "stopping scheduler");
        shared.stop_requested.store(true, Ordering::Release);

        let spawned = shared.threads.lock().len();
        for _ in 0..spawned {
            self.tickle();
        }

        let caller = shared.caller_fiber.lock().take();
        if let Some(fiber) = caller {
            self.tickle();
            if fiber.state() == FiberState::Ready {
                fiber.resume();
            }
        }

        let threads = mem::take(&mut *shared.threads.lock());
        for worker in threads {
            let name = worker.name().to_string();
            if let Err(err) = worker.join() {
                tracing::warn!(scheduler = %shared.name, thread = %name, error = %err, "worker did not exit cleanly");
            }
        }

        if self.is_current() {
            CURRENT_SCHEDULER.with(|current| *current.borrow_mut() = Weak::new());
        }
        tracing::info!(scheduler = %shared.name, "scheduler stopped");
    }

    fn fiber_config(&self) -> FiberConfig {
        FiberConfig::default().with_stack_size(self.shared.stack_size)
    }

    /// Pop the first task this worker may run. The flag asks for a tickle:
    /// tasks were skipped or are still waiting.
    fn take_task(&self, tid: Tid) -> (Option<ScheduleTask>, bool) {
        let mut tasks = self.shared.tasks.lock();
        let mut tickle_me = false;
        let position = tasks.iter().position(|task| {
            let runnable = task.runnable_on(tid);
            tickle_me |= !runnable;
            runnable
        });

        let task = position.and_then(|index| tasks.remove(index));
        if task.is_some() {
            self.shared.active.fetch_add(1, Ordering::AcqRel);
            tickle_me |= !tasks.is_empty();
        }
        (task, tickle_me)
    }

    /// Worker loop.
    fn run(&self) {
        let tid = thread::current_tid();
        set_current(&self.shared);
        Fiber::current();
        tracing::debug!(scheduler = %self.shared.name, thread = tid, "worker running");

        let idle_fiber = {
            let scheduler = self.clone();
            match Fiber::with_config(move || scheduler.idle_loop(), self.fiber_config()) {
                Ok(fiber) => fiber,
                Err(err) => {
                    tracing::error!(scheduler = %self.shared.name, thread = tid, error = %err, "no idle fiber, worker exiting");
                    return;
                }
            }
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let (task, tickle_me) = self.take_task(tid);
            if tickle_me {
                self.tickle();
            }

            match task.map(|task| task.job) {
                Some(Job::Fiber(fiber)) => {
                    if fiber.state() != FiberState::Term
                        && fiber.switch_in() == Switch::Yielded
                    {
                        self.schedule_fiber(fiber);
                    }
                    self.shared.active.fetch_sub(1, Ordering::AcqRel);
                }
                Some(Job::Callback(callback)) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.reset(callback);
                            fiber
                        }
                        None => match Fiber::with_config(callback, self.fiber_config()) {
                            Ok(fiber) => fiber,
                            Err(err) => {
                                tracing::error!(scheduler = %self.shared.name, error = %err, "dropping callback");
                                self.shared.active.fetch_sub(1, Ordering::AcqRel);
                                continue;
                            }
                        },
                    };

                    match fiber.switch_in() {
                        Switch::Yielded => self.schedule_fiber(fiber),
                        Switch::Held => {}
                        Switch::Terminated => {
                            if Arc::strong_count(&fiber) == 1 {
                                cb_fiber = Some(fiber);
                            }
                        }
                    }
                    self.shared.active.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        break;
                    }
                    self.shared.idle_threads.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.switch_in();
                    self.shared.idle_threads.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        tracing::debug!(scheduler = %self.shared.name, thread = tid, "worker exiting");
        // Peers blocked in `idle` need to see the shutdown too.
        self.tickle();
    }

    fn idle_loop(&self) {
        while !self.stopping() {
            self.shared.idle.idle(self);
            Fiber::yield_current();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.shared.name)
            .field("use_caller", &self.shared.use_caller)
            .field("threads", &self.shared.thread_ids.lock().len())
            .finish()
    }
}

fn set_current(shared: &Arc<Shared>) {
    CURRENT_SCHEDULER.with(|current| *current.borrow_mut() = Arc::downgrade(shared));
}

fn ptr_eq_weak(weak: &Weak<Shared>, shared: &Arc<Shared>) -> bool {
    ptr::eq(weak.as_ptr(), Arc::as_ptr(shared))
}
