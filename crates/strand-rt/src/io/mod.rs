// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! I/O-aware scheduler.
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle workers block in epoll.
//! Register a callback (or the calling fiber) for a descriptor's readiness
//! and it is queued once the descriptor is ready. Timers run on the same
//! workers.

mod event;
mod reactor;

pub use event::Event;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::fiber::Fiber;
use crate::scheduler::{Callback, Job, Scheduler};
use crate::timer::Timer;

use reactor::Reactor;

/// Handle to an I/O scheduler. Clones share the same workers and epoll
/// instance.
#[derive(Clone)]
pub struct IoManager {
    scheduler: Scheduler,
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Create the epoll instance and start the workers.
    pub fn new(config: SchedulerConfig) -> Result<IoManager> {
        let reactor = Arc::new(Reactor::new()?);
        let scheduler = Scheduler::with_idle(config, reactor.clone())?;
        scheduler.start()?;
        Ok(IoManager { scheduler, reactor })
    }

    /// The I/O manager the calling worker belongs to, if any.
    pub fn current() -> Option<IoManager> {
        let scheduler = Scheduler::current()?;
        let reactor = scheduler.idle_strategy::<Reactor>()?;
        Some(IoManager { scheduler, reactor })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    /// Wait for pending events and timers, then join the workers.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Register interest in one readiness kind of `fd`.
    ///
    /// When ready, `callback` is queued; without a callback the calling
    /// fiber is, and it should `park` until then. The continuation goes to
    /// the scheduler of the registering thread, or to this one.
    ///
    /// Panics if `event` is already registered for `fd`.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Callback>,
    ) -> io::Result<()> {
        let scheduler = Scheduler::current().unwrap_or_else(|| self.scheduler.clone());
        let job = match callback {
            Some(callback) => Job::Callback(callback),
            None => {
                let fiber = Fiber::current();
                assert!(
                    !fiber.is_root(),
                    "add_event without a callback must be called from a fiber"
                );
                Job::Fiber(fiber)
            }
        };
        self.reactor.add_event(fd, event, job, scheduler.downgrade())
    }

    /// Park the calling fiber until `fd` is ready for `event`.
    pub fn wait_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        self.add_event(fd, event, None)?;
        Fiber::park_current();
        Ok(())
    }

    /// Unregister without running the continuation. `Ok(false)` if the
    /// kind was not registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> io::Result<bool> {
        self.reactor.del_event(fd, event)
    }

    /// Unregister and queue the continuation once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> io::Result<bool> {
        self.reactor.cancel_event(fd, event, &self.scheduler)
    }

    /// Unregister every kind of `fd`, queueing each continuation.
    pub fn cancel_all(&self, fd: RawFd) -> io::Result<bool> {
        self.reactor.cancel_all(fd, &self.scheduler)
    }

    pub fn registered_events(&self, fd: RawFd) -> Event {
        self.reactor.registered_events(fd)
    }

    /// Registered readiness kinds across all descriptors.
    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.timers().add_timer(ms, callback, recurring)
    }

    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + ?Sized + 'static,
    {
        self.reactor
            .timers()
            .add_condition_timer(ms, callback, condition, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.reactor.timers().has_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn workers_see_their_io_manager() {
        let io = IoManager::new(
            SchedulerConfig::default()
                .with_use_caller(false)
                .with_name("io"),
        )
        .unwrap();
        assert!(IoManager::current().is_none());

        let (tx, rx) = mpsc::channel();
        io.schedule(move || {
            let current = IoManager::current().map(|io| io.scheduler().name().to_string());
            tx.send(current).unwrap();
        });
        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen.as_deref(), Some("io"));
        io.stop();
    }

    #[test]
    fn plain_scheduler_is_not_an_io_manager() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(move || tx.send(IoManager::current().is_some()).unwrap());
        scheduler.stop();
        assert!(!rx.recv().unwrap());
    }

    #[test]
    #[should_panic(expected = "must be called from a fiber")]
    fn fiberless_registration_needs_a_fiber() {
        let io = IoManager::new(SchedulerConfig::default().with_use_caller(false)).unwrap();
        let _ = io.add_event(0, Event::READ, None);
    }
}
