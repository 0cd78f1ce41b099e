// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Epoll reactor, the idle strategy behind [`IoManager`](super::IoManager).
//!
//! Descriptors are registered edge-triggered with one continuation per
//! readiness kind. A kind fires once: it is removed from the registration
//! before its continuation is scheduled, and must be re-added to fire
//! again.
//!
//! Workers with nothing to run block in `epoll_wait` until a descriptor is
//! ready, the next timer is due, or the wake pipe is written. The pipe is
//! level-triggered and is only drained while the scheduler is not
//! stopping, so a byte left in it at shutdown releases every blocked
//! worker.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::event::Event;
use crate::scheduler::{Idle, Job, ScheduleTask, Scheduler, WeakScheduler};
use crate::timer::TimerManager;

const MAX_EVENTS: usize = 256;
/// Longest single wait, so a worker re-checks shutdown even if nobody
/// tickles it.
const MAX_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_CONTEXTS: usize = 32;

/// Self-pipe used to interrupt `epoll_wait`.
struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    fn notify(&self) {
        let byte = b'T';
        // A full pipe is already readable.
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    /// Read until empty. Returns whether anything was pending.
    fn drain(&self) -> bool {
        let mut buf = [0u8; 256];
        let mut drained = false;
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                return drained;
            }
            drained = true;
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// A continuation detached from its registration, ready to be queued.
struct Fired {
    scheduler: Option<WeakScheduler>,
    job: Job,
}

impl Fired {
    /// Queue on the registering scheduler, or on `fallback` if it is gone.
    fn dispatch(self, fallback: &Scheduler) {
        let task = ScheduleTask {
            job: self.job,
            thread: None,
        };
        match self.scheduler.and_then(|weak| weak.upgrade()) {
            Some(scheduler) => scheduler.schedule_task(task),
            None => fallback.schedule_task(task),
        }
    }
}

/// Continuation for one readiness kind. Populated only while the kind is
/// registered.
#[derive(Default)]
struct EventContext {
    scheduler: Option<WeakScheduler>,
    job: Option<Job>,
}

#[derive(Default)]
struct FdState {
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Clear `event` from the mask and detach its continuation.
    fn take(&mut self, event: Event) -> Option<Fired> {
        self.events = self.events & !event;
        let slot = self.slot(event);
        let scheduler = slot.scheduler.take();
        slot.job.take().map(|job| Fired { scheduler, job })
    }
}

#[derive(Default)]
struct FdContext {
    state: Mutex<FdState>,
}

impl std::fmt::Debug for FdContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdContext").finish_non_exhaustive()
    }
}

pub(crate) struct Reactor {
    epfd: RawFd,
    wake: Arc<WakePipe>,
    /// Registered kinds across all descriptors.
    pending: AtomicUsize,
    /// Indexed by fd; grown on demand.
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    timers: TimerManager,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = match WakePipe::new() {
            Ok(wake) => Arc::new(wake),
            Err(err) => {
                unsafe { libc::close(epfd) };
                return Err(err);
            }
        };

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake.read_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake.read_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        // A timer that becomes the earliest deadline must cut the current
        // wait short.
        let timers = {
            let wake = wake.clone();
            TimerManager::new(move || wake.notify())
        };

        Ok(Self {
            epfd,
            wake,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(vec![None; INITIAL_CONTEXTS]),
            timers,
        })
    }

    pub(crate) fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn registered_events(&self, fd: RawFd) -> Event {
        self.fd_context(fd)
            .map_or(Event::NONE, |ctx| ctx.state.lock().events)
    }

    fn fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        self.contexts.read().get(index).and_then(|slot| slot.clone())
    }

    fn fd_context_or_insert(&self, fd: RawFd) -> io::Result<Arc<FdContext>> {
        let index =
            usize::try_from(fd).map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;
        if let Some(ctx) = self.contexts.read().get(index).and_then(|slot| slot.clone()) {
            return Ok(ctx);
        }

        let mut contexts = self.contexts.write();
        if index >= contexts.len() {
            contexts.resize((index * 3 / 2).max(index + 1), None);
        }
        Ok(contexts[index].get_or_insert_with(Default::default).clone())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register `left` for `fd`, or remove `fd` if nothing is left.
    fn rearm(&self, fd: RawFd, left: Event) -> io::Result<()> {
        if !left.is_empty() {
            return self.ctl(libc::EPOLL_CTL_MOD, fd, left);
        }
        match self.ctl(libc::EPOLL_CTL_DEL, fd, Event::NONE) {
            // Already closed or never added: nothing to remove.
            Err(err)
                if err.raw_os_error() == Some(libc::ENOENT)
                    || err.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        job: Job,
        scheduler: WeakScheduler,
    ) -> io::Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "register READ or WRITE one at a time, got {:?}",
            event
        );
        let ctx = self.fd_context_or_insert(fd)?;
        let mut state = ctx.state.lock();
        assert!(
            !state.events.contains(event),
            "fd {} already registered for {:?}",
            fd,
            event
        );

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(err) = self.ctl(op, fd, state.events | event) {
            tracing::error!(fd, ?event, error = %err, "epoll_ctl failed to register");
            return Err(err);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.events |= event;
        *state.slot(event) = EventContext {
            scheduler: Some(scheduler),
            job: Some(job),
        };
        tracing::trace!(fd, ?event, "event registered");
        Ok(())
    }

    pub(crate) fn del_event(&self, fd: RawFd, event: Event) -> io::Result<bool> {
        let Some(ctx) = self.fd_context(fd) else {
            return Ok(false);
        };
        let detached = {
            let mut state = ctx.state.lock();
            if !state.events.contains(event) {
                return Ok(false);
            }
            self.rearm(fd, state.events & !event)?;
            self.pending.fetch_sub(1, Ordering::AcqRel);
            state.take(event)
        };
        // Dropped outside the fd lock: a parked fiber unwinds here.
        drop(detached);
        Ok(true)
    }

    pub(crate) fn cancel_event(
        &self,
        fd: RawFd,
        event: Event,
        fallback: &Scheduler,
    ) -> io::Result<bool> {
        let Some(ctx) = self.fd_context(fd) else {
            return Ok(false);
        };
        let fired = {
            let mut state = ctx.state.lock();
            if !state.events.contains(event) {
                return Ok(false);
            }
            self.rearm(fd, state.events & !event)?;
            self.pending.fetch_sub(1, Ordering::AcqRel);
            state.take(event)
        };
        if let Some(fired) = fired {
            fired.dispatch(fallback);
        }
        Ok(true)
    }

    pub(crate) fn cancel_all(&self, fd: RawFd, fallback: &Scheduler) -> io::Result<bool> {
        let Some(ctx) = self.fd_context(fd) else {
            return Ok(false);
        };
        let fired = {
            let mut state = ctx.state.lock();
            if state.events.is_empty() {
                return Ok(false);
            }
            self.rearm(fd, Event::NONE)?;

            let mut fired = Vec::with_capacity(2);
            for event in [Event::READ, Event::WRITE] {
                if state.events.contains(event) {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    fired.extend(state.take(event));
                }
            }
            fired
        };
        for fired in fired {
            fired.dispatch(fallback);
        }
        Ok(true)
    }

    /// Detach every registered kind that `raw` reports ready and re-arm the
    /// rest.
    fn collect_ready(&self, fd: RawFd, raw: u32, fired: &mut Vec<Fired>) {
        let Some(ctx) = self.fd_context(fd) else {
            return;
        };
        let mut state = ctx.state.lock();
        let ready = Event::from_epoll(raw, state.events);
        if ready.is_empty() {
            return;
        }

        // The ready kinds are consumed either way: an edge that was reported
        // will not be reported again.
        if let Err(err) = self.rearm(fd, state.events & !ready) {
            tracing::error!(fd, ?ready, error = %err, "failed to re-arm descriptor");
        }
        for event in [Event::READ, Event::WRITE] {
            if ready.contains(event) {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                fired.extend(state.take(event));
            }
        }
        tracing::trace!(fd, ?ready, "descriptor ready");
    }
}

impl Idle for Reactor {
    fn idle(&self, scheduler: &Scheduler) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout = self
            .timers
            .next_timeout()
            .map_or(MAX_TIMEOUT, |next| next.min(MAX_TIMEOUT));
        let timeout_ms = timeout_millis(timeout);

        let ready = loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!(error = %err, "epoll_wait failed");
                break 0;
            }
        };

        let mut fired = Vec::new();
        for ev in &events[..ready] {
            let fd = ev.u64 as RawFd;
            let raw = ev.events;
            if fd == self.wake.read_fd {
                if !scheduler.stopping() {
                    self.wake.drain();
                }
                continue;
            }
            self.collect_ready(fd, raw, &mut fired);
        }
        for fired in fired {
            fired.dispatch(scheduler);
        }

        for callback in self.timers.list_expired() {
            scheduler.schedule(move || callback());
        }
    }

    fn tickle(&self, _scheduler: &Scheduler) {
        self.wake.notify();
    }

    fn stopping(&self, _scheduler: &Scheduler) -> bool {
        self.pending_events() == 0 && !self.timers.has_timer()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

/// Round up so a wait never ends just before its deadline.
fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_nanos().div_ceil(1_000_000) as i32
}
