// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Named OS threads that know their kernel thread id.
//!
//! `Thread::spawn` blocks on a [`Semaphore`] until the new thread has
//! recorded its tid, so `id()` is valid as soon as `spawn` returns.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self as std_thread, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Kernel thread id (`gettid`).
pub type Tid = libc::pid_t;

thread_local! {
    static TID: Cell<Tid> = const { Cell::new(0) };
    static NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Kernel thread id of the calling thread. Cached after the first call.
#[inline(never)]
pub fn current_tid() -> Tid {
    TID.with(|tid| {
        if tid.get() == 0 {
            tid.set(unsafe { libc::syscall(libc::SYS_gettid) } as Tid);
        }
        tid.get()
    })
}

/// Name of the calling thread: the last `set_current_name`, else the std
/// thread name, else `"UNKNOWN"`.
#[inline(never)]
pub fn current_name() -> String {
    NAME.with(|name| {
        name.borrow().clone().unwrap_or_else(|| {
            std_thread::current()
                .name()
                .unwrap_or("UNKNOWN")
                .to_string()
        })
    })
}

/// Rename the calling thread. The kernel name is truncated to 15 bytes.
#[inline(never)]
pub fn set_current_name(name: &str) {
    let kernel: String = name.chars().take(15).collect();
    if let Ok(cname) = CString::new(kernel) {
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
        }
    }
    NAME.with(|slot| *slot.borrow_mut() = Some(name.to_string()));
}

/// Counting semaphore.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Increment the count and wake one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}

/// Handle to a spawned OS thread. Dropping it detaches the thread.
pub struct Thread {
    id: Tid,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn a named thread and wait until it has started.
    pub fn spawn<F>(name: impl Into<String>, entry: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let started = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(0));

        let handle = {
            let started = started.clone();
            let tid = tid.clone();
            let thread_name = name.clone();
            std_thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    tid.store(current_tid(), Ordering::Release);
                    set_current_name(&thread_name);
                    started.signal();
                    entry();
                })
                .map_err(|source| Error::Spawn {
                    name: name.clone(),
                    source,
                })?
        };

        started.wait();
        let id = tid.load(Ordering::Acquire);
        tracing::debug!(thread = id, name = %name, "thread started");

        Ok(Thread {
            id,
            name,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> Tid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::ThreadPanicked(self.name.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn tid_is_stable_and_distinct() {
        let main = current_tid();
        assert!(main > 0);
        assert_eq!(main, current_tid());

        let other = std_thread::spawn(current_tid).join().unwrap();
        assert_ne!(main, other);
    }

    #[test]
    fn spawn_reports_id_and_name() {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = Thread::spawn("worker_7", move || {
            tx.send((current_tid(), current_name())).unwrap();
        })
        .unwrap();

        let id = thread.id();
        assert!(id > 0);
        assert_eq!(thread.name(), "worker_7");

        let (seen_tid, seen_name) = rx.recv().unwrap();
        assert_eq!(seen_tid, id);
        assert_eq!(seen_name, "worker_7");
        thread.join().unwrap();
    }

    #[test]
    fn join_reports_panic() {
        let thread = Thread::spawn("doomed", || panic!("boom")).unwrap();
        match thread.join() {
            Err(Error::ThreadPanicked(name)) => assert_eq!(name, "doomed"),
            other => panic!("expected ThreadPanicked, got {:?}", other),
        }
    }

    #[test]
    fn semaphore_blocks_until_signalled() {
        let sem = Arc::new(Semaphore::new(0));
        let passed = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let sem = sem.clone();
            let passed = passed.clone();
            std_thread::spawn(move || {
                sem.wait();
                passed.fetch_add(1, Ordering::SeqCst);
            })
        };

        std_thread::sleep(Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        sem.signal();
        waiter.join().unwrap();
        assert_eq!(passed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn semaphore_initial_count() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.signal();
        sem.wait();
    }
}
