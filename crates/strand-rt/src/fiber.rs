// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful fibers.
//!
//! A fiber owns a stack and a saved machine context (a `corosensei`
//! coroutine). `resume` switches into it, `yield_now` switches back to
//! whoever resumed it. Fibers know nothing about scheduling: the scheduler
//! decides what to do with a fiber after each switch from the [`Switch`]
//! outcome.
//!
//! Every thread has an implicit root fiber for its native stack. It is
//! created the first time the thread asks for [`Fiber::current`], lives
//! until the thread exits, and is never resumed.
//!
//! State machine:
//!
//! ```text
//! READY --resume--> RUNNING --yield--> READY
//!                      |
//!                      +--entry returns--> TERM --reset--> READY
//! ```

use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Stack size used when none is configured.
pub const DEFAULT_STACK_SIZE: usize = 128_000;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static LIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);

type Entry = Box<dyn FnOnce() + Send>;
type Context = Coroutine<(), (), (), DefaultStack>;

// Accessors of these are `#[inline(never)]`: a fiber may resume on another
// thread, and a TLS address cached across a switch would still point at the
// old thread's slot.
thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER_FIBER: RefCell<Weak<Fiber>> = RefCell::new(Weak::new());
}

/// Unique fiber identifier, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    Ready = 0,
    Running = 1,
    Term = 2,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

/// Outcome of one switch into a fiber, seen by the resumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Switch {
    /// Yielded and may be resumed again by whoever owns it.
    Yielded,
    /// Parked: another party holds the handle and will reschedule it.
    Held,
    Terminated,
}

/// Fiber creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberConfig {
    /// Stack size in bytes; 0 means [`DEFAULT_STACK_SIZE`].
    pub stack_size: usize,
    /// Whether the fiber is driven by a scheduler worker rather than by
    /// the thread's root fiber. Informational: a fiber always yields back
    /// to whoever resumed it.
    pub run_in_scheduler: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            run_in_scheduler: true,
        }
    }
}

impl FiberConfig {
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_run_in_scheduler(mut self, run_in_scheduler: bool) -> Self {
        self.run_in_scheduler = run_in_scheduler;
        self
    }
}

/// A stackful execution context.
///
/// A fiber run by a multi-threaded scheduler may resume on a different
/// worker after every yield. Its entry must not hold on to thread-local
/// state (a `thread_local!` borrow, a `&T` taken from `LocalKey::with`, a
/// thread-bound lock guard) across `yield_now` or `park`: after the switch
/// it would refer to the previous worker's copy.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Set by `park`, consumed by the resumer after the switch.
    held: AtomicBool,
    root: bool,
    run_in_scheduler: bool,
    stack_size: usize,
    entry: Mutex<Option<Entry>>,
    /// Yielder of the running coroutine, published by the trampoline.
    yielder: AtomicPtr<Yielder<(), ()>>,
    /// Set once the fiber is being dropped, so the trampoline lets the
    /// forced unwind of a suspended stack pass through.
    unwinding: Arc<AtomicBool>,
    context: UnsafeCell<Option<Context>>,
}

// SAFETY: `context` is only touched by the thread that won the
// READY -> RUNNING transition in `switch_in`, or the TERM -> RUNNING
// transition in `reset`, so a stack never runs on two threads at once.
// Everything else is atomic or behind a mutex.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size.
    pub fn new<F>(entry: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_config(entry, FiberConfig::default())
    }

    pub fn with_config<F>(entry: F, config: FiberConfig) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if config.stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            config.stack_size
        };
        let stack = DefaultStack::new(stack_size).map_err(|source| Error::StackAlloc {
            size: stack_size,
            source,
        })?;

        let unwinding = Arc::new(AtomicBool::new(false));
        let context = Self::context_on(stack, unwinding.clone());

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            held: AtomicBool::new(false),
            root: false,
            run_in_scheduler: config.run_in_scheduler,
            stack_size,
            entry: Mutex::new(Some(Box::new(entry))),
            yielder: AtomicPtr::new(ptr::null_mut()),
            unwinding,
            context: UnsafeCell::new(Some(context)),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fiber = %fiber.id, stack_size, "fiber created");
        Ok(fiber)
    }

    fn root() -> Fiber {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            held: AtomicBool::new(false),
            root: true,
            run_in_scheduler: false,
            stack_size: 0,
            entry: Mutex::new(None),
            yielder: AtomicPtr::new(ptr::null_mut()),
            unwinding: Arc::new(AtomicBool::new(false)),
            context: UnsafeCell::new(None),
        }
    }

    fn context_on(stack: DefaultStack, unwinding: Arc<AtomicBool>) -> Context {
        Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, ()| {
            trampoline(yielder, &unwinding)
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn runs_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Whether this is a thread's root fiber.
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Switch into the fiber and run it until it yields or terminates.
    ///
    /// Panics unless the fiber is READY.
    pub fn resume(self: &Arc<Self>) {
        self.switch_in();
    }

    pub(crate) fn switch_in(self: &Arc<Self>) -> Switch {
        let claimed = self
            .state
            .compare_exchange(
                FiberState::Ready as u8,
                FiberState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        assert!(claimed, "{} resumed while {:?}", self.id, self.state());

        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));

        // SAFETY: winning the READY -> RUNNING transition gives this thread
        // exclusive use of the context until the state is published again.
        let outcome = unsafe { (*self.context.get()).as_mut().map(|ctx| ctx.resume(())) };

        let this = CURRENT.with(|current| current.replace(previous));
        drop(this);

        match outcome {
            Some(CoroutineResult::Yield(())) => {
                let held = self.held.swap(false, Ordering::AcqRel);
                // Only now are the fiber's registers saved.
                self.state.store(FiberState::Ready as u8, Ordering::Release);
                if held {
                    Switch::Held
                } else {
                    Switch::Yielded
                }
            }
            Some(CoroutineResult::Return(())) | None => {
                self.state.store(FiberState::Term as u8, Ordering::Release);
                Switch::Terminated
            }
        }
    }

    /// Switch back to whoever resumed this fiber.
    ///
    /// Must be called from inside the fiber itself.
    #[inline(never)]
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Running | FiberState::Term),
            "{} yielded while {:?}",
            self.id,
            state
        );
        assert!(self.is_current(), "{} yielded from outside itself", self.id);

        let yielder = self.yielder.load(Ordering::Acquire);
        assert!(!yielder.is_null(), "{} has no context to yield from", self.id);

        // SAFETY: the yielder lives in the bottom frame of this fiber's
        // stack, which is the stack we are running on.
        unsafe { (*yielder).suspend(()) };
    }

    /// Yield without asking to be re-queued: whoever holds the handle
    /// (an I/O registration, a timer) reschedules the fiber.
    pub fn park(&self) {
        self.held.store(true, Ordering::Release);
        self.yield_now();
    }

    /// Yield the calling fiber.
    #[inline(never)]
    pub fn yield_current() {
        // SAFETY: see `with_current_ptr`.
        Self::with_current_ptr(|fiber| unsafe { (*fiber).yield_now() })
    }

    /// Park the calling fiber.
    #[inline(never)]
    pub fn park_current() {
        // SAFETY: see `with_current_ptr`.
        Self::with_current_ptr(|fiber| unsafe { (*fiber).park() })
    }

    /// Run `f` on the current fiber without holding a strong reference on
    /// its own stack across the switch. A fiber that kept an `Arc` to
    /// itself while suspended could never be freed.
    ///
    /// The pointer stays valid because the resumer owns an `Arc` for as
    /// long as the fiber runs.
    fn with_current_ptr<R>(f: impl FnOnce(*const Fiber) -> R) -> R {
        let fiber = Fiber::current();
        let ptr = Arc::as_ptr(&fiber);
        drop(fiber);
        f(ptr)
    }

    /// Recycle a terminated fiber's stack for a new entry.
    ///
    /// Panics unless the fiber is TERM and owns a stack.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Claim the fiber: a concurrent reset or resume loses this race.
        let claimed = self
            .state
            .compare_exchange(
                FiberState::Term as u8,
                FiberState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        assert!(
            claimed,
            "{} reset before it terminated ({:?})",
            self.id,
            self.state()
        );

        // SAFETY: winning the TERM -> RUNNING transition gives this thread
        // exclusive use of the context until READY is published.
        let slot = unsafe { &mut *self.context.get() };
        let stack = match slot.take() {
            Some(finished) => finished.into_stack(),
            None => {
                self.state.store(FiberState::Term as u8, Ordering::Release);
                panic!("{} owns no stack", self.id);
            }
        };
        *slot = Some(Self::context_on(stack, self.unwinding.clone()));

        *self.entry.lock() = Some(Box::new(entry));
        self.yielder.store(ptr::null_mut(), Ordering::Release);
        self.state.store(FiberState::Ready as u8, Ordering::Release);
        tracing::trace!(fiber = %self.id, "fiber reset");
    }

    /// The fiber running on this thread, creating the root fiber on first
    /// use.
    #[inline(never)]
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = CURRENT.with(|current| current.borrow().clone()) {
            return fiber;
        }

        let root = Arc::new(Fiber::root());
        CURRENT.with(|current| *current.borrow_mut() = Some(root.clone()));
        ROOT.with(|slot| *slot.borrow_mut() = Some(root.clone()));
        SCHEDULER_FIBER.with(|slot| *slot.borrow_mut() = Arc::downgrade(&root));
        root
    }

    /// Id of the running fiber, or `None` if this thread never touched one.
    #[inline(never)]
    pub fn current_id() -> Option<FiberId> {
        CURRENT.with(|current| current.borrow().as_ref().map(|fiber| fiber.id))
    }

    #[inline(never)]
    fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|fiber| ptr::eq(Arc::as_ptr(fiber), self))
        })
    }

    /// Record the fiber that drives scheduling on this thread.
    #[inline(never)]
    pub fn set_scheduler_fiber(fiber: &Arc<Fiber>) {
        SCHEDULER_FIBER.with(|slot| *slot.borrow_mut() = Arc::downgrade(fiber));
    }

    #[inline(never)]
    pub fn scheduler_fiber() -> Option<Arc<Fiber>> {
        SCHEDULER_FIBER.with(|slot| slot.borrow().upgrade())
    }

    /// Number of live fibers in the process, root fibers included.
    pub fn total_fibers() -> usize {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("root", &self.root)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // The context field drops after this, unwinding a suspended stack.
        self.unwinding.store(true, Ordering::Release);
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(fiber = %self.id, "fiber dropped");
    }
}

/// Bottom frame of every fiber stack.
fn trampoline(yielder: &Yielder<(), ()>, unwinding: &AtomicBool) {
    let fiber = Fiber::current();
    fiber
        .yielder
        .store(yielder as *const _ as *mut _, Ordering::Release);
    let entry = fiber.entry.lock().take();
    let id = fiber.id;
    drop(fiber);

    let Some(entry) = entry else {
        return;
    };

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
        if unwinding.load(Ordering::Acquire) {
            panic::resume_unwind(payload);
        }
        tracing::error!(fiber = %id, "fiber entry panicked: {}", panic_message(&*payload));
    }
    // Returning completes the coroutine; the resumer marks it TERM.
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_to_completion_and_releases_entry() {
        let token = Arc::new(());
        let runs = Arc::new(AtomicUsize::new(0));

        let fiber = {
            let token = token.clone();
            let runs = runs.clone();
            Fiber::new(move || {
                let _keep = token;
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(Arc::strong_count(&token), 2);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    #[should_panic(expected = "resumed while Term")]
    fn terminated_fiber_cannot_resume() {
        let fiber = Fiber::new(|| {}).unwrap();
        fiber.resume();
        fiber.resume();
    }

    #[test]
    fn yield_leaves_ready_and_resume_continues() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let fiber = {
            let steps = steps.clone();
            Fiber::new(move || {
                steps.lock().push(1);
                Fiber::yield_current();
                steps.lock().push(2);
                Fiber::yield_current();
                steps.lock().push(3);
            })
            .unwrap()
        };

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(*steps.lock(), vec![1]);

        fiber.resume();
        assert_eq!(*steps.lock(), vec![1, 2]);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*steps.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn switch_reports_park() {
        let fiber = Fiber::new(Fiber::park_current).unwrap();
        assert_eq!(fiber.switch_in(), Switch::Held);
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.switch_in(), Switch::Terminated);
    }

    #[test]
    fn reset_reuses_terminated_fiber() {
        let runs = Arc::new(AtomicUsize::new(0));
        let fiber = {
            let runs = runs.clone();
            Fiber::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        let id = fiber.id();
        fiber.resume();

        let again = runs.clone();
        fiber.reset(move || {
            again.fetch_add(10, Ordering::SeqCst);
            Fiber::yield_current();
            again.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.id(), id);

        fiber.resume();
        assert_eq!(runs.load(Ordering::SeqCst), 11);
        fiber.resume();
        assert_eq!(runs.load(Ordering::SeqCst), 111);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    #[should_panic(expected = "reset before it terminated")]
    fn reset_requires_term() {
        let fiber = Fiber::new(|| {}).unwrap();
        fiber.reset(|| {});
    }

    #[test]
    #[should_panic(expected = "reset before it terminated (Running)")]
    fn reset_rejects_fiber_already_being_reset() {
        let fiber = Fiber::new(|| {}).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        // Another holder has claimed the fiber and is mid-reset.
        fiber
            .state
            .store(FiberState::Running as u8, Ordering::Release);
        fiber.reset(|| {});
    }

    #[test]
    fn concurrent_resets_claim_the_fiber_once() {
        let fiber = Fiber::new(|| {}).unwrap();
        fiber.resume();

        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fiber = fiber.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    let won = panic::catch_unwind(AssertUnwindSafe(|| fiber.reset(|| {})));
                    if won.is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);
    }

    #[test]
    fn current_tracks_the_running_fiber() {
        let root = Fiber::current();
        assert!(root.is_root());
        assert_eq!(root.state(), FiberState::Running);
        assert_eq!(Fiber::current_id(), Some(root.id()));
        assert_eq!(Fiber::scheduler_fiber().map(|f| f.id()), Some(root.id()));

        let seen = Arc::new(Mutex::new(None));
        let fiber = {
            let seen = seen.clone();
            Fiber::new(move || {
                *seen.lock() = Fiber::current_id();
            })
            .unwrap()
        };
        fiber.resume();

        assert_eq!(*seen.lock(), Some(fiber.id()));
        assert_eq!(Fiber::current_id(), Some(root.id()));
    }

    #[test]
    fn yield_returns_to_the_resumer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = {
            let log = log.clone();
            Fiber::new(move || {
                log.lock().push("inner start");
                Fiber::yield_current();
                log.lock().push("inner end");
            })
            .unwrap()
        };
        let outer = {
            let log = log.clone();
            let inner = inner.clone();
            Fiber::new(move || {
                inner.resume();
                log.lock().push("outer after inner yield");
                inner.resume();
                log.lock().push("outer end");
            })
            .unwrap()
        };

        outer.resume();
        assert_eq!(outer.state(), FiberState::Term);
        assert_eq!(inner.state(), FiberState::Term);
        assert_eq!(
            *log.lock(),
            vec![
                "inner start",
                "outer after inner yield",
                "inner end",
                "outer end"
            ]
        );
    }

    #[test]
    fn panicking_entry_still_terminates() {
        let fiber = Fiber::new(|| panic!("entry failed")).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn dropping_suspended_fiber_unwinds_its_stack() {
        struct Guard(Arc<AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let fiber = {
            let dropped = dropped.clone();
            Fiber::new(move || {
                let _guard = Guard(dropped);
                Fiber::yield_current();
                unreachable!("fiber was never resumed");
            })
            .unwrap()
        };

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert!(!dropped.load(Ordering::SeqCst));

        drop(fiber);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn custom_stack_size() {
        let fiber =
            Fiber::with_config(|| {}, FiberConfig::default().with_stack_size(64 * 1024)).unwrap();
        assert_eq!(fiber.stack_size(), 64 * 1024);
        assert!(fiber.runs_in_scheduler());

        let fallback = Fiber::with_config(|| {}, FiberConfig::default().with_stack_size(0)).unwrap();
        assert_eq!(fallback.stack_size(), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn fiber_id_display() {
        assert_eq!(FiberId(7).to_string(), "Fiber(7)");
    }
}
