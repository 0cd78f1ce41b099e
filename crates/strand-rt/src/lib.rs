// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: stackful fibers on an N:M scheduler.
//!
//! Components, leaves first:
//! - thread: named OS threads with kernel tids, startup semaphore
//! - fiber: stackful coroutines with resume/yield/reset
//! - timer: deadline-ordered one-shot, recurring and condition timers
//! - scheduler: worker pool draining a FIFO of fibers and callables
//! - io: epoll-backed scheduler that wakes fibers on readiness and timers

pub mod config;
pub mod error;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberConfig, FiberId, FiberState};
pub use io::{Event, IoManager};
pub use scheduler::{Idle, ScheduleTask, Scheduler, SpinIdle};
pub use thread::{Semaphore, Thread, Tid};
pub use timer::{Timer, TimerManager};
