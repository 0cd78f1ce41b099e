// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Set programmatically or read from the environment:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `STRAND_THREADS` | Worker threads, including the caller when `use_caller` | 1 |
//! | `STRAND_USE_CALLER` | Run the constructing thread as a worker ("true"/"false") | true |
//! | `STRAND_STACK_SIZE` | Fiber stack size in bytes | 128000 |
//! | `STRAND_NAME` | Scheduler name, used as the worker thread prefix | Scheduler |
//!
//! Invalid values are ignored and the default is kept.

use std::env;

use crate::fiber::DEFAULT_STACK_SIZE;

/// Smallest stack accepted from the environment.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Configuration for a [`Scheduler`](crate::Scheduler) or
/// [`IoManager`](crate::IoManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads. With `use_caller` the constructing thread
    /// is one of them.
    pub threads: usize,
    /// Turn the constructing thread into a worker that runs during `stop()`.
    pub use_caller: bool,
    /// Scheduler name; worker threads are named `{name}_{index}`.
    pub name: String,
    /// Stack size for the fibers the scheduler creates itself.
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            use_caller: true,
            name: "Scheduler".to_string(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by any valid `STRAND_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("STRAND_THREADS") {
            if val > 0 {
                config.threads = val;
            }
        }

        if let Some(val) = parse_env_bool("STRAND_USE_CALLER") {
            config.use_caller = val;
        }

        if let Some(val) = parse_env_usize("STRAND_STACK_SIZE") {
            if val >= MIN_STACK_SIZE {
                config.stack_size = val;
            }
        }

        if let Ok(name) = env::var("STRAND_NAME") {
            if !name.is_empty() {
                config.name = name;
            }
        }

        config
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
}
