// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.
//!
//! Only OS-level failures are errors. Contract violations (resuming a fiber
//! that is not ready, registering the same event twice) are panics.

use std::io;

use thiserror::Error;

/// A runtime failure reported to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate a {size}-byte fiber stack: {source}")]
    StackAlloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("thread `{0}` panicked")]
    ThreadPanicked(String),

    #[error("invalid scheduler config: {0}")]
    Config(String),

    #[error("scheduler `{0}` is stopping")]
    Stopping(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn stack_alloc_keeps_source() {
        let err = Error::StackAlloc {
            size: 4096,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert!(err.to_string().contains("4096-byte"));
        assert!(err.source().is_some());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::from_raw_os_error(libc::EBADF).into();
        assert!(matches!(err, Error::Io(_)));
    }
}
