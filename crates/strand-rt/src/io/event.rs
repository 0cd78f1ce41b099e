// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness kinds a descriptor can be registered for.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Bitmask of readiness kinds. Values match the epoll flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Event) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }

    /// Readiness reported by epoll, narrowed to READ/WRITE. Errors and
    /// hangups count as every direction in `registered`.
    pub(crate) fn from_epoll(events: u32, registered: Event) -> Event {
        let mut ready = Event(events & (Event::READ.0 | Event::WRITE.0));
        if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            ready |= registered;
        }
        ready & registered
    }
}

impl BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;

    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;

    fn not(self) -> Event {
        Event(!self.0 & (Event::READ.0 | Event::WRITE.0))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ | WRITE"),
        }
    }
}
