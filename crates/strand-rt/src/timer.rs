// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline-ordered timers.
//!
//! The manager keeps timers sorted by `(deadline, id)`. Its owner polls it:
//! `next_timeout` says how long it may block, `list_expired` hands back the
//! callbacks that are due. When an insert becomes the earliest deadline the
//! manager calls its front hook so a blocked owner can wake up and shorten
//! its wait. The hook fires once and is re-armed by the next
//! `next_timeout` call.
//!
//! Lock order: the queue lock, then a timer's slot lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

type TimerKey = (Instant, u64);

/// A scheduled callback. Cancel, refresh or reset it through the handle
/// returned by [`TimerManager::add_timer`].
pub struct Timer {
    id: u64,
    recurring: bool,
    manager: Weak<TimerShared>,
    slot: Mutex<TimerSlot>,
}

struct TimerSlot {
    period: Duration,
    deadline: Instant,
    /// `None` once cancelled or, for one-shot timers, fired.
    callback: Option<TimerCallback>,
}

struct TimerShared {
    queue: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    /// Front hook already fired and not yet re-armed.
    tickled: AtomicBool,
    on_front: Box<dyn Fn() + Send + Sync>,
}

impl Timer {
    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    pub fn period(&self) -> Duration {
        self.slot.lock().period
    }

    /// Remove the timer. Returns `false` if it already fired or was
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut queue = shared.queue.write();
        let mut slot = self.slot.lock();
        if slot.callback.take().is_none() {
            return false;
        }
        queue.remove(&(slot.deadline, self.id));
        true
    }

    /// Push the deadline to now + period.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut queue = shared.queue.write();
        let mut slot = self.slot.lock();
        if slot.callback.is_none() {
            return false;
        }
        let Some(this) = queue.remove(&(slot.deadline, self.id)) else {
            return false;
        };
        slot.deadline = Instant::now() + slot.period;
        queue.insert((slot.deadline, self.id), this);
        true
    }

    /// Change the period. With `from_now` the new period counts from now,
    /// otherwise from the original start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let period = Duration::from_millis(ms);
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let at_front = {
            let mut queue = shared.queue.write();
            let mut slot = self.slot.lock();
            if slot.callback.is_none() {
                return false;
            }
            if slot.period == period && !from_now {
                return true;
            }
            let Some(this) = queue.remove(&(slot.deadline, self.id)) else {
                return false;
            };

            let start = if from_now {
                Instant::now()
            } else {
                slot.deadline - slot.period
            };
            slot.period = period;
            slot.deadline = start + period;
            let key = (slot.deadline, self.id);
            drop(slot);
            shared.insert_locked(&mut queue, key, this)
        };

        if at_front {
            (shared.on_front)();
        }
        true
    }
}

impl TimerShared {
    /// Insert under the held queue lock. Returns whether the front hook
    /// should fire once the lock is released.
    fn insert_locked(
        &self,
        queue: &mut BTreeMap<TimerKey, Arc<Timer>>,
        key: TimerKey,
        timer: Arc<Timer>,
    ) -> bool {
        queue.insert(key, timer);
        let at_front = queue.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }
}

/// Ordered set of timers with a front-insertion hook.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new(|| {})
    }
}

impl TimerManager {
    /// `on_front` runs, outside any lock, when a new timer becomes the
    /// earliest deadline.
    pub fn new<F>(on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(TimerShared {
                queue: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                on_front: Box::new(on_front),
            }),
        }
    }

    /// Run `callback` after `ms` milliseconds, and every `ms` after that if
    /// `recurring`.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(ms, Arc::new(callback), recurring)
    }

    /// Like `add_timer`, but the callback is skipped once `condition` can
    /// no longer be upgraded.
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
        self.add_timer(
            ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    fn add_callback(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        let period = Duration::from_millis(ms);
        let deadline = Instant::now() + period;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            manager: Arc::downgrade(&self.shared),
            slot: Mutex::new(TimerSlot {
                period,
                deadline,
                callback: Some(callback),
            }),
        });

        let at_front = {
            let mut queue = self.shared.queue.write();
            self.shared
                .insert_locked(&mut queue, (deadline, timer.id), timer.clone())
        };
        if at_front {
            (self.shared.on_front)();
        }
        timer
    }

    /// Time until the earliest deadline, zero if it already passed, `None`
    /// with no timers. Re-arms the front hook.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.shared.tickled.store(false, Ordering::Release);
        let queue = self.shared.queue.read();
        queue
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    /// Remove every due timer and return its callback. Recurring timers are
    /// re-inserted one period from now.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let mut queue = self.shared.queue.write();
        if queue.keys().next().map_or(true, |(deadline, _)| *deadline > now) {
            return expired;
        }

        // Everything strictly before (now, MAX) is due.
        let later = queue.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut *queue, later);

        for (_, timer) in due {
            let mut slot = timer.slot.lock();
            let Some(callback) = slot.callback.clone() else {
                continue;
            };
            expired.push(callback);
            if timer.recurring {
                slot.deadline = now + slot.period;
                let key = (slot.deadline, timer.id);
                drop(slot);
                queue.insert(key, timer);
            } else {
                slot.callback = None;
            }
        }
        expired
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.queue.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inc = {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, inc)
    }

    #[test]
    fn empty_manager() {
        let timers = TimerManager::default();
        assert!(!timers.has_timer());
        assert_eq!(timers.next_timeout(), None);
        assert!(timers.list_expired().is_empty());
    }

    #[test]
    fn one_shot_fires_once() {
        let timers = TimerManager::default();
        let (count, inc) = counter();
        let timer = timers.add_timer(0, inc, false);
        assert!(timers.has_timer());
        assert_eq!(timers.next_timeout(), Some(Duration::ZERO));

        let due = timers.list_expired();
        assert_eq!(due.len(), 1);
        due.iter().for_each(|cb| cb());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(!timers.has_timer());
        assert!(!timer.cancel());
    }

    #[test]
    fn future_timer_is_not_due() {
        let timers = TimerManager::default();
        timers.add_timer(10_000, || {}, false);
        assert!(timers.list_expired().is_empty());
        let wait = timers.next_timeout().unwrap();
        assert!(wait > Duration::from_secs(9));
    }

    #[test]
    fn recurring_is_reinserted() {
        let timers = TimerManager::default();
        let (count, inc) = counter();
        let timer = timers.add_timer(1, inc, true);
        assert!(timer.is_recurring());

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(3));
            for cb in timers.list_expired() {
                cb();
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(timers.has_timer());

        assert!(timer.cancel());
        assert!(!timers.has_timer());
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let timers = TimerManager::default();
        let timer = timers.add_timer(0, || {}, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(timers.list_expired().is_empty());
    }

    #[test]
    fn expired_in_deadline_order() {
        let timers = TimerManager::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(2u64, "b"), (1, "a"), (3, "c")] {
            let order = order.clone();
            timers.add_timer(ms, move || order.lock().push(tag), false);
        }
        thread::sleep(Duration::from_millis(10));
        for cb in timers.list_expired() {
            cb();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn refresh_and_reset_move_deadline() {
        let timers = TimerManager::default();
        let timer = timers.add_timer(0, || {}, false);
        timer.reset(10_000, true);
        assert_eq!(timer.period(), Duration::from_secs(10));
        assert!(timers.list_expired().is_empty());

        assert!(timer.reset(0, true));
        assert_eq!(timers.list_expired().len(), 1);

        // Fired one-shot timers cannot be refreshed.
        assert!(!timer.refresh());
    }

    #[test]
    fn refresh_pushes_deadline() {
        let timers = TimerManager::default();
        let timer = timers.add_timer(50, || {}, false);
        thread::sleep(Duration::from_millis(30));
        assert!(timer.refresh());
        let wait = timers.next_timeout().unwrap();
        assert!(wait > Duration::from_millis(30));
    }

    #[test]
    fn condition_timer_skips_dropped_owner() {
        let timers = TimerManager::default();
        let (count, inc) = counter();
        let owner = Arc::new(());
        timers.add_condition_timer(0, inc, Arc::downgrade(&owner), false);
        drop(owner);

        for cb in timers.list_expired() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn condition_timer_runs_while_owner_lives() {
        let timers = TimerManager::default();
        let (count, inc) = counter();
        let owner = Arc::new(5u32);
        timers.add_condition_timer(0, inc, Arc::downgrade(&owner), false);

        for cb in timers.list_expired() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn front_hook_fires_once_until_rearmed() {
        let (fronts, hook) = counter();
        let timers = TimerManager::new(hook);

        timers.add_timer(1_000, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 1);

        // Earlier, but the hook has not been re-armed.
        timers.add_timer(500, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 1);

        timers.next_timeout();
        timers.add_timer(100, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 2);

        // Not at the front.
        timers.next_timeout();
        timers.add_timer(2_000, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 2);
    }
}
