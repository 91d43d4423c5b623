//! Virtual clock, deferred tasks and timers.
//!
//! The runtime is single-threaded and cooperative. Nothing here touches the
//! wall clock: time only moves when the embedder calls
//! `Kernel::advance_ms`, which drains due timers in deadline order. Program
//! callbacks never run while a kernel borrow is held; they are queued as
//! deferred tasks and executed from the top-level pump with a fresh
//! capability gate.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use vos_ipc::Pid;

use crate::gate::{IntervalFn, TimerFn, WaitFn};
use crate::kernel::Kernel;

/// Timer handle, shared by one-shot timeouts and intervals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// A unit of deferred work, run from the pump with exclusive kernel access.
pub(crate) type Task = Box<dyn FnOnce(&mut Kernel)>;

pub(crate) enum TimerKind {
    /// Fires once, then the entry is removed. Waiters learn whether the
    /// timer fired (`true`) or was cancelled (`false`); each runs under the
    /// pid that registered it.
    Timeout {
        cb: Option<TimerFn>,
        on_cancel: Option<TimerFn>,
        waiters: Vec<(Pid, WaitFn)>,
    },
    /// Re-armed after every firing until cleared.
    Interval {
        period_ms: u64,
        cb: Rc<RefCell<IntervalFn>>,
    },
}

pub(crate) struct TimerEntry {
    pub owner: Pid,
    pub deadline_ms: u64,
    pub kind: TimerKind,
}

/// Task queue plus timer table on a virtual millisecond clock.
pub struct Scheduler {
    clock_ms: u64,
    tasks: VecDeque<Task>,
    timers: BTreeMap<TimerId, TimerEntry>,
    next_timer: u64,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            clock_ms: 0,
            tasks: VecDeque::new(),
            timers: BTreeMap::new(),
            next_timer: 1,
        }
    }

    /// Current virtual time.
    pub fn now_ms(&self) -> u64 {
        self.clock_ms
    }

    pub(crate) fn set_clock(&mut self, ms: u64) {
        debug_assert!(ms >= self.clock_ms);
        self.clock_ms = ms;
    }

    /// Queue work to run after the current kernel operation returns.
    pub(crate) fn defer(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub(crate) fn pop_task(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    fn alloc_id(&mut self) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        id
    }

    pub(crate) fn create_timeout(
        &mut self,
        owner: Pid,
        delay_ms: u64,
        cb: Option<TimerFn>,
        on_cancel: Option<TimerFn>,
    ) -> TimerId {
        let id = self.alloc_id();
        self.timers.insert(
            id,
            TimerEntry {
                owner,
                deadline_ms: self.clock_ms.saturating_add(delay_ms),
                kind: TimerKind::Timeout {
                    cb,
                    on_cancel,
                    waiters: Vec::new(),
                },
            },
        );
        id
    }

    pub(crate) fn create_interval(&mut self, owner: Pid, period_ms: u64, cb: IntervalFn) -> TimerId {
        // A zero period would loop forever within a single advance.
        let period_ms = period_ms.max(1);
        let id = self.alloc_id();
        self.timers.insert(
            id,
            TimerEntry {
                owner,
                deadline_ms: self.clock_ms.saturating_add(period_ms),
                kind: TimerKind::Interval {
                    period_ms,
                    cb: Rc::new(RefCell::new(cb)),
                },
            },
        );
        id
    }

    /// Attach a completion waiter to a pending timeout. The waiter comes
    /// back as `Err` when the timer is unknown, already settled, or not a
    /// one-shot, so the caller can resolve it immediately.
    pub(crate) fn try_add_waiter(
        &mut self,
        id: TimerId,
        caller: Pid,
        waiter: WaitFn,
    ) -> Result<(), WaitFn> {
        match self.timers.get_mut(&id) {
            Some(TimerEntry {
                kind: TimerKind::Timeout { waiters, .. },
                ..
            }) => {
                waiters.push((caller, waiter));
                Ok(())
            }
            _ => Err(waiter),
        }
    }

    /// Remove a pending one-shot, returning its entry so the caller can
    /// resolve cancellation callbacks and waiters.
    pub(crate) fn take_timeout(&mut self, id: TimerId) -> Option<TimerEntry> {
        match self.timers.get(&id) {
            Some(TimerEntry {
                kind: TimerKind::Timeout { .. },
                ..
            }) => self.timers.remove(&id),
            _ => None,
        }
    }

    /// Remove a pending interval.
    pub(crate) fn take_interval(&mut self, id: TimerId) -> Option<TimerEntry> {
        match self.timers.get(&id) {
            Some(TimerEntry {
                kind: TimerKind::Interval { .. },
                ..
            }) => self.timers.remove(&id),
            _ => None,
        }
    }

    /// Drop a timer without resolving anything. Used for the broker's own
    /// protocol timers, which have no observers.
    pub(crate) fn discard_timer(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    /// Remove any timer by id, for firing.
    pub(crate) fn take_any(&mut self, id: TimerId) -> Option<TimerEntry> {
        self.timers.remove(&id)
    }

    pub(crate) fn reinsert(&mut self, id: TimerId, entry: TimerEntry) {
        self.timers.insert(id, entry);
    }

    /// The earliest timer due at or before `limit_ms`. Ties break by id, so
    /// timers created earlier fire first.
    pub(crate) fn next_due(&self, limit_ms: u64) -> Option<(TimerId, u64)> {
        self.timers
            .iter()
            .filter(|(_, e)| e.deadline_ms <= limit_ms)
            .min_by_key(|(id, e)| (e.deadline_ms, **id))
            .map(|(id, e)| (*id, e.deadline_ms))
    }

    pub(crate) fn timer_owner(&self, id: TimerId) -> Option<Pid> {
        self.timers.get(&id).map(|e| e.owner)
    }

    /// Drop every timer and queued task. Clock keeps its value.
    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[test]
    fn due_timers_order_by_deadline_then_id() {
        let mut s = Scheduler::new();
        let late = s.create_timeout(Pid(1), 50, None, None);
        let early_a = s.create_timeout(Pid(1), 10, None, None);
        let early_b = s.create_timeout(Pid(1), 10, None, None);

        assert_eq!(s.next_due(100), Some((early_a, 10)));
        s.take_timeout(early_a);
        assert_eq!(s.next_due(100), Some((early_b, 10)));
        s.take_timeout(early_b);
        assert_eq!(s.next_due(100), Some((late, 50)));
        assert_eq!(s.next_due(40), None);
    }

    #[test]
    fn waiters_only_attach_to_pending_timeouts() {
        let mut s = Scheduler::new();
        let t = s.create_timeout(Pid(1), 10, None, None);
        let i = s.create_interval(Pid(1), 10, Box::new(|_| Ok(())));

        assert!(s.try_add_waiter(t, Pid(2), Box::new(|_, _| Ok(()))).is_ok());
        assert!(s.try_add_waiter(i, Pid(2), Box::new(|_, _| Ok(()))).is_err());
        s.take_timeout(t);
        assert!(s.try_add_waiter(t, Pid(2), Box::new(|_, _| Ok(()))).is_err());
    }

    #[test]
    fn take_is_kind_checked() {
        let mut s = Scheduler::new();
        let t = s.create_timeout(Pid(1), 10, None, None);
        let i = s.create_interval(Pid(1), 10, Box::new(|_| Ok(())));

        assert!(s.take_interval(t).is_none());
        assert!(s.take_timeout(i).is_none());
        assert!(s.take_timeout(t).is_some());
        assert!(s.take_interval(i).is_some());
    }

    #[test]
    fn zero_period_intervals_are_clamped() {
        let mut s = Scheduler::new();
        let i = s.create_interval(Pid(1), 0, Box::new(|_| Ok(())));
        // Deadline must be strictly in the future.
        assert_eq!(s.next_due(0), None);
        assert_eq!(s.next_due(1), Some((i, 1)));
    }
}
