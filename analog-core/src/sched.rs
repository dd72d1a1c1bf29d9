//! Timer-facing primitives shared by the samplers and their host runtimes.
//!
//! The MCU clock is a free-running 32-bit tick counter that wraps, so every
//! comparison goes through [`is_before`]. [`TimerQueue`] is the small ordered
//! timer set used by the firmware and the emulator; the object logic only
//! relies on the [`Scheduler`] trait.

use core::fmt;

use heapless::Vec;
use portable_atomic::{AtomicBool, Ordering};

/// MCU clock ticks.
pub type Ticks = u32;

/// Returns `true` when `lhs` happens before `rhs` on the wrapping clock.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn is_before(lhs: Ticks, rhs: Ticks) -> bool {
    (lhs.wrapping_sub(rhs) as i32) < 0
}

/// Identifies the timer slot owned by one object id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId(u8);

impl TimerId {
    /// Timer slot for the object stored under `oid`.
    #[must_use]
    pub const fn for_oid(oid: u8) -> Self {
        Self(oid)
    }

    /// Object id that owns this timer.
    #[must_use]
    pub const fn oid(self) -> u8 {
        self.0
    }
}

/// Result of running a timer callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerAction {
    /// Run the callback again at the given tick.
    Reschedule(Ticks),
    /// Leave the timer disarmed.
    Done,
}

/// Failure to arm a timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScheduleError {
    /// No free timer slot remained.
    QueueFull,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::QueueFull => f.write_str("timer queue full"),
        }
    }
}

/// Timer service used by the command handlers.
pub trait Scheduler {
    /// Arms (or re-arms) the timer `id` to fire at `waketime`.
    fn add_timer(&mut self, id: TimerId, waketime: Ticks) -> Result<(), ScheduleError>;

    /// Disarms the timer `id`; a no-op when it is not armed.
    fn del_timer(&mut self, id: TimerId);
}

/// Ordered set of armed timers, earliest first.
#[derive(Clone, Debug, Default)]
pub struct TimerQueue<const N: usize> {
    entries: Vec<(TimerId, Ticks), N>,
}

impl<const N: usize> TimerQueue<N> {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Wake time of the earliest armed timer.
    #[must_use]
    pub fn next_wake(&self) -> Option<Ticks> {
        self.entries.first().map(|&(_, waketime)| waketime)
    }

    /// Removes and returns the earliest timer whose wake time is not after `now`.
    pub fn pop_due(&mut self, now: Ticks) -> Option<(TimerId, Ticks)> {
        let &(_, waketime) = self.entries.first()?;
        if is_before(now, waketime) {
            return None;
        }
        Some(self.entries.remove(0))
    }

    /// Wake time of `id`, if armed.
    #[must_use]
    pub fn waketime(&self, id: TimerId) -> Option<Ticks> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|&(_, waketime)| waketime)
    }

    /// Returns `true` when `id` is armed.
    #[must_use]
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.waketime(id).is_some()
    }

    /// Disarms every timer.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<const N: usize> Scheduler for TimerQueue<N> {
    fn add_timer(&mut self, id: TimerId, waketime: Ticks) -> Result<(), ScheduleError> {
        self.del_timer(id);
        let position = self
            .entries
            .iter()
            .position(|&(_, pending)| is_before(waketime, pending))
            .unwrap_or(self.entries.len());
        self.entries
            .insert(position, (id, waketime))
            .map_err(|_| ScheduleError::QueueFull)
    }

    fn del_timer(&mut self, id: TimerId) {
        if let Some(position) = self.entries.iter().position(|(entry, _)| *entry == id) {
            self.entries.remove(position);
        }
    }
}

/// Wake flag for a cooperative task, raised from interrupt context.
#[derive(Debug, Default)]
pub struct TaskWake {
    pending: AtomicBool,
}

impl TaskWake {
    /// Creates a lowered flag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Requests that the task run.
    pub fn wake(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consumes a pending wake request.
    pub fn check_wake(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Returns `true` when a wake request is pending, without consuming it.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_compare_handles_rollover() {
        assert!(is_before(10, 20));
        assert!(!is_before(20, 10));
        assert!(!is_before(5, 5));
        assert!(is_before(u32::MAX - 5, 3));
        assert!(!is_before(3, u32::MAX - 5));
    }

    #[test]
    fn queue_orders_by_waketime() {
        let mut queue = TimerQueue::<4>::new();
        queue.add_timer(TimerId::for_oid(1), 300).expect("arm 1");
        queue.add_timer(TimerId::for_oid(2), 100).expect("arm 2");
        queue.add_timer(TimerId::for_oid(3), 200).expect("arm 3");

        assert_eq!(queue.next_wake(), Some(100));
        assert_eq!(queue.pop_due(99), None);
        assert_eq!(queue.pop_due(250), Some((TimerId::for_oid(2), 100)));
        assert_eq!(queue.pop_due(250), Some((TimerId::for_oid(3), 200)));
        assert_eq!(queue.pop_due(250), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rearming_replaces_existing_entry() {
        let mut queue = TimerQueue::<2>::new();
        let id = TimerId::for_oid(7);
        queue.add_timer(id, 500).expect("arm");
        queue.add_timer(id, 50).expect("re-arm");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.waketime(id), Some(50));

        queue.del_timer(id);
        assert!(!queue.is_armed(id));
        queue.del_timer(id);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_rejects_new_timer() {
        let mut queue = TimerQueue::<1>::new();
        queue.add_timer(TimerId::for_oid(0), 1).expect("arm");
        assert_eq!(
            queue.add_timer(TimerId::for_oid(1), 2),
            Err(ScheduleError::QueueFull)
        );
    }

    #[test]
    fn orders_across_clock_rollover() {
        let mut queue = TimerQueue::<2>::new();
        queue.add_timer(TimerId::for_oid(0), 4).expect("arm after wrap");
        queue
            .add_timer(TimerId::for_oid(1), u32::MAX - 1)
            .expect("arm before wrap");

        assert_eq!(queue.next_wake(), Some(u32::MAX - 1));
        assert_eq!(queue.pop_due(0), Some((TimerId::for_oid(1), u32::MAX - 1)));
        assert_eq!(queue.pop_due(0), None);
        assert_eq!(queue.pop_due(4), Some((TimerId::for_oid(0), 4)));
    }

    #[test]
    fn wake_flag_is_consumed_once() {
        let wake = TaskWake::new();
        assert!(!wake.check_wake());
        wake.wake();
        wake.wake();
        assert!(wake.is_pending());
        assert!(wake.check_wake());
        assert!(!wake.check_wake());
    }
}
