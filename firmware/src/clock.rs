//! Scheduler clock on top of the 64-bit `embassy_time` tick counter.
//!
//! The core schedules in wrapping 32-bit ticks. The low word of the embassy
//! counter is that clock; deadlines are widened again relative to "now".

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use analog_core::sched::{Ticks, is_before};

/// Low 32 bits of a 64-bit tick count.
pub fn narrow(ticks: u64) -> Ticks {
    Ticks::try_from(ticks & u64::from(Ticks::MAX)).unwrap_or(Ticks::MAX)
}

/// 64-bit tick at which `waketime` falls, given the current 64-bit tick.
///
/// Wake times already in the past map to `now`.
pub fn widen(now: u64, waketime: Ticks) -> u64 {
    let low = narrow(now);
    if is_before(waketime, low) {
        return now;
    }
    now + u64::from(waketime.wrapping_sub(low))
}

#[cfg(target_os = "none")]
pub fn now() -> Ticks {
    narrow(embassy_time::Instant::now().as_ticks())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_keeps_the_low_word() {
        assert_eq!(narrow(0x1_0000_0005), 5);
        assert_eq!(narrow(42), 42);
    }

    #[test]
    fn widen_across_the_low_word_wrap() {
        let now = 0x2_ffff_fff0;
        assert_eq!(widen(now, 0x10), 0x3_0000_0010);
        assert_eq!(widen(now, 0xffff_fff0), now);
        assert_eq!(widen(now, 0xffff_ff00), now);
    }

    #[test]
    fn widen_future_deadline() {
        assert_eq!(widen(1_000, 1_500), 1_500);
        assert_eq!(widen(1_000, 999), 1_000);
    }
}
