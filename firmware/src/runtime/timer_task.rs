use analog_core::sched::{Scheduler, TimerAction};
use embassy_futures::select::{Either, select};
use embassy_time::{Instant, Timer};

use super::{REPORT_WAKE, RUNTIME, TIMER_WAKE, enter_shutdown, with_hardware};
use crate::clock;

#[embassy_executor::task]
pub async fn run() -> ! {
    loop {
        match with_hardware(|hw| hw.sched.next_wake()).flatten() {
            Some(waketime) => {
                let deadline = Instant::from_ticks(clock::widen(Instant::now().as_ticks(), waketime));
                if let Either::Second(()) = select(Timer::at(deadline), TIMER_WAKE.wait()).await {
                    continue;
                }
            }
            None => {
                TIMER_WAKE.wait().await;
                continue;
            }
        }

        if service_due_timers() > 0 {
            REPORT_WAKE.signal(());
        }
    }
}

/// Runs every timer due at the current tick.
fn service_due_timers() -> usize {
    let now = clock::now();
    with_hardware(|hw| {
        let mut ran = 0;
        while let Some((id, _)) = hw.sched.pop_due(now) {
            ran += 1;
            if let TimerAction::Reschedule(waketime) = RUNTIME.run_timer(id, hw) {
                if let Err(err) = hw.sched.add_timer(id, waketime) {
                    defmt::warn!("timer: oid {} not re-armed: {}", id.oid(), err);
                }
            }
            if let Some(reason) = hw.shutdown.take_request() {
                enter_shutdown(hw, reason);
                break;
            }
        }
        ran
    })
    .unwrap_or(0)
}
