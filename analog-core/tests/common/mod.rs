//! Simulated MCU used by the integration tests: a scripted ADC, the timer
//! queue driven by a virtual clock, and a report log.

#![allow(dead_code)]

use std::collections::VecDeque;

use analog_core::hal::{AdcDriver, AdcError, ShutdownLatch, TrsyncTable};
use analog_core::protocol::{Report, ReportSink};
use analog_core::sched::{Scheduler, Ticks, TimerAction, TimerId, TimerQueue, is_before};
use analog_core::{AnalogRuntime, CommandError, Hardware};

pub const PINS: usize = 8;

#[derive(Default)]
struct PinScript {
    level: u16,
    queued: VecDeque<u16>,
    busy_polls: u32,
}

/// ADC whose readings are scripted per pin.
#[derive(Default)]
pub struct ScriptedAdc {
    pins: [PinScript; PINS],
    pub conversion_ticks: Ticks,
    pub reads: usize,
    pub cancels: Vec<u8>,
}

impl ScriptedAdc {
    /// Reading returned once queued readings run out.
    pub fn set_level(&mut self, pin: u8, level: u16) {
        self.pins[usize::from(pin)].level = level;
    }

    /// Readings returned before falling back to the level.
    pub fn queue(&mut self, pin: u8, readings: &[u16]) {
        self.pins[usize::from(pin)].queued.extend(readings);
    }

    /// Makes the next `polls` calls to `sample` report a busy converter.
    pub fn stall(&mut self, pin: u8, polls: u32) {
        self.pins[usize::from(pin)].busy_polls = polls;
    }
}

impl AdcDriver for ScriptedAdc {
    type Pin = u8;

    fn setup(&mut self, pin: u32) -> Result<u8, AdcError> {
        u8::try_from(pin)
            .ok()
            .filter(|&pin| usize::from(pin) < PINS)
            .ok_or(AdcError::InvalidPin(pin))
    }

    fn sample(&mut self, pin: u8) -> Ticks {
        let script = &mut self.pins[usize::from(pin)];
        if script.busy_polls > 0 {
            script.busy_polls -= 1;
            return self.conversion_ticks.max(1);
        }
        0
    }

    fn read(&mut self, pin: u8) -> u16 {
        self.reads += 1;
        let script = &mut self.pins[usize::from(pin)];
        script.queued.pop_front().unwrap_or(script.level)
    }

    fn cancel_sample(&mut self, pin: u8) {
        self.cancels.push(pin);
    }
}

#[derive(Default)]
pub struct ReportLog(pub Vec<Report>);

impl ReportSink for ReportLog {
    fn send(&mut self, report: Report) {
        self.0.push(report);
    }
}

pub type BenchHardware = Hardware<ScriptedAdc, TimerQueue<16>, TrsyncTable<4>, ShutdownLatch>;

/// Runtime plus simulated peripherals.
pub struct Bench {
    pub runtime: AnalogRuntime<u8>,
    pub hw: BenchHardware,
    pub now: Ticks,
    pub reports: ReportLog,
    /// Every timer callback run, with the tick it was scheduled for.
    pub fired: Vec<(TimerId, Ticks)>,
    pub shutdown_reasons: Vec<&'static str>,
}

impl Bench {
    pub fn new() -> Self {
        Self {
            runtime: AnalogRuntime::new(),
            hw: BenchHardware::default(),
            now: 0,
            reports: ReportLog::default(),
            fired: Vec::new(),
            shutdown_reasons: Vec::new(),
        }
    }

    pub fn send(&mut self, line: &str) -> Result<Option<Report>, CommandError> {
        self.runtime.dispatch_line(line, &mut self.hw)
    }

    pub fn send_ok(&mut self, line: &str) -> Option<Report> {
        self.send(line)
            .unwrap_or_else(|err| panic!("`{line}` failed: {err}"))
    }

    /// Runs every timer due up to and including `until`, in wake order.
    pub fn run_until(&mut self, until: Ticks) {
        loop {
            let Some(next) = self.hw.sched.next_wake() else {
                break;
            };
            if is_before(until, next) {
                break;
            }
            let Some((id, waketime)) = self.hw.sched.pop_due(next) else {
                break;
            };
            self.now = waketime;
            self.fired.push((id, waketime));
            if let TimerAction::Reschedule(at) = self.runtime.run_timer(id, &mut self.hw) {
                self.hw.sched.add_timer(id, at).expect("re-arm timer");
            }
            if let Some(reason) = self.hw.shutdown.take_request() {
                self.enter_shutdown(reason);
            }
            self.runtime.analog_in_task(&mut self.reports);
        }
        self.now = until;
    }

    /// Mirrors the MCU shutdown path: all timers stop, then the sampler hook
    /// runs.
    fn enter_shutdown(&mut self, reason: &'static str) {
        self.shutdown_reasons.push(reason);
        self.hw.sched.clear();
        self.runtime
            .shutdown(&mut self.hw.adc, &mut self.hw.sched)
            .expect("shutdown hook");
    }

    /// Wake times of the callbacks run for `oid`.
    pub fn wake_times(&self, oid: u8) -> Vec<Ticks> {
        self.fired
            .iter()
            .filter(|(id, _)| id.oid() == oid)
            .map(|&(_, waketime)| waketime)
            .collect()
    }

    pub fn armed_at(&self, oid: u8) -> Option<Ticks> {
        self.hw.sched.waketime(TimerId::for_oid(oid))
    }
}
