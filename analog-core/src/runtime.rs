//! Command handlers, timer dispatch and the reporting task.
//!
//! [`AnalogRuntime`] owns every sampler and endstop. The objects sit behind an
//! [`IrqShared`] because timer callbacks (interrupt context) and the command
//! and reporting paths (task context) all reach them. The collaborators the
//! objects drive are passed in per call, usually bundled as [`Hardware`].

use core::fmt;

use crate::analog_in::{AnalogIn, SamplerParams};
use crate::endstop::{AnalogEndstop, HomeParams, QUERY_SPIN_LIMIT};
use crate::hal::{AdcDriver, AdcError, Shutdown, TriggerSync, TrsyncError};
use crate::irq::IrqShared;
use crate::objects::{ObjectDirectory, ObjectError, Oid};
use crate::protocol::{Command, DecodeError, Report, ReportSink};
use crate::sched::{ScheduleError, Scheduler, TaskWake, TimerAction, TimerId};

/// Default object table size.
pub const MAX_OBJECTS: usize = 16;

/// Object stored under an id.
#[derive(Clone, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum AdcObject<P> {
    AnalogIn(AnalogIn<P>),
    Endstop(AnalogEndstop<P>),
}

/// Collaborators driven by the runtime.
#[derive(Debug, Default)]
pub struct Hardware<A, S, T, X> {
    pub adc: A,
    pub sched: S,
    pub trsync: T,
    pub shutdown: X,
}

/// Errors surfaced by command handling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    Decode(DecodeError),
    Object(ObjectError),
    Adc(AdcError),
    Trsync(TrsyncError),
    Schedule(ScheduleError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Decode(err) => write!(f, "decode: {err}"),
            CommandError::Object(err) => write!(f, "object: {err}"),
            CommandError::Adc(err) => write!(f, "adc: {err}"),
            CommandError::Trsync(err) => write!(f, "trsync: {err}"),
            CommandError::Schedule(err) => write!(f, "schedule: {err}"),
        }
    }
}

impl From<DecodeError> for CommandError {
    fn from(error: DecodeError) -> Self {
        Self::Decode(error)
    }
}

impl From<ObjectError> for CommandError {
    fn from(error: ObjectError) -> Self {
        Self::Object(error)
    }
}

impl From<AdcError> for CommandError {
    fn from(error: AdcError) -> Self {
        Self::Adc(error)
    }
}

impl From<TrsyncError> for CommandError {
    fn from(error: TrsyncError) -> Self {
        Self::Trsync(error)
    }
}

impl From<ScheduleError> for CommandError {
    fn from(error: ScheduleError) -> Self {
        Self::Schedule(error)
    }
}

type Directory<P, const N: usize> = ObjectDirectory<AdcObject<P>, N>;

fn sampler_mut<P, const N: usize>(
    objects: &mut Directory<P, N>,
    oid: Oid,
) -> Result<&mut AnalogIn<P>, ObjectError> {
    match objects.get_mut(oid)? {
        AdcObject::AnalogIn(sampler) => Ok(sampler),
        AdcObject::Endstop(_) => Err(ObjectError::WrongKind(oid)),
    }
}

fn endstop_mut<P, const N: usize>(
    objects: &mut Directory<P, N>,
    oid: Oid,
) -> Result<&mut AnalogEndstop<P>, ObjectError> {
    match objects.get_mut(oid)? {
        AdcObject::Endstop(endstop) => Ok(endstop),
        AdcObject::AnalogIn(_) => Err(ObjectError::WrongKind(oid)),
    }
}

/// Analog samplers and endstops of one MCU.
pub struct AnalogRuntime<P, const N: usize = MAX_OBJECTS> {
    objects: IrqShared<Directory<P, N>>,
    report_wake: TaskWake,
}

impl<P: Copy, const N: usize> AnalogRuntime<P, N> {
    /// Creates a runtime with no objects configured.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects: IrqShared::new(ObjectDirectory::new()),
            report_wake: TaskWake::new(),
        }
    }

    /// `config_analog_in`: binds a sampler to `oid`.
    pub fn config_analog_in<A>(&self, oid: Oid, pin: u32, adc: &mut A) -> Result<(), CommandError>
    where
        A: AdcDriver<Pin = P>,
    {
        let pin = adc.setup(pin)?;
        self.objects.lock(|objects| -> Result<(), CommandError> {
            objects.alloc(oid, AdcObject::AnalogIn(AnalogIn::new(pin)))?;
            Ok(())
        })
    }

    /// `query_analog_in`: replaces the sampler parameters and (re)arms it.
    pub fn query_analog_in<A, S>(
        &self,
        oid: Oid,
        params: &SamplerParams,
        adc: &mut A,
        sched: &mut S,
    ) -> Result<(), CommandError>
    where
        A: AdcDriver<Pin = P>,
        S: Scheduler,
    {
        let id = TimerId::for_oid(oid);
        self.objects.lock(|objects| -> Result<(), CommandError> {
            let sampler = sampler_mut(objects, oid)?;
            sched.del_timer(id);
            adc.cancel_sample(sampler.pin());
            if let Some(waketime) = sampler.query(params) {
                sched.add_timer(id, waketime)?;
            }
            Ok(())
        })
    }

    /// `config_analog_endstop`: binds an endstop to `oid`.
    pub fn config_analog_endstop<A>(&self, oid: Oid, pin: u32, adc: &mut A) -> Result<(), CommandError>
    where
        A: AdcDriver<Pin = P>,
    {
        let pin = adc.setup(pin)?;
        self.objects.lock(|objects| -> Result<(), CommandError> {
            objects.alloc(oid, AdcObject::Endstop(AnalogEndstop::new(pin)))?;
            Ok(())
        })
    }

    /// `analog_endstop_home`: starts homing, or disarms when
    /// `oversample_count` is zero.
    pub fn analog_endstop_home<A, S, T>(
        &self,
        oid: Oid,
        params: &HomeParams,
        adc: &mut A,
        sched: &mut S,
        trsync: &T,
    ) -> Result<(), CommandError>
    where
        A: AdcDriver<Pin = P>,
        S: Scheduler,
        T: TriggerSync,
    {
        let target = if params.oversample_count == 0 {
            None
        } else {
            Some(trsync.lookup(params.trsync_oid)?)
        };

        let id = TimerId::for_oid(oid);
        self.objects.lock(|objects| -> Result<(), CommandError> {
            let endstop = endstop_mut(objects, oid)?;
            sched.del_timer(id);
            adc.cancel_sample(endstop.pin());
            if let Some(waketime) = endstop.home(params, target) {
                sched.add_timer(id, waketime)?;
            }
            Ok(())
        })
    }

    /// `analog_endstop_query_state`: reads the endstop pin.
    ///
    /// Only the snapshot is taken under the lock; the converter is polled
    /// with interrupts enabled.
    pub fn analog_endstop_query_state<A>(&self, oid: Oid, adc: &mut A) -> Result<Report, CommandError>
    where
        A: AdcDriver<Pin = P>,
    {
        let snapshot = self.objects.lock(|objects| -> Result<_, CommandError> {
            Ok(endstop_mut(objects, oid)?.query_snapshot())
        })?;
        let state = snapshot.read(adc, QUERY_SPIN_LIMIT)?;
        Ok(Report::AnalogEndstopState {
            oid,
            next_clock: state.next_clock,
            pin_value: state.pin_value,
            threshold: state.threshold,
        })
    }

    /// Executes `command`; returns the immediate response, if it has one.
    pub fn dispatch<A, S, T, X>(
        &self,
        command: &Command,
        hw: &mut Hardware<A, S, T, X>,
    ) -> Result<Option<Report>, CommandError>
    where
        A: AdcDriver<Pin = P>,
        S: Scheduler,
        T: TriggerSync,
    {
        match *command {
            Command::ConfigAnalogIn { oid, pin } => self.config_analog_in(oid, pin, &mut hw.adc)?,
            Command::QueryAnalogIn { oid, ref params } => {
                self.query_analog_in(oid, params, &mut hw.adc, &mut hw.sched)?;
            }
            Command::ConfigAnalogEndstop { oid, pin } => {
                self.config_analog_endstop(oid, pin, &mut hw.adc)?;
            }
            Command::AnalogEndstopHome { oid, ref params } => {
                self.analog_endstop_home(oid, params, &mut hw.adc, &mut hw.sched, &hw.trsync)?;
            }
            Command::AnalogEndstopQueryState { oid } => {
                return self.analog_endstop_query_state(oid, &mut hw.adc).map(Some);
            }
        }
        Ok(None)
    }

    /// Decodes and executes one command line.
    pub fn dispatch_line<A, S, T, X>(
        &self,
        line: &str,
        hw: &mut Hardware<A, S, T, X>,
    ) -> Result<Option<Report>, CommandError>
    where
        A: AdcDriver<Pin = P>,
        S: Scheduler,
        T: TriggerSync,
    {
        let command = Command::decode(line)?;
        self.dispatch(&command, hw)
    }

    /// Runs the timer callback of the object owning `id`.
    ///
    /// Timers of ids with no object are retired.
    pub fn run_timer<A, S, T, X>(&self, id: TimerId, hw: &mut Hardware<A, S, T, X>) -> TimerAction
    where
        A: AdcDriver<Pin = P>,
        T: TriggerSync,
        X: Shutdown,
    {
        self.objects.lock(|objects| match objects.get_mut(id.oid()) {
            Ok(AdcObject::AnalogIn(sampler)) => {
                sampler.on_timer(&mut hw.adc, &mut hw.shutdown, &self.report_wake)
            }
            Ok(AdcObject::Endstop(endstop)) => endstop.on_timer(&mut hw.adc, &mut hw.trsync),
            Err(_) => TimerAction::Done,
        })
    }

    /// Returns `true` when a completed sampler block awaits reporting.
    #[must_use]
    pub fn report_pending(&self) -> bool {
        self.report_wake.is_pending()
    }

    /// Reporting task body: sends every completed sampler block.
    ///
    /// Each claim masks interrupts only for the read-and-advance of a single
    /// sampler; the report itself is sent with interrupts enabled.
    pub fn analog_in_task(&self, sink: &mut impl ReportSink) -> usize {
        if !self.report_wake.check_wake() {
            return 0;
        }

        let mut sent = 0;
        for oid in (0..=Oid::MAX).take(N) {
            let reading = self.objects.lock(|objects| {
                sampler_mut(objects, oid)
                    .ok()
                    .and_then(AnalogIn::take_reading)
            });
            if let Some(reading) = reading {
                sink.send(Report::AnalogInState {
                    oid,
                    next_clock: reading.next_clock,
                    value: reading.value,
                });
                sent += 1;
            }
        }
        sent
    }

    /// Shutdown hook: cancels conversions, re-arms enabled samplers at their
    /// next block and returns homing endstops to idle.
    ///
    /// Every sampler is visited even when re-arming one fails; the first
    /// failure is returned.
    pub fn shutdown<A, S>(&self, adc: &mut A, sched: &mut S) -> Result<(), CommandError>
    where
        A: AdcDriver<Pin = P>,
        S: Scheduler,
    {
        self.objects.lock(|objects| {
            let mut result: Result<(), CommandError> = Ok(());
            for (oid, object) in objects.iter_mut() {
                let sampler = match object {
                    AdcObject::AnalogIn(sampler) => sampler,
                    AdcObject::Endstop(endstop) => {
                        endstop.shutdown(adc);
                        continue;
                    }
                };
                if let Some(waketime) = sampler.shutdown(adc) {
                    adc_info!("analog_in: oid {} resumes at {}", oid, waketime);
                    if let Err(err) = sched.add_timer(TimerId::for_oid(oid), waketime) {
                        if result.is_ok() {
                            result = Err(err.into());
                        }
                    }
                }
            }
            result
        })
    }

    /// Runs `f` against the object bound to `oid`.
    pub fn inspect<R>(&self, oid: Oid, f: impl FnOnce(&AdcObject<P>) -> R) -> Result<R, ObjectError> {
        self.objects.lock(|objects| objects.get(oid).map(f))
    }

    /// Ids with a configured object.
    pub fn oids(&self) -> heapless::Vec<Oid, N> {
        self.objects.lock(|objects| objects.oids().take(N).collect())
    }
}

impl<P: Copy, const N: usize> Default for AnalogRuntime<P, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{ShutdownLatch, TrsyncTable};
    use crate::sched::{Ticks, TimerQueue};

    #[derive(Default)]
    struct StubAdc {
        level: u16,
        cancelled: heapless::Vec<u8, 8>,
    }

    impl AdcDriver for StubAdc {
        type Pin = u8;

        fn setup(&mut self, pin: u32) -> Result<u8, AdcError> {
            match pin {
                0..=7 => Ok(u8::try_from(pin).unwrap_or_default()),
                _ => Err(AdcError::InvalidPin(pin)),
            }
        }

        fn sample(&mut self, _pin: u8) -> Ticks {
            0
        }

        fn read(&mut self, _pin: u8) -> u16 {
            self.level
        }

        fn cancel_sample(&mut self, pin: u8) {
            let _ = self.cancelled.push(pin);
        }
    }

    type TestHardware = Hardware<StubAdc, TimerQueue<4>, TrsyncTable<2>, ShutdownLatch>;

    #[derive(Default)]
    struct Collected(heapless::Vec<Report, 4>);

    impl ReportSink for Collected {
        fn send(&mut self, report: Report) {
            self.0.push(report).expect("report capacity");
        }
    }

    #[test]
    fn config_rejects_bad_pin_and_duplicate_oid() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut hw = TestHardware::default();

        assert_eq!(
            runtime.config_analog_in(0, 99, &mut hw.adc),
            Err(CommandError::Adc(AdcError::InvalidPin(99)))
        );
        runtime.config_analog_in(0, 1, &mut hw.adc).expect("config");
        assert_eq!(
            runtime.config_analog_endstop(0, 2, &mut hw.adc),
            Err(CommandError::Object(ObjectError::AlreadyAllocated(0)))
        );
        assert_eq!(runtime.oids().as_slice(), &[0]);
    }

    #[test]
    fn commands_check_object_kind() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut hw = TestHardware::default();
        runtime.config_analog_endstop(1, 1, &mut hw.adc).expect("config");

        let result = runtime.dispatch_line(
            "query_analog_in oid=1 clock=0 sample_ticks=1 sample_count=1 rest_ticks=1 \
             min_value=0 max_value=1 range_check_count=1",
            &mut hw,
        );
        assert_eq!(result, Err(CommandError::Object(ObjectError::WrongKind(1))));
        assert_eq!(
            runtime.dispatch_line("analog_endstop_query_state oid=2", &mut hw),
            Err(CommandError::Object(ObjectError::NotFound(2)))
        );
    }

    #[test]
    fn home_rejects_unknown_trsync_before_touching_endstop() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut hw = TestHardware::default();
        runtime.config_analog_endstop(1, 3, &mut hw.adc).expect("config");

        let result = runtime.dispatch_line(
            "analog_endstop_home oid=1 clock=10 sample_ticks=1 oversample_count=1 \
             rest_ticks=5 treshold=100 trsync_oid=7 trigger_reason=1",
            &mut hw,
        );
        assert_eq!(result, Err(CommandError::Trsync(TrsyncError::UnknownOid(7))));
        assert!(hw.sched.is_empty());
        assert!(hw.adc.cancelled.is_empty());
    }

    #[test]
    fn query_cancels_before_rearming() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut hw = TestHardware::default();
        runtime.config_analog_in(2, 5, &mut hw.adc).expect("config");

        let query = |clock: Ticks, count: u8| Command::QueryAnalogIn {
            oid: 2,
            params: SamplerParams {
                clock,
                sample_ticks: 1,
                sample_count: count,
                rest_ticks: 100,
                min_value: 0,
                max_value: u16::MAX,
                range_check_count: 1,
            },
        };

        runtime.dispatch(&query(50, 2), &mut hw).expect("arm");
        assert_eq!(hw.sched.waketime(TimerId::for_oid(2)), Some(50));
        runtime.dispatch(&query(80, 2), &mut hw).expect("re-arm");
        assert_eq!(hw.sched.len(), 1);
        assert_eq!(hw.sched.waketime(TimerId::for_oid(2)), Some(80));
        runtime.dispatch(&query(90, 0), &mut hw).expect("disable");
        assert!(hw.sched.is_empty());
        assert_eq!(hw.adc.cancelled.as_slice(), &[5, 5, 5]);
    }

    #[test]
    fn reporting_task_needs_a_wake() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut hw = TestHardware::default();
        let mut sink = Collected::default();
        runtime.config_analog_in(0, 0, &mut hw.adc).expect("config");
        runtime
            .dispatch_line(
                "query_analog_in oid=0 clock=0 sample_ticks=1 sample_count=1 rest_ticks=10 \
                 min_value=0 max_value=1000 range_check_count=1",
                &mut hw,
            )
            .expect("query");

        assert_eq!(runtime.analog_in_task(&mut sink), 0);
        hw.adc.level = 42;
        assert_eq!(
            runtime.run_timer(TimerId::for_oid(0), &mut hw),
            TimerAction::Reschedule(10)
        );
        assert!(runtime.report_pending());
        assert_eq!(runtime.analog_in_task(&mut sink), 1);
        assert_eq!(
            sink.0.as_slice(),
            &[Report::AnalogInState {
                oid: 0,
                next_clock: 10,
                value: 42
            }]
        );
        assert!(!runtime.report_pending());
    }

    /// Converter that stays busy for a few polls and looks the endstop up
    /// on every poll.
    struct PollingAdc<'a> {
        runtime: &'a AnalogRuntime<u8, 4>,
        busy_polls: u32,
        polls: usize,
    }

    impl AdcDriver for PollingAdc<'_> {
        type Pin = u8;

        fn setup(&mut self, pin: u32) -> Result<u8, AdcError> {
            u8::try_from(pin).map_err(|_| AdcError::InvalidPin(pin))
        }

        fn sample(&mut self, _pin: u8) -> Ticks {
            // Panics if the object table is still locked by the query.
            self.runtime
                .inspect(1, |_| ())
                .expect("endstop configured");
            self.polls += 1;
            if self.busy_polls == 0 {
                return 0;
            }
            self.busy_polls -= 1;
            2
        }

        fn read(&mut self, _pin: u8) -> u16 {
            777
        }

        fn cancel_sample(&mut self, _pin: u8) {}
    }

    #[test]
    fn endstop_query_polls_with_objects_unlocked() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut adc = PollingAdc {
            runtime: &runtime,
            busy_polls: 3,
            polls: 0,
        };
        runtime.config_analog_endstop(1, 2, &mut adc).expect("config");

        let report = runtime
            .analog_endstop_query_state(1, &mut adc)
            .expect("query");
        assert_eq!(
            report,
            Report::AnalogEndstopState {
                oid: 1,
                next_clock: 0,
                pin_value: 777,
                threshold: 0
            }
        );
        assert_eq!(adc.polls, 4);
    }

    #[test]
    fn shutdown_returns_homing_endstops_to_idle() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut hw = TestHardware::default();
        hw.trsync.register(1).expect("register trsync");
        runtime.config_analog_endstop(0, 4, &mut hw.adc).expect("config");
        runtime
            .dispatch_line(
                "analog_endstop_home oid=0 clock=0 sample_ticks=1 oversample_count=1 \
                 rest_ticks=5 treshold=100 trsync_oid=1 trigger_reason=1",
                &mut hw,
            )
            .expect("home");

        hw.sched.clear();
        runtime.shutdown(&mut hw.adc, &mut hw.sched).expect("shutdown");
        let phase = runtime
            .inspect(0, |object| match object {
                AdcObject::Endstop(endstop) => endstop.phase(),
                AdcObject::AnalogIn(_) => panic!("unexpected sampler"),
            })
            .expect("endstop configured");
        assert_eq!(phase, crate::endstop::EndstopPhase::Idle);
        assert!(hw.sched.is_empty());
        assert_eq!(hw.adc.cancelled.as_slice(), &[4, 4]);
    }

    #[test]
    fn timer_for_missing_object_is_retired() {
        let runtime = AnalogRuntime::<u8, 4>::new();
        let mut hw = TestHardware::default();
        assert_eq!(runtime.run_timer(TimerId::for_oid(3), &mut hw), TimerAction::Done);
    }
}
