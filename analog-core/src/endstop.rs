//! Analog threshold endstop.
//!
//! While homing the endstop runs in two phases on a single timer:
//!
//! * **Sampling**: one raw reading every `rest_time` ticks, always fed to the
//!   moving average. A reading at or above the threshold is a candidate
//!   crossing and switches to oversampling within the same callback.
//! * **Oversampling**: readings every `sample_time` ticks through the same
//!   filter. The trigger-sync fires the first time the filtered value exceeds
//!   the threshold. Oversampling never drops back to sampling.
//!
//! The filter reports zero until it holds a full window, which keeps a
//! freshly homed endstop from firing on a partially filled window.

use crate::filter::MovingAverage;
use crate::hal::{AdcDriver, AdcError, TriggerSync, TrsyncId};
use crate::sched::{Ticks, TimerAction};

/// Poll limit for [`QuerySnapshot::read`]; unbounded on the MCU.
pub const QUERY_SPIN_LIMIT: Option<u32> = if cfg!(target_os = "none") {
    None
} else {
    Some(100_000)
};

/// Detection phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndstopPhase {
    /// Configured but not homing.
    Idle,
    /// Watching raw readings for a candidate crossing.
    Sampling,
    /// Confirming a crossing through the filter.
    Oversampling,
    /// Trigger-sync fired; the timer is retired.
    Triggered,
}

/// Parameters supplied by `analog_endstop_home`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HomeParams {
    /// Tick of the first reading.
    pub clock: Ticks,
    /// Spacing between oversampling readings.
    pub sample_ticks: Ticks,
    /// Non-zero arms detection; zero disarms.
    pub oversample_count: u8,
    /// Spacing between sampling-phase readings.
    pub rest_ticks: Ticks,
    /// Trigger level in raw ADC units.
    pub threshold: u16,
    /// Trigger-sync to signal.
    pub trsync_oid: u8,
    /// Reason passed to the trigger-sync.
    pub trigger_reason: u8,
}

/// Trigger-sync target captured at home time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TriggerBinding {
    pub trsync: TrsyncId,
    pub reason: u8,
}

/// Snapshot returned by `analog_endstop_query_state`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndstopState {
    /// Wake tick recorded when the last candidate crossing was seen.
    pub next_clock: Ticks,
    /// Raw reading taken for the query.
    pub pin_value: u16,
    pub threshold: u16,
}

/// One analog endstop.
#[derive(Clone, Debug)]
pub struct AnalogEndstop<P> {
    pin: P,
    waketime: Ticks,
    rest_time: Ticks,
    sample_time: Ticks,
    nextwake: Ticks,
    value: u16,
    threshold: u16,
    oversample_count: u8,
    trigger: Option<TriggerBinding>,
    phase: EndstopPhase,
    filter: MovingAverage,
}

impl<P: Copy> AnalogEndstop<P> {
    /// Creates an idle endstop.
    #[must_use]
    pub const fn new(pin: P) -> Self {
        Self {
            pin,
            waketime: 0,
            rest_time: 0,
            sample_time: 0,
            nextwake: 0,
            value: 0,
            threshold: 0,
            oversample_count: 0,
            trigger: None,
            phase: EndstopPhase::Idle,
            filter: MovingAverage::new(),
        }
    }

    #[must_use]
    pub const fn pin(&self) -> P {
        self.pin
    }

    #[must_use]
    pub const fn phase(&self) -> EndstopPhase {
        self.phase
    }

    #[must_use]
    pub const fn threshold(&self) -> u16 {
        self.threshold
    }

    /// Last filtered value computed while oversampling.
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.value
    }

    #[must_use]
    pub const fn nextwake(&self) -> Ticks {
        self.nextwake
    }

    #[must_use]
    pub const fn waketime(&self) -> Ticks {
        self.waketime
    }

    #[must_use]
    pub const fn trigger(&self) -> Option<TriggerBinding> {
        self.trigger
    }

    #[must_use]
    pub const fn filter(&self) -> &MovingAverage {
        &self.filter
    }

    /// Starts or stops homing.
    ///
    /// The caller must already have cancelled the timer and any pending
    /// conversion. `trsync` is ignored when `oversample_count` is zero.
    /// Returns the tick to arm the timer at, or `None` when disarmed.
    pub fn home(&mut self, params: &HomeParams, trsync: Option<TrsyncId>) -> Option<Ticks> {
        self.waketime = params.clock;
        self.sample_time = params.sample_ticks;
        self.oversample_count = params.oversample_count;

        let trsync = match trsync {
            Some(trsync) if params.oversample_count != 0 => trsync,
            _ => {
                self.trigger = None;
                self.phase = EndstopPhase::Idle;
                adc_debug!("endstop: disarmed");
                return None;
            }
        };

        self.rest_time = params.rest_ticks;
        self.threshold = params.threshold;
        self.trigger = Some(TriggerBinding {
            trsync,
            reason: params.trigger_reason,
        });
        self.filter.reset();
        self.phase = EndstopPhase::Sampling;
        adc_debug!(
            "endstop: homing threshold={} rest={}",
            self.threshold,
            self.rest_time
        );
        Some(self.waketime)
    }

    /// Timer callback; runs in interrupt context.
    pub fn on_timer<A, T>(&mut self, adc: &mut A, trsync: &mut T) -> TimerAction
    where
        A: AdcDriver<Pin = P>,
        T: TriggerSync,
    {
        match self.phase {
            EndstopPhase::Sampling => self.sample_event(adc, trsync),
            EndstopPhase::Oversampling => self.oversample_event(adc, trsync),
            EndstopPhase::Idle | EndstopPhase::Triggered => TimerAction::Done,
        }
    }

    fn sample_event<A, T>(&mut self, adc: &mut A, trsync: &mut T) -> TimerAction
    where
        A: AdcDriver<Pin = P>,
        T: TriggerSync,
    {
        let delay = adc.sample(self.pin);
        if delay != 0 {
            self.waketime = self.waketime.wrapping_add(delay);
            return TimerAction::Reschedule(self.waketime);
        }

        let raw = adc.read(self.pin);
        self.filter.add_sample(raw);

        let nextwake = self.waketime.wrapping_add(self.rest_time);
        if raw < self.threshold {
            self.waketime = nextwake;
            return TimerAction::Reschedule(self.waketime);
        }

        adc_debug!("endstop: candidate crossing raw={}", raw);
        self.nextwake = nextwake;
        self.phase = EndstopPhase::Oversampling;
        self.oversample_event(adc, trsync)
    }

    fn oversample_event<A, T>(&mut self, adc: &mut A, trsync: &mut T) -> TimerAction
    where
        A: AdcDriver<Pin = P>,
        T: TriggerSync,
    {
        let delay = adc.sample(self.pin);
        if delay != 0 {
            self.waketime = self.waketime.wrapping_add(delay);
            return TimerAction::Reschedule(self.waketime);
        }

        let filtered = self.filter.add_sample(adc.read(self.pin));
        self.value = filtered;
        if filtered > self.threshold {
            let Some(binding) = self.trigger else {
                self.phase = EndstopPhase::Idle;
                return TimerAction::Done;
            };
            adc_info!(
                "endstop: triggered filtered={} threshold={}",
                filtered,
                self.threshold
            );
            trsync.do_trigger(binding.trsync, binding.reason);
            self.phase = EndstopPhase::Triggered;
            return TimerAction::Done;
        }

        self.waketime = self.waketime.wrapping_add(self.sample_time);
        TimerAction::Reschedule(self.waketime)
    }

    /// Captures the values reported by a query.
    ///
    /// The pin itself is read from the snapshot once the object lock is
    /// released.
    #[must_use]
    pub const fn query_snapshot(&self) -> QuerySnapshot<P> {
        QuerySnapshot {
            pin: self.pin,
            next_clock: self.nextwake,
            threshold: self.threshold,
        }
    }

    /// Shutdown hook: the scheduler reset retired the timer, so detection
    /// stops.
    pub fn shutdown<A>(&mut self, adc: &mut A)
    where
        A: AdcDriver<Pin = P>,
    {
        adc.cancel_sample(self.pin);
        if matches!(self.phase, EndstopPhase::Sampling | EndstopPhase::Oversampling) {
            self.phase = EndstopPhase::Idle;
        }
    }
}

/// Endstop fields captured for `analog_endstop_query_state`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QuerySnapshot<P> {
    pub pin: P,
    pub next_clock: Ticks,
    pub threshold: u16,
}

impl<P: Copy> QuerySnapshot<P> {
    /// Polls until the conversion is ready, then reads the pin.
    ///
    /// Must not run under the object lock: the poll is unbounded when
    /// `spin_limit` is `None`.
    pub fn read<A>(self, adc: &mut A, spin_limit: Option<u32>) -> Result<EndstopState, AdcError>
    where
        A: AdcDriver<Pin = P>,
    {
        let mut polls: u32 = 0;
        while adc.sample(self.pin) != 0 {
            polls += 1;
            if let Some(limit) = spin_limit {
                if polls >= limit {
                    return Err(AdcError::NotReady);
                }
            }
        }

        Ok(EndstopState {
            next_clock: self.next_clock,
            pin_value: adc.read(self.pin),
            threshold: self.threshold,
        })
    }
}
