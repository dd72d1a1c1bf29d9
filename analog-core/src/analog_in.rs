//! Periodic block-averaged ADC sampling with range-check shutdown.
//!
//! A sampler wakes every `rest_time` ticks, takes `sample_count` readings
//! spaced `sample_time` apart and keeps their raw sum. Finished sums are
//! handed to the reporting task through the progress counter:
//!
//! * `0..sample_count` accumulating a block,
//! * `sample_count` block complete, waiting for the reporting task,
//! * `sample_count + 1` reported (or freshly queried) and idle.
//!
//! Any sum outside `[min_value, max_value]` counts as invalid; once
//! `range_check_count` consecutive blocks are invalid the sampler requests a
//! firmware shutdown.

use crate::hal::{AdcDriver, Shutdown};
use crate::sched::{TaskWake, Ticks, TimerAction};

/// Shutdown reason raised after too many out-of-range blocks.
pub const RANGE_SHUTDOWN_REASON: &str = "ADC out of range";

/// Parameters supplied by `query_analog_in`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SamplerParams {
    /// Tick at which the first block starts.
    pub clock: Ticks,
    /// Spacing between readings within a block.
    pub sample_ticks: Ticks,
    /// Readings per block; `0` disables the sampler.
    pub sample_count: u8,
    /// Spacing between block starts.
    pub rest_ticks: Ticks,
    /// Smallest valid block sum.
    pub min_value: u16,
    /// Largest valid block sum.
    pub max_value: u16,
    /// Consecutive invalid blocks tolerated before shutdown.
    pub range_check_count: u8,
}

/// Completed block handed to the reporting task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SamplerReading {
    /// Start tick of the block following this one.
    pub next_clock: Ticks,
    /// Raw sum of the block.
    pub value: u16,
}

/// One analog input sampler.
#[derive(Clone, Debug)]
pub struct AnalogIn<P> {
    pin: P,
    waketime: Ticks,
    rest_time: Ticks,
    sample_time: Ticks,
    next_begin_time: Ticks,
    value: u16,
    min_value: u16,
    max_value: u16,
    invalid_count: u8,
    range_check_count: u8,
    // Wider than sample_count so that sample_count + 1 cannot wrap.
    state: u16,
    sample_count: u8,
}

impl<P: Copy> AnalogIn<P> {
    /// Creates a configured but unarmed sampler.
    #[must_use]
    pub const fn new(pin: P) -> Self {
        Self {
            pin,
            waketime: 0,
            rest_time: 0,
            sample_time: 0,
            next_begin_time: 0,
            value: 0,
            min_value: 0,
            max_value: 0,
            invalid_count: 0,
            range_check_count: 0,
            state: 1,
            sample_count: 0,
        }
    }

    /// Pin handle the sampler reads.
    #[must_use]
    pub const fn pin(&self) -> P {
        self.pin
    }

    /// Progress counter.
    #[must_use]
    pub const fn state(&self) -> u16 {
        self.state
    }

    /// Readings per block.
    #[must_use]
    pub const fn sample_count(&self) -> u8 {
        self.sample_count
    }

    /// Raw accumulated sum.
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.value
    }

    /// Consecutive invalid blocks seen so far.
    #[must_use]
    pub const fn invalid_count(&self) -> u8 {
        self.invalid_count
    }

    /// Tick at which the next block begins.
    #[must_use]
    pub const fn next_begin_time(&self) -> Ticks {
        self.next_begin_time
    }

    /// Tick of the pending (or last) timer callback.
    #[must_use]
    pub const fn waketime(&self) -> Ticks {
        self.waketime
    }

    fn idle_state(&self) -> u16 {
        u16::from(self.sample_count) + 1
    }

    /// Replaces the sampling parameters.
    ///
    /// The caller must already have cancelled the timer and any pending
    /// conversion. Returns the tick to arm the timer at, or `None` when
    /// `sample_count` is zero and the sampler stays disabled.
    pub fn query(&mut self, params: &SamplerParams) -> Option<Ticks> {
        self.next_begin_time = params.clock;
        self.waketime = params.clock;
        self.sample_time = params.sample_ticks;
        self.sample_count = params.sample_count;
        self.state = self.idle_state();
        self.rest_time = params.rest_ticks;
        self.min_value = params.min_value;
        self.max_value = params.max_value;
        self.range_check_count = params.range_check_count;

        if self.sample_count == 0 {
            adc_debug!("analog_in: sampler disabled");
            return None;
        }
        adc_debug!(
            "analog_in: armed count={} rest={}",
            self.sample_count,
            self.rest_time
        );
        Some(self.waketime)
    }

    /// Timer callback; runs in interrupt context.
    pub fn on_timer<A, X>(&mut self, adc: &mut A, shutdown: &mut X, wake: &TaskWake) -> TimerAction
    where
        A: AdcDriver<Pin = P>,
        X: Shutdown,
    {
        let delay = adc.sample(self.pin);
        if delay != 0 {
            self.waketime = self.waketime.wrapping_add(delay);
            return TimerAction::Reschedule(self.waketime);
        }

        let raw = adc.read(self.pin);
        if self.state >= u16::from(self.sample_count) {
            self.state = 0;
            self.value = raw;
        } else {
            self.value = self.value.wrapping_add(raw);
        }

        self.state += 1;
        if self.state < u16::from(self.sample_count) {
            self.waketime = self.waketime.wrapping_add(self.sample_time);
            return TimerAction::Reschedule(self.waketime);
        }

        self.check_range(shutdown);
        wake.wake();
        self.next_begin_time = self.next_begin_time.wrapping_add(self.rest_time);
        self.waketime = self.next_begin_time;
        TimerAction::Reschedule(self.waketime)
    }

    fn check_range<X: Shutdown>(&mut self, shutdown: &mut X) {
        if (self.min_value..=self.max_value).contains(&self.value) {
            self.invalid_count = 0;
            return;
        }

        self.invalid_count = self.invalid_count.saturating_add(1);
        if self.invalid_count >= self.range_check_count {
            adc_warn!(
                "analog_in: value {} outside {}..={}",
                self.value,
                self.min_value,
                self.max_value
            );
            shutdown.try_shutdown(RANGE_SHUTDOWN_REASON);
            self.invalid_count = 0;
        }
    }

    /// Claims a completed block for reporting.
    ///
    /// Must run with interrupts masked; the claim moves the sampler to idle so
    /// each block is reported at most once.
    pub fn take_reading(&mut self) -> Option<SamplerReading> {
        if self.state != u16::from(self.sample_count) {
            return None;
        }
        let reading = SamplerReading {
            next_clock: self.next_begin_time,
            value: self.value,
        };
        self.state += 1;
        Some(reading)
    }

    /// Shutdown hook.
    ///
    /// Cancels the conversion in flight and, for an enabled sampler, returns
    /// the start tick of the next block so sampling resumes after shutdown.
    pub fn shutdown<A>(&mut self, adc: &mut A) -> Option<Ticks>
    where
        A: AdcDriver<Pin = P>,
    {
        adc.cancel_sample(self.pin);
        if self.sample_count == 0 {
            return None;
        }
        self.state = self.idle_state();
        self.next_begin_time = self.next_begin_time.wrapping_add(self.rest_time);
        self.waketime = self.next_begin_time;
        Some(self.waketime)
    }
}
