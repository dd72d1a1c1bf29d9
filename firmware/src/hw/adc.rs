//! ADC1 adapter.
//!
//! Conversions are blocking: `sample` always reports the input ready and the
//! conversion itself happens inside `read`.

use analog_core::hal::{AdcDriver, AdcError};
use analog_core::sched::Ticks;
use embassy_stm32::Peri;
use embassy_stm32::adc::{Adc, AnyAdcChannel, SampleTime};
use embassy_stm32::peripherals::ADC1;

use super::{ADC_CHANNELS, channel_index};

pub struct BoardAdc {
    adc: Adc<'static, ADC1>,
    channels: [AnyAdcChannel<ADC1>; ADC_CHANNELS],
}

impl BoardAdc {
    pub fn new(adc: Peri<'static, ADC1>, channels: [AnyAdcChannel<ADC1>; ADC_CHANNELS]) -> Self {
        let mut adc = Adc::new(adc);
        adc.set_sample_time(SampleTime::CYCLES39_5);
        Self { adc, channels }
    }
}

impl AdcDriver for BoardAdc {
    type Pin = u8;

    fn setup(&mut self, pin: u32) -> Result<u8, AdcError> {
        let index = channel_index(pin)?;
        defmt::info!("adc: input {} on {}", index, super::ADC_PINS[usize::from(index)]);
        Ok(index)
    }

    fn sample(&mut self, _pin: u8) -> Ticks {
        0
    }

    fn read(&mut self, pin: u8) -> u16 {
        self.adc.blocking_read(&mut self.channels[usize::from(pin)])
    }

    fn cancel_sample(&mut self, _pin: u8) {}
}
