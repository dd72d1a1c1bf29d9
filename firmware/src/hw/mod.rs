#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Board wiring for the analog inputs.
//!
//! Host commands name ADC inputs by their index in [`ADC_PINS`]; the index is
//! the pin handle the core stores for each sampler and endstop.

use analog_core::hal::AdcError;

#[cfg(target_os = "none")]
mod adc;

#[cfg(target_os = "none")]
pub use adc::BoardAdc;

/// Number of ADC1 inputs routed to the connectors.
pub const ADC_CHANNELS: usize = 8;

/// GPIO backing each ADC input, in command pin order.
pub const ADC_PINS: [&str; ADC_CHANNELS] = ["PA0", "PA1", "PA4", "PA5", "PA6", "PA7", "PB0", "PB1"];

/// Validates a host pin number.
pub fn channel_index(pin: u32) -> Result<u8, AdcError> {
    u8::try_from(pin)
        .ok()
        .filter(|index| usize::from(*index) < ADC_CHANNELS)
        .ok_or(AdcError::InvalidPin(pin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_map_to_channel_indexes() {
        assert_eq!(channel_index(0), Ok(0));
        assert_eq!(channel_index(7), Ok(7));
        assert_eq!(channel_index(8), Err(AdcError::InvalidPin(8)));
        assert_eq!(channel_index(300), Err(AdcError::InvalidPin(300)));
    }
}
