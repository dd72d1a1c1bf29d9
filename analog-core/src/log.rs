//! Logging shims that forward to `defmt` when the `defmt` feature is enabled
//! and compile to nothing otherwise.

#[cfg(feature = "defmt")]
macro_rules! adc_debug {
    ($($arg:tt)*) => { defmt::debug!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! adc_debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "defmt")]
macro_rules! adc_info {
    ($($arg:tt)*) => { defmt::info!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! adc_info {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "defmt")]
macro_rules! adc_warn {
    ($($arg:tt)*) => { defmt::warn!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! adc_warn {
    ($($arg:tt)*) => {};
}
