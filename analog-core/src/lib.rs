#![no_std]

//! Analog input sampling and analog endstop detection for MCU firmware.
//!
//! The crate is target-agnostic: hardware access goes through the traits in
//! [`hal`] and [`sched`], shared state through [`irq::IrqShared`]. The
//! firmware wires it to Embassy peripherals, the emulator to a simulated
//! clock.

#[macro_use]
mod log;

pub mod analog_in;
pub mod baseline;
pub mod endstop;
pub mod filter;
pub mod hal;
pub mod irq;
pub mod objects;
pub mod protocol;
pub mod runtime;
pub mod sched;

pub use runtime::{AdcObject, AnalogRuntime, CommandError, Hardware, MAX_OBJECTS};
