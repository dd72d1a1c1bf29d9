//! Collaborator seams consumed by the samplers.
//!
//! The ADC driver, trigger-sync objects and the shutdown path belong to the
//! surrounding firmware. Each is reached through a trait so the same sampler
//! logic runs against Embassy peripherals on the MCU and against scripted
//! fakes on the host. Thin concrete implementations of the trigger-sync table
//! and the shutdown latch live here as well because every host of this crate
//! needs exactly that behaviour.

use core::fmt;

use heapless::Vec;

use crate::sched::Ticks;

/// Errors raised by an [`AdcDriver`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcError {
    /// The pin number does not name an ADC-capable input.
    InvalidPin(u32),
    /// A conversion did not complete within the allowed number of polls.
    NotReady,
}

impl fmt::Display for AdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdcError::InvalidPin(pin) => write!(f, "pin {pin} is not an ADC input"),
            AdcError::NotReady => f.write_str("conversion not ready"),
        }
    }
}

/// Non-blocking ADC access.
///
/// `sample` starts (or polls) a conversion and returns `0` once a result can be
/// read, or the number of ticks to wait before polling again.
pub trait AdcDriver {
    /// Driver-specific handle for a configured input.
    type Pin: Copy;

    /// Validates `pin` and prepares it for sampling.
    fn setup(&mut self, pin: u32) -> Result<Self::Pin, AdcError>;

    /// Starts or polls a conversion.
    fn sample(&mut self, pin: Self::Pin) -> Ticks;

    /// Returns the completed conversion.
    fn read(&mut self, pin: Self::Pin) -> u16;

    /// Abandons any conversion in flight on `pin`.
    fn cancel_sample(&mut self, pin: Self::Pin);
}

/// Handle to a trigger-sync object returned by [`TriggerSync::lookup`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrsyncId(u8);

impl TrsyncId {
    /// Wraps a trigger-sync object id.
    #[must_use]
    pub const fn new(oid: u8) -> Self {
        Self(oid)
    }

    /// Object id of the trigger-sync.
    #[must_use]
    pub const fn oid(self) -> u8 {
        self.0
    }
}

/// Errors raised by trigger-sync bookkeeping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrsyncError {
    /// No trigger-sync is registered under the id.
    UnknownOid(u8),
    /// The id is already registered.
    AlreadyRegistered(u8),
    /// No free slots remain.
    TableFull,
}

impl fmt::Display for TrsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrsyncError::UnknownOid(oid) => write!(f, "unknown trsync oid {oid}"),
            TrsyncError::AlreadyRegistered(oid) => write!(f, "trsync oid {oid} already registered"),
            TrsyncError::TableFull => f.write_str("trsync table full"),
        }
    }
}

/// Rendezvous used to stop motion once an endstop fires.
pub trait TriggerSync {
    /// Resolves a trigger-sync object id.
    fn lookup(&self, oid: u8) -> Result<TrsyncId, TrsyncError>;

    /// Signals the trigger-sync with `reason`.
    fn do_trigger(&mut self, trsync: TrsyncId, reason: u8);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct TrsyncSlot {
    oid: u8,
    reason: Option<u8>,
}

/// Table of registered trigger-sync objects.
///
/// Only the first trigger after registration (or [`TrsyncTable::rearm`]) is
/// latched; later triggers are ignored.
#[derive(Clone, Debug, Default)]
pub struct TrsyncTable<const N: usize> {
    slots: Vec<TrsyncSlot, N>,
}

impl<const N: usize> TrsyncTable<N> {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Registers a trigger-sync object.
    pub fn register(&mut self, oid: u8) -> Result<TrsyncId, TrsyncError> {
        if self.slot(oid).is_some() {
            return Err(TrsyncError::AlreadyRegistered(oid));
        }
        self.slots
            .push(TrsyncSlot { oid, reason: None })
            .map_err(|_| TrsyncError::TableFull)?;
        Ok(TrsyncId(oid))
    }

    /// Clears a latched trigger so the object can fire again.
    pub fn rearm(&mut self, oid: u8) -> Result<(), TrsyncError> {
        let slot = self.slot_mut(oid).ok_or(TrsyncError::UnknownOid(oid))?;
        slot.reason = None;
        Ok(())
    }

    /// Reason latched by the first trigger, if any.
    #[must_use]
    pub fn trigger_reason(&self, oid: u8) -> Option<u8> {
        self.slot(oid).and_then(|slot| slot.reason)
    }

    fn slot(&self, oid: u8) -> Option<&TrsyncSlot> {
        self.slots.iter().find(|slot| slot.oid == oid)
    }

    fn slot_mut(&mut self, oid: u8) -> Option<&mut TrsyncSlot> {
        self.slots.iter_mut().find(|slot| slot.oid == oid)
    }
}

impl<const N: usize> TriggerSync for TrsyncTable<N> {
    fn lookup(&self, oid: u8) -> Result<TrsyncId, TrsyncError> {
        self.slot(oid)
            .map(|slot| TrsyncId(slot.oid))
            .ok_or(TrsyncError::UnknownOid(oid))
    }

    fn do_trigger(&mut self, trsync: TrsyncId, reason: u8) {
        if let Some(slot) = self.slot_mut(trsync.oid()) {
            if slot.reason.is_none() {
                slot.reason = Some(reason);
            }
        }
    }
}

/// Global shutdown request.
pub trait Shutdown {
    /// Requests an emergency shutdown; the first reason wins.
    fn try_shutdown(&mut self, reason: &'static str);
}

/// Latches the first shutdown request.
///
/// The latch stays set until [`ShutdownLatch::clear`]; later requests are
/// ignored, so the shutdown path runs once per shutdown.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ShutdownLatch {
    reason: Option<&'static str>,
    handled: bool,
}

impl ShutdownLatch {
    /// Creates a latch with no shutdown recorded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reason: None,
            handled: false,
        }
    }

    /// Returns `true` once a shutdown has been requested.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        self.reason.is_some()
    }

    /// Reason supplied with the first request.
    #[must_use]
    pub const fn reason(&self) -> Option<&'static str> {
        self.reason
    }

    /// Returns the reason of a shutdown not yet handed out, marking it
    /// handled.
    pub fn take_request(&mut self) -> Option<&'static str> {
        if self.handled {
            return None;
        }
        self.handled = self.reason.is_some();
        self.reason
    }

    /// Clears the latch after the host has acknowledged the shutdown.
    pub fn clear(&mut self) {
        self.reason = None;
        self.handled = false;
    }
}

impl Shutdown for ShutdownLatch {
    fn try_shutdown(&mut self, reason: &'static str) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
    }
}
