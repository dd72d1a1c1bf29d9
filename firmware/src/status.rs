#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Shared status storage for the firmware target.
//!
//! Lightweight atomics count link traffic and track the USB link so the host
//! `status` command can render a [`StatusSnapshot`] without touching the
//! runtime. The shutdown reason lives here too: once set, every host command
//! is refused.

use core::fmt;

use analog_core::irq::IrqShared;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

/// Host commands executed (including rejected ones).
static COMMANDS: AtomicU32 = AtomicU32::new(0);
/// Host commands answered with `ERR`.
static COMMAND_ERRORS: AtomicU32 = AtomicU32::new(0);
/// Sampler and trigger reports queued to the host.
static REPORTS: AtomicU32 = AtomicU32::new(0);
/// Tracks whether the USB link is attached (DTR asserted).
static LINK_ATTACHED: AtomicBool = AtomicBool::new(false);
/// First shutdown reason since boot.
static SHUTDOWN_REASON: IrqShared<Option<&'static str>> = IrqShared::new(None);

/// Counts one executed host command.
pub fn record_command(failed: bool) {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
    if failed {
        COMMAND_ERRORS.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts reports handed to the link.
pub fn record_reports(count: usize) {
    let count = u32::try_from(count).unwrap_or(u32::MAX);
    REPORTS.fetch_add(count, Ordering::Relaxed);
}

/// Updates the cached link attachment flag.
pub fn set_link_attached(attached: bool) {
    LINK_ATTACHED.store(attached, Ordering::Relaxed);
}

/// Records a shutdown; the first reason is kept.
pub fn record_shutdown(reason: &'static str) {
    SHUTDOWN_REASON.lock(|stored| {
        stored.get_or_insert(reason);
    });
}

/// Reason of the shutdown in effect, if any.
pub fn shutdown_reason() -> Option<&'static str> {
    SHUTDOWN_REASON.lock(|stored| *stored)
}

/// Point-in-time copy of the status counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    pub commands: u32,
    pub command_errors: u32,
    pub reports: u32,
    pub link_attached: bool,
    pub shutdown: Option<&'static str>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status commands={} errors={} reports={} link={} shutdown={}",
            self.commands,
            self.command_errors,
            self.reports,
            if self.link_attached { "up" } else { "down" },
            self.shutdown.unwrap_or("no")
        )
    }
}

/// Builds a [`StatusSnapshot`] from the stored counters.
pub fn snapshot() -> StatusSnapshot {
    StatusSnapshot {
        commands: COMMANDS.load(Ordering::Relaxed),
        command_errors: COMMAND_ERRORS.load(Ordering::Relaxed),
        reports: REPORTS.load(Ordering::Relaxed),
        link_attached: LINK_ATTACHED.load(Ordering::Relaxed),
        shutdown: shutdown_reason(),
    }
}
