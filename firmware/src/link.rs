//! Line-oriented host link.
//!
//! The USB CDC interface carries one text command per line. [`LinkSession`]
//! assembles lines from raw bytes and hands each one to a [`LineHandler`];
//! [`execute_line`] is the handler body shared by the firmware and the host
//! tests: it runs link-level commands (`config_trsync`, `trsync_rearm`) and
//! forwards everything else to the [`AnalogRuntime`].

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use core::fmt::Write;
use core::str;

use analog_core::hal::{AdcDriver, Shutdown, TrsyncTable};
use analog_core::protocol::{decode_args, split_message};
use analog_core::sched::Scheduler;
use analog_core::{AnalogRuntime, CommandError, Hardware};
use heapless::{String, Vec};

/// Maximum number of bytes accepted on a single line (excluding terminator).
pub const MAX_LINE_LEN: usize = 160;

/// Text line travelling over the link in either direction.
pub type LinkLine = String<MAX_LINE_LEN>;

const CONFIG_TRSYNC: &str = "config_trsync oid=%c";
const TRSYNC_REARM: &str = "trsync_rearm oid=%c";

/// Errors surfaced while assembling a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkError {
    /// Encountered non-UTF-8 data in the assembled line buffer.
    InvalidUtf8,
    /// Input exceeded [`MAX_LINE_LEN`]; the rest of the line is dropped.
    LineOverflow,
}

/// Consumer of complete lines.
pub trait LineHandler {
    /// Handles `line`, writing the single-line answer into `reply`.
    fn handle_line(&mut self, line: &str, reply: &mut LinkLine);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SessionState {
    Disconnected,
    Connected,
    Discarding,
}

/// Line assembly state for the host link.
pub struct LinkSession<H> {
    handler: H,
    buffer: Vec<u8, MAX_LINE_LEN>,
    state: SessionState,
}

impl<H: LineHandler> LinkSession<H> {
    pub const fn new(handler: H) -> Self {
        Self {
            handler,
            buffer: Vec::new(),
            state: SessionState::Disconnected,
        }
    }

    /// Marks the transport as connected (host asserted DTR).
    pub fn on_connect(&mut self) {
        self.state = SessionState::Connected;
        self.buffer.clear();
    }

    /// Marks the transport as disconnected.
    pub fn on_disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.buffer.clear();
    }

    /// Feeds one byte; a line terminator yields the handler's reply.
    pub fn ingest(&mut self, byte: u8) -> Result<Option<LinkLine>, LinkError> {
        match (self.state, byte) {
            (SessionState::Disconnected, _) => Ok(None),
            (SessionState::Discarding, b'\r' | b'\n') => {
                self.state = SessionState::Connected;
                Ok(None)
            }
            (SessionState::Discarding, _) => Ok(None),
            (SessionState::Connected, b'\r' | b'\n') => self.process_line(),
            (SessionState::Connected, 0x08 | 0x7f) => {
                self.buffer.pop();
                Ok(None)
            }
            (SessionState::Connected, value) => {
                if self.buffer.push(value).is_err() {
                    self.buffer.clear();
                    self.state = SessionState::Discarding;
                    return Err(LinkError::LineOverflow);
                }
                Ok(None)
            }
        }
    }

    fn process_line(&mut self) -> Result<Option<LinkLine>, LinkError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let result = match str::from_utf8(self.buffer.as_slice()) {
            Ok(line) => {
                let mut reply = LinkLine::new();
                self.handler.handle_line(line.trim(), &mut reply);
                Ok(Some(reply))
            }
            Err(_) => Err(LinkError::InvalidUtf8),
        };
        self.buffer.clear();
        result
    }
}

/// Trigger-sync objects the host configured, with announce bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct TriggerWatch<const M: usize> {
    entries: Vec<(u8, bool), M>,
}

impl<const M: usize> TriggerWatch<M> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn track(&mut self, oid: u8) {
        match self.entries.iter_mut().find(|(known, _)| *known == oid) {
            Some(entry) => entry.1 = false,
            None => {
                let _ = self.entries.push((oid, false));
            }
        }
    }

    /// Reports each trigger latched since the last poll exactly once.
    pub fn poll(&mut self, table: &TrsyncTable<M>, mut announce: impl FnMut(u8, u8)) {
        for (oid, announced) in &mut self.entries {
            if *announced {
                continue;
            }
            if let Some(reason) = table.trigger_reason(*oid) {
                *announced = true;
                announce(*oid, reason);
            }
        }
    }
}

/// Formats the `trsync_state` line announcing a trigger.
pub fn trigger_line(oid: u8, reason: u8) -> LinkLine {
    let mut line = LinkLine::new();
    let _ = write!(line, "trsync_state oid={oid} triggered reason={reason}");
    line
}

/// Executes one host line against the runtime.
///
/// Replies with the immediate report, `ok`, or `ERR <detail>`. Every command
/// is refused once `shutdown` carries a reason.
pub fn execute_line<P, A, S, X, const N: usize, const M: usize>(
    runtime: &AnalogRuntime<P, N>,
    hw: &mut Hardware<A, S, TrsyncTable<M>, X>,
    triggers: &mut TriggerWatch<M>,
    shutdown: Option<&'static str>,
    line: &str,
    reply: &mut LinkLine,
) where
    P: Copy,
    A: AdcDriver<Pin = P>,
    S: Scheduler,
    X: Shutdown,
{
    reply.clear();
    if let Some(reason) = shutdown {
        let _ = write!(reply, "ERR shutdown {reason}");
        return;
    }

    if let Some(result) = execute_trsync(hw, triggers, line) {
        match result {
            Ok(()) => {
                let _ = reply.write_str("ok");
            }
            Err(err) => {
                let _ = write!(reply, "ERR {err}");
            }
        }
        return;
    }

    let _ = match runtime.dispatch_line(line, hw) {
        Ok(Some(report)) => write!(reply, "{report}"),
        Ok(None) => reply.write_str("ok"),
        Err(err) => write!(reply, "ERR {err}"),
    };
}

fn execute_trsync<A, S, X, const M: usize>(
    hw: &mut Hardware<A, S, TrsyncTable<M>, X>,
    triggers: &mut TriggerWatch<M>,
    line: &str,
) -> Option<Result<(), CommandError>> {
    let (name, rest) = split_message(line).ok()?;
    let format = [CONFIG_TRSYNC, TRSYNC_REARM]
        .into_iter()
        .find(|format| format.split_whitespace().next() == Some(name))?;

    let result = decode_args(format, rest)
        .map_err(CommandError::from)
        .and_then(|args| {
            let oid = u8::try_from(args.values()[0]).unwrap_or(u8::MAX);
            if format == CONFIG_TRSYNC {
                hw.trsync.register(oid)?;
            } else {
                hw.trsync.rearm(oid)?;
            }
            triggers.track(oid);
            Ok(())
        });
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use analog_core::hal::{AdcError, ShutdownLatch};
    use analog_core::sched::{Ticks, TimerQueue};

    #[derive(Default)]
    struct RecordingHandler {
        lines: std::vec::Vec<std::string::String>,
    }

    impl LineHandler for RecordingHandler {
        fn handle_line(&mut self, line: &str, reply: &mut LinkLine) {
            self.lines.push(line.to_string());
            let _ = reply.write_str("ok");
        }
    }

    struct LevelAdc(u16);

    impl AdcDriver for LevelAdc {
        type Pin = u8;

        fn setup(&mut self, pin: u32) -> Result<u8, AdcError> {
            u8::try_from(pin)
                .ok()
                .filter(|pin| *pin < 4)
                .ok_or(AdcError::InvalidPin(pin))
        }

        fn sample(&mut self, _pin: u8) -> Ticks {
            0
        }

        fn read(&mut self, _pin: u8) -> u16 {
            self.0
        }

        fn cancel_sample(&mut self, _pin: u8) {}
    }

    type TestHardware = Hardware<LevelAdc, TimerQueue<4>, TrsyncTable<2>, ShutdownLatch>;

    fn hardware(level: u16) -> TestHardware {
        Hardware {
            adc: LevelAdc(level),
            sched: TimerQueue::new(),
            trsync: TrsyncTable::new(),
            shutdown: ShutdownLatch::new(),
        }
    }

    fn feed<H: LineHandler>(session: &mut LinkSession<H>, bytes: &[u8]) -> std::vec::Vec<LinkLine> {
        bytes
            .iter()
            .filter_map(|byte| session.ingest(*byte).expect("ingest"))
            .collect()
    }

    #[test]
    fn session_routes_complete_lines() {
        let mut session = LinkSession::new(RecordingHandler::default());
        session.on_connect();

        let replies = feed(&mut session, b"first\r\n\nsecond line\n");
        assert_eq!(replies.len(), 2);
        assert_eq!(session.handler.lines, ["first", "second line"]);
    }

    #[test]
    fn bytes_are_ignored_until_connected() {
        let mut session = LinkSession::new(RecordingHandler::default());
        assert!(feed(&mut session, b"dropped\n").is_empty());
        assert!(session.handler.lines.is_empty());
    }

    #[test]
    fn overflow_discards_the_rest_of_the_line() {
        let mut session = LinkSession::new(RecordingHandler::default());
        session.on_connect();

        for _ in 0..MAX_LINE_LEN {
            session.ingest(b'a').expect("within limit");
        }
        assert_eq!(session.ingest(b'b'), Err(LinkError::LineOverflow));
        assert_eq!(session.ingest(b'c'), Ok(None));
        assert_eq!(session.ingest(b'\n'), Ok(None));

        let replies = feed(&mut session, b"next\n");
        assert_eq!(replies.len(), 1);
        assert_eq!(session.handler.lines, ["next"]);
    }

    #[test]
    fn backspace_edits_the_buffer() {
        let mut session = LinkSession::new(RecordingHandler::default());
        session.on_connect();
        feed(&mut session, b"statz\x08us\n");
        assert_eq!(session.handler.lines, ["status"]);
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut session = LinkSession::new(RecordingHandler::default());
        session.on_connect();
        session.ingest(0xff).expect("buffered");
        assert_eq!(session.ingest(b'\n'), Err(LinkError::InvalidUtf8));
    }

    #[test]
    fn commands_reach_the_runtime() {
        let runtime: AnalogRuntime<u8, 4> = AnalogRuntime::new();
        let mut hw = hardware(812);
        let mut triggers = TriggerWatch::<2>::new();
        let mut reply = LinkLine::new();

        execute_line(
            &runtime,
            &mut hw,
            &mut triggers,
            None,
            "config_analog_endstop oid=1 pin=2",
            &mut reply,
        );
        assert_eq!(reply.as_str(), "ok");

        execute_line(
            &runtime,
            &mut hw,
            &mut triggers,
            None,
            "analog_endstop_query_state oid=1",
            &mut reply,
        );
        assert_eq!(
            reply.as_str(),
            "analog_endstop_state oid=1 next_clock=0 pin_value=812 treshold=0"
        );

        execute_line(
            &runtime,
            &mut hw,
            &mut triggers,
            None,
            "config_analog_in oid=2 pin=9",
            &mut reply,
        );
        assert_eq!(reply.as_str(), "ERR adc: pin 9 is not an ADC input");
    }

    #[test]
    fn shutdown_refuses_commands() {
        let runtime: AnalogRuntime<u8, 4> = AnalogRuntime::new();
        let mut hw = hardware(0);
        let mut triggers = TriggerWatch::<2>::new();
        let mut reply = LinkLine::new();

        execute_line(
            &runtime,
            &mut hw,
            &mut triggers,
            Some("ADC out of range"),
            "config_analog_in oid=0 pin=1",
            &mut reply,
        );
        assert_eq!(reply.as_str(), "ERR shutdown ADC out of range");
        assert!(runtime.oids().is_empty());
    }

    #[test]
    fn trsync_commands_register_and_announce_once() {
        let runtime: AnalogRuntime<u8, 4> = AnalogRuntime::new();
        let mut hw = hardware(0);
        let mut triggers = TriggerWatch::<2>::new();
        let mut reply = LinkLine::new();

        execute_line(&runtime, &mut hw, &mut triggers, None, "config_trsync oid=7", &mut reply);
        assert_eq!(reply.as_str(), "ok");
        execute_line(&runtime, &mut hw, &mut triggers, None, "config_trsync oid=7", &mut reply);
        assert_eq!(reply.as_str(), "ERR trsync: trsync oid 7 already registered");

        let id = analog_core::hal::TriggerSync::lookup(&hw.trsync, 7).expect("registered");
        analog_core::hal::TriggerSync::do_trigger(&mut hw.trsync, id, 3);

        let mut seen = std::vec::Vec::new();
        triggers.poll(&hw.trsync, |oid, reason| seen.push(trigger_line(oid, reason)));
        triggers.poll(&hw.trsync, |oid, reason| seen.push(trigger_line(oid, reason)));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_str(), "trsync_state oid=7 triggered reason=3");

        execute_line(&runtime, &mut hw, &mut triggers, None, "trsync_rearm oid=7", &mut reply);
        assert_eq!(reply.as_str(), "ok");
        assert_eq!(hw.trsync.trigger_reason(7), None);
    }
}
