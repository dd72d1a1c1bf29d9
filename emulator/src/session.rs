use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use analog_core::baseline::{BaselineEstimator, DEFAULT_BASELINE_SAMPLES};
use analog_core::endstop::EndstopPhase;
use analog_core::hal::{AdcDriver, AdcError, Shutdown, ShutdownLatch, TrsyncTable};
use analog_core::protocol::{Report, ReportSink, decode_args, split_message};
use analog_core::sched::{Scheduler, Ticks, TimerAction, TimerId, TimerQueue, is_before};
use analog_core::{AdcObject, AnalogRuntime, CommandError, Hardware, MAX_OBJECTS};

pub const MAX_TRSYNCS: usize = 8;
pub const ADC_CHANNELS: usize = 16;

const ADVANCE: &str = "advance ticks=%u";
const SET_ADC: &str = "adc pin=%u value=%hu";
const SPIKE: &str = "spike pin=%u value=%hu count=%u";
const TRSYNC: &str = "trsync oid=%c";
const TRSYNC_REARM: &str = "trsync_rearm oid=%c";
const CALIBRATE: &str = "calibrate oid=%c samples=%u offset=%hu";

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "config_analog_in",
        "config_analog_in oid=<n> pin=<n>                 - bind a sampler",
    ),
    (
        "query_analog_in",
        "query_analog_in oid= clock= sample_ticks= sample_count= rest_ticks= min_value= max_value= range_check_count=",
    ),
    (
        "config_analog_endstop",
        "config_analog_endstop oid=<n> pin=<n>            - bind an endstop",
    ),
    (
        "analog_endstop_home",
        "analog_endstop_home oid= clock= sample_ticks= oversample_count= rest_ticks= treshold= trsync_oid= trigger_reason=",
    ),
    (
        "analog_endstop_query_state",
        "analog_endstop_query_state oid=<n>               - read an endstop pin",
    ),
    (
        "advance",
        "advance ticks=<n>                                - run the clock forward",
    ),
    (
        "adc",
        "adc pin=<n> value=<n>                            - set a simulated input level",
    ),
    (
        "spike",
        "spike pin=<n> value=<n> count=<n>                - override the next readings",
    ),
    (
        "trsync",
        "trsync oid=<n> | trsync_rearm oid=<n>            - manage trigger-sync objects",
    ),
    (
        "calibrate",
        "calibrate oid=<n> samples=<n> offset=<n>         - measure an endstop resting level",
    ),
    (
        "shutdown",
        "shutdown | clear_shutdown                        - force or clear a shutdown",
    ),
    (
        "status",
        "status                                           - list objects and timers",
    ),
];

/// Command-line options.
#[derive(Clone, Debug, Default)]
pub struct EmulatorConfig {
    pub transcript: Option<PathBuf>,
    /// Peak-to-peak noise added to every reading.
    pub noise: u16,
    /// Ticks a conversion stays busy after being started.
    pub adc_delay: Ticks,
}

#[derive(Clone, Copy, Debug, Default)]
struct SimChannel {
    level: u16,
    spike_value: u16,
    spike_remaining: u32,
    converting: bool,
}

/// ADC with settable per-pin levels, optional noise and conversion delay.
#[derive(Debug)]
pub struct SimAdc {
    channels: [SimChannel; ADC_CHANNELS],
    noise: u16,
    conversion_ticks: Ticks,
    rng: u32,
}

impl SimAdc {
    pub fn new(noise: u16, conversion_ticks: Ticks) -> Self {
        Self {
            channels: [SimChannel::default(); ADC_CHANNELS],
            noise,
            conversion_ticks,
            rng: 0x2545_f491,
        }
    }

    fn channel(&mut self, pin: u32) -> Result<&mut SimChannel, AdcError> {
        usize::try_from(pin)
            .ok()
            .and_then(|index| self.channels.get_mut(index))
            .ok_or(AdcError::InvalidPin(pin))
    }

    pub fn set_level(&mut self, pin: u32, level: u16) -> Result<(), AdcError> {
        self.channel(pin)?.level = level;
        Ok(())
    }

    pub fn spike(&mut self, pin: u32, value: u16, count: u32) -> Result<(), AdcError> {
        let channel = self.channel(pin)?;
        channel.spike_value = value;
        channel.spike_remaining = count;
        Ok(())
    }

    fn next_noise(&mut self) -> i32 {
        if self.noise == 0 {
            return 0;
        }
        // xorshift32
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 17;
        self.rng ^= self.rng << 5;
        let span = u32::from(self.noise) + 1;
        let offset = i32::try_from(self.rng % span).unwrap_or(0);
        offset - i32::from(self.noise / 2)
    }
}

impl AdcDriver for SimAdc {
    type Pin = u8;

    fn setup(&mut self, pin: u32) -> Result<u8, AdcError> {
        self.channel(pin)?;
        u8::try_from(pin).map_err(|_| AdcError::InvalidPin(pin))
    }

    fn sample(&mut self, pin: u8) -> Ticks {
        let delay = self.conversion_ticks;
        let channel = &mut self.channels[usize::from(pin)];
        if delay == 0 || channel.converting {
            channel.converting = false;
            return 0;
        }
        channel.converting = true;
        delay
    }

    fn read(&mut self, pin: u8) -> u16 {
        let noise = self.next_noise();
        let channel = &mut self.channels[usize::from(pin)];
        let base = if channel.spike_remaining > 0 {
            channel.spike_remaining -= 1;
            channel.spike_value
        } else {
            channel.level
        };
        let noisy = i32::from(base) + noise;
        u16::try_from(noisy.clamp(0, i32::from(u16::MAX))).unwrap_or(u16::MAX)
    }

    fn cancel_sample(&mut self, pin: u8) {
        self.channels[usize::from(pin)].converting = false;
    }
}

type SimHardware = Hardware<SimAdc, TimerQueue<MAX_OBJECTS>, TrsyncTable<MAX_TRSYNCS>, ShutdownLatch>;

#[derive(Default)]
struct LineSink(Vec<String>);

impl ReportSink for LineSink {
    fn send(&mut self, report: Report) {
        self.0.push(report.to_string());
    }
}

pub struct Session {
    runtime: AnalogRuntime<u8>,
    hw: SimHardware,
    now: Ticks,
    transcript: Option<TranscriptLogger>,
    announced_triggers: [bool; MAX_TRSYNCS],
    trsync_oids: Vec<u8>,
    command_count: usize,
}

impl Session {
    pub fn new(config: &EmulatorConfig) -> io::Result<Self> {
        let transcript = match &config.transcript {
            Some(path) => Some(TranscriptLogger::new(path)?),
            None => None,
        };

        Ok(Self {
            runtime: AnalogRuntime::new(),
            hw: Hardware {
                adc: SimAdc::new(config.noise, config.adc_delay),
                sched: TimerQueue::new(),
                trsync: TrsyncTable::new(),
                shutdown: ShutdownLatch::new(),
            },
            now: 0,
            transcript,
            announced_triggers: [false; MAX_TRSYNCS],
            trsync_oids: Vec::new(),
            command_count: 0,
        })
    }

    /// Current simulated clock.
    pub fn now(&self) -> Ticks {
        self.now
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        self.command_count += 1;
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.append_line(self.now, TranscriptRole::Host, trimmed)?;
        }

        let lines = self.execute(trimmed);
        if let Some(transcript) = self.transcript.as_mut() {
            for output in &lines {
                transcript.append_line(self.now, TranscriptRole::Emulator, output)?;
            }
        }
        Ok(lines)
    }

    fn execute(&mut self, line: &str) -> Vec<String> {
        if line.eq_ignore_ascii_case("help") {
            return help_lines(None);
        }
        if let Some(topic) = line.strip_prefix("help ") {
            return help_lines(Some(topic.trim()));
        }
        if line == "status" {
            return self.status_lines();
        }
        if line == "shutdown" {
            if let Some(reason) = self.hw.shutdown.reason() {
                return vec![format!("already shut down: {reason}")];
            }
            self.hw.shutdown.try_shutdown("Shutdown requested by host");
            return self.handle_shutdown();
        }
        if line == "clear_shutdown" {
            let Some(reason) = self.hw.shutdown.reason() else {
                return vec!["not shut down".to_string()];
            };
            self.hw.shutdown.clear();
            return vec![format!("shutdown cleared (was: {reason})")];
        }

        match self.execute_local(line) {
            Some(Ok(lines)) => lines,
            Some(Err(message)) => vec![format!("ERR {message}")],
            None => self.execute_mcu(line),
        }
    }

    fn execute_local(&mut self, line: &str) -> Option<Result<Vec<String>, String>> {
        let (name, rest) = split_message(line).ok()?;
        let format = [ADVANCE, SET_ADC, SPIKE, TRSYNC, TRSYNC_REARM, CALIBRATE]
            .into_iter()
            .find(|format| format.split_whitespace().next() == Some(name))?;
        let args = match decode_args(format, rest) {
            Ok(args) => args,
            Err(err) => return Some(Err(format!("syntax {err}"))),
        };
        let values = args.values();

        let result = match format {
            ADVANCE => Ok(self.advance(values[0])),
            SET_ADC => self
                .hw
                .adc
                .set_level(values[0], narrow(values[1]))
                .map(|()| vec![format!("pin {} level {}", values[0], values[1])])
                .map_err(|err| format!("adc {err}")),
            SPIKE => self
                .hw
                .adc
                .spike(values[0], narrow(values[1]), values[2])
                .map(|()| vec![format!("pin {} spike {} x{}", values[0], values[1], values[2])])
                .map_err(|err| format!("adc {err}")),
            TRSYNC => self.register_trsync(narrow(values[0])),
            TRSYNC_REARM => self.rearm_trsync(narrow(values[0])),
            CALIBRATE => {
                self.calibrate(narrow(values[0]), values[1], narrow(values[2]))
            }
            _ => Err("unsupported".to_string()),
        };
        Some(result)
    }

    fn execute_mcu(&mut self, line: &str) -> Vec<String> {
        if let Some(reason) = self.hw.shutdown.reason() {
            return vec![format!("ERR shutdown {reason}")];
        }
        match self.runtime.dispatch_line(line, &mut self.hw) {
            Ok(Some(report)) => vec![report.to_string()],
            Ok(None) => vec!["ok".to_string()],
            Err(err) => vec![describe_error(&err)],
        }
    }

    /// Runs every timer due in the next `ticks`, then the reporting task.
    pub fn advance(&mut self, ticks: Ticks) -> Vec<String> {
        let until = self.now.wrapping_add(ticks);
        let mut lines = Vec::new();
        let mut sink = LineSink::default();

        while let Some(next) = self.hw.sched.next_wake() {
            if is_before(until, next) {
                break;
            }
            let Some((id, waketime)) = self.hw.sched.pop_due(next) else {
                break;
            };
            self.now = waketime;
            if let TimerAction::Reschedule(at) = self.runtime.run_timer(id, &mut self.hw) {
                if let Err(err) = self.hw.sched.add_timer(id, at) {
                    lines.push(format!("ERR schedule oid={} {err}", id.oid()));
                }
            }
            lines.extend(self.announce_triggers());
            lines.extend(self.handle_shutdown());
            self.runtime.analog_in_task(&mut sink);
            lines.append(&mut sink.0);
        }

        self.now = until;
        lines.push(format!("clock={}", self.now));
        lines
    }

    fn announce_triggers(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for (slot, &oid) in self.trsync_oids.iter().enumerate() {
            if self.announced_triggers[slot] {
                continue;
            }
            if let Some(reason) = self.hw.trsync.trigger_reason(oid) {
                self.announced_triggers[slot] = true;
                lines.push(format!(
                    "trsync_state oid={oid} triggered reason={reason} clock={}",
                    self.now
                ));
            }
        }
        lines
    }

    /// Stops every timer, then runs the shutdown hook; only the first call
    /// after a shutdown request does anything.
    fn handle_shutdown(&mut self) -> Vec<String> {
        let Some(reason) = self.hw.shutdown.take_request() else {
            return Vec::new();
        };
        self.hw.sched.clear();
        let mut lines = vec![format!("shutdown clock={} reason=\"{reason}\"", self.now)];
        if let Err(err) = self.runtime.shutdown(&mut self.hw.adc, &mut self.hw.sched) {
            lines.push(describe_error(&err));
        }
        lines
    }

    fn register_trsync(&mut self, oid: u8) -> Result<Vec<String>, String> {
        self.hw
            .trsync
            .register(oid)
            .map_err(|err| format!("trsync {err}"))?;
        self.trsync_oids.push(oid);
        Ok(vec![format!("trsync oid={oid} registered")])
    }

    fn rearm_trsync(&mut self, oid: u8) -> Result<Vec<String>, String> {
        self.hw
            .trsync
            .rearm(oid)
            .map_err(|err| format!("trsync {err}"))?;
        if let Some(slot) = self.trsync_oids.iter().position(|&known| known == oid) {
            self.announced_triggers[slot] = false;
        }
        Ok(vec![format!("trsync oid={oid} rearmed")])
    }

    fn calibrate(&mut self, oid: u8, samples: u32, offset: u16) -> Result<Vec<String>, String> {
        let mut estimator = BaselineEstimator::<DEFAULT_BASELINE_SAMPLES>::new();
        for _ in 0..samples {
            let report = self
                .runtime
                .analog_endstop_query_state(oid, &mut self.hw.adc)
                .map_err(|err| describe_error(&err))?;
            let Report::AnalogEndstopState { pin_value, .. } = report else {
                return Err("unexpected report".to_string());
            };
            if !estimator.push(pin_value) {
                break;
            }
        }

        let baseline = estimator
            .finish()
            .ok_or_else(|| "calibrate needs at least two samples".to_string())?;
        Ok(vec![
            format!(
                "baseline oid={oid} samples={} min={} q1={:.2} median={:.2} q3={:.2} max={}",
                estimator.len(),
                baseline.min,
                baseline.q1,
                baseline.median,
                baseline.q3,
                baseline.max
            ),
            format!(
                "baseline oid={oid} level={} treshold={}",
                baseline.level(),
                baseline.threshold(offset)
            ),
        ])
    }

    fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "clock={} commands={} timers={} shutdown={}",
            self.now,
            self.command_count,
            self.hw.sched.len(),
            self.hw.shutdown.reason().unwrap_or("no")
        )];
        for oid in self.runtime.oids() {
            let armed = self
                .hw
                .sched
                .waketime(TimerId::for_oid(oid))
                .map_or_else(|| "-".to_string(), |at| at.to_string());
            let detail = self.runtime.inspect(oid, |object| match object {
                AdcObject::AnalogIn(sampler) => format!(
                    "analog_in pin={} state={}/{} invalid={} next_begin={}",
                    sampler.pin(),
                    sampler.state(),
                    sampler.sample_count(),
                    sampler.invalid_count(),
                    sampler.next_begin_time()
                ),
                AdcObject::Endstop(endstop) => format!(
                    "analog_endstop pin={} phase={} treshold={} filtered={} window={}/{}",
                    endstop.pin(),
                    phase_label(endstop.phase()),
                    endstop.threshold(),
                    endstop.value(),
                    endstop.filter().len(),
                    endstop.filter().capacity()
                ),
            });
            if let Ok(detail) = detail {
                lines.push(format!("  oid={oid} {detail} armed={armed}"));
            }
        }
        lines
    }
}

fn narrow<T: TryFrom<u32> + Default>(value: u32) -> T {
    T::try_from(value).unwrap_or_default()
}

fn phase_label(phase: EndstopPhase) -> &'static str {
    match phase {
        EndstopPhase::Idle => "idle",
        EndstopPhase::Sampling => "sampling",
        EndstopPhase::Oversampling => "oversampling",
        EndstopPhase::Triggered => "triggered",
    }
}

fn describe_error(error: &CommandError) -> String {
    format!("ERR {error}")
}

fn help_lines(topic: Option<&str>) -> Vec<String> {
    match topic {
        None => {
            let names: Vec<&str> = HELP_TOPICS.iter().map(|(name, _)| *name).collect();
            vec![
                format!("Commands: {}", names.join(", ")),
                "Type `help <command>` for details.".to_string(),
            ]
        }
        Some(topic) => match HELP_TOPICS.iter().find(|(name, _)| *name == topic) {
            Some((_, text)) => vec![(*text).to_string()],
            None => vec![format!("ERR unknown help topic `{topic}`")],
        },
    }
}

struct TranscriptLogger {
    writer: BufWriter<File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        logger.write_header()?;
        Ok(logger)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "# Analog emulator transcript")?;
        writeln!(self.writer, "# clock is in simulated MCU ticks")?;
        self.writer.flush()
    }

    fn append_line(&mut self, clock: Ticks, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[{clock:>10}] {} {line}", role.prefix())?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&EmulatorConfig::default()).expect("session")
    }

    fn run(session: &mut Session, line: &str) -> Vec<String> {
        session.handle_command(line).expect("command")
    }

    #[test]
    fn sampler_reports_through_advance() {
        let mut session = session();
        assert_eq!(run(&mut session, "config_analog_in oid=0 pin=2"), ["ok"]);
        run(&mut session, "adc pin=2 value=300");
        run(
            &mut session,
            "query_analog_in oid=0 clock=100 sample_ticks=10 sample_count=2 rest_ticks=1000 \
             min_value=0 max_value=1000 range_check_count=1",
        );

        let lines = run(&mut session, "advance ticks=200");
        assert_eq!(
            lines,
            [
                "analog_in_state oid=0 next_clock=1100 value=600",
                "clock=200"
            ]
        );
    }

    #[test]
    fn endstop_trigger_is_announced_once() {
        let mut session = session();
        run(&mut session, "trsync oid=1");
        run(&mut session, "config_analog_endstop oid=3 pin=0");
        run(&mut session, "adc pin=0 value=4000");
        run(
            &mut session,
            "analog_endstop_home oid=3 clock=0 sample_ticks=10 oversample_count=4 \
             rest_ticks=100 treshold=2000 trsync_oid=1 trigger_reason=7",
        );

        let lines = run(&mut session, "advance ticks=5000");
        assert_eq!(
            lines,
            ["trsync_state oid=1 triggered reason=7 clock=1260", "clock=5000"]
        );
        assert_eq!(run(&mut session, "advance ticks=5000"), ["clock=10000"]);
    }

    #[test]
    fn range_failure_shuts_down_and_blocks_commands() {
        let mut session = session();
        run(&mut session, "config_analog_in oid=0 pin=1");
        run(&mut session, "adc pin=1 value=900");
        run(
            &mut session,
            "query_analog_in oid=0 clock=0 sample_ticks=1 sample_count=1 rest_ticks=100 \
             min_value=0 max_value=500 range_check_count=1",
        );

        let lines = run(&mut session, "advance ticks=0");
        assert_eq!(lines[0], "shutdown clock=0 reason=\"ADC out of range\"");
        assert_eq!(
            run(&mut session, "config_analog_in oid=1 pin=2"),
            ["ERR shutdown ADC out of range"]
        );
        run(&mut session, "clear_shutdown");
        assert_eq!(run(&mut session, "config_analog_in oid=1 pin=2"), ["ok"]);
    }

    #[test]
    fn sampler_keeps_reporting_after_range_shutdown() {
        let mut session = session();
        run(&mut session, "config_analog_in oid=0 pin=1");
        run(&mut session, "adc pin=1 value=900");
        run(
            &mut session,
            "query_analog_in oid=0 clock=0 sample_ticks=1 sample_count=1 rest_ticks=100 \
             min_value=0 max_value=500 range_check_count=1",
        );

        let lines = run(&mut session, "advance ticks=500");
        assert_eq!(
            lines,
            [
                "shutdown clock=0 reason=\"ADC out of range\"",
                "analog_in_state oid=0 next_clock=300 value=900",
                "analog_in_state oid=0 next_clock=400 value=900",
                "analog_in_state oid=0 next_clock=500 value=900",
                "analog_in_state oid=0 next_clock=600 value=900",
                "clock=500",
            ]
        );
        assert_eq!(
            run(&mut session, "shutdown"),
            ["already shut down: ADC out of range"]
        );
    }

    #[test]
    fn shutdown_idles_a_homing_endstop() {
        let mut session = session();
        run(&mut session, "trsync oid=1");
        run(&mut session, "config_analog_endstop oid=3 pin=0");
        run(
            &mut session,
            "analog_endstop_home oid=3 clock=0 sample_ticks=10 oversample_count=4 \
             rest_ticks=100 treshold=2000 trsync_oid=1 trigger_reason=7",
        );
        run(&mut session, "advance ticks=250");

        let lines = run(&mut session, "shutdown");
        assert_eq!(lines, ["shutdown clock=250 reason=\"Shutdown requested by host\""]);
        let status = run(&mut session, "status");
        assert!(status[0].ends_with("timers=0 shutdown=Shutdown requested by host"));
        assert!(status[1].contains("phase=idle"));
        assert!(status[1].ends_with("armed=-"));
    }

    #[test]
    fn calibrate_reports_baseline() {
        let mut session = session();
        run(&mut session, "config_analog_endstop oid=0 pin=4");
        run(&mut session, "adc pin=4 value=1500");
        let lines = run(&mut session, "calibrate oid=0 samples=16 offset=200");
        assert_eq!(lines[1], "baseline oid=0 level=1500 treshold=1700");
    }

    #[test]
    fn errors_are_prefixed() {
        let mut session = session();
        assert_eq!(
            run(&mut session, "analog_endstop_query_state oid=9"),
            ["ERR object: oid 9 not configured"]
        );
        assert_eq!(
            run(&mut session, "config_analog_in oid=0 pin=40"),
            ["ERR adc: pin 40 is not an ADC input"]
        );
        assert_eq!(run(&mut session, "advance"), ["ERR syntax missing field `ticks`"]);
    }
}
