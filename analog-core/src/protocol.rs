//! Host command and report messages.
//!
//! Every message is described by a format string such as
//! `config_analog_in oid=%c pin=%u`. The format strings drive both decoding
//! of host command lines and rendering of reports, and fix the width of each
//! field: `%c` is 8 bits, `%hu` 16 bits and `%u` 32 bits.
//!
//! Lines use the `name key=value ...` form. Fields may appear in any order
//! but each one named by the format is required exactly once.

use core::fmt;

use winnow::ascii::{dec_uint, space1};
use winnow::combinator::{preceded, separated_pair};
use winnow::prelude::*;
use winnow::token::take_while;

use crate::analog_in::SamplerParams;
use crate::endstop::HomeParams;
use crate::objects::Oid;
use crate::sched::Ticks;

pub const CONFIG_ANALOG_IN: &str = "config_analog_in oid=%c pin=%u";
pub const QUERY_ANALOG_IN: &str = "query_analog_in oid=%c clock=%u sample_ticks=%u sample_count=%c rest_ticks=%u min_value=%hu max_value=%hu range_check_count=%c";
pub const CONFIG_ANALOG_ENDSTOP: &str = "config_analog_endstop oid=%c pin=%u";
pub const ANALOG_ENDSTOP_HOME: &str = "analog_endstop_home oid=%c clock=%u sample_ticks=%u oversample_count=%c rest_ticks=%u treshold=%u trsync_oid=%c trigger_reason=%c";
pub const ANALOG_ENDSTOP_QUERY_STATE: &str = "analog_endstop_query_state oid=%c";

pub const ANALOG_IN_STATE: &str = "analog_in_state oid=%c next_clock=%u value=%hu";
pub const ANALOG_ENDSTOP_STATE: &str =
    "analog_endstop_state oid=%c next_clock=%u pin_value=%u treshold=%u";

/// Commands accepted from the host.
pub const COMMAND_FORMATS: [&str; 5] = [
    CONFIG_ANALOG_IN,
    QUERY_ANALOG_IN,
    CONFIG_ANALOG_ENDSTOP,
    ANALOG_ENDSTOP_HOME,
    ANALOG_ENDSTOP_QUERY_STATE,
];

/// Largest field count of any message.
pub const MAX_ARGS: usize = 8;

/// Width of a message field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FieldKind {
    /// `%c`
    U8,
    /// `%hu`
    U16,
    /// `%u`
    U32,
}

impl FieldKind {
    fn from_spec(spec: &str) -> Option<Self> {
        match spec {
            "%c" => Some(Self::U8),
            "%hu" => Some(Self::U16),
            "%u" => Some(Self::U32),
            _ => None,
        }
    }

    /// Largest value the field can carry.
    #[must_use]
    pub fn max(self) -> u32 {
        match self {
            Self::U8 => u32::from(u8::MAX),
            Self::U16 => u32::from(u16::MAX),
            Self::U32 => u32::MAX,
        }
    }
}

/// One `name=%x` entry of a format string.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Message name of a format string.
#[must_use]
pub fn message_name(format: &'static str) -> &'static str {
    format.split_whitespace().next().unwrap_or(format)
}

/// Fields of a format string in declaration order.
pub fn message_fields(format: &'static str) -> impl Iterator<Item = Field> {
    format.split_whitespace().skip(1).filter_map(|token| {
        let (name, spec) = token.split_once('=')?;
        Some(Field {
            name,
            kind: FieldKind::from_spec(spec)?,
        })
    })
}

/// Errors raised while decoding a command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The line holds no message.
    Empty,
    /// The line is not `name key=value ...`.
    Syntax,
    /// No command carries the given name.
    UnknownCommand,
    /// The command has no field with the given key.
    UnknownField,
    /// A field was supplied twice.
    DuplicateField(&'static str),
    /// A required field was not supplied.
    MissingField(&'static str),
    /// A value does not fit the field width.
    OutOfRange(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => f.write_str("empty line"),
            DecodeError::Syntax => f.write_str("malformed message"),
            DecodeError::UnknownCommand => f.write_str("unknown command"),
            DecodeError::UnknownField => f.write_str("unknown field"),
            DecodeError::DuplicateField(name) => write!(f, "duplicate field `{name}`"),
            DecodeError::MissingField(name) => write!(f, "missing field `{name}`"),
            DecodeError::OutOfRange(name) => write!(f, "field `{name}` out of range"),
        }
    }
}

/// Decoded field values of one message, in format order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Args {
    format: &'static str,
    values: [u32; MAX_ARGS],
}

impl Args {
    /// Format string the values belong to.
    #[must_use]
    pub const fn format(&self) -> &'static str {
        self.format
    }

    /// Raw values in format order.
    #[must_use]
    pub fn values(&self) -> &[u32] {
        let count = message_fields(self.format).count();
        &self.values[..count]
    }

    fn get(&self, name: &'static str) -> Result<u32, DecodeError> {
        message_fields(self.format)
            .position(|field| field.name == name)
            .map(|index| self.values[index])
            .ok_or(DecodeError::MissingField(name))
    }

    fn u8(&self, name: &'static str) -> Result<u8, DecodeError> {
        u8::try_from(self.get(name)?).map_err(|_| DecodeError::OutOfRange(name))
    }

    fn u16(&self, name: &'static str) -> Result<u16, DecodeError> {
        u16::try_from(self.get(name)?).map_err(|_| DecodeError::OutOfRange(name))
    }

    fn u32(&self, name: &'static str) -> Result<u32, DecodeError> {
        self.get(name)
    }
}

fn identifier<'a>(input: &mut &'a str) -> winnow::Result<&'a str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

fn field<'a>(input: &mut &'a str) -> winnow::Result<(&'a str, u32)> {
    preceded(space1, separated_pair(identifier, '=', dec_uint)).parse_next(input)
}

/// Splits a line into its message name and the unparsed field text.
pub fn split_message(line: &str) -> Result<(&str, &str), DecodeError> {
    let mut input = line.trim();
    if input.is_empty() {
        return Err(DecodeError::Empty);
    }
    let name = identifier(&mut input).map_err(|_| DecodeError::Syntax)?;
    Ok((name, input))
}

/// Decodes the `key=value` fields following a message name.
pub fn decode_args(format: &'static str, mut input: &str) -> Result<Args, DecodeError> {
    let mut values = [0u32; MAX_ARGS];
    let mut seen = [false; MAX_ARGS];

    while !input.is_empty() {
        let (key, value) = field(&mut input).map_err(|_| DecodeError::Syntax)?;
        let (index, spec) = message_fields(format)
            .enumerate()
            .find(|(_, spec)| spec.name == key)
            .ok_or(DecodeError::UnknownField)?;
        if seen[index] {
            return Err(DecodeError::DuplicateField(spec.name));
        }
        if value > spec.kind.max() {
            return Err(DecodeError::OutOfRange(spec.name));
        }
        values[index] = value;
        seen[index] = true;
    }

    if let Some((_, missing)) = message_fields(format)
        .enumerate()
        .find(|(index, _)| !seen[*index])
    {
        return Err(DecodeError::MissingField(missing.name));
    }

    Ok(Args { format, values })
}

/// Writes `values` using `format`, one `name=value` pair per field.
pub fn write_message(f: &mut impl fmt::Write, format: &'static str, values: &[u32]) -> fmt::Result {
    f.write_str(message_name(format))?;
    for (field, value) in message_fields(format).zip(values) {
        write!(f, " {}={value}", field.name)?;
    }
    Ok(())
}

/// Command issued by the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    ConfigAnalogIn { oid: Oid, pin: u32 },
    QueryAnalogIn { oid: Oid, params: SamplerParams },
    ConfigAnalogEndstop { oid: Oid, pin: u32 },
    AnalogEndstopHome { oid: Oid, params: HomeParams },
    AnalogEndstopQueryState { oid: Oid },
}

impl Command {
    /// Decodes one command line.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let (name, rest) = split_message(line)?;
        let format = COMMAND_FORMATS
            .into_iter()
            .find(|format| message_name(*format) == name)
            .ok_or(DecodeError::UnknownCommand)?;
        Self::from_args(&decode_args(format, rest)?)
    }

    /// Builds a typed command from decoded values.
    pub fn from_args(args: &Args) -> Result<Self, DecodeError> {
        let oid = args.u8("oid")?;
        let command = match args.format() {
            CONFIG_ANALOG_IN => Command::ConfigAnalogIn {
                oid,
                pin: args.u32("pin")?,
            },
            QUERY_ANALOG_IN => Command::QueryAnalogIn {
                oid,
                params: SamplerParams {
                    clock: args.u32("clock")?,
                    sample_ticks: args.u32("sample_ticks")?,
                    sample_count: args.u8("sample_count")?,
                    rest_ticks: args.u32("rest_ticks")?,
                    min_value: args.u16("min_value")?,
                    max_value: args.u16("max_value")?,
                    range_check_count: args.u8("range_check_count")?,
                },
            },
            CONFIG_ANALOG_ENDSTOP => Command::ConfigAnalogEndstop {
                oid,
                pin: args.u32("pin")?,
            },
            ANALOG_ENDSTOP_HOME => Command::AnalogEndstopHome {
                oid,
                params: HomeParams {
                    clock: args.u32("clock")?,
                    sample_ticks: args.u32("sample_ticks")?,
                    oversample_count: args.u8("oversample_count")?,
                    rest_ticks: args.u32("rest_ticks")?,
                    // Readings are 16 bits wide; a larger level saturates instead of
                    // keeping only its low 16 bits, so it can never be reached.
                    threshold: u16::try_from(args.u32("treshold")?).unwrap_or(u16::MAX),
                    trsync_oid: args.u8("trsync_oid")?,
                    trigger_reason: args.u8("trigger_reason")?,
                },
            },
            ANALOG_ENDSTOP_QUERY_STATE => Command::AnalogEndstopQueryState { oid },
            _ => return Err(DecodeError::UnknownCommand),
        };
        Ok(command)
    }

    /// Object id the command addresses.
    #[must_use]
    pub const fn oid(&self) -> Oid {
        match self {
            Command::ConfigAnalogIn { oid, .. }
            | Command::QueryAnalogIn { oid, .. }
            | Command::ConfigAnalogEndstop { oid, .. }
            | Command::AnalogEndstopHome { oid, .. }
            | Command::AnalogEndstopQueryState { oid } => *oid,
        }
    }

    /// Format string of the command.
    #[must_use]
    pub const fn format(&self) -> &'static str {
        match self {
            Command::ConfigAnalogIn { .. } => CONFIG_ANALOG_IN,
            Command::QueryAnalogIn { .. } => QUERY_ANALOG_IN,
            Command::ConfigAnalogEndstop { .. } => CONFIG_ANALOG_ENDSTOP,
            Command::AnalogEndstopHome { .. } => ANALOG_ENDSTOP_HOME,
            Command::AnalogEndstopQueryState { .. } => ANALOG_ENDSTOP_QUERY_STATE,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Command::ConfigAnalogIn { oid, pin } | Command::ConfigAnalogEndstop { oid, pin } => {
                write_message(f, self.format(), &[u32::from(oid), pin])
            }
            Command::QueryAnalogIn { oid, params } => write_message(
                f,
                QUERY_ANALOG_IN,
                &[
                    u32::from(oid),
                    params.clock,
                    params.sample_ticks,
                    u32::from(params.sample_count),
                    params.rest_ticks,
                    u32::from(params.min_value),
                    u32::from(params.max_value),
                    u32::from(params.range_check_count),
                ],
            ),
            Command::AnalogEndstopHome { oid, params } => write_message(
                f,
                ANALOG_ENDSTOP_HOME,
                &[
                    u32::from(oid),
                    params.clock,
                    params.sample_ticks,
                    u32::from(params.oversample_count),
                    params.rest_ticks,
                    u32::from(params.threshold),
                    u32::from(params.trsync_oid),
                    u32::from(params.trigger_reason),
                ],
            ),
            Command::AnalogEndstopQueryState { oid } => {
                write_message(f, ANALOG_ENDSTOP_QUERY_STATE, &[u32::from(oid)])
            }
        }
    }
}

/// Report sent to the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Report {
    AnalogInState {
        oid: Oid,
        next_clock: Ticks,
        value: u16,
    },
    AnalogEndstopState {
        oid: Oid,
        next_clock: Ticks,
        pin_value: u16,
        threshold: u16,
    },
}

impl Report {
    /// Object id the report describes.
    #[must_use]
    pub const fn oid(&self) -> Oid {
        match self {
            Report::AnalogInState { oid, .. } | Report::AnalogEndstopState { oid, .. } => *oid,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Report::AnalogInState {
                oid,
                next_clock,
                value,
            } => write_message(
                f,
                ANALOG_IN_STATE,
                &[u32::from(oid), next_clock, u32::from(value)],
            ),
            Report::AnalogEndstopState {
                oid,
                next_clock,
                pin_value,
                threshold,
            } => write_message(
                f,
                ANALOG_ENDSTOP_STATE,
                &[
                    u32::from(oid),
                    next_clock,
                    u32::from(pin_value),
                    u32::from(threshold),
                ],
            ),
        }
    }
}

/// Destination for reports.
pub trait ReportSink {
    fn send(&mut self, report: Report);
}
