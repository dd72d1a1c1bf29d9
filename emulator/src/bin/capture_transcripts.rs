use std::io;
use std::path::PathBuf;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{EmulatorConfig, Session};

#[derive(Clone, Copy, Debug)]
enum Scenario {
    Sampler,
    RangeShutdown,
    Endstop,
    Calibrate,
}

impl Scenario {
    const ALL: [Scenario; 4] = [
        Scenario::Sampler,
        Scenario::RangeShutdown,
        Scenario::Endstop,
        Scenario::Calibrate,
    ];

    fn tag(self) -> &'static str {
        match self {
            Scenario::Sampler => "sampler",
            Scenario::RangeShutdown => "range-shutdown",
            Scenario::Endstop => "endstop",
            Scenario::Calibrate => "calibrate",
        }
    }

    fn script(self) -> &'static [&'static str] {
        match self {
            Scenario::Sampler => &[
                "config_analog_in oid=0 pin=3",
                "adc pin=3 value=1200",
                "query_analog_in oid=0 clock=1000 sample_ticks=50 sample_count=8 rest_ticks=10000 min_value=0 max_value=65535 range_check_count=4",
                "advance ticks=35000",
                "adc pin=3 value=1800",
                "advance ticks=10000",
                "status",
            ],
            Scenario::RangeShutdown => &[
                "config_analog_in oid=1 pin=5",
                "adc pin=5 value=2000",
                "query_analog_in oid=1 clock=0 sample_ticks=10 sample_count=4 rest_ticks=1000 min_value=1000 max_value=12000 range_check_count=3",
                "advance ticks=2500",
                "adc pin=5 value=3500",
                "advance ticks=5000",
                "config_analog_in oid=2 pin=6",
                "clear_shutdown",
                "status",
            ],
            Scenario::Endstop => &[
                "trsync oid=9",
                "config_analog_endstop oid=4 pin=0",
                "adc pin=0 value=1000",
                "analog_endstop_home oid=4 clock=500 sample_ticks=20 oversample_count=1 rest_ticks=200 treshold=1600 trsync_oid=9 trigger_reason=1",
                "advance ticks=4000",
                "spike pin=0 value=3000 count=3",
                "advance ticks=4000",
                "status",
                "adc pin=0 value=2500",
                "advance ticks=4000",
                "analog_endstop_query_state oid=4",
            ],
            Scenario::Calibrate => &[
                "config_analog_endstop oid=2 pin=7",
                "adc pin=7 value=1450",
                "calibrate oid=2 samples=256 offset=300",
            ],
        }
    }

    fn config(self) -> EmulatorConfig {
        let noise = match self {
            Scenario::Calibrate | Scenario::Endstop => 40,
            Scenario::Sampler | Scenario::RangeShutdown => 0,
        };
        EmulatorConfig {
            transcript: Some(PathBuf::from(format!("transcripts/{}.log", self.tag()))),
            noise,
            adc_delay: 2,
        }
    }
}

fn main() -> io::Result<()> {
    for scenario in Scenario::ALL {
        record(scenario)?;
    }
    Ok(())
}

fn record(scenario: Scenario) -> io::Result<()> {
    let mut session = Session::new(&scenario.config())?;
    for line in scenario.script() {
        let _ = session.handle_command(line)?;
    }
    println!("recorded {}", scenario.tag());
    Ok(())
}
