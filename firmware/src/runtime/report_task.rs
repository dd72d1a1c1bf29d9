use core::fmt::Write;

use analog_core::MAX_OBJECTS;
use analog_core::protocol::{Report, ReportSink};
use heapless::Vec;

use super::{LINK_TX_QUEUE, MAX_TRSYNCS, REPORT_WAKE, RUNTIME, TRIGGERS, with_hardware};
use crate::link::{LinkLine, trigger_line};
use crate::status;

/// Completed sampler blocks, gathered with interrupts masked per claim.
struct PendingReports(Vec<Report, MAX_OBJECTS>);

impl ReportSink for PendingReports {
    fn send(&mut self, report: Report) {
        if self.0.push(report).is_err() {
            defmt::warn!("report: queue full");
        }
    }
}

#[embassy_executor::task]
pub async fn run() -> ! {
    let tx = LINK_TX_QUEUE.sender();

    loop {
        REPORT_WAKE.wait().await;

        let mut reports = PendingReports(Vec::new());
        RUNTIME.analog_in_task(&mut reports);

        let mut triggers: Vec<LinkLine, MAX_TRSYNCS> = Vec::new();
        with_hardware(|hw| {
            TRIGGERS.lock(|watch| {
                watch.poll(&hw.trsync, |oid, reason| {
                    defmt::info!("trsync: oid {} triggered reason {}", oid, reason);
                    let _ = triggers.push(trigger_line(oid, reason));
                });
            });
        });

        status::record_reports(reports.0.len() + triggers.len());
        for report in reports.0 {
            let mut line = LinkLine::new();
            if write!(line, "{report}").is_ok() {
                tx.send(line).await;
            }
        }
        for line in triggers {
            tx.send(line).await;
        }
    }
}
