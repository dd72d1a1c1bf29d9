use core::fmt::Write;

use super::{LINK_RX_QUEUE, LINK_TX_QUEUE, LinkEvent, RUNTIME, TIMER_WAKE, TRIGGERS, with_hardware};
use crate::link::{LineHandler, LinkError, LinkLine, LinkSession, execute_line};
use crate::status;

/// Executes host lines against the shared runtime.
struct FirmwareHandler;

impl LineHandler for FirmwareHandler {
    fn handle_line(&mut self, line: &str, reply: &mut LinkLine) {
        if line == "status" {
            let _ = write!(reply, "{}", status::snapshot());
            status::record_command(false);
            return;
        }

        let shutdown = status::shutdown_reason();
        let handled = with_hardware(|hw| {
            TRIGGERS.lock(|triggers| execute_line(&RUNTIME, hw, triggers, shutdown, line, reply));
        });
        if handled.is_none() {
            reply.clear();
            let _ = reply.write_str("ERR hardware not ready");
        }

        let failed = reply.starts_with("ERR");
        if failed {
            defmt::warn!("link: {} -> {}", line, reply.as_str());
        }
        status::record_command(failed);
        TIMER_WAKE.signal(());
    }
}

#[embassy_executor::task]
pub async fn run() -> ! {
    let rx = LINK_RX_QUEUE.receiver();
    let tx = LINK_TX_QUEUE.sender();
    let mut session = LinkSession::new(FirmwareHandler);

    loop {
        match rx.receive().await {
            LinkEvent::Connected => session.on_connect(),
            LinkEvent::Disconnected => session.on_disconnect(),
            LinkEvent::Data(frame) => {
                for byte in frame {
                    match session.ingest(byte) {
                        Ok(Some(reply)) => tx.send(reply).await,
                        Ok(None) => {}
                        Err(err) => {
                            let mut reply = LinkLine::new();
                            let _ = match err {
                                LinkError::LineOverflow => reply.write_str("ERR line too long"),
                                LinkError::InvalidUtf8 => reply.write_str("ERR invalid utf-8"),
                            };
                            status::record_command(true);
                            tx.send(reply).await;
                        }
                    }
                }
            }
        }
    }
}
