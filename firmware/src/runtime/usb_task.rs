use embassy_futures::join::join;
use embassy_futures::select::{Either3, select3};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_usb::class::cdc_acm::{ControlChanged, Receiver, Sender};
use embassy_usb::driver::EndpointError;
use static_cell::StaticCell;

use super::{LINK_RX_QUEUE, LINK_TX_QUEUE, LinkEvent, LinkFrame};
use crate::link::LinkLine;
use crate::status;
use crate::usb::{self, UsbDeviceStrings};

const PACKET_LEN: usize = usb::MAX_PACKET_SIZE as usize;

static USB_STORAGE: StaticCell<usb::UsbDeviceStorage> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UsbIrqs {
    USB_UCPD1_2 => embassy_stm32::usb::InterruptHandler<hal::peripherals::USB>;
});

#[embassy_executor::task]
pub async fn run(
    usb: Peri<'static, hal::peripherals::USB>,
    dp: Peri<'static, hal::peripherals::PA12>,
    dm: Peri<'static, hal::peripherals::PA11>,
) -> ! {
    let storage = USB_STORAGE.init(usb::UsbDeviceStorage::new());
    let driver = embassy_stm32::usb::Driver::new(usb, UsbIrqs, dp, dm);

    let usb::UsbLink { mut device, link } =
        usb::UsbLink::new(driver, storage, UsbDeviceStrings::default());
    let usb::CdcAcmHandle {
        sender,
        receiver,
        control,
    } = link;

    join(device.run(), run_link_interface(sender, receiver, control)).await;
    loop {
        core::future::pending::<()>().await;
    }
}

async fn run_link_interface<D>(
    mut sender: Sender<'static, D>,
    mut receiver: Receiver<'static, D>,
    control: ControlChanged<'static>,
) -> !
where
    D: embassy_usb::driver::Driver<'static>,
{
    let rx_queue = LINK_RX_QUEUE.sender();
    let tx_queue = LINK_TX_QUEUE.receiver();
    let mut ingress = [0u8; PACKET_LEN];
    let mut pending_tx: Option<LinkLine> = None;

    loop {
        join(receiver.wait_connection(), sender.wait_connection()).await;
        wait_for_dtr(&control, &mut sender).await;
        pending_tx.take();

        defmt::info!("usb: host link connected");
        status::set_link_attached(true);
        rx_queue.send(LinkEvent::Connected).await;

        loop {
            match select3(
                receiver.read_packet(&mut ingress),
                async {
                    if pending_tx.is_none() {
                        pending_tx = Some(tx_queue.receive().await);
                    }
                    if let Some(line) = pending_tx.as_ref() {
                        write_line(&mut sender, line).await?;
                    }
                    pending_tx = None;
                    Ok::<(), EndpointError>(())
                },
                control.control_changed(),
            )
            .await
            {
                Either3::First(Ok(count)) => {
                    if count == 0 {
                        continue;
                    }

                    let mut frame = LinkFrame::new();
                    if frame.extend_from_slice(&ingress[..count]).is_err() {
                        defmt::warn!("usb: dropping link frame len={} (overflow)", count);
                        continue;
                    }

                    rx_queue.send(LinkEvent::Data(frame)).await;
                }
                Either3::First(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: link interface disabled");
                    break;
                }
                Either3::First(Err(_)) => {
                    defmt::warn!("usb: link read error");
                }
                Either3::Second(Ok(())) => {}
                Either3::Second(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: link write disabled");
                    break;
                }
                Either3::Second(Err(_)) => {
                    defmt::warn!("usb: link write error");
                }
                Either3::Third(()) => {
                    if !sender.dtr() {
                        defmt::warn!("usb: host dropped DTR");
                        pending_tx.take();
                        break;
                    }
                }
            }
        }

        status::set_link_attached(false);
        rx_queue.send(LinkEvent::Disconnected).await;
    }
}

/// Writes `line` plus a newline, split into full-speed packets.
async fn write_line<D>(sender: &mut Sender<'static, D>, line: &LinkLine) -> Result<(), EndpointError>
where
    D: embassy_usb::driver::Driver<'static>,
{
    let mut packet = [0u8; PACKET_LEN];
    let mut len = 0;

    for byte in line.as_bytes().iter().copied().chain(core::iter::once(b'\n')) {
        packet[len] = byte;
        len += 1;
        if len == PACKET_LEN {
            sender.write_packet(&packet).await?;
            len = 0;
        }
    }

    // A short (possibly empty) packet terminates the transfer.
    sender.write_packet(&packet[..len]).await
}

async fn wait_for_dtr<D>(control: &ControlChanged<'static>, sender: &mut Sender<'static, D>)
where
    D: embassy_usb::driver::Driver<'static>,
{
    while !sender.dtr() {
        control.control_changed().await;
    }
}
