use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt::unwrap;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::adc::AdcChannel;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use heapless::Vec;

use analog_core::hal::{ShutdownLatch, TrsyncTable};
use analog_core::irq::IrqShared;
use analog_core::sched::TimerQueue;
use analog_core::{AnalogRuntime, Hardware, MAX_OBJECTS};

use crate::hw::BoardAdc;
use crate::link::{LinkLine, TriggerWatch};
use crate::status;
use crate::usb;

mod link_task;
mod report_task;
mod timer_task;
mod usb_task;

/// Trigger-sync objects the host may configure.
pub(super) const MAX_TRSYNCS: usize = 8;
const LINK_RX_DEPTH: usize = 4;
const LINK_TX_DEPTH: usize = 8;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(super) type BoardHardware =
    Hardware<BoardAdc, TimerQueue<MAX_OBJECTS>, TrsyncTable<MAX_TRSYNCS>, ShutdownLatch>;

/// Packet-sized chunk of host input.
pub(super) type LinkFrame = Vec<u8, { usb::MAX_PACKET_SIZE as usize }>;

/// USB link activity forwarded to the line session.
pub(super) enum LinkEvent {
    Connected,
    Disconnected,
    Data(LinkFrame),
}

pub(super) static RUNTIME: AnalogRuntime<u8> = AnalogRuntime::new();
pub(super) static HARDWARE: IrqShared<Option<BoardHardware>> = IrqShared::new(None);
pub(super) static TRIGGERS: IrqShared<TriggerWatch<MAX_TRSYNCS>> = IrqShared::new(TriggerWatch::new());

/// Raised when the earliest timer may have changed.
pub(super) static TIMER_WAKE: Signal<CriticalSectionRawMutex, ()> = Signal::new();
/// Raised after timers ran; the report task drains completed blocks.
pub(super) static REPORT_WAKE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

pub(super) static LINK_RX_QUEUE: Channel<CriticalSectionRawMutex, LinkEvent, LINK_RX_DEPTH> =
    Channel::new();
pub(super) static LINK_TX_QUEUE: Channel<CriticalSectionRawMutex, LinkLine, LINK_TX_DEPTH> =
    Channel::new();

/// Runs `f` with interrupts masked on the installed hardware.
pub(super) fn with_hardware<R>(f: impl FnOnce(&mut BoardHardware) -> R) -> Option<R> {
    HARDWARE.lock(|slot| slot.as_mut().map(f))
}

/// Stops every timer and runs the sampler shutdown hook.
pub(super) fn enter_shutdown(hw: &mut BoardHardware, reason: &'static str) {
    defmt::error!("shutdown: {}", reason);
    status::record_shutdown(reason);
    hw.sched.clear();
    if let Err(err) = RUNTIME.shutdown(&mut hw.adc, &mut hw.sched) {
        defmt::warn!("shutdown: sampler hook failed: {}", err);
    }
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        ADC1,
        PA0,
        PA1,
        PA4,
        PA5,
        PA6,
        PA7,
        PB0,
        PB1,
        USB,
        PA11,
        PA12,
        ..
    } = hal::init(config);

    let adc = BoardAdc::new(
        ADC1,
        [
            PA0.degrade_adc(),
            PA1.degrade_adc(),
            PA4.degrade_adc(),
            PA5.degrade_adc(),
            PA6.degrade_adc(),
            PA7.degrade_adc(),
            PB0.degrade_adc(),
            PB1.degrade_adc(),
        ],
    );
    HARDWARE.lock(|slot| {
        *slot = Some(Hardware {
            adc,
            sched: TimerQueue::new(),
            trsync: TrsyncTable::new(),
            shutdown: ShutdownLatch::new(),
        });
    });
    defmt::info!("analog runtime ready ({} objects)", MAX_OBJECTS);

    spawner.spawn(unwrap!(timer_task::run()));
    spawner.spawn(unwrap!(report_task::run()));
    spawner.spawn(unwrap!(link_task::run()));
    spawner.spawn(unwrap!(usb_task::run(USB, PA12, PA11)));

    core::future::pending::<()>().await;
}
