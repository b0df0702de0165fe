//! The per-port driver: installation, the blocking send/receive surface and
//! the timing configuration. One [DmxDriver] owns one UART.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use critical_section::Mutex;

use crate::consts::{
    BREAK_LEN_US, DMX_BAUD, DMX_MAX_PACKET_SIZE, MAB_LEN_US, MAX_PORTS, READ_TIMEOUT_MS,
    WRITE_MIN_BREAK_LEN_US, WRITE_MIN_MAB_LEN_US, WRITE_TIMEOUT_MS,
};
use crate::hal::{BusTimer, DmxPlatform, FrameNotifier, InterruptFlags, TxSemaphore, UartHal};
use crate::interrupts::{Framer, PortFlags};
use crate::types::{baud_rate_is_valid, DmxError};
use crate::unique_identifier::UniqueIdentifier;

/// Ports already claimed by a driver, one bit each.
static INSTALLED_PORTS: AtomicU8 = AtomicU8::new(0);

/// RX inactivity timeout in word times before the FIFO is serviced.
const DEFAULT_RX_TIMEOUT_THRESHOLD: u8 = 2;
/// Bytes in the RX FIFO before the full interrupt fires.
const DEFAULT_RXFIFO_FULL_THRESHOLD: u8 = 120;
/// Bytes left in the TX FIFO before the empty interrupt fires.
const DEFAULT_TXFIFO_EMPTY_THRESHOLD: u8 = 8;

/// Identifies one physical UART.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortId(u8);

impl PortId {
    pub fn new(port: u8) -> Result<Self, DmxError> {
        if (port as usize) < MAX_PORTS {
            Ok(Self(port))
        } else {
            Err(DmxError::InvalidArg)
        }
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// The RDM port id field, numbered from one.
    pub fn rdm_port_id(&self) -> u8 {
        self.0 + 1
    }
}

/// Install-time configuration.
#[derive(Copy, Clone, Debug)]
pub struct DmxConfig {
    pub baud_rate: u32,
    pub break_len_us: u32,
    pub mab_len_us: u32,
    /// ESTA manufacturer id used when the UID is derived from the MAC.
    pub manufacturer_id: u16,
}

impl Default for DmxConfig {
    fn default() -> Self {
        Self {
            baud_rate: DMX_BAUD,
            break_len_us: BREAK_LEN_US,
            mab_len_us: MAB_LEN_US,
            // prototyping id
            manufacturer_id: 0x7FF0,
        }
    }
}

/// A received frame: its length and the timestamp of its last slot.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceivedFrame {
    pub size: usize,
    pub timestamp_us: i64,
}

/// The driver for one DMX port.
///
/// All methods take `&self`; the record is shared with the interrupt
/// handlers through atomics and a short critical section, never a blocking
/// lock.
pub struct DmxDriver<P: DmxPlatform> {
    port: PortId,
    manufacturer_id: u16,
    flags: PortFlags,
    framer: Mutex<RefCell<Framer<P>>>,
    notifier: P::Notifier,
    tx_done: P::TxDone,
    /// Zero until the UID is first derived or set.
    uid: AtomicU64,
    has_sent: AtomicBool,
}

impl<P: DmxPlatform> DmxDriver<P> {
    /// Installs a driver on `port`. The UART is configured for DMX and
    /// receive interrupts are enabled. Fails hard when the port already has
    /// a driver installed.
    pub fn install(
        port: PortId,
        mut uart: P::Uart,
        timer: P::Timer,
        notifier: P::Notifier,
        tx_done: P::TxDone,
        config: &DmxConfig,
    ) -> Result<Self, DmxError> {
        if !baud_rate_is_valid(config.baud_rate) || config.manufacturer_id == u16::MAX {
            return Err(DmxError::InvalidArg);
        }

        let port_bit = 1u8 << port.index();
        if INSTALLED_PORTS.fetch_or(port_bit, Ordering::AcqRel) & port_bit != 0 {
            return Err(DmxError::InvalidArg);
        }

        uart.init(config.baud_rate);
        uart.set_rx_timeout_threshold(DEFAULT_RX_TIMEOUT_THRESHOLD);
        uart.set_rxfifo_full_threshold(DEFAULT_RXFIFO_FULL_THRESHOLD);
        uart.set_txfifo_empty_threshold(DEFAULT_TXFIFO_EMPTY_THRESHOLD);
        uart.rxfifo_reset();
        uart.txfifo_reset();
        uart.enable_interrupt(InterruptFlags::RX_ALL);

        Ok(Self {
            port,
            manufacturer_id: config.manufacturer_id,
            flags: PortFlags::new(),
            framer: Mutex::new(RefCell::new(Framer::new(
                uart,
                timer,
                config.break_len_us.max(WRITE_MIN_BREAK_LEN_US),
                config.mab_len_us.max(WRITE_MIN_MAB_LEN_US),
            ))),
            notifier,
            tx_done,
            uid: AtomicU64::new(0),
            has_sent: AtomicBool::new(false),
        })
    }

    /// Releases the port for a later install.
    pub fn uninstall(self) {}

    pub fn port(&self) -> PortId {
        self.port
    }

    /// Call from the UART interrupt handler of this port.
    pub fn on_uart_interrupt(&self) {
        let now = P::now_us();
        critical_section::with(|cs| {
            self.framer.borrow_ref_mut(cs).service_uart(
                &self.flags,
                &self.notifier,
                &self.tx_done,
                now,
            );
        });
    }

    /// Call from the break/mark-after-break alarm of this port.
    pub fn on_timer_alarm(&self) {
        critical_section::with(|cs| {
            self.framer.borrow_ref_mut(cs).service_timer(&self.flags);
        });
    }

    /// Blocks until a whole frame is in the buffer, then copies it to
    /// `destination`. Bytes that arrive while nobody is waiting are
    /// dropped.
    pub fn receive(
        &self,
        destination: &mut [u8],
        timeout_ms: u32,
    ) -> Result<ReceivedFrame, DmxError> {
        self.notifier.clear();
        self.flags.waiter_armed.store(true, Ordering::Release);

        let status = self.notifier.wait(timeout_ms);
        self.flags.waiter_armed.store(false, Ordering::Release);

        let status = match status {
            Some(status) => status,
            None => {
                self.flags.is_busy.store(false, Ordering::Release);
                return Err(DmxError::Timeout);
            },
        };
        status.into_result()?;

        Ok(critical_section::with(|cs| {
            let framer = self.framer.borrow_ref(cs);
            let size = framer.size.min(destination.len());
            destination[..size].copy_from_slice(&framer.buffer[..size]);

            ReceivedFrame {
                size,
                timestamp_us: framer.last_received_ts,
            }
        }))
    }

    /// Blocks with the receive watchdog timeout.
    pub fn receive_default(&self, destination: &mut [u8]) -> Result<ReceivedFrame, DmxError> {
        self.receive(destination, READ_TIMEOUT_MS)
    }

    /// Starts transmitting a frame behind a break and mark-after-break.
    /// Returns as soon as the break begins; use [DmxDriver::wait_sent] or
    /// [DmxDriver::send_and_wait] to block until the last slot is out.
    pub fn send(&self, frame: &[u8]) -> Result<(), DmxError> {
        if frame.is_empty() || frame.len() > DMX_MAX_PACKET_SIZE {
            return Err(DmxError::InvalidArg);
        }

        self.has_sent.store(true, Ordering::Release);
        critical_section::with(|cs| {
            self.framer
                .borrow_ref_mut(cs)
                .begin_send(&self.flags, frame);
        });

        Ok(())
    }

    /// Transmits a frame with no break, as the DISC_UNIQUE_BRANCH response
    /// demands.
    pub fn send_without_break(&self, frame: &[u8]) -> Result<(), DmxError> {
        if frame.is_empty() || frame.len() > DMX_MAX_PACKET_SIZE {
            return Err(DmxError::InvalidArg);
        }

        self.has_sent.store(true, Ordering::Release);
        critical_section::with(|cs| {
            self.framer
                .borrow_ref_mut(cs)
                .begin_send_without_break(&self.flags, frame);
        });

        Ok(())
    }

    /// Blocks until the in-flight frame has left the wire.
    pub fn wait_sent(&self, timeout_ms: u32) -> Result<(), DmxError> {
        if self.tx_done.take(timeout_ms) {
            Ok(())
        } else {
            self.flags.is_busy.store(false, Ordering::Release);
            Err(DmxError::Timeout)
        }
    }

    /// [DmxDriver::send] followed by [DmxDriver::wait_sent] with the
    /// transmit watchdog.
    pub fn send_and_wait(&self, frame: &[u8]) -> Result<(), DmxError> {
        self.send(frame)?;
        self.wait_sent(WRITE_TIMEOUT_MS)
    }

    pub fn is_busy(&self) -> bool {
        self.flags.is_busy.load(Ordering::Acquire)
    }

    pub fn is_in_break(&self) -> bool {
        self.flags.is_in_break.load(Ordering::Acquire)
    }

    /// The frame cursor and observed frame length, for diagnostics.
    /// `head <= size <= 513` holds at any observable point.
    pub fn frame_cursor(&self) -> (usize, usize) {
        critical_section::with(|cs| {
            let framer = self.framer.borrow_ref(cs);
            (framer.head, framer.size)
        })
    }

    /// Timestamp of the last received slot, monotonic microseconds.
    pub fn last_received_ts(&self) -> i64 {
        critical_section::with(|cs| self.framer.borrow_ref(cs).last_received_ts)
    }

    /// Timestamp of the end of the last transmitted frame.
    pub fn last_sent_ts(&self) -> i64 {
        critical_section::with(|cs| self.framer.borrow_ref(cs).last_sent_ts)
    }

    /// Reconfigures the transmitted break, clamped to the permitted
    /// minimum.
    pub fn set_break_len(&self, break_len_us: u32) {
        critical_section::with(|cs| {
            self.framer.borrow_ref_mut(cs).break_len_us =
                break_len_us.max(WRITE_MIN_BREAK_LEN_US);
        });
    }

    /// Reconfigures the transmitted mark-after-break, clamped to the
    /// permitted minimum.
    pub fn set_mab_len(&self, mab_len_us: u32) {
        critical_section::with(|cs| {
            self.framer.borrow_ref_mut(cs).mab_len_us = mab_len_us.max(WRITE_MIN_MAB_LEN_US);
        });
    }

    /// The device UID, derived from the MAC address on first use.
    pub fn uid(&self) -> UniqueIdentifier {
        let current = self.uid.load(Ordering::Acquire);
        if current != 0 {
            // Top 16 bits are always zero for a device UID.
            return UniqueIdentifier::try_from(current).unwrap()
        }

        let mac = P::mac_address();
        let device_id = u32::from_be_bytes(mac[2..6].try_into().unwrap());
        let uid = UniqueIdentifier::new(self.manufacturer_id, device_id)
            .unwrap_or_else(|_| UniqueIdentifier::new(self.manufacturer_id, 1).unwrap());

        self.uid.store(uid.into(), Ordering::Release);
        uid
    }

    /// Overrides the derived UID. Permitted only before the first
    /// transmit.
    pub fn set_uid(&self, uid: UniqueIdentifier) -> Result<(), DmxError> {
        if self.has_sent.load(Ordering::Acquire) {
            return Err(DmxError::InvalidArg);
        }

        self.uid.store(uid.into(), Ordering::Release);
        Ok(())
    }
}

impl<P: DmxPlatform> Drop for DmxDriver<P> {
    fn drop(&mut self) {
        critical_section::with(|cs| {
            let mut framer = self.framer.borrow_ref_mut(cs);
            framer.uart.disable_interrupt(InterruptFlags::ALL);
            framer.timer.pause();
        });

        INSTALLED_PORTS.fetch_and(!(1u8 << self.port.index()), Ordering::AcqRel);
    }
}
