//! Hardware abstraction consumed by the framer. These traits are the only
//! path to peripheral registers; the engine itself never touches hardware.
//!
//! Implementations of [UartHal] and [BusTimer] methods that run in interrupt
//! context must be placed so that no cache miss can occur there (IRAM or
//! equivalent tightly-coupled memory on parts that have it).

use crate::types::FrameStatus;

/// UART interrupt sources, as a mask.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterruptFlags(pub u32);

impl InterruptFlags {
    pub const NONE: Self = Self(0);
    /// The receive FIFO overflowed.
    pub const RX_FIFO_OVERFLOW: Self = Self(1 << 0);
    /// Framing, parity or RS-485 frame error on a received slot.
    pub const RX_FRAMING_ERR: Self = Self(1 << 1);
    /// A break was detected on the receive line.
    pub const RX_BREAK: Self = Self(1 << 2);
    /// The receive FIFO reached its full threshold.
    pub const RX_FIFO_FULL: Self = Self(1 << 3);
    /// The receive line idled past the timeout threshold.
    pub const RX_TIMEOUT: Self = Self(1 << 4);
    /// Another transmitter drove the bus while we did.
    pub const RX_CLASH: Self = Self(1 << 5);
    /// The transmit FIFO drained to its empty threshold.
    pub const TX_DATA: Self = Self(1 << 6);
    /// The transmitter finished the last stop bit.
    pub const TX_DONE: Self = Self(1 << 7);

    /// Time to service the receive FIFO.
    pub const RX_DATA: Self = Self(Self::RX_FIFO_FULL.0 | Self::RX_TIMEOUT.0);
    pub const RX_ALL: Self = Self(
        Self::RX_FIFO_OVERFLOW.0
            | Self::RX_FRAMING_ERR.0
            | Self::RX_BREAK.0
            | Self::RX_DATA.0
            | Self::RX_CLASH.0,
    );
    pub const TX_ALL: Self = Self(Self::TX_DATA.0 | Self::TX_DONE.0);
    pub const ALL: Self = Self(u32::MAX);

    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for InterruptFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for InterruptFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// RS-485 transceiver direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusDirection {
    Rx,
    Tx,
}

/// Register-level access to one RS-485 capable UART.
///
/// `init` must configure the port for DMX: the requested baud rate (250 000
/// by default), 8 data bits, no parity, 2 stop bits, RS-485 half-duplex,
/// hardware flow control off and a TX idle time of zero.
pub trait UartHal {
    fn init(&mut self, baud_rate: u32);

    fn interrupt_status(&mut self) -> InterruptFlags;
    fn enable_interrupt(&mut self, mask: InterruptFlags);
    fn disable_interrupt(&mut self, mask: InterruptFlags);
    fn clear_interrupt(&mut self, mask: InterruptFlags);

    /// Drains up to `buffer.len()` bytes from the receive FIFO.
    /// Returns the number of bytes read.
    fn read_rxfifo(&mut self, buffer: &mut [u8]) -> usize;
    /// Pushes up to `buffer.len()` bytes into the transmit FIFO.
    /// Returns the number of bytes written.
    fn write_txfifo(&mut self, buffer: &[u8]) -> usize;
    fn rxfifo_reset(&mut self);
    fn txfifo_reset(&mut self);

    fn set_rts(&mut self, direction: BusDirection);
    /// Inverts or un-inverts the TX line; inversion holds the line low for
    /// break generation.
    fn invert_tx_signal(&mut self, invert: bool);

    fn set_baud_rate(&mut self, baud_rate: u32);
    /// RX inactivity timeout, in word times.
    fn rx_timeout_threshold(&self) -> u8;
    fn set_rx_timeout_threshold(&mut self, threshold: u8);
    fn set_rxfifo_full_threshold(&mut self, threshold: u8);
    fn set_txfifo_empty_threshold(&mut self, threshold: u8);
}

/// One-shot hardware alarm used to time the transmitted break and
/// mark-after-break.
pub trait BusTimer {
    /// Arms the alarm `delay_us` from now and starts the timer.
    fn start(&mut self, delay_us: u32);
    /// Re-arms the alarm from interrupt context.
    fn set_alarm(&mut self, delay_us: u32);
    /// Stops the timer without firing.
    fn pause(&mut self);
}

/// The single-slot notification a task blocks on while a frame is in
/// flight. `signal` runs in interrupt context and must overwrite any value
/// that has not been consumed yet; the most recent status wins.
pub trait FrameNotifier {
    fn signal(&self, status: FrameStatus);
    /// Blocks until a status arrives or `timeout_ms` expires.
    fn wait(&self, timeout_ms: u32) -> Option<FrameStatus>;
    /// Discards any stale status before arming a new wait.
    fn clear(&self);
}

/// Binary semaphore released by the TX done interrupt.
pub trait TxSemaphore {
    fn give(&self);
    /// Blocks until the semaphore is given or `timeout_ms` expires.
    fn take(&self, timeout_ms: u32) -> bool;
}

/// Non-volatile backend for persisted parameters. Entries are keyed by
/// `(sub_device, pid)`.
pub trait Nvs {
    /// Loads a stored value into `buffer`. Returns the stored size, or
    /// `None` when the key is absent.
    fn load(&mut self, sub_device: u16, pid: u16, buffer: &mut [u8]) -> Option<usize>;
    /// Stores a value. Returns false when the backend rejects the write.
    fn store(&mut self, sub_device: u16, pid: u16, value: &[u8]) -> bool;
}

/// Keeps persisted parameters in RAM only. For responders without real
/// non-volatile storage and for tests.
#[derive(Default)]
pub struct NoopNvs;

impl Nvs for NoopNvs {
    fn load(&mut self, _sub_device: u16, _pid: u16, _buffer: &mut [u8]) -> Option<usize> {
        None
    }

    fn store(&mut self, _sub_device: u16, _pid: u16, _value: &[u8]) -> bool {
        true
    }
}

/// The hardware bundle a port runs on.
pub trait DmxPlatform {
    type Uart: UartHal;
    type Timer: BusTimer;
    type Notifier: FrameNotifier;
    type TxDone: TxSemaphore;
    type Nvs: Nvs;

    /// Monotonic microsecond clock.
    fn now_us() -> i64;

    /// Factory-programmed MAC address, used to derive the device UID.
    fn mac_address() -> [u8; 6];
}
