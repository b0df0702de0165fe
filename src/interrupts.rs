//! The interrupt-resident half of the driver: translates UART interrupts
//! into whole frames and runs the transmit state machine
//! (break, mark-after-break, data, idle).
//!
//! Everything here runs to completion inside an interrupt handler. No
//! blocking, no allocation, no calls outside the HAL; the only way out is
//! the frame notification and the transmit-done semaphore.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::{DMX_MAX_PACKET_SIZE, DMX_NULL_START, SC_RDM, WORD_TIME_US};
use crate::hal::{BusDirection, BusTimer, DmxPlatform, FrameNotifier, InterruptFlags, TxSemaphore, UartHal};
use crate::types::FrameStatus;

/// Single-word state shared between interrupt and task context. Plain
/// atomics; never guarded by a blocking lock.
pub(crate) struct PortFlags {
    /// A frame is actively being received or transmitted.
    pub is_busy: AtomicBool,
    /// The port is inside a break or mark-after-break.
    pub is_in_break: AtomicBool,
    /// RS-485 direction, true while driving the bus.
    pub is_transmitting: AtomicBool,
    /// A task has armed the frame notification and is waiting.
    pub waiter_armed: AtomicBool,
}

impl PortFlags {
    pub const fn new() -> Self {
        Self {
            is_busy: AtomicBool::new(false),
            is_in_break: AtomicBool::new(false),
            is_transmitting: AtomicBool::new(false),
            waiter_armed: AtomicBool::new(false),
        }
    }
}

/// The per-port frame record. Owned by the driver behind a
/// `critical_section::Mutex`; interrupt service borrows it for the duration
/// of one handler run.
pub(crate) struct Framer<P: DmxPlatform> {
    pub uart: P::Uart,
    pub timer: P::Timer,
    pub buffer: [u8; DMX_MAX_PACKET_SIZE],
    /// Cursor into `buffer`.
    pub head: usize,
    /// Observed frame length. `head <= size <= 513` holds after every
    /// interrupt.
    pub size: usize,
    pub last_received_ts: i64,
    pub last_sent_ts: i64,
    pub break_len_us: u32,
    pub mab_len_us: u32,
}

impl<P: DmxPlatform> Framer<P> {
    pub fn new(uart: P::Uart, timer: P::Timer, break_len_us: u32, mab_len_us: u32) -> Self {
        Self {
            uart,
            timer,
            buffer: [0; DMX_MAX_PACKET_SIZE],
            head: 0,
            size: DMX_MAX_PACKET_SIZE,
            last_received_ts: 0,
            last_sent_ts: 0,
            break_len_us,
            mab_len_us,
        }
    }

    /// Services every pending UART interrupt, highest priority first.
    pub fn service_uart(
        &mut self,
        flags: &PortFlags,
        notifier: &P::Notifier,
        tx_done: &P::TxDone,
        now: i64,
    ) {
        loop {
            let status = self.uart.interrupt_status();
            if status.is_empty() {
                break;
            }

            if status.intersects(InterruptFlags::RX_FIFO_OVERFLOW) {
                self.uart.clear_interrupt(InterruptFlags::RX_FIFO_OVERFLOW);

                if flags.is_busy.load(Ordering::Acquire) && flags.waiter_armed.load(Ordering::Acquire)
                {
                    notifier.signal(FrameStatus::Overflow);
                }

                // The frame is lost; drop whatever is left in the FIFO.
                flags.is_busy.store(false, Ordering::Release);
                self.uart.rxfifo_reset();
            } else if status.intersects(InterruptFlags::RX_FRAMING_ERR) {
                self.uart.clear_interrupt(InterruptFlags::RX_FRAMING_ERR);

                if flags.is_busy.load(Ordering::Acquire) && flags.waiter_armed.load(Ordering::Acquire)
                {
                    notifier.signal(FrameStatus::ImproperSlot);
                }

                flags.is_busy.store(false, Ordering::Release);
                self.uart.rxfifo_reset();
            } else if status.intersects(InterruptFlags::RX_BREAK) {
                self.uart.clear_interrupt(InterruptFlags::RX_BREAK);

                flags.is_in_break.store(true, Ordering::Release);

                // A break while busy terminates the previous frame.
                if flags.is_busy.load(Ordering::Acquire) {
                    if flags.waiter_armed.load(Ordering::Acquire) {
                        notifier.signal(FrameStatus::Ready);
                    }
                    self.size = self.head;
                }

                flags.is_busy.store(true, Ordering::Release);
                self.head = 0;
                self.uart.rxfifo_reset();
            } else if status.intersects(InterruptFlags::RX_DATA) {
                self.uart.clear_interrupt(InterruptFlags::RX_DATA);

                flags.is_in_break.store(false, Ordering::Release);

                // An RX timeout fires one threshold late; back-date the slot.
                self.last_received_ts = if status.intersects(InterruptFlags::RX_TIMEOUT) {
                    now - self.uart.rx_timeout_threshold() as i64 * WORD_TIME_US
                } else {
                    now
                };

                let is_busy = flags.is_busy.load(Ordering::Acquire);
                if is_busy && self.head < DMX_MAX_PACKET_SIZE {
                    let head = self.head;
                    self.head += self.uart.read_rxfifo(&mut self.buffer[head..]);
                } else {
                    self.uart.rxfifo_reset();
                }

                if !is_busy || !flags.waiter_armed.load(Ordering::Acquire) {
                    if self.head > self.size {
                        self.size = self.head;
                    }
                    continue;
                }

                match self.buffer[0] {
                    // More slots than the previous frame carried: the frame
                    // is complete.
                    DMX_NULL_START => {
                        if self.head > self.size {
                            self.size = self.head;
                            notifier.signal(FrameStatus::Ready);
                            flags.is_busy.store(false, Ordering::Release);
                        }
                    },
                    // RDM frames carry their length; hand off as soon as the
                    // checksum word is in.
                    SC_RDM => {
                        if self.head >= 3 && self.head >= self.buffer[2] as usize + 2 {
                            self.size = self.head;
                            notifier.signal(FrameStatus::Ready);
                            flags.is_busy.store(false, Ordering::Release);
                        } else if self.head > self.size {
                            self.size = self.head;
                        }
                    },
                    _ => {
                        if self.head > self.size {
                            self.size = self.head;
                        }
                    },
                }
            } else if status.intersects(InterruptFlags::RX_CLASH) {
                // Several responders drove the bus at once. Expected during
                // discovery; not an error.
                self.uart.clear_interrupt(InterruptFlags::RX_CLASH);
            } else if status.intersects(InterruptFlags::TX_DATA) {
                self.uart.clear_interrupt(InterruptFlags::TX_DATA);

                let head = self.head;
                self.head += self.uart.write_txfifo(&self.buffer[head..self.size]);

                // Let the FIFO drain once the whole frame is queued.
                if self.head == self.size {
                    self.uart.disable_interrupt(InterruptFlags::TX_DATA);
                }
            } else if status.intersects(InterruptFlags::TX_DONE) {
                self.uart.clear_interrupt(InterruptFlags::TX_DONE);

                self.last_sent_ts = now;
                flags.is_busy.store(false, Ordering::Release);
                tx_done.give();

                self.uart.set_rts(BusDirection::Rx);
                flags.is_transmitting.store(false, Ordering::Release);
            } else {
                // Interrupts nothing here asked for; disable so they cannot
                // starve the handler.
                self.uart.disable_interrupt(status);
                self.uart.clear_interrupt(status);
            }
        }
    }

    /// Services the break/mark-after-break alarm of the transmit sequence.
    pub fn service_timer(&mut self, flags: &PortFlags) {
        if flags.is_in_break.load(Ordering::Acquire) {
            // The break ends here; the mark-after-break begins.
            self.uart.invert_tx_signal(false);
            flags.is_in_break.store(false, Ordering::Release);

            self.timer.set_alarm(self.mab_len_us);
        } else {
            // Mark-after-break has elapsed; push the first chunk.
            let head = self.head;
            self.head += self.uart.write_txfifo(&self.buffer[head..self.size]);

            self.uart.enable_interrupt(InterruptFlags::TX_ALL);
            self.timer.pause();
        }
    }

    /// Queues a frame and begins the break. Runs in task context with the
    /// framer lock held.
    pub fn begin_send(&mut self, flags: &PortFlags, frame: &[u8]) {
        self.buffer[..frame.len()].copy_from_slice(frame);
        self.head = 0;
        self.size = frame.len();

        flags.is_busy.store(true, Ordering::Release);
        flags.is_transmitting.store(true, Ordering::Release);
        flags.is_in_break.store(true, Ordering::Release);

        self.uart.set_rts(BusDirection::Tx);
        self.uart.invert_tx_signal(true);
        self.timer.start(self.break_len_us);
    }

    /// Queues a frame and pushes it immediately, skipping break and
    /// mark-after-break. Used for DISC_UNIQUE_BRANCH responses.
    pub fn begin_send_without_break(&mut self, flags: &PortFlags, frame: &[u8]) {
        self.buffer[..frame.len()].copy_from_slice(frame);
        self.head = 0;
        self.size = frame.len();

        flags.is_busy.store(true, Ordering::Release);
        flags.is_transmitting.store(true, Ordering::Release);

        self.uart.set_rts(BusDirection::Tx);
        let head = self.head;
        self.head += self.uart.write_txfifo(&self.buffer[head..self.size]);
        self.uart.enable_interrupt(InterruptFlags::TX_ALL);
    }
}
