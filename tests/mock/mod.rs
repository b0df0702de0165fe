//! A software rendition of the hardware the engine drives: a UART whose
//! FIFOs are byte queues, a one-shot alarm, a condvar-backed task
//! notification and an in-memory non-volatile store. Tests inject
//! interrupts through the same entry points a real ISR would use.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use dmx_bus::driver::{DmxConfig, DmxDriver, PortId};
use dmx_bus::hal::{
    BusDirection, BusTimer, DmxPlatform, FrameNotifier, InterruptFlags, Nvs, TxSemaphore, UartHal,
};
use dmx_bus::types::FrameStatus;

#[derive(Default)]
struct BusState {
    rx_fifo: VecDeque<u8>,
    tx: Vec<u8>,
    enabled: u32,
    pending: u32,
    rx_timeout_threshold: u8,
    baud_rate: u32,
    direction_tx: bool,
    tx_inverted: bool,
    waiter_blocked: bool,
}

/// Cloneable handle on the mock bus shared by the UART, the notifier and
/// the test body.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks interrupt sources pending, as the hardware would.
    pub fn raise(&self, flags: InterruptFlags) {
        self.state.lock().unwrap().pending |= flags.0;
    }

    /// Loads bytes into the receive FIFO.
    pub fn load_rx(&self, bytes: &[u8]) {
        self.state.lock().unwrap().rx_fifo.extend(bytes);
    }

    /// Takes everything captured off the transmit path.
    pub fn take_tx(&self) -> Vec<u8> {
        core::mem::take(&mut self.state.lock().unwrap().tx)
    }

    pub fn tx_pending(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pending & (InterruptFlags::TX_DATA.0 | InterruptFlags::TX_DONE.0) != 0
    }

    pub fn waiter_blocked(&self) -> bool {
        self.state.lock().unwrap().waiter_blocked
    }

    fn set_waiter_blocked(&self, blocked: bool) {
        self.state.lock().unwrap().waiter_blocked = blocked;
    }
}

/// UART whose registers are the shared [MockBus] state.
pub struct MockUart {
    bus: MockBus,
}

impl MockUart {
    pub fn new(bus: MockBus) -> Self {
        Self { bus }
    }
}

impl UartHal for MockUart {
    fn init(&mut self, baud_rate: u32) {
        self.bus.state.lock().unwrap().baud_rate = baud_rate;
    }

    fn interrupt_status(&mut self) -> InterruptFlags {
        let state = self.bus.state.lock().unwrap();
        InterruptFlags(state.pending & state.enabled)
    }

    fn enable_interrupt(&mut self, mask: InterruptFlags) {
        let mut state = self.bus.state.lock().unwrap();
        state.enabled |= mask.0;

        // The mock transmit FIFO drains instantly, so arming the transmit
        // interrupts fires them at once.
        if mask.intersects(InterruptFlags::TX_ALL) {
            state.pending |= InterruptFlags::TX_ALL.0 & mask.0;
        }
    }

    fn disable_interrupt(&mut self, mask: InterruptFlags) {
        self.bus.state.lock().unwrap().enabled &= !mask.0;
    }

    fn clear_interrupt(&mut self, mask: InterruptFlags) {
        self.bus.state.lock().unwrap().pending &= !mask.0;
    }

    fn read_rxfifo(&mut self, buffer: &mut [u8]) -> usize {
        let mut state = self.bus.state.lock().unwrap();
        let mut read = 0;
        while read < buffer.len() {
            match state.rx_fifo.pop_front() {
                Some(byte) => {
                    buffer[read] = byte;
                    read += 1;
                },
                None => break,
            }
        }
        read
    }

    fn write_txfifo(&mut self, buffer: &[u8]) -> usize {
        self.bus.state.lock().unwrap().tx.extend_from_slice(buffer);
        buffer.len()
    }

    fn rxfifo_reset(&mut self) {
        self.bus.state.lock().unwrap().rx_fifo.clear();
    }

    fn txfifo_reset(&mut self) {}

    fn set_rts(&mut self, direction: BusDirection) {
        self.bus.state.lock().unwrap().direction_tx = direction == BusDirection::Tx;
    }

    fn invert_tx_signal(&mut self, invert: bool) {
        self.bus.state.lock().unwrap().tx_inverted = invert;
    }

    fn set_baud_rate(&mut self, baud_rate: u32) {
        self.bus.state.lock().unwrap().baud_rate = baud_rate;
    }

    fn rx_timeout_threshold(&self) -> u8 {
        self.bus.state.lock().unwrap().rx_timeout_threshold
    }

    fn set_rx_timeout_threshold(&mut self, threshold: u8) {
        self.bus.state.lock().unwrap().rx_timeout_threshold = threshold;
    }

    fn set_rxfifo_full_threshold(&mut self, _threshold: u8) {}

    fn set_txfifo_empty_threshold(&mut self, _threshold: u8) {}
}

/// One-shot alarm. Tests poll [MockTimer::is_armed] and fire the driver's
/// alarm entry point themselves.
#[derive(Clone, Default)]
pub struct MockTimer {
    armed: Arc<Mutex<bool>>,
}

impl MockTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        *self.armed.lock().unwrap()
    }
}

impl BusTimer for MockTimer {
    fn start(&mut self, _delay_us: u32) {
        *self.armed.lock().unwrap() = true;
    }

    fn set_alarm(&mut self, _delay_us: u32) {
        *self.armed.lock().unwrap() = true;
    }

    fn pause(&mut self) {
        *self.armed.lock().unwrap() = false;
    }
}

struct NotifierInner {
    slot: Mutex<Option<FrameStatus>>,
    condvar: Condvar,
}

/// Condvar-backed single-slot notification with overwrite semantics.
pub struct MockNotifier {
    inner: Arc<NotifierInner>,
    bus: MockBus,
}

impl MockNotifier {
    pub fn new(bus: MockBus) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                slot: Mutex::new(None),
                condvar: Condvar::new(),
            }),
            bus,
        }
    }
}

impl FrameNotifier for MockNotifier {
    fn signal(&self, status: FrameStatus) {
        *self.inner.slot.lock().unwrap() = Some(status);
        self.inner.condvar.notify_one();
    }

    fn wait(&self, timeout_ms: u32) -> Option<FrameStatus> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        self.bus.set_waiter_blocked(true);

        let mut slot = self.inner.slot.lock().unwrap();
        let status = loop {
            if let Some(status) = slot.take() {
                break Some(status);
            }

            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let (guard, _) = self
                .inner
                .condvar
                .wait_timeout(slot, deadline - now)
                .unwrap();
            slot = guard;
        };

        drop(slot);
        self.bus.set_waiter_blocked(false);
        status
    }

    fn clear(&self) {
        *self.inner.slot.lock().unwrap() = None;
    }
}

/// Condvar-backed binary semaphore.
#[derive(Default)]
pub struct MockSemaphore {
    given: Mutex<bool>,
    condvar: Condvar,
}

impl TxSemaphore for MockSemaphore {
    fn give(&self) {
        *self.given.lock().unwrap() = true;
        self.condvar.notify_one();
    }

    fn take(&self, timeout_ms: u32) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut given = self.given.lock().unwrap();

        loop {
            if *given {
                *given = false;
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.condvar.wait_timeout(given, deadline - now).unwrap();
            given = guard;
        }
    }
}

/// Non-volatile storage as a process-local map.
#[derive(Default)]
pub struct MemNvs {
    values: HashMap<(u16, u16), Vec<u8>>,
}

impl Nvs for MemNvs {
    fn load(&mut self, sub_device: u16, pid: u16, buffer: &mut [u8]) -> Option<usize> {
        let value = self.values.get(&(sub_device, pid))?;
        let size = value.len().min(buffer.len());
        buffer[..size].copy_from_slice(&value[..size]);
        Some(size)
    }

    fn store(&mut self, sub_device: u16, pid: u16, value: &[u8]) -> bool {
        self.values.insert((sub_device, pid), value.to_vec());
        true
    }
}

pub struct MockPlatform;

impl DmxPlatform for MockPlatform {
    type Uart = MockUart;
    type Timer = MockTimer;
    type Notifier = MockNotifier;
    type TxDone = MockSemaphore;
    type Nvs = MemNvs;

    fn now_us() -> i64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_micros() as i64
    }

    fn mac_address() -> [u8; 6] {
        [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]
    }
}

/// Installs a driver on whichever port is free, retrying while parallel
/// tests hold ports.
pub fn install_driver() -> (DmxDriver<MockPlatform>, MockBus, MockTimer) {
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        for port in 0..dmx_bus::consts::MAX_PORTS as u8 {
            let bus = MockBus::new();
            let timer = MockTimer::new();

            match DmxDriver::<MockPlatform>::install(
                PortId::new(port).unwrap(),
                MockUart::new(bus.clone()),
                timer.clone(),
                MockNotifier::new(bus.clone()),
                MockSemaphore::default(),
                &DmxConfig::default(),
            ) {
                Ok(driver) => return (driver, bus, timer),
                Err(_) => continue,
            }
        }

        assert!(Instant::now() < deadline, "no port became free");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Blocks until the receiving task has armed its wait.
pub fn wait_for_waiter(bus: &MockBus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !bus.waiter_blocked() {
        assert!(Instant::now() < deadline, "receiver never blocked");
        std::thread::yield_now();
    }
}

/// Delivers a break to the interrupt service.
pub fn inject_break(driver: &DmxDriver<MockPlatform>, bus: &MockBus) {
    bus.raise(InterruptFlags::RX_BREAK);
    driver.on_uart_interrupt();
}

/// Delivers bytes followed by an RX timeout to the interrupt service.
pub fn inject_bytes(driver: &DmxDriver<MockPlatform>, bus: &MockBus, bytes: &[u8]) {
    bus.load_rx(bytes);
    bus.raise(InterruptFlags::RX_TIMEOUT);
    driver.on_uart_interrupt();
}

/// Waits for the responder task to start a transmission, then plays the
/// hardware's part: the break/mark alarms and the transmit interrupts.
pub fn pump_transmit(driver: &DmxDriver<MockPlatform>, bus: &MockBus, timer: &MockTimer) {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        if timer.is_armed() {
            // End of break, then end of mark-after-break.
            driver.on_timer_alarm();
            driver.on_timer_alarm();
            break;
        }
        if bus.tx_pending() {
            // A transmission without a break is already under way.
            break;
        }

        assert!(Instant::now() < deadline, "no transmission started");
        std::thread::yield_now();
    }

    driver.on_uart_interrupt();
}
