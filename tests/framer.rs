//! Framer behavior under error conditions and odd byte sequences, driven
//! through the interrupt entry points of a mock UART.

mod mock;

use dmx_bus::consts::DMX_MAX_PACKET_SIZE;
use dmx_bus::hal::InterruptFlags;
use dmx_bus::types::DmxError;

use mock::{inject_break, inject_bytes, install_driver, wait_for_waiter};

#[test]
fn test_overflow_notifies_once_and_recovers() {
    let (driver, bus, _timer) = install_driver();

    std::thread::scope(|scope| {
        let driver = &driver;

        let worker = scope.spawn(move || {
            let mut frame = [0u8; DMX_MAX_PACKET_SIZE];

            // The burst overflows the FIFO mid-frame.
            match driver.receive(&mut frame, 2_000) {
                Err(DmxError::Overflow) => {},
                other => panic!("expected an overflow, got {other:?}"),
            }

            // The driver stays installed and the next frame arrives whole.
            let received = driver.receive(&mut frame, 2_000).unwrap();
            (received.size, frame[..received.size.min(4)].to_vec())
        });

        wait_for_waiter(&bus);
        inject_break(driver, &bus);
        inject_bytes(driver, &bus, &[0u8; 200]);
        bus.raise(InterruptFlags::RX_FIFO_OVERFLOW);
        driver.on_uart_interrupt();

        wait_for_waiter(&bus);
        inject_break(driver, &bus);
        inject_bytes(driver, &bus, &[0x00, 1, 2, 3]);
        // The short frame completes on the following break.
        inject_break(driver, &bus);

        let (size, head) = worker.join().unwrap();
        assert_eq!(size, 4);
        assert_eq!(head, [0x00, 1, 2, 3]);
    });
}

#[test]
fn test_framing_error_surfaces_improper_slot() {
    let (driver, bus, _timer) = install_driver();

    std::thread::scope(|scope| {
        let driver = &driver;

        let worker = scope.spawn(move || {
            let mut frame = [0u8; DMX_MAX_PACKET_SIZE];
            driver.receive(&mut frame, 2_000)
        });

        wait_for_waiter(&bus);
        inject_break(driver, &bus);
        inject_bytes(driver, &bus, &[0x00, 1, 2]);
        bus.raise(InterruptFlags::RX_FRAMING_ERR);
        driver.on_uart_interrupt();

        match worker.join().unwrap() {
            Err(DmxError::ImproperSlot) => {},
            other => panic!("expected an improper slot error, got {other:?}"),
        }
    });
}

#[test]
fn test_full_dmx_frame_completes_on_next_break() {
    let (driver, bus, _timer) = install_driver();

    let mut slots = [0x55u8; DMX_MAX_PACKET_SIZE];
    slots[0] = 0x00;

    std::thread::scope(|scope| {
        let driver = &driver;

        let worker = scope.spawn(move || {
            let mut frame = [0u8; DMX_MAX_PACKET_SIZE];
            let received = driver.receive(&mut frame, 2_000).unwrap();
            (received.size, frame)
        });

        wait_for_waiter(&bus);
        inject_break(driver, &bus);
        // 513 bytes delivered in chunks, as the FIFO would.
        for chunk in slots.chunks(120) {
            inject_bytes(driver, &bus, chunk);
        }
        inject_break(driver, &bus);

        let (size, frame) = worker.join().unwrap();
        assert_eq!(size, DMX_MAX_PACKET_SIZE);
        assert_eq!(frame[0], 0x00);
        assert!(frame[1..].iter().all(|&slot| slot == 0x55));
    });
}

#[test]
fn test_cursor_invariant_holds_for_arbitrary_input() {
    let (driver, bus, _timer) = install_driver();

    // Nothing is waiting; bytes are dropped or buffered but the cursor
    // stays inside the frame either way.
    let mut state = 0x2545_F491u32;
    let mut next = || {
        state = state.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
        (state >> 24) as u8
    };

    for round in 0..64 {
        if round % 7 == 0 {
            inject_break(&driver, &bus);
        }

        let len = (next() as usize % 96) + 1;
        let bytes: Vec<u8> = (0..len).map(|_| next()).collect();
        inject_bytes(&driver, &bus, &bytes);

        let (head, size) = driver.frame_cursor();
        assert!(head <= size, "head {head} ran past size {size}");
        assert!(size <= DMX_MAX_PACKET_SIZE);
    }
}
