//! Interrupt-driven driver engine for DMX512 (ANSI E1.11) and DMX-RDM
//! (ANSI E1.20) over an RS-485 capable UART. The crate is no-std and
//! no-alloc: all buffers are fixed capacity and nothing allocates after a
//! driver is installed.
//!
//! The engine is layered bottom-up:
//!
//! * [hal] — traits for the UART registers, the break/MAB alarm timer, the
//!   task notification, the transmit semaphore and non-volatile storage.
//!   Ports supply implementations; the engine never touches hardware.
//! * [driver] — the per-port [driver::DmxDriver]: frame buffer, interrupt
//!   service entry points and the blocking send/receive surface.
//! * [rdm_data] and [format] — the RDM wire codec, including the
//!   DISC_UNIQUE_BRANCH interleave and the parameter-data format strings.
//! * [parameter] — the registry of parameters with static, dynamic or
//!   non-volatile backing and the queued-message notification queue.
//! * [responder] — the responder runtime dispatching GET/SET/DISC requests
//!   to per-PID handlers and composing ACK/NACK/ACK_TIMER replies.
//!
//! # Usage
//!
//! ```ignore
//! use dmx_bus::driver::{DmxConfig, DmxDriver, PortId};
//! use dmx_bus::responder::{PollEvent, RdmResponder, RdmResponderConfig};
//!
//! // Board-specific implementations of the hal traits.
//! let uart = BoardUart::take();
//! let timer = BoardTimer::take();
//!
//! let driver = DmxDriver::<Board>::install(
//!     PortId::new(1).unwrap(),
//!     uart,
//!     timer,
//!     BoardNotifier::new(),
//!     BoardSemaphore::new(),
//!     &DmxConfig::default(),
//! )
//! .unwrap();
//!
//! let mut responder = RdmResponder::<Board, 16, 32>::new(
//!     &driver,
//!     BoardNvs::open("dmx"),
//!     &RdmResponderConfig {
//!         device_model_id: 0x0001,
//!         software_version_label: "1.0.0",
//!         ..Default::default()
//!     },
//! );
//! responder.register_device_label("my fixture");
//!
//! loop {
//!     match responder.poll_default() {
//!         Ok(PollEvent::Dmx(frame)) => apply_slots(&frame),
//!         Ok(_) => {},
//!         Err(error) => log_error(error),
//!     }
//! }
//! ```
//!
//! The UART and timer interrupt handlers of the port must call
//! [driver::DmxDriver::on_uart_interrupt] and
//! [driver::DmxDriver::on_timer_alarm]; both run to completion without
//! blocking.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod command_class;
pub mod consts;
/// The per-port driver: install, send, receive.
pub mod driver;
/// Parameter-data format strings and their interpreter.
pub mod format;
/// Traits the surrounding hardware has to implement.
pub mod hal;
mod interrupts;
mod layouts;
/// The typed parameter registry backing the responder.
pub mod parameter;
pub mod pids;
pub mod rdm_data;
pub mod rdm_types;
/// The RDM responder runtime.
pub mod responder;
pub mod types;
pub mod unique_identifier;
