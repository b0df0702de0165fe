pub const DMX_NULL_START: u8 = 0x00;
/// start code + 512 slots
pub const DMX_MAX_PACKET_SIZE: usize = 513;
pub const SC_RDM: u8 = 0xCC;
pub const SC_SUB_MESSAGE: u8 = 0x01;

pub const PREAMBLE_BYTE: u8 = 0xFE;
pub const SEPARATOR_BYTE: u8 = 0xAA;
pub const PREAMBLE_MAX_LEN: usize = 7;

pub const BROADCAST_UID: u64 = 0xFFFF_FFFFFFFF;
/// The highest UID assignable to a device.
pub const RDM_MAX_UID: u64 = 0xFFFF_FFFFFFFE;

pub const DMX_BAUD: u32 = 250_000;
pub const DMX_MIN_BAUD: u32 = 245_000;
pub const DMX_MAX_BAUD: u32 = 255_000;

/// Default transmitted break length.
pub const BREAK_LEN_US: u32 = 176;
/// Shortest break the transmitter may be configured to generate.
pub const WRITE_MIN_BREAK_LEN_US: u32 = 92;
/// Shortest break accepted on receive.
pub const READ_MIN_BREAK_LEN_US: u32 = 88;
/// Default transmitted mark-after-break length.
pub const MAB_LEN_US: u32 = 12;
/// Shortest mark-after-break the transmitter may be configured to generate.
pub const WRITE_MIN_MAB_LEN_US: u32 = 12;
/// Shortest mark-after-break accepted on receive.
pub const READ_MIN_MAB_LEN_US: u32 = 8;

/// Receive watchdog. A compliant transmitter sends at least one break in
/// this window.
pub const READ_TIMEOUT_MS: u32 = 1250;
/// Transmit watchdog.
pub const WRITE_TIMEOUT_MS: u32 = 1000;

/// Wire time of one 8N2 word at 250 kbaud. Used to back-date the receive
/// timestamp when the RX timeout interrupt fires.
pub const WORD_TIME_US: i64 = 44;

pub const RDM_MIN_PACKET_SIZE: usize = 26;
pub const RDM_MAX_PACKET_SIZE: usize = 257;
/// The 24-byte fixed prefix shared by every standard RDM packet.
pub const RDM_HEADER_SIZE: usize = 24;
/// Delimiter + 12 interleaved UID bytes + 4 interleaved checksum bytes.
pub const RDM_DISCOVERY_RESPONSE_SIZE: usize = 17;
/// Including the maximal 7 byte preamble.
pub const RDM_MAX_DISCOVERY_RESPONSE_SIZE: usize =
    RDM_DISCOVERY_RESPONSE_SIZE + PREAMBLE_MAX_LEN;

pub const RDM_MAX_PDL: usize = 231;
/// Strict upper bound for ASCII parameter data.
pub const RDM_ASCII_SIZE_MAX: usize = 32;
pub const RDM_STATUS_MESSAGE_SIZE: usize = 9;
pub const RDM_DEVICE_INFO_SIZE: usize = 0x13;

/// Manufacturer-specific PID range served by PARAMETER_DESCRIPTION.
pub const RDM_PID_MANUFACTURER_FIRST: u16 = 0x8000;
pub const RDM_PID_MANUFACTURER_LAST: u16 = 0xFFDF;

/// Ports a single process may install drivers on.
pub const MAX_PORTS: usize = 4;
