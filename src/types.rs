use crate::consts::{DMX_MAX_BAUD, DMX_MIN_BAUD, RDM_MAX_PDL};

/// Parameter data of a single RDM packet.
pub type DataPack = heapless::Vec<u8, RDM_MAX_PDL>;

/// Errors surfaced by the driver API.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmxError {
    /// The blocking call expired before the bus produced a result.
    Timeout,
    /// The UART receive FIFO overflowed mid-frame.
    Overflow,
    /// A slot arrived with a framing or parity error.
    ImproperSlot,
    /// No driver is installed on the addressed port.
    NotInstalled,
    /// An argument failed validation.
    InvalidArg,
    /// A fixed-capacity table or queue is full.
    NoCapacity,
}

impl core::fmt::Display for DmxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DmxError::Timeout => write!(f, "request timed out"),
            DmxError::Overflow => write!(f, "receive fifo overflowed"),
            DmxError::ImproperSlot => write!(f, "slot framing error"),
            DmxError::NotInstalled => write!(f, "driver is not installed"),
            DmxError::InvalidArg => write!(f, "invalid argument"),
            DmxError::NoCapacity => write!(f, "capacity exhausted"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DmxError {}

/// Status delivered through the single-slot task notification when a frame
/// completes. Overwrite semantics: the most recent status wins.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum FrameStatus {
    /// A whole frame is in the driver buffer.
    Ready = 0,
    /// The receive FIFO overflowed; the frame is lost.
    Overflow = 1,
    /// A framing or parity error corrupted the frame.
    ImproperSlot = 2,
}

impl FrameStatus {
    pub fn into_result(self) -> Result<(), DmxError> {
        match self {
            FrameStatus::Ready => Ok(()),
            FrameStatus::Overflow => Err(DmxError::Overflow),
            FrameStatus::ImproperSlot => Err(DmxError::ImproperSlot),
        }
    }
}

/// Response status of an RDM packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResponseType {
    /// The request was acknowledged.
    Ack = 0x00,
    /// The request was acknowledged but the result isn't ready yet.
    AckTimer = 0x01,
    /// The request was not acknowledged.
    NackReason = 0x02,
    /// The request was acknowledged but the response does not fit into a
    /// single packet.
    AckOverflow = 0x03,
}

impl TryFrom<u8> for ResponseType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        Ok(match value {
            0x00 => Self::Ack,
            0x01 => Self::AckTimer,
            0x02 => Self::NackReason,
            0x03 => Self::AckOverflow,
            _ => {
                return Err(());
            },
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum NackReason {
    UnknownPid = 0x0000,
    FormatError = 0x0001,
    HardwareFault = 0x0002,
    ProxyReject = 0x0003,
    WriteProtect = 0x0004,
    UnsupportedCommandClass = 0x0005,
    DataOutOfRange = 0x0006,
    BufferFull = 0x0007,
    PacketSizeUnsupported = 0x0008,
    SubDeviceOutOfRange = 0x0009,
    ProxyBufferFull = 0x000A,
}

impl NackReason {
    pub fn serialize(&self) -> DataPack {
        DataPack::from_slice(&(*self as u16).to_be_bytes()).unwrap()
    }
}

impl TryFrom<u16> for NackReason {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        match value {
            0x0000 => Ok(Self::UnknownPid),
            0x0001 => Ok(Self::FormatError),
            0x0002 => Ok(Self::HardwareFault),
            0x0003 => Ok(Self::ProxyReject),
            0x0004 => Ok(Self::WriteProtect),
            0x0005 => Ok(Self::UnsupportedCommandClass),
            0x0006 => Ok(Self::DataOutOfRange),
            0x0007 => Ok(Self::BufferFull),
            0x0008 => Ok(Self::PacketSizeUnsupported),
            0x0009 => Ok(Self::SubDeviceOutOfRange),
            0x000A => Ok(Self::ProxyBufferFull),
            _ => Err(()),
        }
    }
}

/// Whether a start code may appear on a compliant bus. Alternate start codes
/// 0x92-0xA9 and 0xAB-0xCD are reserved for future use of the standard;
/// 0xF0-0xF7 must not be sold in products.
pub fn start_code_is_valid(start_code: u8) -> bool {
    !(0x92..=0xA9).contains(&start_code)
        && !(0xAB..=0xCD).contains(&start_code)
        && !(0xF0..=0xF7).contains(&start_code)
}

/// Whether a baud rate is within the DMX tolerance window.
pub fn baud_rate_is_valid(baud: u32) -> bool {
    (DMX_MIN_BAUD..=DMX_MAX_BAUD).contains(&baud)
}
