use crate::command_class::{RequestCommandClass, ResponseCommandClass};
use crate::consts::{
    PREAMBLE_BYTE, PREAMBLE_MAX_LEN, RDM_DISCOVERY_RESPONSE_SIZE, RDM_HEADER_SIZE,
    RDM_MAX_PACKET_SIZE, RDM_MAX_PDL, RDM_MIN_PACKET_SIZE, SC_RDM, SC_SUB_MESSAGE, SEPARATOR_BYTE,
};
use crate::layouts::rdm_packet_layout;
use crate::types::{DataPack, ResponseType};
use crate::unique_identifier::{PacketAddress, UniqueIdentifier};

/// Binary representation of an RDM packet.
pub type BinaryRdmPacket = heapless::Vec<u8, RDM_MAX_PACKET_SIZE>;

/// Error raised when converting a broadcast request into a response.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsBroadcastError;

impl core::fmt::Display for IsBroadcastError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tried to convert broadcast request to response")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for IsBroadcastError {}

/// An RDM request whose parameter data has not been deserialized.
#[derive(Debug, Clone)]
pub struct RdmRequestData {
    pub destination_uid: PacketAddress,
    pub source_uid: UniqueIdentifier,
    pub transaction_number: u8,
    pub port_id: u8,
    pub message_count: u8,
    pub sub_device: u16,
    pub command_class: RequestCommandClass,
    pub parameter_id: u16,
    pub parameter_data: DataPack,
}

impl RdmRequestData {
    pub fn build_response(
        &self,
        response_type: ResponseType,
        response: DataPack,
        message_count: u8,
    ) -> Result<RdmResponseData, IsBroadcastError> {
        Ok(RdmResponseData {
            destination_uid: PacketAddress::Device(self.source_uid),
            source_uid: match self.destination_uid {
                PacketAddress::Device(uid) => uid,
                _ => return Err(IsBroadcastError),
            },
            transaction_number: self.transaction_number,
            response_type,
            message_count,
            sub_device: self.sub_device,
            command_class: self.command_class.get_response_class(),
            parameter_id: self.parameter_id,
            parameter_data: response,
        })
    }

    /// Same as [RdmRequestData::build_response] but with the response sourced
    /// from the given device instead of the request destination, which may be
    /// a broadcast.
    pub fn build_response_from(
        &self,
        source_uid: UniqueIdentifier,
        response_type: ResponseType,
        response: DataPack,
        message_count: u8,
    ) -> RdmResponseData {
        RdmResponseData {
            destination_uid: PacketAddress::Device(self.source_uid),
            source_uid,
            transaction_number: self.transaction_number,
            response_type,
            message_count,
            sub_device: self.sub_device,
            command_class: self.command_class.get_response_class(),
            parameter_id: self.parameter_id,
            parameter_data: response,
        }
    }
}

/// An RDM response whose parameter data has not been deserialized.
#[derive(Debug, Clone)]
pub struct RdmResponseData {
    pub destination_uid: PacketAddress,
    pub source_uid: UniqueIdentifier,
    pub transaction_number: u8,
    pub response_type: ResponseType,
    pub message_count: u8,
    pub sub_device: u16,
    pub command_class: ResponseCommandClass,
    pub parameter_id: u16,
    pub parameter_data: DataPack,
}

#[derive(Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RdmDeserializationError {
    /// Buffer must be at least 26 bytes
    BufferTooSmall,
    /// Buffer must be at most 257 bytes
    BufferTooBig,
    /// The command class was not found; contains contents of command class field
    CommandClassNotFound(u8),
    /// The response type was not found; contains contents of response type field
    ResponseTypeNotFound(u8),
    /// The message length field is incorrect; contains result of parsing
    WrongMessageLength(usize),
    /// Received wrong start code (0xCC) or sub start code (0x01)
    WrongStartCode,
    /// The source uid is a broadcast address.
    SourceUidIsBroadcast,
    /// A discovery response without a delimiter in the first 8 bytes.
    NoDelimiter,
}

impl core::fmt::Display for RdmDeserializationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RdmDeserializationError::BufferTooSmall => write!(f, "buffer too small"),
            RdmDeserializationError::BufferTooBig => write!(f, "buffer too big"),
            RdmDeserializationError::CommandClassNotFound(command_class) => {
                write!(f, "command class {} not found", command_class)
            },
            RdmDeserializationError::ResponseTypeNotFound(response_type) => {
                write!(f, "response type {} is unknown", response_type)
            },
            RdmDeserializationError::WrongMessageLength(message_length) => {
                write!(f, "message length {} is incorrect", message_length)
            },
            RdmDeserializationError::WrongStartCode => write!(f, "start code is incorrect"),
            RdmDeserializationError::SourceUidIsBroadcast => write!(f, "source uid is a broadcast"),
            RdmDeserializationError::NoDelimiter => write!(f, "no delimiter found"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RdmDeserializationError {}

#[derive(Debug)]
pub enum RdmData {
    Request(RdmRequestData),
    Response(RdmResponseData),
}

/// A structurally valid packet plus the verdict of its checksum. A wrong
/// checksum is a parse outcome, not an error; dispatch layers drop such
/// packets without responding.
#[derive(Debug)]
pub struct RdmEvent {
    pub data: RdmData,
    pub checksum_is_valid: bool,
}

impl RdmData {
    pub fn deserialize(buf: &[u8]) -> Result<RdmEvent, RdmDeserializationError> {
        deserialize_rdm_data(buf)
    }

    pub fn serialize(&self) -> BinaryRdmPacket {
        serialize_rdm_data(self)
    }
}

/// Deserialize a standard RDM packet.
/// Buffer must hold the whole packet including the checksum word.
pub fn deserialize_rdm_data(buffer: &[u8]) -> Result<RdmEvent, RdmDeserializationError> {
    let buffer_size = buffer.len();

    if buffer_size < RDM_MIN_PACKET_SIZE {
        return Err(RdmDeserializationError::BufferTooSmall);
    }

    if buffer_size > RDM_MAX_PACKET_SIZE {
        return Err(RdmDeserializationError::BufferTooBig);
    }

    let packet_view = rdm_packet_layout::View::new(buffer);

    if packet_view.start_code().read() != SC_RDM
        || packet_view.sub_start_code().read() != SC_SUB_MESSAGE
    {
        return Err(RdmDeserializationError::WrongStartCode);
    }

    // Message length counts every byte before the checksum word.
    let message_length = packet_view.message_length().read() as usize;
    if message_length < RDM_HEADER_SIZE || message_length + 2 > buffer_size {
        return Err(RdmDeserializationError::WrongMessageLength(message_length));
    }

    let expected_checksum = calculate_checksum(&buffer[..message_length]);
    let actual_checksum =
        u16::from_be_bytes(buffer[message_length..message_length + 2].try_into().unwrap());
    let checksum_is_valid = expected_checksum == actual_checksum;

    let parameter_data_length = packet_view.parameter_data_length().read() as usize;
    if message_length != RDM_HEADER_SIZE + parameter_data_length {
        return Err(RdmDeserializationError::WrongMessageLength(message_length));
    }

    let parameter_data = DataPack::from_slice(
        &packet_view.parameter_data_and_checksum()[..parameter_data_length],
    )
    .map_err(|_| RdmDeserializationError::BufferTooBig)?;

    let command_class_field = packet_view.command_class().read();
    let is_request = RequestCommandClass::try_from(command_class_field).is_ok();

    let source_uid = match PacketAddress::from_bytes(packet_view.source_uid()) {
        PacketAddress::Device(device_uid) => device_uid,
        _ => return Err(RdmDeserializationError::SourceUidIsBroadcast),
    };

    let data = if is_request {
        RdmData::Request(RdmRequestData {
            destination_uid: PacketAddress::from_bytes(packet_view.destination_uid()),
            source_uid,
            transaction_number: packet_view.transaction_number().read(),
            port_id: packet_view.port_id_response_type().read(),
            message_count: packet_view.message_count().read(),
            sub_device: packet_view.sub_device().read(),
            command_class: command_class_field
                .try_into()
                .map_err(|_| RdmDeserializationError::CommandClassNotFound(command_class_field))?,
            parameter_id: packet_view.parameter_id().read(),
            parameter_data,
        })
    } else {
        let response_type_field = packet_view.port_id_response_type().read();
        let response_type = response_type_field
            .try_into()
            .map_err(|_| RdmDeserializationError::ResponseTypeNotFound(response_type_field))?;

        RdmData::Response(RdmResponseData {
            destination_uid: PacketAddress::from_bytes(packet_view.destination_uid()),
            source_uid,
            transaction_number: packet_view.transaction_number().read(),
            response_type,
            message_count: packet_view.message_count().read(),
            sub_device: packet_view.sub_device().read(),
            command_class: command_class_field
                .try_into()
                .map_err(|_| RdmDeserializationError::CommandClassNotFound(command_class_field))?,
            parameter_id: packet_view.parameter_id().read(),
            parameter_data,
        })
    };

    Ok(RdmEvent {
        data,
        checksum_is_valid,
    })
}

/// Serializes RDM data to a binary Vec.
pub fn serialize_rdm_data(rdm_data: &RdmData) -> BinaryRdmPacket {
    let mut dst = [0u8; RDM_MAX_PACKET_SIZE];

    let parameter_data_length = match rdm_data {
        RdmData::Request(ref request) => request.parameter_data.len(),
        RdmData::Response(ref response) => response.parameter_data.len(),
    };
    assert!(parameter_data_length <= RDM_MAX_PDL);

    let total_packet_length = parameter_data_length + RDM_HEADER_SIZE + 2;
    let mut packet_view = rdm_packet_layout::View::new(&mut dst[..total_packet_length]);

    packet_view.start_code_mut().write(SC_RDM);
    packet_view.sub_start_code_mut().write(SC_SUB_MESSAGE);
    packet_view
        .message_length_mut()
        .write((parameter_data_length + RDM_HEADER_SIZE) as u8);

    match rdm_data {
        RdmData::Request(request) => {
            packet_view
                .destination_uid_mut()
                .copy_from_slice(&request.destination_uid.to_bytes());
            packet_view
                .source_uid_mut()
                .copy_from_slice(&request.source_uid.to_bytes());

            packet_view
                .transaction_number_mut()
                .write(request.transaction_number);
            packet_view
                .port_id_response_type_mut()
                .write(request.port_id);
            packet_view.message_count_mut().write(request.message_count);
            packet_view.sub_device_mut().write(request.sub_device);
            packet_view
                .command_class_mut()
                .write(request.command_class as u8);
            packet_view.parameter_id_mut().write(request.parameter_id);
            packet_view
                .parameter_data_length_mut()
                .write(parameter_data_length as u8);
            packet_view.parameter_data_and_checksum_mut()[..parameter_data_length]
                .copy_from_slice(&request.parameter_data);
        },
        RdmData::Response(response) => {
            packet_view
                .destination_uid_mut()
                .copy_from_slice(&response.destination_uid.to_bytes());
            packet_view
                .source_uid_mut()
                .copy_from_slice(&response.source_uid.to_bytes());

            packet_view
                .transaction_number_mut()
                .write(response.transaction_number);
            packet_view
                .port_id_response_type_mut()
                .write(response.response_type as u8);
            packet_view
                .message_count_mut()
                .write(response.message_count);
            packet_view.sub_device_mut().write(response.sub_device);
            packet_view
                .command_class_mut()
                .write(response.command_class as u8);
            packet_view.parameter_id_mut().write(response.parameter_id);
            packet_view
                .parameter_data_length_mut()
                .write(parameter_data_length as u8);
            packet_view.parameter_data_and_checksum_mut()[..parameter_data_length]
                .copy_from_slice(&response.parameter_data);
        },
    }

    let checksum = calculate_checksum(&dst[..total_packet_length - 2]);
    dst[total_packet_length - 2..total_packet_length].copy_from_slice(&checksum.to_be_bytes());

    heapless::Vec::from_slice(&dst[..total_packet_length]).unwrap()
}

/// A decoded DISC_UNIQUE_BRANCH response.
#[derive(Debug)]
pub struct DiscoveryResponse {
    pub uid: UniqueIdentifier,
    pub checksum_is_valid: bool,
}

/// Encodes the DISC_UNIQUE_BRANCH response for a device: seven preamble
/// bytes, the delimiter, the interleaved UID and the interleaved checksum.
/// This packet carries no start code and is sent without a break.
pub fn serialize_discovery_response(uid: UniqueIdentifier) -> [u8; 24] {
    let mut response = [PREAMBLE_BYTE; 24];
    response[PREAMBLE_MAX_LEN] = SEPARATOR_BYTE;

    let uid_bytes = uid.to_bytes();
    encode_disc_unique(&uid_bytes, &mut response[8..20]);

    // Each UID byte contributes itself plus 0xAA + 0x55.
    let checksum = calculate_checksum(&response[8..20]);
    encode_disc_unique(&checksum.to_be_bytes(), &mut response[20..24]);

    response
}

/// Decodes a DISC_UNIQUE_BRANCH response. Accepts 0 to 7 preamble bytes
/// before the delimiter.
pub fn deserialize_discovery_response(
    buffer: &[u8],
) -> Result<DiscoveryResponse, RdmDeserializationError> {
    let preamble_len = buffer
        .iter()
        .take(PREAMBLE_MAX_LEN + 1)
        .position(|&byte| byte == SEPARATOR_BYTE)
        .ok_or(RdmDeserializationError::NoDelimiter)?;

    if buffer.len() < preamble_len + RDM_DISCOVERY_RESPONSE_SIZE {
        return Err(RdmDeserializationError::WrongMessageLength(buffer.len()));
    }

    let encoded = &buffer[preamble_len + 1..];
    let calculated_checksum = calculate_checksum(&encoded[..12]);

    let mut uid_bytes = [0u8; 6];
    decode_disc_unique(&encoded[..12], &mut uid_bytes);
    let uid = match PacketAddress::from_bytes(&uid_bytes) {
        PacketAddress::Device(uid) => uid,
        _ => return Err(RdmDeserializationError::SourceUidIsBroadcast),
    };

    let mut checksum_bytes = [0u8; 2];
    decode_disc_unique(&encoded[12..16], &mut checksum_bytes);
    let received_checksum = u16::from_be_bytes(checksum_bytes);

    Ok(DiscoveryResponse {
        uid,
        checksum_is_valid: calculated_checksum == received_checksum,
    })
}

/// Interleave-encode source bytes for a discovery response. Each source byte
/// becomes `b | 0xAA` followed by `b | 0x55`. The destination must be twice
/// the source size.
fn encode_disc_unique(src: &[u8], dest: &mut [u8]) {
    assert!(
        dest.len() >= src.len() * 2,
        "destination buffer has to be at least twice the size of the source buffer"
    );

    for (index, &byte) in src.iter().enumerate() {
        dest[index * 2] = byte | 0xAA;
        dest[index * 2 + 1] = byte | 0x55;
    }
}

/// Reciprocal of [encode_disc_unique]: `b0 & 0x55 | b1 & 0xAA`.
fn decode_disc_unique(src: &[u8], dest: &mut [u8]) {
    assert!(
        dest.len() * 2 >= src.len(),
        "destination buffer has to be at least half the size of the source buffer"
    );

    for (index, chunk) in src.chunks(2).enumerate() {
        dest[index] = chunk[0] & 0x55 | chunk[1] & 0xAA;
    }
}

#[inline]
pub(crate) fn calculate_checksum(data: &[u8]) -> u16 {
    let mut checksum = 0u16;

    for byte in data {
        checksum = checksum.wrapping_add(*byte as u16);
    }

    checksum
}
