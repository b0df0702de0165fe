//! The RDM responder runtime: receives addressed requests, dispatches them
//! to per-PID handlers out of the parameter registry and composes
//! ACK/NACK/ACK_TIMER replies.
//!
//! [ResponderEngine] handles parsed requests without touching a driver, so
//! it can be exercised standalone; [RdmResponder] couples an engine to a
//! [DmxDriver] and runs the receive/dispatch/transmit loop.

use crate::command_class::{CommandClassSpec, RequestCommandClass};
use crate::consts::{
    DMX_MAX_PACKET_SIZE, READ_TIMEOUT_MS, RDM_ASCII_SIZE_MAX, RDM_MAX_PDL,
    RDM_PID_MANUFACTURER_FIRST, RDM_PID_MANUFACTURER_LAST, SC_RDM, WRITE_TIMEOUT_MS,
};
use crate::driver::DmxDriver;
use crate::format;
use crate::hal::{DmxPlatform, Nvs};
use crate::parameter::{
    HandlerResponse, ParameterDataType, ParameterDefinition, ParameterStore, PidOperation, Prefix,
    StorageClass, Units,
};
use crate::pids;
use crate::rdm_data::{serialize_discovery_response, RdmData, RdmRequestData, RdmResponseData};
use crate::rdm_types::{DeviceInfo, DiscoveryMuteResponse, DmxStartAddress, StatusMessage, StatusType};
use crate::types::{start_code_is_valid, DataPack, DmxError, NackReason, ResponseType};
use crate::unique_identifier::{PacketAddress, UniqueIdentifier};

/// A vector that contains one received frame. The first byte is the start
/// code.
pub type DmxFrame = heapless::Vec<u8, DMX_MAX_PACKET_SIZE>;

/// Upper bound of PIDs a SUPPORTED_PARAMETERS response enumerates.
const SUPPORTED_PIDS_MAX: usize = 64;

/// PIDs never listed in SUPPORTED_PARAMETERS: discovery commands and the
/// PIDs every responder must implement anyway.
const UNLISTED_PIDS: [u16; 9] = [
    pids::DISC_UNIQUE_BRANCH,
    pids::DISC_MUTE,
    pids::DISC_UN_MUTE,
    pids::SUPPORTED_PARAMETERS,
    pids::PARAMETER_DESCRIPTION,
    pids::DEVICE_INFO,
    pids::SOFTWARE_VERSION_LABEL,
    pids::DMX_START_ADDRESS,
    pids::IDENTIFY_DEVICE,
];

/// The view a PID handler gets of the device. Object-safe so definitions
/// stay plain statics regardless of the store's capacity parameters.
pub trait DeviceModel {
    fn parameter_get(&self, sub_device: u16, pid: u16) -> Option<&[u8]>;
    fn parameter_set(&mut self, sub_device: u16, pid: u16, value: &[u8]) -> bool;
    fn definition_get(&self, sub_device: u16, pid: u16) -> Option<&'static ParameterDefinition>;
    fn supported_pids(&self, sub_device: u16, out: &mut heapless::Vec<u16, SUPPORTED_PIDS_MAX>);
    fn device_info(&self) -> DeviceInfo;
    fn message_count(&self) -> u8;
    /// Serializes and removes the queued statuses at or above the filter
    /// severity.
    fn pop_statuses(&mut self, filter: StatusType) -> DataPack;
    /// Replays the parameter data of the previous status response.
    fn last_statuses(&self) -> DataPack;
}

/// Per-request state handed to a PID handler. `pd` carries the request's
/// parameter data in, and the wire-ready response parameter data out.
pub struct PidContext<'a> {
    pub header: &'a RdmRequestData,
    pub definition: &'static ParameterDefinition,
    pub device: &'a mut dyn DeviceModel,
    pub pd: &'a mut [u8; RDM_MAX_PDL],
    pub pdl: usize,
}

/// A GET or SET handler: reads the request from the context, writes the
/// response parameter data back into it.
pub type ResponseHandler = fn(&mut PidContext<'_>) -> HandlerResponse;

/// Install-time responder configuration.
#[derive(Copy, Clone, Debug)]
pub struct RdmResponderConfig {
    pub device_model_id: u16,
    pub product_category: u16,
    pub software_version_id: u32,
    pub software_version_label: &'static str,
    pub personality_count: u8,
    pub personality_current: u8,
    pub dmx_footprint: u16,
    pub dmx_start_address: u16,
    pub sensor_count: u8,
}

impl Default for RdmResponderConfig {
    fn default() -> Self {
        Self {
            device_model_id: 0,
            product_category: 0,
            software_version_id: 0,
            software_version_label: "dmx-bus device",
            personality_count: 1,
            personality_current: 1,
            dmx_footprint: 1,
            dmx_start_address: 1,
            sensor_count: 0,
        }
    }
}

/// The device the responder advertises: the parameter registry plus the
/// handful of values DEVICE_INFO synthesizes at call time.
pub struct ResponderDevice<V: Nvs, const PARAMS: usize, const QUEUE: usize> {
    pub store: ParameterStore<V, PARAMS, QUEUE>,
    pub dmx_footprint: u16,
    pub personality_current: u8,
    pub personality_count: u8,
    pub sub_device_count: u16,
    pub sensor_count: u8,
    pub discovery_muted: bool,
    status_messages: heapless::Vec<StatusMessage, QUEUE>,
    last_status_response: DataPack,
}

impl<V: Nvs, const PARAMS: usize, const QUEUE: usize> ResponderDevice<V, PARAMS, QUEUE> {
    fn new(store: ParameterStore<V, PARAMS, QUEUE>, config: &RdmResponderConfig) -> Self {
        Self {
            store,
            dmx_footprint: config.dmx_footprint,
            personality_current: config.personality_current,
            personality_count: config.personality_count,
            sub_device_count: 0,
            sensor_count: config.sensor_count,
            discovery_muted: false,
            status_messages: heapless::Vec::new(),
            last_status_response: DataPack::new(),
        }
    }

    /// Queues a status message for collection via STATUS_MESSAGES.
    pub fn push_status(&mut self, status: StatusMessage) -> bool {
        self.status_messages.push(status).is_ok()
    }

    pub fn dmx_start_address(&self) -> DmxStartAddress {
        let Some(value) = self.store.parameter_get(0, pids::DMX_START_ADDRESS) else {
            return DmxStartAddress::NoAddress;
        };
        if value.len() != 2 {
            return DmxStartAddress::NoAddress;
        }

        u16::from_le_bytes(value.try_into().unwrap())
            .try_into()
            .unwrap_or(DmxStartAddress::NoAddress)
    }

    pub fn identify_is_active(&self) -> bool {
        self.store
            .parameter_get(0, pids::IDENTIFY_DEVICE)
            .is_some_and(|value| value.first().copied().unwrap_or(0) != 0)
    }
}

impl<V: Nvs, const PARAMS: usize, const QUEUE: usize> DeviceModel
    for ResponderDevice<V, PARAMS, QUEUE>
{
    fn parameter_get(&self, sub_device: u16, pid: u16) -> Option<&[u8]> {
        self.store.parameter_get(sub_device, pid)
    }

    fn parameter_set(&mut self, sub_device: u16, pid: u16, value: &[u8]) -> bool {
        self.store.parameter_set(sub_device, pid, value)
    }

    fn definition_get(&self, sub_device: u16, pid: u16) -> Option<&'static ParameterDefinition> {
        self.store.definition_get(sub_device, pid)
    }

    fn supported_pids(&self, sub_device: u16, out: &mut heapless::Vec<u16, SUPPORTED_PIDS_MAX>) {
        let mut registered = heapless::Vec::<u16, PARAMS>::new();
        self.store.pids(sub_device, &mut registered);

        out.clear();
        for pid in registered {
            if !UNLISTED_PIDS.contains(&pid) {
                let _ = out.push(pid);
            }
        }
    }

    fn device_info(&self) -> DeviceInfo {
        // The product info parameter stores model id, category and software
        // version as an 8-byte image; everything else is live state.
        let mut product_info = [0xFFu8; 8];
        self.store
            .parameter_copy(0, pids::DEVICE_INFO, &mut product_info);

        DeviceInfo {
            device_model_id: u16::from_le_bytes(product_info[0..2].try_into().unwrap()),
            product_category: u16::from_le_bytes(product_info[2..4].try_into().unwrap()),
            software_version_id: u32::from_le_bytes(product_info[4..8].try_into().unwrap()),
            dmx_footprint: self.dmx_footprint,
            personality_current: self.personality_current,
            personality_count: self.personality_count,
            dmx_start_address: self.dmx_start_address(),
            sub_device_count: self.sub_device_count,
            sensor_count: self.sensor_count,
        }
    }

    fn message_count(&self) -> u8 {
        self.store.message_count()
    }

    fn pop_statuses(&mut self, filter: StatusType) -> DataPack {
        let mut parameter_data = DataPack::new();

        self.status_messages.retain(|status| {
            let matches = (status.status_type as u8) & 0x0F >= filter as u8;
            if matches
                && parameter_data
                    .extend_from_slice(&status.serialize())
                    .is_err()
            {
                // Out of response space; keep the message for the next
                // request.
                return true;
            }

            !matches
        });

        self.last_status_response = parameter_data.clone();
        parameter_data
    }

    fn last_statuses(&self) -> DataPack {
        self.last_status_response.clone()
    }
}

// ---------------------------------------------------------------------------
// Built-in PID handlers

fn read_le_uint(bytes: &[u8]) -> Option<u64> {
    match bytes.len() {
        1 => Some(bytes[0] as u64),
        2 => Some(u16::from_le_bytes(bytes.try_into().unwrap()) as u64),
        4 => Some(u32::from_le_bytes(bytes.try_into().unwrap()) as u64),
        _ => None,
    }
}

fn value_in_range(definition: &ParameterDefinition, value: &[u8]) -> bool {
    if definition.min_value == 0 && definition.max_value == 0 {
        return true;
    }

    match definition.data_type {
        ParameterDataType::UnsignedByte
        | ParameterDataType::UnsignedWord
        | ParameterDataType::UnsignedDword => match read_le_uint(value) {
            Some(value) => {
                (definition.min_value as u64..=definition.max_value as u64).contains(&value)
            },
            None => false,
        },
        _ => true,
    }
}

/// The handler behind every parameter whose GET echoes the stored bytes
/// and whose SET replaces them: device label, start address, identify and
/// friends.
pub fn simple_response_handler(ctx: &mut PidContext<'_>) -> HandlerResponse {
    match ctx.header.command_class {
        RequestCommandClass::GetCommand => {
            let operation = match ctx.definition.get {
                Some(operation) => operation,
                None => return HandlerResponse::Nack(NackReason::UnsupportedCommandClass),
            };

            let mut value = [0u8; RDM_ASCII_SIZE_MAX];
            let size = {
                let Some(stored) =
                    ctx.device
                        .parameter_get(ctx.header.sub_device, ctx.header.parameter_id)
                else {
                    return HandlerResponse::Nack(NackReason::HardwareFault);
                };
                let size = stored.len().min(value.len());
                value[..size].copy_from_slice(&stored[..size]);
                size
            };

            match operation.response_format {
                Some(response_format) => {
                    match format::encode(response_format, &value[..size], &mut ctx.pd[..]) {
                        Ok(written) => HandlerResponse::Ack(written),
                        Err(_) => HandlerResponse::Nack(NackReason::HardwareFault),
                    }
                },
                None => {
                    ctx.pd[..size].copy_from_slice(&value[..size]);
                    HandlerResponse::Ack(size)
                },
            }
        },
        RequestCommandClass::SetCommand => {
            let operation = match ctx.definition.set {
                Some(operation) => operation,
                None => return HandlerResponse::Nack(NackReason::UnsupportedCommandClass),
            };

            let mut value = [0u8; RDM_ASCII_SIZE_MAX];
            let size = match operation.request_format {
                Some(request_format) => {
                    match format::decode(request_format, &ctx.pd[..ctx.pdl], &mut value) {
                        Ok(size) => size,
                        Err(_) => return HandlerResponse::Nack(NackReason::FormatError),
                    }
                },
                None => {
                    if ctx.pdl > value.len() {
                        return HandlerResponse::Nack(NackReason::FormatError);
                    }
                    value[..ctx.pdl].copy_from_slice(&ctx.pd[..ctx.pdl]);
                    ctx.pdl
                },
            };

            if !value_in_range(ctx.definition, &value[..size]) {
                return HandlerResponse::Nack(NackReason::DataOutOfRange);
            }

            if !ctx
                .device
                .parameter_set(ctx.header.sub_device, ctx.header.parameter_id, &value[..size])
            {
                return HandlerResponse::Nack(NackReason::HardwareFault);
            }

            HandlerResponse::Ack(0)
        },
        RequestCommandClass::DiscoveryCommand => {
            HandlerResponse::Nack(NackReason::UnsupportedCommandClass)
        },
    }
}

/// GET DEVICE_INFO. The 19-byte response is synthesized at call time.
fn device_info_handler(ctx: &mut PidContext<'_>) -> HandlerResponse {
    let serialized = ctx.device.device_info().serialize();

    ctx.pd[..serialized.len()].copy_from_slice(&serialized);
    HandlerResponse::Ack(serialized.len())
}

/// GET SUPPORTED_PARAMETERS: every registered PID beyond the mandatory
/// minimum set, two bytes each.
fn supported_parameters_handler(ctx: &mut PidContext<'_>) -> HandlerResponse {
    let mut supported = heapless::Vec::<u16, SUPPORTED_PIDS_MAX>::new();
    ctx.device
        .supported_pids(ctx.header.sub_device, &mut supported);

    let mut written = 0;
    for pid in supported {
        if written + 2 > ctx.pd.len() {
            break;
        }
        ctx.pd[written..written + 2].copy_from_slice(&pid.to_be_bytes());
        written += 2;
    }

    HandlerResponse::Ack(written)
}

/// GET PARAMETER_DESCRIPTION, served for manufacturer-specific PIDs only.
fn parameter_description_handler(ctx: &mut PidContext<'_>) -> HandlerResponse {
    let requested_pid = u16::from_be_bytes(ctx.pd[..2].try_into().unwrap());

    if !(RDM_PID_MANUFACTURER_FIRST..=RDM_PID_MANUFACTURER_LAST).contains(&requested_pid) {
        return HandlerResponse::Nack(NackReason::DataOutOfRange);
    }

    let Some(definition) = ctx.device.definition_get(0, requested_pid) else {
        return HandlerResponse::Nack(NackReason::DataOutOfRange);
    };

    let mut image = [0u8; 20 + RDM_ASCII_SIZE_MAX];
    image[0..2].copy_from_slice(&requested_pid.to_le_bytes());
    image[2] = definition.pdl_size;
    image[3] = definition.data_type as u8;
    image[4] = definition.pid_cc as u8;
    image[5] = 0; // parameter type, always zero
    image[6] = definition.units as u8;
    image[7] = definition.prefix as u8;
    image[8..12].copy_from_slice(&definition.min_value.to_le_bytes());
    image[12..16].copy_from_slice(&definition.max_value.to_le_bytes());
    image[16..20].copy_from_slice(&definition.default_value.to_le_bytes());

    let description = definition.description.unwrap_or("").as_bytes();
    let description_len = description.len().min(RDM_ASCII_SIZE_MAX - 1);
    image[20..20 + description_len].copy_from_slice(&description[..description_len]);

    match format::encode(
        PARAMETER_DESCRIPTION_RESPONSE_FORMAT,
        &image[..20 + description_len],
        &mut ctx.pd[..],
    ) {
        Ok(written) => HandlerResponse::Ack(written),
        Err(_) => HandlerResponse::Nack(NackReason::HardwareFault),
    }
}

/// GET STATUS_MESSAGES, also the fallback for GET QUEUED_MESSAGE when the
/// queue is empty.
fn status_messages_handler(ctx: &mut PidContext<'_>) -> HandlerResponse {
    let status_type: StatusType = match ctx.pd[0].try_into() {
        Ok(status_type) => status_type,
        Err(_) => return HandlerResponse::Nack(NackReason::DataOutOfRange),
    };

    match status_type {
        StatusType::StatusNone => HandlerResponse::Ack(0),
        StatusType::StatusGetLastMessage => {
            let last = ctx.device.last_statuses();
            ctx.pd[..last.len()].copy_from_slice(&last);
            HandlerResponse::Ack(last.len())
        },
        StatusType::StatusAdvisory | StatusType::StatusWarning | StatusType::StatusError => {
            let statuses = ctx.device.pop_statuses(status_type);
            ctx.pd[..statuses.len()].copy_from_slice(&statuses);
            HandlerResponse::Ack(statuses.len())
        },
        _ => HandlerResponse::Nack(NackReason::DataOutOfRange),
    }
}

// ---------------------------------------------------------------------------
// Built-in definitions

const PARAMETER_DESCRIPTION_RESPONSE_FORMAT: &str = "wbbbbbbddda$";

static DEVICE_INFO_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::Get,
    data_type: ParameterDataType::NotDefined,
    get: Some(PidOperation {
        handler: device_info_handler,
        request_format: None,
        response_format: None,
    }),
    set: None,
    pdl_size: 0,
    min_value: 0,
    max_value: 0,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static SUPPORTED_PARAMETERS_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::Get,
    data_type: ParameterDataType::NotDefined,
    get: Some(PidOperation {
        handler: supported_parameters_handler,
        request_format: None,
        response_format: None,
    }),
    set: None,
    pdl_size: 0,
    min_value: 0,
    max_value: 0,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static PARAMETER_DESCRIPTION_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::Get,
    data_type: ParameterDataType::NotDefined,
    get: Some(PidOperation {
        handler: parameter_description_handler,
        request_format: Some("w$"),
        response_format: Some(PARAMETER_DESCRIPTION_RESPONSE_FORMAT),
    }),
    set: None,
    pdl_size: 2,
    min_value: 0,
    max_value: 0,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static SOFTWARE_VERSION_LABEL_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::Get,
    data_type: ParameterDataType::Ascii,
    get: Some(PidOperation {
        handler: simple_response_handler,
        request_format: None,
        response_format: Some("a$"),
    }),
    set: None,
    pdl_size: RDM_ASCII_SIZE_MAX as u8,
    min_value: 0,
    max_value: 0,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static DEVICE_LABEL_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::GetSet,
    data_type: ParameterDataType::Ascii,
    get: Some(PidOperation {
        handler: simple_response_handler,
        request_format: None,
        response_format: Some("a"),
    }),
    set: Some(PidOperation {
        handler: simple_response_handler,
        request_format: Some("a"),
        response_format: None,
    }),
    pdl_size: RDM_ASCII_SIZE_MAX as u8,
    min_value: 0,
    max_value: 0,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static DMX_START_ADDRESS_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::GetSet,
    data_type: ParameterDataType::UnsignedWord,
    get: Some(PidOperation {
        handler: simple_response_handler,
        request_format: None,
        response_format: Some("w$"),
    }),
    set: Some(PidOperation {
        handler: simple_response_handler,
        request_format: Some("w$"),
        response_format: None,
    }),
    pdl_size: 2,
    min_value: 1,
    max_value: 512,
    default_value: 1,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static IDENTIFY_DEVICE_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::GetSet,
    data_type: ParameterDataType::UnsignedByte,
    get: Some(PidOperation {
        handler: simple_response_handler,
        request_format: None,
        response_format: Some("b$"),
    }),
    set: Some(PidOperation {
        handler: simple_response_handler,
        request_format: Some("b$"),
        response_format: None,
    }),
    pdl_size: 1,
    min_value: 0,
    max_value: 1,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static QUEUED_MESSAGE_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::Get,
    data_type: ParameterDataType::NotDefined,
    get: Some(PidOperation {
        handler: status_messages_handler,
        request_format: Some("b$"),
        response_format: None,
    }),
    set: None,
    pdl_size: 1,
    min_value: 0,
    max_value: 0,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

static STATUS_MESSAGES_DEFINITION: ParameterDefinition = ParameterDefinition {
    pid_cc: CommandClassSpec::Get,
    data_type: ParameterDataType::NotDefined,
    get: Some(PidOperation {
        handler: status_messages_handler,
        request_format: Some("b$"),
        response_format: None,
    }),
    set: None,
    pdl_size: 1,
    min_value: 0,
    max_value: 0,
    default_value: 0,
    units: Units::None,
    prefix: Prefix::None,
    description: None,
};

// ---------------------------------------------------------------------------
// Engine

/// How the engine answered one request.
pub enum RdmAnswer {
    /// Has to be sent with an uart break.
    Response(RdmResponseData),
    /// Has to be sent without an uart break.
    DiscoveryResponse(UniqueIdentifier),
    /// A broadcast was executed; nothing goes on the wire. Carries the
    /// served PID so callbacks still fire.
    Executed(u16),
    /// No response to send.
    NoResponse,
}

/// Dispatches parsed RDM requests against a [ResponderDevice] without an
/// underlying driver. Useful on its own for heavily interrupt-driven
/// applications.
pub struct ResponderEngine<V: Nvs, const PARAMS: usize, const QUEUE: usize> {
    pub device: ResponderDevice<V, PARAMS, QUEUE>,
    last_queued_response: Option<RdmResponseData>,
}

impl<V: Nvs, const PARAMS: usize, const QUEUE: usize> ResponderEngine<V, PARAMS, QUEUE> {
    /// Builds the engine and auto-registers the built-in PIDs.
    pub fn new(nvs: V, config: &RdmResponderConfig) -> Self {
        let mut store = ParameterStore::new(nvs);

        let mut product_info = [0u8; 8];
        product_info[0..2].copy_from_slice(&config.device_model_id.to_le_bytes());
        product_info[2..4].copy_from_slice(&config.product_category.to_le_bytes());
        product_info[4..8].copy_from_slice(&config.software_version_id.to_le_bytes());
        store.add_parameter(0, pids::DEVICE_INFO, StorageClass::Dynamic, &product_info, 8);
        store.definition_set(0, pids::DEVICE_INFO, &DEVICE_INFO_DEFINITION);

        store.add_parameter(0, pids::SUPPORTED_PARAMETERS, StorageClass::Dynamic, &[], 0);
        store.definition_set(
            0,
            pids::SUPPORTED_PARAMETERS,
            &SUPPORTED_PARAMETERS_DEFINITION,
        );

        store.add_parameter(0, pids::PARAMETER_DESCRIPTION, StorageClass::Dynamic, &[], 0);
        store.definition_set(
            0,
            pids::PARAMETER_DESCRIPTION,
            &PARAMETER_DESCRIPTION_DEFINITION,
        );

        store.add_parameter_static(
            0,
            pids::SOFTWARE_VERSION_LABEL,
            &config.software_version_label.as_bytes()
                [..config.software_version_label.len().min(RDM_ASCII_SIZE_MAX - 1)],
        );
        store.definition_set(
            0,
            pids::SOFTWARE_VERSION_LABEL,
            &SOFTWARE_VERSION_LABEL_DEFINITION,
        );

        store.add_parameter(
            0,
            pids::DMX_START_ADDRESS,
            StorageClass::NonVolatile,
            &config.dmx_start_address.to_le_bytes(),
            2,
        );
        store.definition_set(0, pids::DMX_START_ADDRESS, &DMX_START_ADDRESS_DEFINITION);

        store.add_parameter(0, pids::IDENTIFY_DEVICE, StorageClass::Dynamic, &[0], 1);
        store.definition_set(0, pids::IDENTIFY_DEVICE, &IDENTIFY_DEVICE_DEFINITION);

        store.add_parameter(0, pids::QUEUED_MESSAGE, StorageClass::Dynamic, &[], 0);
        store.definition_set(0, pids::QUEUED_MESSAGE, &QUEUED_MESSAGE_DEFINITION);

        store.add_parameter(0, pids::STATUS_MESSAGES, StorageClass::Dynamic, &[], 0);
        store.definition_set(0, pids::STATUS_MESSAGES, &STATUS_MESSAGES_DEFINITION);

        Self {
            device: ResponderDevice::new(store, config),
            last_queued_response: None,
        }
    }

    /// Registers the optional DEVICE_LABEL parameter. The label must be
    /// shorter than 32 bytes.
    pub fn register_device_label(&mut self, label: &str) -> bool {
        if label.len() >= RDM_ASCII_SIZE_MAX {
            return false;
        }

        if !self.device.store.parameter_exists(0, pids::DEVICE_LABEL)
            && !self.device.store.add_parameter(
                0,
                pids::DEVICE_LABEL,
                StorageClass::NonVolatile,
                label.as_bytes(),
                RDM_ASCII_SIZE_MAX - 1,
            )
        {
            return false;
        }

        self.device
            .store
            .definition_set(0, pids::DEVICE_LABEL, &DEVICE_LABEL_DEFINITION)
    }

    /// Handles one parsed request. `uid` is the responding device's UID.
    pub fn handle_rdm_request(&mut self, request: &RdmRequestData, uid: UniqueIdentifier) -> RdmAnswer {
        // Is the request for us at all?
        match request.destination_uid {
            PacketAddress::ManufacturerBroadcast(manufacturer_id) => {
                if manufacturer_id != uid.manufacturer_id() {
                    return RdmAnswer::NoResponse;
                }
            },
            PacketAddress::Device(device_uid) => {
                if device_uid != uid {
                    return RdmAnswer::NoResponse;
                }
            },
            PacketAddress::Broadcast => {},
        }

        // Discovery commands reach only the three discovery PIDs.
        if request.command_class == RequestCommandClass::DiscoveryCommand
            && ![pids::DISC_UNIQUE_BRANCH, pids::DISC_MUTE, pids::DISC_UN_MUTE]
                .contains(&request.parameter_id)
        {
            return RdmAnswer::NoResponse;
        }

        match request.parameter_id {
            pids::DISC_UNIQUE_BRANCH => self.handle_disc_unique_branch(request, uid),
            pids::DISC_MUTE => self.handle_disc_mute(request, uid, true),
            pids::DISC_UN_MUTE => self.handle_disc_mute(request, uid, false),
            pids::QUEUED_MESSAGE => self.handle_queued_message(request, uid),
            _ => self.dispatch_to_definition(request, uid),
        }
    }

    fn handle_disc_unique_branch(
        &mut self,
        request: &RdmRequestData,
        uid: UniqueIdentifier,
    ) -> RdmAnswer {
        if request.command_class != RequestCommandClass::DiscoveryCommand {
            return self.nack(request, uid, NackReason::UnsupportedCommandClass);
        }

        if request.parameter_data.len() != 12 {
            return RdmAnswer::NoResponse;
        }

        let lower_bound: u64 =
            PacketAddress::from_bytes(&request.parameter_data[..6].try_into().unwrap()).into();
        let upper_bound: u64 =
            PacketAddress::from_bytes(&request.parameter_data[6..].try_into().unwrap()).into();
        let own_uid: u64 = uid.into();

        if !self.device.discovery_muted && (lower_bound..=upper_bound).contains(&own_uid) {
            return RdmAnswer::DiscoveryResponse(uid);
        }

        RdmAnswer::NoResponse
    }

    fn handle_disc_mute(
        &mut self,
        request: &RdmRequestData,
        uid: UniqueIdentifier,
        mute: bool,
    ) -> RdmAnswer {
        if request.command_class != RequestCommandClass::DiscoveryCommand {
            return self.nack(request, uid, NackReason::UnsupportedCommandClass);
        }

        if !request.parameter_data.is_empty() {
            return RdmAnswer::NoResponse;
        }

        self.device.discovery_muted = mute;

        if request.destination_uid.is_broadcast() {
            let pid = request.parameter_id;
            return RdmAnswer::Executed(pid);
        }

        let control_field = DiscoveryMuteResponse {
            managed_proxy: false,
            sub_device: false,
            boot_loader: false,
            proxy_device: false,
            binding_uid: None,
        };
        RdmAnswer::Response(request.build_response_from(
            uid,
            ResponseType::Ack,
            control_field.serialize(),
            self.device.message_count(),
        ))
    }

    /// GET QUEUED_MESSAGE: pop a pending PID and serve its GET in place of
    /// the queued-message request. PIDs whose definition went away are
    /// skipped. An empty queue degrades to a STATUS_MESSAGES response.
    fn handle_queued_message(&mut self, request: &RdmRequestData, uid: UniqueIdentifier) -> RdmAnswer {
        if request.destination_uid.is_broadcast() {
            return RdmAnswer::NoResponse;
        }
        if request.command_class != RequestCommandClass::GetCommand {
            return self.nack(request, uid, NackReason::UnsupportedCommandClass);
        }

        let status_type = match StatusType::deserialize(&request.parameter_data) {
            Ok(status_type) => status_type,
            Err(_) => return self.nack(request, uid, NackReason::FormatError),
        };

        match status_type {
            StatusType::StatusGetLastMessage => {
                if let Some(ref mut last) = self.last_queued_response {
                    last.transaction_number = request.transaction_number;
                    last.message_count = self.device.store.message_count();
                    return RdmAnswer::Response(last.clone());
                }
            },
            StatusType::StatusAdvisory | StatusType::StatusWarning | StatusType::StatusError => {},
            _ => return self.nack(request, uid, NackReason::DataOutOfRange),
        }

        while let Some(queued_pid) = self.device.store.queue_pop() {
            let Some(definition) = self.device.store.definition_get(0, queued_pid) else {
                continue;
            };
            if definition.get.is_none() {
                continue;
            }

            let mut substituted = request.clone();
            substituted.parameter_id = queued_pid;
            substituted.parameter_data = DataPack::new();

            let answer = self.invoke(&substituted, uid, definition);
            if let RdmAnswer::Response(ref response) = answer {
                self.last_queued_response = Some(response.clone());
            }
            return answer;
        }

        // Nothing queued: answer with the device's status messages instead.
        let mut substituted = request.clone();
        substituted.parameter_id = pids::STATUS_MESSAGES;
        let answer = self.invoke(&substituted, uid, &STATUS_MESSAGES_DEFINITION);
        if let RdmAnswer::Response(ref response) = answer {
            self.last_queued_response = Some(response.clone());
        }
        answer
    }

    fn dispatch_to_definition(&mut self, request: &RdmRequestData, uid: UniqueIdentifier) -> RdmAnswer {
        if request.sub_device != 0 {
            return self.nack(request, uid, NackReason::SubDeviceOutOfRange);
        }

        let Some(definition) = self
            .device
            .store
            .definition_get(request.sub_device, request.parameter_id)
        else {
            return self.nack(request, uid, NackReason::UnknownPid);
        };

        if !definition.pid_cc.admits(request.command_class) {
            return self.nack(request, uid, NackReason::UnsupportedCommandClass);
        }

        self.invoke(request, uid, definition)
    }

    /// Runs the definition's handler and composes the reply.
    fn invoke(
        &mut self,
        request: &RdmRequestData,
        uid: UniqueIdentifier,
        definition: &'static ParameterDefinition,
    ) -> RdmAnswer {
        let operation = match request.command_class {
            RequestCommandClass::GetCommand => definition.get,
            RequestCommandClass::SetCommand => definition.set,
            RequestCommandClass::DiscoveryCommand => None,
        };
        let Some(operation) = operation else {
            return self.nack(request, uid, NackReason::UnsupportedCommandClass);
        };

        // The request's parameter data must fit the declared layout.
        let pdl_ok = match operation.request_format {
            Some(request_format) => {
                format::pdl_matches(request_format, request.parameter_data.len()).unwrap_or(false)
            },
            None => request.parameter_data.is_empty(),
        };
        if !pdl_ok {
            return self.nack(request, uid, NackReason::FormatError);
        }

        let mut pd = [0u8; RDM_MAX_PDL];
        pd[..request.parameter_data.len()].copy_from_slice(&request.parameter_data);

        let response = {
            let mut context = PidContext {
                header: request,
                definition,
                device: &mut self.device,
                pd: &mut pd,
                pdl: request.parameter_data.len(),
            };
            (operation.handler)(&mut context)
        };

        let is_broadcast = request.destination_uid.is_broadcast();
        match response {
            HandlerResponse::Ack(pdl) => {
                if is_broadcast {
                    return RdmAnswer::Executed(request.parameter_id);
                }
                self.write_ack(request, uid, &pd[..pdl])
            },
            HandlerResponse::AckTimer(deci_seconds) => {
                if is_broadcast {
                    return RdmAnswer::Executed(request.parameter_id);
                }
                self.write_ack_timer(request, uid, deci_seconds)
            },
            HandlerResponse::Nack(reason) => self.nack(request, uid, reason),
            HandlerResponse::NoResponse => RdmAnswer::NoResponse,
        }
    }

    /// Standard ACK carrying wire-ready parameter data.
    fn write_ack(
        &self,
        request: &RdmRequestData,
        uid: UniqueIdentifier,
        parameter_data: &[u8],
    ) -> RdmAnswer {
        RdmAnswer::Response(request.build_response_from(
            uid,
            ResponseType::Ack,
            DataPack::from_slice(parameter_data).unwrap(),
            self.device.message_count(),
        ))
    }

    /// NACK with a two-byte reason code.
    fn write_nack_reason(
        &self,
        request: &RdmRequestData,
        uid: UniqueIdentifier,
        reason: NackReason,
    ) -> RdmAnswer {
        RdmAnswer::Response(request.build_response_from(
            uid,
            ResponseType::NackReason,
            reason.serialize(),
            self.device.message_count(),
        ))
    }

    /// ACK_TIMER: the result will be ready after `deci_seconds` * 100 ms.
    fn write_ack_timer(
        &self,
        request: &RdmRequestData,
        uid: UniqueIdentifier,
        deci_seconds: u16,
    ) -> RdmAnswer {
        RdmAnswer::Response(request.build_response_from(
            uid,
            ResponseType::AckTimer,
            DataPack::from_slice(&deci_seconds.to_be_bytes()).unwrap(),
            self.device.message_count(),
        ))
    }

    fn nack(
        &self,
        request: &RdmRequestData,
        uid: UniqueIdentifier,
        reason: NackReason,
    ) -> RdmAnswer {
        if request.destination_uid.is_broadcast() {
            return RdmAnswer::NoResponse;
        }

        self.write_nack_reason(request, uid, reason)
    }
}

// ---------------------------------------------------------------------------
// Driver-coupled responder

/// What one [RdmResponder::poll] produced.
pub enum PollEvent {
    /// A null-start-code frame, start code included.
    Dmx(DmxFrame),
    /// A frame with a permitted alternate start code.
    Custom(DmxFrame),
    /// An RDM request was handled; the response (if any) is on the wire.
    Rdm(RdmHandled),
    /// The frame was dropped before dispatch: it failed its checksum,
    /// could not be parsed, or carried a reserved start code. Frames
    /// addressed to another device reach dispatch and report as
    /// [RdmHandled::NoResponse] instead.
    Ignored,
}

/// The outcome of a handled RDM request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RdmHandled {
    /// A standard response for this PID went out.
    Responded(u16),
    /// A discovery response went out.
    DiscoveryResponded,
    /// A broadcast was executed silently.
    Executed(u16),
    /// Dispatched without a reply: addressed to another device, or
    /// deliberately unanswered.
    NoResponse,
}

/// A complete RDM responder: driver, parameter registry and dispatch.
///
/// Borrows the driver instead of owning it; the UART and timer interrupt
/// handlers keep their own shared reference to the same [DmxDriver].
pub struct RdmResponder<'d, P: DmxPlatform, const PARAMS: usize, const QUEUE: usize> {
    driver: &'d DmxDriver<P>,
    engine: ResponderEngine<P::Nvs, PARAMS, QUEUE>,
}

impl<'d, P: DmxPlatform, const PARAMS: usize, const QUEUE: usize>
    RdmResponder<'d, P, PARAMS, QUEUE>
{
    /// Couples a driver to a fresh engine and registers the built-in PIDs.
    pub fn new(driver: &'d DmxDriver<P>, nvs: P::Nvs, config: &RdmResponderConfig) -> Self {
        Self {
            driver,
            engine: ResponderEngine::new(nvs, config),
        }
    }

    pub fn driver(&self) -> &DmxDriver<P> {
        self.driver
    }

    pub fn engine(&self) -> &ResponderEngine<P::Nvs, PARAMS, QUEUE> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ResponderEngine<P::Nvs, PARAMS, QUEUE> {
        &mut self.engine
    }

    /// Registers the optional DEVICE_LABEL parameter.
    pub fn register_device_label(&mut self, label: &str) -> bool {
        self.engine.register_device_label(label)
    }

    /// Receives one frame and fully handles it: RDM requests are dispatched
    /// and answered on the wire, other frames are returned to the caller.
    pub fn poll(&mut self, timeout_ms: u32) -> Result<PollEvent, DmxError> {
        let mut frame = [0u8; DMX_MAX_PACKET_SIZE];
        let received = self.driver.receive(&mut frame, timeout_ms)?;
        let frame = &frame[..received.size];

        let Some(&start_code) = frame.first() else {
            return Ok(PollEvent::Ignored);
        };

        match start_code {
            SC_RDM => self.handle_rdm_frame(frame),
            crate::consts::DMX_NULL_START => {
                Ok(PollEvent::Dmx(DmxFrame::from_slice(frame).unwrap()))
            },
            _ if start_code_is_valid(start_code) => {
                Ok(PollEvent::Custom(DmxFrame::from_slice(frame).unwrap()))
            },
            _ => Ok(PollEvent::Ignored),
        }
    }

    /// [RdmResponder::poll] with the receive watchdog timeout.
    pub fn poll_default(&mut self) -> Result<PollEvent, DmxError> {
        self.poll(READ_TIMEOUT_MS)
    }

    fn handle_rdm_frame(&mut self, frame: &[u8]) -> Result<PollEvent, DmxError> {
        let event = match RdmData::deserialize(frame) {
            Ok(event) => event,
            Err(_) => return Ok(PollEvent::Ignored),
        };

        // Corrupt packets are dropped before dispatch; no response, no
        // notification.
        if !event.checksum_is_valid {
            return Ok(PollEvent::Ignored);
        }

        let request = match event.data {
            RdmData::Request(request) => request,
            RdmData::Response(_) => return Ok(PollEvent::Ignored),
        };

        let uid = self.driver.uid();
        let handled = match self.engine.handle_rdm_request(&request, uid) {
            RdmAnswer::Response(response) => {
                let served_pid = response.parameter_id;
                let packet = RdmData::Response(response).serialize();
                self.driver.send(&packet)?;
                self.driver.wait_sent(WRITE_TIMEOUT_MS)?;
                self.fire_callback(served_pid, &request);
                RdmHandled::Responded(served_pid)
            },
            RdmAnswer::DiscoveryResponse(uid) => {
                // Discovery responses skip the break and the usual
                // inter-slot pacing.
                let packet = serialize_discovery_response(uid);
                self.driver.send_without_break(&packet)?;
                self.driver.wait_sent(WRITE_TIMEOUT_MS)?;
                RdmHandled::DiscoveryResponded
            },
            RdmAnswer::Executed(pid) => {
                self.fire_callback(pid, &request);
                RdmHandled::Executed(pid)
            },
            RdmAnswer::NoResponse => RdmHandled::NoResponse,
        };

        Ok(PollEvent::Rdm(handled))
    }

    fn fire_callback(&self, pid: u16, request: &RdmRequestData) {
        if let Some(callback) = self.engine.device.store.callback_get(0, pid) {
            callback.parameter_touched(0, pid, request);
        }
    }
}
