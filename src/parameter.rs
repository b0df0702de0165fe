//! The typed parameter registry behind the RDM responder: storage-classed
//! values, per-PID definition metadata, user callbacks and the queue of
//! pending change notifications.

use crate::command_class::CommandClassSpec;
use crate::consts::RDM_ASCII_SIZE_MAX;
use crate::hal::Nvs;
use crate::rdm_data::RdmRequestData;
use crate::types::NackReason;

/// Largest value a dynamic or non-volatile parameter can hold.
pub const PARAMETER_VALUE_MAX: usize = RDM_ASCII_SIZE_MAX;

/// How a parameter's bytes are backed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageClass {
    /// Caller-owned memory, read-only for the driver's lifetime.
    Static,
    /// Driver-owned RAM.
    Dynamic,
    /// Driver-owned RAM, written through to the [Nvs] backend.
    NonVolatile,
}

enum ValueStorage {
    Static(&'static [u8]),
    Owned {
        bytes: heapless::Vec<u8, PARAMETER_VALUE_MAX>,
        non_volatile: bool,
    },
}

impl ValueStorage {
    fn class(&self) -> StorageClass {
        match self {
            ValueStorage::Static(_) => StorageClass::Static,
            ValueStorage::Owned {
                non_volatile: false,
                ..
            } => StorageClass::Dynamic,
            ValueStorage::Owned {
                non_volatile: true, ..
            } => StorageClass::NonVolatile,
        }
    }
}

/// RDM data type tags from ANSI E1.20 Table A-15.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ParameterDataType {
    NotDefined = 0x00,
    BitField = 0x01,
    Ascii = 0x02,
    UnsignedByte = 0x03,
    SignedByte = 0x04,
    UnsignedWord = 0x05,
    SignedWord = 0x06,
    UnsignedDword = 0x07,
    SignedDword = 0x08,
}

/// Units from ANSI E1.20 Table A-13, abridged to the ones the engine
/// emits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Units {
    None = 0x00,
    Centigrade = 0x01,
    Volts = 0x03,
    Amperes = 0x04,
    Hertz = 0x09,
    Second = 0x15,
}

/// Prefixes from ANSI E1.20 Table A-14, abridged.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Prefix {
    None = 0x00,
    Milli = 0x03,
    Kilo = 0x11,
}

/// What a GET or SET handler asks the responder to emit.
#[derive(Debug)]
pub enum HandlerResponse {
    /// Acknowledge with the given number of parameter-data bytes, already
    /// wire-encoded into the context's data buffer.
    Ack(usize),
    /// Acknowledge, result ready after the given time in 100 ms steps.
    AckTimer(u16),
    /// Refuse with a reason.
    Nack(NackReason),
    /// Say nothing at all.
    NoResponse,
}

/// One GET or SET operation of a parameter definition.
#[derive(Copy, Clone)]
pub struct PidOperation {
    pub handler: crate::responder::ResponseHandler,
    /// Wire layout of the request parameter data, if any is admitted.
    pub request_format: Option<&'static str>,
    /// Wire layout of the response parameter data, if any is produced.
    pub response_format: Option<&'static str>,
}

/// Everything the responder knows about a PID beyond its stored bytes.
/// Definitions live in static storage and are borrowed for the driver's
/// lifetime.
#[derive(Copy, Clone)]
pub struct ParameterDefinition {
    pub pid_cc: CommandClassSpec,
    pub data_type: ParameterDataType,
    pub get: Option<PidOperation>,
    pub set: Option<PidOperation>,
    pub pdl_size: u8,
    pub min_value: u32,
    pub max_value: u32,
    pub default_value: u32,
    pub units: Units,
    pub prefix: Prefix,
    pub description: Option<&'static str>,
}

/// User hook fired after a request for its parameter completes
/// successfully.
pub trait ParameterCallback: Sync {
    fn parameter_touched(&self, sub_device: u16, pid: u16, request: &RdmRequestData);
}

struct ParameterEntry {
    sub_device: u16,
    pid: u16,
    storage: ValueStorage,
    /// Upper bound for writes, fixed at registration.
    capacity: usize,
    definition: Option<&'static ParameterDefinition>,
    callback: Option<&'static dyn ParameterCallback>,
}

/// The registry of parameters for one port. Touched in task context only;
/// the framer never reaches in here.
pub struct ParameterStore<V: Nvs, const PARAMS: usize, const QUEUE: usize> {
    entries: heapless::Vec<ParameterEntry, PARAMS>,
    queue: heapless::Deque<u16, QUEUE>,
    nvs: V,
}

impl<V: Nvs, const PARAMS: usize, const QUEUE: usize> ParameterStore<V, PARAMS, QUEUE> {
    pub fn new(nvs: V) -> Self {
        Self {
            entries: heapless::Vec::new(),
            queue: heapless::Deque::new(),
            nvs,
        }
    }

    fn entry(&self, sub_device: u16, pid: u16) -> Option<&ParameterEntry> {
        self.entries
            .iter()
            .find(|entry| entry.sub_device == sub_device && entry.pid == pid)
    }

    fn entry_mut(&mut self, sub_device: u16, pid: u16) -> Option<&mut ParameterEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.sub_device == sub_device && entry.pid == pid)
    }

    /// Registers a parameter with driver-owned storage. For
    /// [StorageClass::NonVolatile] the persisted value wins over
    /// `init_value`. Refuses duplicates and refuses when the table or the
    /// per-entry capacity is exhausted.
    pub fn add_parameter(
        &mut self,
        sub_device: u16,
        pid: u16,
        class: StorageClass,
        init_value: &[u8],
        capacity: usize,
    ) -> bool {
        if class == StorageClass::Static || capacity > PARAMETER_VALUE_MAX {
            return false;
        }
        if self.entry(sub_device, pid).is_some() {
            return false;
        }

        let non_volatile = class == StorageClass::NonVolatile;
        let mut bytes = heapless::Vec::new();

        let mut loaded = false;
        if non_volatile {
            let mut stored = [0u8; PARAMETER_VALUE_MAX];
            if let Some(stored_size) = self.nvs.load(sub_device, pid, &mut stored) {
                let stored_size = stored_size.min(capacity);
                bytes.extend_from_slice(&stored[..stored_size]).unwrap();
                loaded = true;
            }
        }
        if !loaded && bytes.extend_from_slice(&init_value[..init_value.len().min(capacity)]).is_err()
        {
            return false;
        }

        self.entries
            .push(ParameterEntry {
                sub_device,
                pid,
                storage: ValueStorage::Owned {
                    bytes,
                    non_volatile,
                },
                capacity,
                definition: None,
                callback: None,
            })
            .is_ok()
    }

    /// Registers a parameter over caller-owned read-only memory. The
    /// buffer must outlive the driver, which the `'static` bound enforces.
    pub fn add_parameter_static(&mut self, sub_device: u16, pid: u16, value: &'static [u8]) -> bool {
        if self.entry(sub_device, pid).is_some() {
            return false;
        }

        self.entries
            .push(ParameterEntry {
                sub_device,
                pid,
                capacity: value.len(),
                storage: ValueStorage::Static(value),
                definition: None,
                callback: None,
            })
            .is_ok()
    }

    pub fn parameter_exists(&self, sub_device: u16, pid: u16) -> bool {
        self.entry(sub_device, pid).is_some()
    }

    /// Borrows the current value. The borrow is valid until the next write
    /// to the entry.
    pub fn parameter_get(&self, sub_device: u16, pid: u16) -> Option<&[u8]> {
        self.entry(sub_device, pid).map(|entry| match &entry.storage {
            ValueStorage::Static(value) => *value,
            ValueStorage::Owned { bytes, .. } => bytes.as_slice(),
        })
    }

    /// Writes a value: rejected for static storage, clamped to the entry's
    /// capacity, written through to [Nvs] for non-volatile entries, and
    /// queued for QUEUED_MESSAGE on success.
    pub fn parameter_set(&mut self, sub_device: u16, pid: u16, value: &[u8]) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.sub_device == sub_device && entry.pid == pid)
        else {
            return false;
        };

        let size = value.len().min(self.entries[index].capacity);
        let non_volatile = match self.entries[index].storage {
            ValueStorage::Static(_) => return false,
            ValueStorage::Owned { non_volatile, .. } => non_volatile,
        };

        // Persist before the RAM image changes so both always agree.
        if non_volatile && !self.nvs.store(sub_device, pid, &value[..size]) {
            return false;
        }

        if let ValueStorage::Owned { ref mut bytes, .. } = self.entries[index].storage {
            bytes.clear();
            bytes.extend_from_slice(&value[..size]).unwrap();
        }

        self.queue_push(pid);
        true
    }

    /// Copies the current value into caller memory. Returns the number of
    /// bytes copied, zero for unknown parameters.
    pub fn parameter_copy(&self, sub_device: u16, pid: u16, destination: &mut [u8]) -> usize {
        let Some(value) = self.parameter_get(sub_device, pid) else {
            return 0;
        };

        let size = value.len().min(destination.len());
        destination[..size].copy_from_slice(&value[..size]);
        size
    }

    pub fn parameter_size(&self, sub_device: u16, pid: u16) -> usize {
        self.parameter_get(sub_device, pid)
            .map(|value| value.len())
            .unwrap_or(0)
    }

    /// Associates definition metadata with a registered parameter. The
    /// definition's format strings must parse, and a definition with a SET
    /// handler demands writable storage.
    pub fn definition_set(
        &mut self,
        sub_device: u16,
        pid: u16,
        definition: &'static ParameterDefinition,
    ) -> bool {
        let formats = [
            definition.get.and_then(|op| op.request_format),
            definition.get.and_then(|op| op.response_format),
            definition.set.and_then(|op| op.request_format),
            definition.set.and_then(|op| op.response_format),
        ];
        if formats
            .into_iter()
            .flatten()
            .any(|format| crate::format::validate(format).is_err())
        {
            return false;
        }

        let Some(entry) = self.entry_mut(sub_device, pid) else {
            return false;
        };

        if definition.set.is_some() && entry.storage.class() == StorageClass::Static {
            return false;
        }

        entry.definition = Some(definition);
        true
    }

    pub fn definition_get(&self, sub_device: u16, pid: u16) -> Option<&'static ParameterDefinition> {
        self.entry(sub_device, pid)?.definition
    }

    /// Installs the user callback invoked after every successful request
    /// for this parameter.
    pub fn callback_set(
        &mut self,
        sub_device: u16,
        pid: u16,
        callback: &'static dyn ParameterCallback,
    ) -> bool {
        let Some(entry) = self.entry_mut(sub_device, pid) else {
            return false;
        };

        entry.callback = Some(callback);
        true
    }

    pub fn callback_get(
        &self,
        sub_device: u16,
        pid: u16,
    ) -> Option<&'static dyn ParameterCallback> {
        self.entry(sub_device, pid)?.callback
    }

    pub fn storage_class(&self, sub_device: u16, pid: u16) -> Option<StorageClass> {
        self.entry(sub_device, pid)
            .map(|entry| entry.storage.class())
    }

    /// Appends a PID to the change-notification queue, dropping the oldest
    /// entry when the queue is full.
    pub fn queue_push(&mut self, pid: u16) {
        if self.queue.is_full() {
            self.queue.pop_front();
        }
        // Capacity was just made; cannot fail.
        let _ = self.queue.push_back(pid);
    }

    /// Pops the oldest pending PID.
    pub fn queue_pop(&mut self) -> Option<u16> {
        self.queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued messages reported on the wire saturate at `u8::MAX`.
    pub fn message_count(&self) -> u8 {
        self.queue.len().min(u8::MAX as usize) as u8
    }

    /// Registered PIDs of one sub-device, in registration order.
    pub fn pids(&self, sub_device: u16, out: &mut heapless::Vec<u16, PARAMS>) {
        out.clear();
        for entry in self.entries.iter().filter(|e| e.sub_device == sub_device) {
            let _ = out.push(entry.pid);
        }
    }

    pub fn nvs_mut(&mut self) -> &mut V {
        &mut self.nvs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NoopNvs;

    type TestStore = ParameterStore<NoopNvs, 8, 4>;

    #[test]
    fn test_set_then_get_returns_written_value() {
        let mut store = TestStore::new(NoopNvs);
        assert!(store.add_parameter(0, 0x0082, StorageClass::Dynamic, b"", 32));
        assert!(store.parameter_set(0, 0x0082, b"Hello"));
        assert_eq!(store.parameter_get(0, 0x0082).unwrap(), b"Hello");
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let mut store = TestStore::new(NoopNvs);
        assert!(store.add_parameter(0, 1, StorageClass::Dynamic, &[0], 1));
        assert!(!store.add_parameter(0, 1, StorageClass::Dynamic, &[0], 1));
    }

    #[test]
    fn test_static_storage_never_written() {
        static VALUE: [u8; 3] = *b"1.0";

        let mut store = TestStore::new(NoopNvs);
        assert!(store.add_parameter_static(0, 0x00C0, &VALUE));
        assert!(!store.parameter_set(0, 0x00C0, b"2.0"));
        assert_eq!(store.parameter_get(0, 0x00C0).unwrap(), b"1.0");
    }

    #[test]
    fn test_set_clamps_to_capacity() {
        let mut store = TestStore::new(NoopNvs);
        assert!(store.add_parameter(0, 2, StorageClass::Dynamic, &[], 4));
        assert!(store.parameter_set(0, 2, &[1, 2, 3, 4, 5, 6]));
        assert_eq!(store.parameter_get(0, 2).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_queue_tracks_changes_and_drops_oldest() {
        let mut store = TestStore::new(NoopNvs);
        for pid in 1..=5u16 {
            assert!(store.add_parameter(0, pid, StorageClass::Dynamic, &[0], 1));
        }
        for pid in 1..=5u16 {
            assert!(store.parameter_set(0, pid, &[1]));
        }

        // Queue capacity is 4; the notification for pid 1 was dropped.
        assert_eq!(store.queue_len(), 4);
        assert_eq!(store.queue_pop(), Some(2));
        assert_eq!(store.queue_pop(), Some(3));
    }

    #[test]
    fn test_parameter_copy_bounds() {
        let mut store = TestStore::new(NoopNvs);
        assert!(store.add_parameter(0, 3, StorageClass::Dynamic, b"abcdef", 6));

        let mut small = [0u8; 4];
        assert_eq!(store.parameter_copy(0, 3, &mut small), 4);
        assert_eq!(&small, b"abcd");
        assert_eq!(store.parameter_copy(0, 0x9999, &mut small), 0);
    }

    struct RecordingNvs {
        stored: heapless::Vec<u8, 32>,
        present: bool,
    }

    impl Nvs for RecordingNvs {
        fn load(&mut self, _sub_device: u16, _pid: u16, buffer: &mut [u8]) -> Option<usize> {
            if !self.present {
                return None;
            }
            buffer[..self.stored.len()].copy_from_slice(&self.stored);
            Some(self.stored.len())
        }

        fn store(&mut self, _sub_device: u16, _pid: u16, value: &[u8]) -> bool {
            self.stored = heapless::Vec::from_slice(value).unwrap();
            self.present = true;
            true
        }
    }

    #[test]
    fn test_non_volatile_write_through_and_reload() {
        let mut store: ParameterStore<RecordingNvs, 8, 4> = ParameterStore::new(RecordingNvs {
            stored: heapless::Vec::new(),
            present: false,
        });
        assert!(store.add_parameter(0, 0x00F0, StorageClass::NonVolatile, &[1, 0], 2));
        assert!(store.parameter_set(0, 0x00F0, &[0, 42]));
        assert_eq!(store.nvs_mut().stored.as_slice(), &[0, 42]);

        // A reinstall sees the persisted value, not the init value.
        let nvs = RecordingNvs {
            stored: heapless::Vec::from_slice(&[0, 42]).unwrap(),
            present: true,
        };
        let mut reinstalled: ParameterStore<RecordingNvs, 8, 4> = ParameterStore::new(nvs);
        assert!(reinstalled.add_parameter(0, 0x00F0, StorageClass::NonVolatile, &[1, 0], 2));
        assert_eq!(reinstalled.parameter_get(0, 0x00F0).unwrap(), &[0, 42]);
    }
}
