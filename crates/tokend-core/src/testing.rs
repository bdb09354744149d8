//! Test scaffolding: scripted HID devices and runtime-built schemas.
//!
//! Compiled for this crate's unit tests and, behind the `test-util`
//! feature, for integration suites in dependent crates. Nothing here is
//! part of the daemon proper.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use prost::Message as _;
use prost_types::{
    field_descriptor_proto::{Label, Type},
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet,
};

use crate::config::Configuration;
use crate::device::{HidHandle, TransportError, REPORT_PAYLOAD_SIZE, REPORT_SIZE};
use crate::transport::DeviceTransport;
use crate::wire;

enum ReadEvent {
    Report([u8; REPORT_SIZE]),
    Timeout,
}

/// A device that replays a fixed read script and records writes.
pub struct ScriptedHandle {
    reads: VecDeque<ReadEvent>,
    written: Arc<Mutex<Vec<[u8; REPORT_SIZE]>>>,
    short_writes: bool,
}

impl ScriptedHandle {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
            short_writes: false,
        }
    }

    /// Queue a raw 64-byte report for reading.
    pub fn push_read_report(&mut self, report: [u8; REPORT_SIZE]) {
        self.reads.push_back(ReadEvent::Report(report));
    }

    /// Queue a report carrying the given payload (at most 63 bytes).
    pub fn push_read_payload(&mut self, payload: &[u8]) {
        assert!(payload.len() <= REPORT_PAYLOAD_SIZE);
        let mut report = [0u8; REPORT_SIZE];
        report[0] = payload.len() as u8;
        report[1..1 + payload.len()].copy_from_slice(payload);
        self.push_read_report(report);
    }

    /// Queue an arbitrary byte stream, chunked into payload reports.
    pub fn push_read_stream(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(REPORT_PAYLOAD_SIZE) {
            self.push_read_payload(chunk);
        }
    }

    /// Queue one read timeout (a poll that returns no data).
    pub fn push_read_timeout(&mut self) {
        self.reads.push_back(ReadEvent::Timeout);
    }

    /// Make every subsequent write report a short write.
    pub fn fail_writes_short(&mut self) {
        self.short_writes = true;
    }

    /// Shared view of the reports written so far.
    pub fn written(&self) -> Arc<Mutex<Vec<[u8; REPORT_SIZE]>>> {
        Arc::clone(&self.written)
    }
}

impl Default for ScriptedHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl HidHandle for ScriptedHandle {
    fn read_report(
        &mut self,
        report: &mut [u8; REPORT_SIZE],
        _timeout_ms: i32,
    ) -> Result<usize, TransportError> {
        match self.reads.pop_front() {
            Some(ReadEvent::Report(r)) => {
                *report = r;
                Ok(REPORT_SIZE)
            }
            Some(ReadEvent::Timeout) => Ok(0),
            None => Err(TransportError::Read("read script exhausted".into())),
        }
    }

    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        self.written.lock().unwrap().push(*report);
        if self.short_writes {
            Ok(1)
        } else {
            Ok(REPORT_SIZE)
        }
    }
}

/// A device whose writes come straight back as reads.
///
/// Written reports already have the read-report layout (length byte
/// followed by payload), so echoing them verbatim exercises the real
/// buffering paths in both directions.
#[derive(Default)]
pub struct LoopbackHandle {
    queue: VecDeque<[u8; REPORT_SIZE]>,
}

impl HidHandle for LoopbackHandle {
    fn read_report(
        &mut self,
        report: &mut [u8; REPORT_SIZE],
        _timeout_ms: i32,
    ) -> Result<usize, TransportError> {
        match self.queue.pop_front() {
            Some(r) => {
                *report = r;
                Ok(REPORT_SIZE)
            }
            None => Err(TransportError::Read("loopback queue empty".into())),
        }
    }

    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        self.queue.push_back(*report);
        Ok(REPORT_SIZE)
    }
}

/// Transport over a [`LoopbackHandle`].
pub fn loopback_transport() -> DeviceTransport {
    DeviceTransport::new(Box::new(LoopbackHandle::default()))
}

/// A device that answers every complete frame with a frame of
/// `id + reply_id_offset` carrying the identical payload.
pub struct EchoHandle {
    reply_id_offset: u16,
    incoming: Vec<u8>,
    outgoing: VecDeque<[u8; REPORT_SIZE]>,
}

impl EchoHandle {
    pub fn new(reply_id_offset: u16) -> Self {
        Self {
            reply_id_offset,
            incoming: Vec::new(),
            outgoing: VecDeque::new(),
        }
    }

    fn try_consume_frame(&mut self) {
        // '#' '#' id(2) length(4)
        if self.incoming.len() < 8 || self.incoming[0] != b'#' || self.incoming[1] != b'#' {
            return;
        }
        let id = u16::from_be_bytes([self.incoming[2], self.incoming[3]]);
        let len = u32::from_be_bytes([
            self.incoming[4],
            self.incoming[5],
            self.incoming[6],
            self.incoming[7],
        ]) as usize;
        if self.incoming.len() < 8 + len {
            return;
        }
        let payload = self.incoming[8..8 + len].to_vec();
        self.incoming.clear();

        let reply = wire::Message {
            id: id.wrapping_add(self.reply_id_offset),
            data: payload,
        };
        let mut frame = Vec::with_capacity(8 + reply.data.len());
        frame.extend_from_slice(&[b'#', b'#']);
        frame.extend_from_slice(&reply.id.to_be_bytes());
        frame.extend_from_slice(&(reply.data.len() as u32).to_be_bytes());
        frame.extend_from_slice(&reply.data);

        for chunk in frame.chunks(REPORT_PAYLOAD_SIZE) {
            let mut report = [0u8; REPORT_SIZE];
            report[0] = chunk.len() as u8;
            report[1..1 + chunk.len()].copy_from_slice(chunk);
            self.outgoing.push_back(report);
        }
    }
}

impl HidHandle for EchoHandle {
    fn read_report(
        &mut self,
        report: &mut [u8; REPORT_SIZE],
        _timeout_ms: i32,
    ) -> Result<usize, TransportError> {
        match self.outgoing.pop_front() {
            Some(r) => {
                *report = r;
                Ok(REPORT_SIZE)
            }
            None => Err(TransportError::Read("no reply pending".into())),
        }
    }

    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        let len = (report[0] as usize).min(REPORT_PAYLOAD_SIZE);
        self.incoming.extend_from_slice(&report[1..1 + len]);
        self.try_consume_frame();
        Ok(REPORT_SIZE)
    }
}

/// A HID subsystem with a mutable device list; opened devices are
/// [`EchoHandle`]s replying with `id + 1`.
///
/// Setting the failure flag makes every outstanding and future handle
/// error on I/O, as if the device were yanked mid-call.
pub struct MockBackend {
    devices: Mutex<Vec<crate::device::DeviceInfo>>,
    fail_io: Arc<AtomicBool>,
    opens: AtomicUsize,
}

impl MockBackend {
    pub fn new(devices: Vec<crate::device::DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            fail_io: Arc::new(AtomicBool::new(false)),
            opens: AtomicUsize::new(0),
        }
    }

    /// Replace the device list, as if devices were plugged/unplugged.
    pub fn set_devices(&self, devices: Vec<crate::device::DeviceInfo>) {
        *self.devices.lock().unwrap() = devices;
    }

    /// Toggle I/O failure on all handles from this backend.
    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::SeqCst);
    }

    /// How many times a device has been opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl crate::device::HidBackend for MockBackend {
    fn enumerate(&self) -> Result<Vec<crate::device::DeviceInfo>, TransportError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn open(&self, path: &str) -> Result<Box<dyn HidHandle>, TransportError> {
        let devices = self.devices.lock().unwrap();
        if devices.iter().any(|d| d.path == path) {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyHandle {
                inner: EchoHandle::new(1),
                fail: Arc::clone(&self.fail_io),
            }))
        } else {
            Err(TransportError::Open("no such device".into()))
        }
    }
}

struct FlakyHandle {
    inner: EchoHandle,
    fail: Arc<AtomicBool>,
}

impl HidHandle for FlakyHandle {
    fn read_report(
        &mut self,
        report: &mut [u8; REPORT_SIZE],
        timeout_ms: i32,
    ) -> Result<usize, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Read("simulated device failure".into()));
        }
        self.inner.read_report(report, timeout_ms)
    }

    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Write("simulated device failure".into()));
        }
        self.inner.write_report(report)
    }
}

/// A supported device for [`test_configuration`].
pub fn mock_device(path: &str) -> crate::device::DeviceInfo {
    crate::device::DeviceInfo {
        vendor_id: 0x534c,
        product_id: 0x0001,
        serial_number: format!("SN-{path}"),
        path: path.to_owned(),
    }
}

// ---------------------------------------------------------------------
// Runtime-built protocol schema

fn field(
    name: &str,
    number: i32,
    label: Label,
    r#type: Type,
    type_name: Option<&str>,
) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_owned()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(r#type as i32),
        type_name: type_name.map(str::to_owned),
        ..Default::default()
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_owned()),
        field: fields,
        ..Default::default()
    }
}

fn enum_value(name: &str, number: i32) -> EnumValueDescriptorProto {
    EnumValueDescriptorProto {
        name: Some(name.to_owned()),
        number: Some(number),
        ..Default::default()
    }
}

/// Message-type ids used by the test schema.
pub const PING_ID: u16 = 2;
pub const SUCCESS_ID: u16 = 3;
pub const FAILURE_ID: u16 = 4;
pub const SAMPLE_ID: u16 = 99;

/// Serialized descriptor set for a small token protocol.
///
/// Contains `Ping`/`Success`/`Failure` plus a `Sample` message covering
/// every field kind the JSON codec handles.
pub fn test_descriptor_set() -> Vec<u8> {
    let message_type = EnumDescriptorProto {
        name: Some("MessageType".to_owned()),
        value: vec![
            enum_value("MessageType_Ping", PING_ID as i32),
            enum_value("MessageType_Success", SUCCESS_ID as i32),
            enum_value("MessageType_Failure", FAILURE_ID as i32),
            enum_value("MessageType_Sample", SAMPLE_ID as i32),
        ],
        ..Default::default()
    };

    let direction = EnumDescriptorProto {
        name: Some("Direction".to_owned()),
        value: vec![
            enum_value("NORTH", 0),
            enum_value("SOUTH", 1),
            enum_value("EAST", 2),
        ],
        ..Default::default()
    };

    let ping = message(
        "Ping",
        vec![field("message", 1, Label::Optional, Type::String, None)],
    );
    let success = message(
        "Success",
        vec![field("message", 1, Label::Optional, Type::String, None)],
    );
    let failure = message(
        "Failure",
        vec![
            field("code", 1, Label::Optional, Type::Uint32, None),
            field("message", 2, Label::Optional, Type::String, None),
        ],
    );
    let inner = message(
        "Inner",
        vec![
            field("x", 1, Label::Optional, Type::Uint32, None),
            field("tags", 2, Label::Repeated, Type::String, None),
        ],
    );
    let sample = message(
        "Sample",
        vec![
            field("an_i32", 1, Label::Optional, Type::Int32, None),
            field("an_i64", 2, Label::Optional, Type::Int64, None),
            field("a_u32", 3, Label::Optional, Type::Uint32, None),
            field("a_u64", 4, Label::Optional, Type::Uint64, None),
            field("a_s32", 5, Label::Optional, Type::Sint32, None),
            field("a_fixed64", 6, Label::Optional, Type::Fixed64, None),
            field("a_float", 7, Label::Optional, Type::Float, None),
            field("a_double", 8, Label::Optional, Type::Double, None),
            field("flag", 9, Label::Optional, Type::Bool, None),
            field("name", 10, Label::Optional, Type::String, None),
            field("blob", 11, Label::Optional, Type::Bytes, None),
            field(
                "dir",
                12,
                Label::Optional,
                Type::Enum,
                Some(".Direction"),
            ),
            field(
                "inner",
                13,
                Label::Optional,
                Type::Message,
                Some(".Inner"),
            ),
            field("nums", 14, Label::Repeated, Type::Uint32, None),
            field(
                "items",
                15,
                Label::Repeated,
                Type::Message,
                Some(".Inner"),
            ),
            field("blobs", 16, Label::Repeated, Type::Bytes, None),
        ],
    );

    let file = FileDescriptorProto {
        name: Some("messages.proto".to_owned()),
        message_type: vec![ping, success, failure, inner, sample],
        enum_type: vec![message_type, direction],
        syntax: Some("proto2".to_owned()),
        ..Default::default()
    };

    FileDescriptorSet { file: vec![file] }.encode_to_vec()
}

// ---------------------------------------------------------------------
// Signed configuration blobs

/// Deterministic signing key for tests.
pub fn test_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[0x42u8; 32].into()).expect("static test scalar is valid")
}

/// Verifying side of [`test_signing_key`].
pub fn test_verifying_key() -> VerifyingKey {
    *test_signing_key().verifying_key()
}

/// A configuration that allows everything and supports one device.
pub fn test_configuration() -> Configuration {
    Configuration {
        whitelist_urls: vec![".*".to_owned()],
        blacklist_urls: vec![],
        wire_protocol: test_descriptor_set(),
        valid_until: None,
        known_devices: vec![crate::config::DeviceDescriptor {
            vendor_id: Some(0x534c),
            product_id: Some(0x0001),
        }],
    }
}

/// Produce the raw `sig || msg` blob for a configuration.
pub fn sign_configuration(config: &Configuration, key: &SigningKey) -> Vec<u8> {
    let msg = config.encode_to_vec();
    let signature: Signature = key.sign(&msg);
    let mut blob = signature.to_bytes().to_vec();
    blob.extend_from_slice(&msg);
    blob
}
