//! USB-HID device access.
//!
//! Wraps `hidapi` behind a small trait pair so the kernel and the tests
//! can substitute scripted devices. All hidapi calls are serialized
//! through a process-global readers-writer lock: enumeration takes the
//! write side, device I/O the read side. hidapi is not safe to use
//! concurrently across enumeration and open handles on every platform.

use std::ffi::CString;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hidapi::{HidApi, HidDevice};
use thiserror::Error;
use tracing::debug;

/// Size of a single HID report, in bytes.
pub const REPORT_SIZE: usize = 64;

/// Payload capacity of one write report (report number takes one byte).
pub const REPORT_PAYLOAD_SIZE: usize = REPORT_SIZE - 1;

/// Opaque OS-assigned identifier for a connected HID device.
///
/// Stable for the lifetime of a physical connection; used as a map key
/// everywhere. The HTTP surface carries it hex-encoded.
pub type DevicePath = String;

static HID_LOCK: RwLock<()> = RwLock::new(());

fn enumeration_guard() -> RwLockWriteGuard<'static, ()> {
    HID_LOCK.write().unwrap_or_else(|e| e.into_inner())
}

fn io_guard() -> RwLockReadGuard<'static, ()> {
    HID_LOCK.read().unwrap_or_else(|e| e.into_inner())
}

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device could not be opened.
    #[error("HID device open failed: {0}")]
    Open(String),

    /// A report read failed.
    #[error("HID device read failed: {0}")]
    Read(String),

    /// A report write failed.
    #[error("HID device write failed: {0}")]
    Write(String),

    /// The device accepted fewer bytes than one full report.
    #[error("HID device write was insufficient")]
    ShortWrite,

    /// Device enumeration failed.
    #[error("HID enumeration failed: {0}")]
    Enumerate(String),

    /// The device path contains bytes hidapi cannot accept.
    #[error("invalid device path")]
    InvalidPath,
}

/// Identity of an enumerated device.
///
/// Structural equality is what `/listen` uses to detect plug events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Serial number string, empty when the device reports none.
    pub serial_number: String,
    /// OS path used to open the device.
    pub path: DevicePath,
}

/// An open HID device: raw report-level reads and writes.
pub trait HidHandle: Send {
    /// Read one report into `report`, blocking up to `timeout_ms`.
    ///
    /// Returns the number of bytes read; 0 means the timeout elapsed
    /// with no data.
    fn read_report(
        &mut self,
        report: &mut [u8; REPORT_SIZE],
        timeout_ms: i32,
    ) -> Result<usize, TransportError>;

    /// Write one full report, including the leading report number byte.
    ///
    /// Returns the number of bytes the device accepted.
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError>;
}

/// Access to the host's HID subsystem: enumeration and opening.
pub trait HidBackend: Send + Sync {
    /// List connected devices, with phantom entries filtered out.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Open a device by OS path.
    fn open(&self, path: &str) -> Result<Box<dyn HidHandle>, TransportError>;
}

/// `hidapi`-backed implementation of [`HidBackend`].
pub struct HidapiBackend {
    api: Mutex<HidApi>,
}

impl HidapiBackend {
    /// Initialize the hidapi library.
    pub fn new() -> Result<Self, TransportError> {
        let _guard = enumeration_guard();
        let api = HidApi::new().map_err(|e| TransportError::Enumerate(e.to_string()))?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

impl HidBackend for HidapiBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let _guard = enumeration_guard();
        debug!("enumerating HID devices");

        let mut api = self.api.lock().unwrap_or_else(|e| e.into_inner());
        api.refresh_devices()
            .map_err(|e| TransportError::Enumerate(e.to_string()))?;

        let mut list = Vec::new();
        for info in api.device_list() {
            // skip interfaces known to be foreign
            // skip "phantom" devices appearing on linux
            if info.interface_number() > 0 || info.product_string().is_none() {
                continue;
            }
            list.push(DeviceInfo {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                serial_number: info.serial_number().unwrap_or_default().to_owned(),
                path: info.path().to_string_lossy().into_owned(),
            });
        }
        Ok(list)
    }

    fn open(&self, path: &str) -> Result<Box<dyn HidHandle>, TransportError> {
        let _guard = io_guard();

        let c_path = CString::new(path).map_err(|_| TransportError::InvalidPath)?;
        let api = self.api.lock().unwrap_or_else(|e| e.into_inner());
        let device = api
            .open_path(&c_path)
            .map_err(|e| TransportError::Open(e.to_string()))?;

        device
            .set_blocking_mode(true)
            .map_err(|e| TransportError::Open(e.to_string()))?;

        // Device bring-up: enable the UART bridge, then purge its FIFOs.
        for report in [[0x41u8, 0x01], [0x43u8, 0x03]] {
            device
                .send_feature_report(&report)
                .map_err(|e| TransportError::Open(e.to_string()))?;
        }

        Ok(Box::new(HidapiHandle { device }))
    }
}

struct HidapiHandle {
    device: HidDevice,
}

impl HidHandle for HidapiHandle {
    fn read_report(
        &mut self,
        report: &mut [u8; REPORT_SIZE],
        timeout_ms: i32,
    ) -> Result<usize, TransportError> {
        let _guard = io_guard();
        self.device
            .read_timeout(report, timeout_ms)
            .map_err(|e| TransportError::Read(e.to_string()))
    }

    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        let _guard = io_guard();
        self.device
            .write(report)
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}
