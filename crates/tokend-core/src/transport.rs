//! Buffered byte transport over the fixed-size report stream.
//!
//! Read reports carry their payload length in the first byte; the
//! remaining bytes past that length are ignored. Write reports are
//! always full 64-byte reports whose first byte is the report number
//! (63, doubling as the payload capacity), zero-padded at the tail.

use std::collections::VecDeque;

use crate::device::{HidHandle, TransportError, REPORT_PAYLOAD_SIZE, REPORT_SIZE};

/// Poll interval for blocking reads. Reads retry until data arrives, so
/// this only bounds how quickly a dropped device is noticed.
const READ_TIMEOUT_MS: i32 = 50;

/// A byte-oriented view of an open device.
///
/// Owns the read-side buffer that holds payload bytes already stripped
/// from reports but not yet consumed by the frame layer.
pub struct DeviceTransport {
    handle: Box<dyn HidHandle>,
    read_buffer: VecDeque<u8>,
}

impl DeviceTransport {
    /// Wrap an open device handle.
    pub fn new(handle: Box<dyn HidHandle>) -> Self {
        Self {
            handle,
            read_buffer: VecDeque::new(),
        }
    }

    /// Fill `dst` completely, draining buffered bytes before pulling
    /// further reports from the device.
    pub fn read_buffered(&mut self, dst: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < dst.len() {
            if self.read_buffer.is_empty() {
                self.buffer_report()?;
            }
            while filled < dst.len() {
                match self.read_buffer.pop_front() {
                    Some(b) => {
                        dst[filled] = b;
                        filled += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Write all of `src`, split into zero-padded 63-byte report chunks.
    pub fn write(&mut self, src: &[u8]) -> Result<(), TransportError> {
        for chunk in src.chunks(REPORT_PAYLOAD_SIZE) {
            let mut report = [0u8; REPORT_SIZE];
            report[0] = REPORT_PAYLOAD_SIZE as u8;
            report[1..1 + chunk.len()].copy_from_slice(chunk);

            let written = self.handle.write_report(&report)?;
            if written < REPORT_SIZE {
                return Err(TransportError::ShortWrite);
            }
        }
        Ok(())
    }

    /// Pull one report from the device and append its payload segment
    /// to the read buffer. Retries on timeout until data arrives.
    fn buffer_report(&mut self) -> Result<(), TransportError> {
        loop {
            let mut report = [0u8; REPORT_SIZE];
            let n = self.handle.read_report(&mut report, READ_TIMEOUT_MS)?;
            if n == 0 {
                continue;
            }
            let len = (report[0] as usize).min(n - 1);
            self.read_buffer.extend(&report[1..1 + len]);
            return Ok(());
        }
    }
}
