//! Message framing over the report byte stream.
//!
//! Envelope format:
//! ```text
//! '#' '#' [id:2 BE] [length:4 BE] [payload:length]
//! ```
//! Bytes before the first `'#'` are discarded; the byte after it must
//! also be `'#'` or the frame is malformed.

use thiserror::Error;

use crate::device::TransportError;
use crate::transport::DeviceTransport;

/// Upper bound on a single message payload.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

const FRAME_MAGIC: u8 = b'#';

/// Frame-level errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// The second sentinel byte was missing.
    #[error("header bytes are malformed")]
    BadMagic,

    /// The declared payload length exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message is too big: {0} bytes")]
    Oversized(u32),

    /// The underlying device failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One framed message: a protocol message id and its serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type id from the loaded schema.
    pub id: u16,
    /// Serialized message body.
    pub data: Vec<u8>,
}

impl Message {
    /// Read one message from the device, skipping leading garbage up to
    /// the frame sentinel.
    pub fn read_from(transport: &mut DeviceTransport) -> Result<Self, WireError> {
        let mut byte = [0u8; 1];

        transport.read_buffered(&mut byte)?;
        while byte[0] != FRAME_MAGIC {
            transport.read_buffered(&mut byte)?;
        }

        transport.read_buffered(&mut byte)?;
        if byte[0] != FRAME_MAGIC {
            return Err(WireError::BadMagic);
        }

        let mut header = [0u8; 6];
        transport.read_buffered(&mut header)?;

        let id = u16::from_be_bytes([header[0], header[1]]);
        let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        if size > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized(size));
        }

        let mut data = vec![0u8; size as usize];
        transport.read_buffered(&mut data)?;
        Ok(Self { id, data })
    }

    /// Write this message to the device as one frame.
    pub fn write_to(&self, transport: &mut DeviceTransport) -> Result<(), WireError> {
        let mut buf = Vec::with_capacity(8 + self.data.len());
        buf.extend_from_slice(&[FRAME_MAGIC, FRAME_MAGIC]);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        transport.write(&buf)?;
        Ok(())
    }
}
