//! The core crate for device access and protocol translation in tokend.
//!
//! This crate knows how to talk to a USB-HID security token (framed
//! messages over fixed-size reports) and how to translate between JSON
//! documents and the token's binary protocol, driven by a schema that is
//! only known at runtime. It holds no sessions and no HTTP surface; that
//! lives in `tokend-server`.

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod device;
pub mod schema;
pub mod transport;
pub mod wire;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use config::{Configuration, DeviceDescriptor, SignedConfig};
pub use device::{DeviceInfo, DevicePath, HidBackend, HidHandle, HidapiBackend};
pub use schema::SchemaStore;
pub use transport::DeviceTransport;
pub use wire::Message;
