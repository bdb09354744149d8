//! Schema-driven translation between wire frames, typed records, and
//! JSON documents.
//!
//! Records are `prost_reflect::DynamicMessage` values: the protocol is
//! only known at runtime, so dispatch happens over field descriptors
//! rather than generated types.

mod json;
mod wire;

pub use json::{from_typed_json, to_typed_json};
pub use wire::{decode_message, encode_message};

use thiserror::Error;

use crate::schema::SchemaError;

/// Conversion errors. Field-level failures are wrapped with the fully
/// qualified field path for diagnosis.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Schema lookup failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The binary payload did not parse as the schema's form.
    #[error("cannot decode message payload: {0}")]
    Decode(String),

    /// A JSON object was required.
    #[error("expecting JSON object")]
    ExpectingObject,

    /// A JSON string was required.
    #[error("expecting JSON string")]
    ExpectingString,

    /// A JSON array was required.
    #[error("expecting JSON array")]
    ExpectingArray,

    /// A JSON number was required.
    #[error("expecting JSON number")]
    ExpectingNumber,

    /// A JSON boolean was required.
    #[error("expecting JSON boolean")]
    ExpectingBool,

    /// The number does not fit the field's range.
    #[error("number out of range")]
    NumberOutOfRange,

    /// The float cannot be represented in JSON.
    #[error("number cannot be represented")]
    UnrepresentableNumber,

    /// The enum name does not exist in the schema.
    #[error("unknown enum value")]
    UnknownEnumValue,

    /// The enum number has no symbolic name in the schema.
    #[error("unknown enum number {0}")]
    UnknownEnumNumber(i32),

    /// A `bytes` field held a string that is not valid hex.
    #[error("cannot decode value from hex")]
    InvalidHex,

    /// The field's schema type has no JSON mapping.
    #[error("field of unsupported type")]
    UnsupportedFieldType,

    /// Field-level serialization failure with its path.
    #[error("error while serializing {path}, caused by: {source}")]
    Serialize {
        path: String,
        #[source]
        source: Box<CodecError>,
    },

    /// Field-level parsing failure with its path.
    #[error("error while parsing {path}, caused by: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<CodecError>,
    },
}
