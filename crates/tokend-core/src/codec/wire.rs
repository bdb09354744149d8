//! Wire frame ⇄ typed record.

use prost::Message as _;
use prost_reflect::{DynamicMessage, ReflectMessage};

use super::CodecError;
use crate::schema::SchemaStore;
use crate::wire;

/// Decode a received frame into a record of the type bound to its id.
pub fn decode_message(
    store: &SchemaStore,
    frame: &wire::Message,
) -> Result<DynamicMessage, CodecError> {
    let descriptor = store.descriptor_by_id(frame.id)?;
    DynamicMessage::decode(descriptor, frame.data.as_slice())
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Serialize a record and attach the wire id bound to its type name.
pub fn encode_message(
    store: &SchemaStore,
    record: &DynamicMessage,
) -> Result<wire::Message, CodecError> {
    let id = store.id_by_name(record.descriptor().name())?;
    Ok(wire::Message {
        id,
        data: record.encode_to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use prost_reflect::Value;

    use super::*;
    use crate::testing::{test_descriptor_set, PING_ID};

    #[test]
    fn record_round_trips_through_wire_form() {
        let store = SchemaStore::load(&test_descriptor_set()).unwrap();
        let descriptor = store.descriptor_by_name("Ping").unwrap();
        let field = descriptor.get_field_by_name("message").unwrap();

        let mut record = store.new_message(&descriptor);
        record.set_field(&field, Value::String("hi".to_owned()));

        let frame = encode_message(&store, &record).unwrap();
        assert_eq!(frame.id, PING_ID);

        let decoded = decode_message(&store, &frame).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn unknown_frame_id_is_a_codec_error() {
        let store = SchemaStore::load(&test_descriptor_set()).unwrap();
        let frame = wire::Message {
            id: 777,
            data: vec![],
        };
        assert!(decode_message(&store, &frame).is_err());
    }
}
