//! Runtime-loaded protocol schema.
//!
//! The configuration carries a serialized descriptor set describing the
//! token's message protocol. The store builds a descriptor pool from it
//! and derives the message-id mapping from the designated `MessageType`
//! enum: each value `MessageType_<Name> = <id>` binds `<id>` to the
//! message named `<Name>`.

use std::collections::HashMap;

use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use thiserror::Error;

const MESSAGE_TYPE_ENUM: &str = "MessageType";
const MESSAGE_TYPE_PREFIX: &str = "MessageType_";

/// Schema loading and lookup errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The descriptor set bytes did not parse.
    #[error("invalid file descriptor set: {0}")]
    InvalidDescriptorSet(String),

    /// No `MessageType` enum was found in the schema.
    #[error("invalid file descriptor set: missing MessageType enum")]
    MissingMessageType,

    /// No message is bound to this wire id.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u16),

    /// No message with this name exists in the schema.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// The message exists but has no wire id.
    #[error("missing wire id for message {0}")]
    MissingWireId(String),
}

/// Descriptor pool plus the id ↔ message-name bijection.
#[derive(Debug)]
pub struct SchemaStore {
    pool: DescriptorPool,
    by_id: HashMap<u16, MessageDescriptor>,
    id_by_name: HashMap<String, u16>,
}

impl SchemaStore {
    /// Build a store from serialized descriptor-set bytes.
    ///
    /// Enum values without the `MessageType_` prefix are ignored, as
    /// are values whose message descriptor is absent; the latter only
    /// fail when a codec call first needs them.
    pub fn load(wire_protocol: &[u8]) -> Result<Self, SchemaError> {
        let pool = DescriptorPool::decode(wire_protocol)
            .map_err(|e| SchemaError::InvalidDescriptorSet(e.to_string()))?;

        let message_type = pool
            .all_enums()
            .find(|e| e.name() == MESSAGE_TYPE_ENUM)
            .ok_or(SchemaError::MissingMessageType)?;

        let mut by_id = HashMap::new();
        let mut id_by_name = HashMap::new();
        for value in message_type.values() {
            let Some(name) = value.name().strip_prefix(MESSAGE_TYPE_PREFIX) else {
                continue;
            };
            let Ok(id) = u16::try_from(value.number()) else {
                continue;
            };
            if let Some(descriptor) = pool.all_messages().find(|m| m.name() == name) {
                by_id.insert(id, descriptor);
            }
            id_by_name.insert(name.to_owned(), id);
        }

        Ok(Self {
            pool,
            by_id,
            id_by_name,
        })
    }

    /// Descriptor for the message bound to `id`.
    pub fn descriptor_by_id(&self, id: u16) -> Result<MessageDescriptor, SchemaError> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or(SchemaError::UnknownMessageId(id))
    }

    /// Wire id for the message named `name`.
    pub fn id_by_name(&self, name: &str) -> Result<u16, SchemaError> {
        self.id_by_name
            .get(name)
            .copied()
            .ok_or_else(|| SchemaError::MissingWireId(name.to_owned()))
    }

    /// Descriptor for the message named `name` (short name, as used in
    /// the JSON envelope).
    pub fn descriptor_by_name(&self, name: &str) -> Result<MessageDescriptor, SchemaError> {
        self.pool
            .all_messages()
            .find(|m| m.name() == name)
            .ok_or_else(|| SchemaError::UnknownMessage(name.to_owned()))
    }

    /// Fresh, empty record of the given type.
    pub fn new_message(&self, descriptor: &MessageDescriptor) -> DynamicMessage {
        DynamicMessage::new(descriptor.clone())
    }
}
