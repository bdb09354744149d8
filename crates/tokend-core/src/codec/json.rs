//! Typed record ⇄ JSON document.
//!
//! The top-level form is `{"type": <message name>, "message": <body>}`.
//! Inside the body: singular fields appear only when present, empty
//! repeated fields are omitted, `bytes` become lowercase hex strings,
//! and enums appear by symbolic name. Parsing sets only the members
//! named in the JSON and ignores unknown members.

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, ReflectMessage, Value};
use serde_json::{json, Map, Number, Value as JsonValue};

use super::CodecError;
use crate::schema::SchemaStore;

/// Emit a record as its typed JSON envelope.
pub fn to_typed_json(record: &DynamicMessage) -> Result<JsonValue, CodecError> {
    Ok(json!({
        "type": record.descriptor().name(),
        "message": message_to_json(record)?,
    }))
}

/// Build a record from its typed JSON envelope.
pub fn from_typed_json(
    store: &SchemaStore,
    value: &JsonValue,
) -> Result<DynamicMessage, CodecError> {
    let name = value
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or(CodecError::ExpectingString)?;

    let descriptor = store.descriptor_by_name(name)?;
    let body = value.get("message").unwrap_or(&JsonValue::Null);

    let mut record = DynamicMessage::new(descriptor);
    json_to_message(body, &mut record)?;
    Ok(record)
}

fn message_to_json(msg: &DynamicMessage) -> Result<JsonValue, CodecError> {
    let mut body = Map::new();

    for fd in msg.descriptor().fields() {
        if fd.is_list() {
            let value = msg.get_field(&fd);
            let items = value.as_list().ok_or(CodecError::UnsupportedFieldType)?;
            // no empty arrays for repeated fields
            if items.is_empty() {
                continue;
            }
            let array = items
                .iter()
                .map(|item| serialize_value(&fd, item))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| serialize_error(&fd, e))?;
            body.insert(fd.name().to_owned(), JsonValue::Array(array));
        } else if msg.has_field(&fd) {
            let value = msg.get_field(&fd);
            let json = serialize_value(&fd, &value).map_err(|e| serialize_error(&fd, e))?;
            body.insert(fd.name().to_owned(), json);
        }
    }

    Ok(JsonValue::Object(body))
}

fn json_to_message(value: &JsonValue, msg: &mut DynamicMessage) -> Result<(), CodecError> {
    let JsonValue::Object(members) = value else {
        return Err(CodecError::ExpectingObject);
    };

    for fd in msg.descriptor().fields() {
        let Some(member) = members.get(fd.name()) else {
            continue;
        };
        let parsed = if fd.is_list() {
            parse_repeated(&fd, member)
        } else {
            parse_value(&fd, member)
        };
        match parsed {
            Ok(v) => msg.set_field(&fd, v),
            Err(e) => return Err(parse_error(&fd, e)),
        }
    }

    Ok(())
}

fn serialize_error(fd: &FieldDescriptor, source: CodecError) -> CodecError {
    CodecError::Serialize {
        path: fd.full_name().to_owned(),
        source: Box::new(source),
    }
}

fn parse_error(fd: &FieldDescriptor, source: CodecError) -> CodecError {
    CodecError::Parse {
        path: fd.full_name().to_owned(),
        source: Box::new(source),
    }
}

fn serialize_value(fd: &FieldDescriptor, value: &Value) -> Result<JsonValue, CodecError> {
    match (fd.kind(), value) {
        (Kind::Double, Value::F64(v)) => finite_number(*v),
        (Kind::Float, Value::F32(v)) => finite_number(f64::from(*v)),
        (Kind::Int64 | Kind::Sfixed64 | Kind::Sint64, Value::I64(v)) => Ok(JsonValue::from(*v)),
        (Kind::Uint64 | Kind::Fixed64, Value::U64(v)) => Ok(JsonValue::from(*v)),
        (Kind::Int32 | Kind::Sfixed32 | Kind::Sint32, Value::I32(v)) => Ok(JsonValue::from(*v)),
        (Kind::Uint32 | Kind::Fixed32, Value::U32(v)) => Ok(JsonValue::from(*v)),
        (Kind::Bool, Value::Bool(v)) => Ok(JsonValue::Bool(*v)),
        (Kind::String, Value::String(v)) => Ok(JsonValue::String(v.clone())),
        (Kind::Bytes, Value::Bytes(v)) => Ok(JsonValue::String(HEXLOWER.encode(v))),
        (Kind::Enum(ed), Value::EnumNumber(n)) => ed
            .get_value(*n)
            .map(|v| JsonValue::String(v.name().to_owned()))
            .ok_or(CodecError::UnknownEnumNumber(*n)),
        (Kind::Message(_), Value::Message(m)) => message_to_json(m),
        _ => Err(CodecError::UnsupportedFieldType),
    }
}

fn parse_repeated(fd: &FieldDescriptor, value: &JsonValue) -> Result<Value, CodecError> {
    let JsonValue::Array(items) = value else {
        return Err(CodecError::ExpectingArray);
    };
    let values = items
        .iter()
        .map(|item| parse_value(fd, item))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::List(values))
}

fn parse_value(fd: &FieldDescriptor, value: &JsonValue) -> Result<Value, CodecError> {
    match fd.kind() {
        Kind::Double => Ok(Value::F64(as_f64(value)?)),
        Kind::Float => Ok(Value::F32(as_f64(value)? as f32)),
        Kind::Int64 | Kind::Sfixed64 | Kind::Sint64 => Ok(Value::I64(as_i64(value)?)),
        Kind::Uint64 | Kind::Fixed64 => Ok(Value::U64(as_u64(value)?)),
        Kind::Int32 | Kind::Sfixed32 | Kind::Sint32 => {
            let n = as_i64(value)?;
            Ok(Value::I32(
                i32::try_from(n).map_err(|_| CodecError::NumberOutOfRange)?,
            ))
        }
        Kind::Uint32 | Kind::Fixed32 => {
            let n = as_u64(value)?;
            Ok(Value::U32(
                u32::try_from(n).map_err(|_| CodecError::NumberOutOfRange)?,
            ))
        }
        Kind::Bool => value
            .as_bool()
            .map(Value::Bool)
            .ok_or(CodecError::ExpectingBool),
        Kind::String => value
            .as_str()
            .map(|s| Value::String(s.to_owned()))
            .ok_or(CodecError::ExpectingString),
        Kind::Bytes => {
            let hex = value.as_str().ok_or(CodecError::ExpectingString)?;
            let bytes = HEXLOWER_PERMISSIVE
                .decode(hex.as_bytes())
                .map_err(|_| CodecError::InvalidHex)?;
            Ok(Value::Bytes(bytes.into()))
        }
        Kind::Enum(ed) => {
            let name = value.as_str().ok_or(CodecError::ExpectingString)?;
            let ev = ed
                .get_value_by_name(name)
                .ok_or(CodecError::UnknownEnumValue)?;
            Ok(Value::EnumNumber(ev.number()))
        }
        Kind::Message(md) => {
            let mut nested = DynamicMessage::new(md);
            json_to_message(value, &mut nested)?;
            Ok(Value::Message(nested))
        }
    }
}

fn as_f64(value: &JsonValue) -> Result<f64, CodecError> {
    value.as_f64().ok_or(CodecError::ExpectingNumber)
}

fn as_i64(value: &JsonValue) -> Result<i64, CodecError> {
    value.as_i64().ok_or(CodecError::ExpectingNumber)
}

fn as_u64(value: &JsonValue) -> Result<u64, CodecError> {
    value.as_u64().ok_or(CodecError::ExpectingNumber)
}

fn finite_number(v: f64) -> Result<JsonValue, CodecError> {
    Number::from_f64(v)
        .map(JsonValue::Number)
        .ok_or(CodecError::UnrepresentableNumber)
}
