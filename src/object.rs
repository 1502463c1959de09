//! Object payload decoding.
//!
//! The server embeds the affected object in every event frame. An
//! [`ObjectDecoder`] turns that raw JSON into an [`ObjectState`]; each
//! subscription then converts the state into its query's
//! [`LiveQuery::Object`](crate::LiveQuery::Object) type via [`LiveObject`].

use std::fmt;

use serde_json::Value;

use crate::error::{LiveQueryError, Result};
use crate::protocol::JsonObject;

/// Decoded object: well-known metadata plus remaining attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectState {
    /// Class of the object.
    pub class_name: Option<String>,
    /// Server-assigned id.
    pub object_id: Option<String>,
    /// Creation timestamp (ISO-8601).
    pub created_at: Option<String>,
    /// Last update timestamp (ISO-8601).
    pub updated_at: Option<String>,
    /// Every other field.
    pub attributes: JsonObject,
}

impl ObjectState {
    /// Look up an attribute.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Turns a raw object payload into an [`ObjectState`].
///
/// Must be a pure function of its input.
pub trait ObjectDecoder: Send + Sync + fmt::Debug {
    /// Decode one object payload.
    fn decode(&self, raw: &JsonObject) -> Result<ObjectState>;
}

/// Decoder for the REST object encoding.
///
/// Lifts `className`, `objectId`, `createdAt` and `updatedAt` out of the
/// payload. Dates are accepted either as plain strings or as
/// `{"__type": "Date", "iso": "..."}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultObjectDecoder;

impl ObjectDecoder for DefaultObjectDecoder {
    fn decode(&self, raw: &JsonObject) -> Result<ObjectState> {
        let mut attributes = raw.clone();
        let class_name = take_string(&mut attributes, "className")?;
        let object_id = take_string(&mut attributes, "objectId")?;
        let created_at = take_date(&mut attributes, "createdAt")?;
        let updated_at = take_date(&mut attributes, "updatedAt")?;
        Ok(ObjectState {
            class_name,
            object_id,
            created_at,
            updated_at,
            attributes,
        })
    }
}

fn take_string(fields: &mut JsonObject, key: &str) -> Result<Option<String>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(LiveQueryError::Decode(format!(
            "'{key}' is not a string: {other}"
        ))),
    }
}

fn take_date(fields: &mut JsonObject, key: &str) -> Result<Option<String>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(iso)) => Ok(Some(iso)),
        Some(Value::Object(date)) if date.get("__type").and_then(Value::as_str) == Some("Date") => {
            match date.get("iso") {
                Some(Value::String(iso)) => Ok(Some(iso.clone())),
                _ => Err(LiveQueryError::Decode(format!("'{key}' date has no iso value"))),
            }
        }
        Some(other) => Err(LiveQueryError::Decode(format!(
            "'{key}' is not a date: {other}"
        ))),
    }
}

/// Conversion from a decoded [`ObjectState`] into a caller's object type.
pub trait LiveObject: Clone + Send + Sync + 'static {
    /// Build `Self` from a decoded object.
    fn from_state(state: ObjectState) -> Result<Self>;
}

impl LiveObject for ObjectState {
    fn from_state(state: ObjectState) -> Result<Self> {
        Ok(state)
    }
}
