//! Live query wire protocol.
//!
//! Every frame is one JSON object with an `op` field.
//!
//! | Direction | op | Fields |
//! |---|---|---|
//! | out | `connect` | `applicationId`, `clientKey`?, `sessionToken`? |
//! | out | `subscribe` | `requestId`, `query: {className, where, fields?}`, `sessionToken`? |
//! | out | `unsubscribe` | `requestId` |
//! | in | `connected` | |
//! | in | `subscribed` / `unsubscribed` | `requestId` |
//! | in | `create` / `enter` / `update` / `leave` / `delete` | `requestId`, `object`, `original`? |
//! | in | `error` | `requestId`?, `code`, `error`, `reconnect`? |
//! | in | `redirect` | `url`? |
//!
//! Encoding and decoding are stateless. Decoding happens in two steps:
//! [`decode_frame`] splits off the `op`, then [`ServerMessage::from_frame`]
//! types the remaining fields.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{LiveQueryError, Result};

/// JSON object as received or sent on the wire.
pub type JsonObject = Map<String, Value>;

/// `query` member of a `subscribe` operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    /// Class the query targets.
    pub class_name: String,
    /// Serialized where-clause.
    pub r#where: JsonObject,
    /// Optional field selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// Outbound protocol operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientOperation {
    /// Authenticate the session.
    #[serde(rename_all = "camelCase")]
    Connect {
        /// Application identifier.
        application_id: String,
        /// Client key credential, if configured.
        #[serde(skip_serializing_if = "Option::is_none")]
        client_key: Option<String>,
        /// Current user session token, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    /// Register interest in a query.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Client-assigned subscription id.
        request_id: u64,
        /// The query to watch.
        query: QueryPayload,
        /// Current user session token, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    /// Drop a subscription.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Client-assigned subscription id.
        request_id: u64,
    },
}

impl ClientOperation {
    /// Name of the operation as it appears in `op`.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// Encode into a wire frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| LiveQueryError::Decode(format!("failed to encode {}: {e}", self.op())))
    }
}

/// Kind of object event delivered to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A matching object was created.
    Create,
    /// An existing object started matching.
    Enter,
    /// A matching object changed and still matches.
    Update,
    /// An object stopped matching.
    Leave,
    /// A matching object was deleted.
    Delete,
}

impl EventKind {
    /// Parse an `op` value.
    #[must_use]
    pub fn from_op(op: &str) -> Option<Self> {
        match op {
            "create" => Some(Self::Create),
            "enter" => Some(Self::Enter),
            "update" => Some(Self::Update),
            "leave" => Some(Self::Leave),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Wire name of this event kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Enter => "enter",
            Self::Update => "update",
            Self::Leave => "leave",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound frame split into its `op` and remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFrame {
    /// Non-empty operation name.
    pub op: String,
    /// Every field except `op`.
    pub fields: JsonObject,
}

/// Split an inbound text frame into `op` and fields.
///
/// Rejects anything that is not a JSON object with a non-empty string `op`.
pub fn decode_frame(text: &str) -> Result<ServerFrame> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LiveQueryError::Decode(format!("invalid JSON frame: {e}")))?;

    let Value::Object(mut fields) = value else {
        return Err(LiveQueryError::decode("frame is not a JSON object"));
    };

    let op = match fields.remove("op") {
        Some(Value::String(op)) if !op.is_empty() => op,
        Some(Value::String(_) | Value::Null) => {
            return Err(LiveQueryError::decode("'op' field is null or empty"));
        }
        Some(other) => {
            return Err(LiveQueryError::Decode(format!(
                "'op' field is not a string: {other}"
            )));
        }
        None => {
            return Err(LiveQueryError::decode(
                "message does not contain a valid 'op' field",
            ));
        }
    };

    Ok(ServerFrame { op, fields })
}

impl ServerFrame {
    /// `requestId` of the frame when it is present and well formed.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        self.fields
            .get("requestId")
            .and_then(|value| request_id_value(value).ok())
    }

    /// Whether this is an object event (`create`, `enter`, ...).
    #[must_use]
    pub fn is_object_event(&self) -> bool {
        EventKind::from_op(&self.op).is_some()
    }
}

/// Typed inbound operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// The `connect` operation was accepted.
    Connected,
    /// Reserved; carried but not acted upon.
    Redirect {
        /// Suggested endpoint, if present.
        url: Option<String>,
    },
    /// A subscription was registered server-side.
    Subscribed {
        /// Subscription id.
        request_id: u64,
    },
    /// A subscription was dropped server-side.
    Unsubscribed {
        /// Subscription id.
        request_id: u64,
    },
    /// An object event for one subscription.
    Event {
        /// What happened to the object.
        kind: EventKind,
        /// Subscription id.
        request_id: u64,
        /// Raw object payload.
        object: JsonObject,
        /// Raw previous object state, when the server includes it.
        original: Option<JsonObject>,
    },
    /// The server reported an error.
    Error {
        /// Subscription id the error belongs to, if any.
        request_id: Option<u64>,
        /// Numeric error code.
        code: i64,
        /// Error message.
        error: String,
        /// Whether the server advises reconnecting.
        reconnect: bool,
    },
}

impl ServerMessage {
    /// Decode a text frame in one step.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_frame(decode_frame(text)?)
    }

    /// Type the fields of an already split frame.
    pub fn from_frame(frame: ServerFrame) -> Result<Self> {
        let ServerFrame { op, mut fields } = frame;

        if let Some(kind) = EventKind::from_op(&op) {
            let request_id = required_request_id(&fields, &op)?;
            let object = match fields.remove("object") {
                Some(Value::Object(object)) => object,
                Some(other) => {
                    return Err(LiveQueryError::Decode(format!(
                        "'{op}' object is not a JSON object: {other}"
                    )));
                }
                None => {
                    return Err(LiveQueryError::Decode(format!("'{op}' frame has no object")));
                }
            };
            let original = match fields.remove("original") {
                Some(Value::Object(original)) => Some(original),
                Some(Value::Null) | None => None,
                Some(other) => {
                    return Err(LiveQueryError::Decode(format!(
                        "'{op}' original is not a JSON object: {other}"
                    )));
                }
            };
            return Ok(Self::Event {
                kind,
                request_id,
                object,
                original,
            });
        }

        match op.as_str() {
            "connected" => Ok(Self::Connected),
            "redirect" => Ok(Self::Redirect {
                url: fields
                    .get("url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            "subscribed" => Ok(Self::Subscribed {
                request_id: required_request_id(&fields, &op)?,
            }),
            "unsubscribed" => Ok(Self::Unsubscribed {
                request_id: required_request_id(&fields, &op)?,
            }),
            "error" => {
                let request_id = match fields.get("requestId") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(request_id_value(value)?),
                };
                let code = fields
                    .get("code")
                    .ok_or_else(|| LiveQueryError::decode("'error' frame has no code"))
                    .and_then(integer_value)?;
                let error = match fields.get("error") {
                    Some(Value::String(error)) => error.clone(),
                    Some(other) => {
                        return Err(LiveQueryError::Decode(format!(
                            "'error' message is not a string: {other}"
                        )));
                    }
                    None => return Err(LiveQueryError::decode("'error' frame has no error")),
                };
                let reconnect = match fields.get("reconnect") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(reconnect)) => *reconnect,
                    Some(other) => {
                        return Err(LiveQueryError::Decode(format!(
                            "'error' reconnect is not a boolean: {other}"
                        )));
                    }
                };
                Ok(Self::Error {
                    request_id,
                    code,
                    error,
                    reconnect,
                })
            }
            other => Err(LiveQueryError::Decode(format!(
                "unexpected operation: {other}"
            ))),
        }
    }

    /// Subscription id this message refers to, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Subscribed { request_id }
            | Self::Unsubscribed { request_id }
            | Self::Event { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            Self::Connected | Self::Redirect { .. } => None,
        }
    }
}

fn required_request_id(fields: &JsonObject, op: &str) -> Result<u64> {
    let value = fields
        .get("requestId")
        .ok_or_else(|| LiveQueryError::Decode(format!("'{op}' frame has no requestId")))?;
    request_id_value(value)
}

fn request_id_value(value: &Value) -> Result<u64> {
    let id = integer_value(value)?;
    u64::try_from(id)
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| LiveQueryError::Decode(format!("requestId must be positive, got {id}")))
}

/// Read an integer that may be encoded as a JSON integer or integral float.
fn integer_value(value: &Value) -> Result<i64> {
    let Value::Number(number) = value else {
        return Err(LiveQueryError::Decode(format!(
            "expected a number, got {value}"
        )));
    };

    if let Some(int) = number.as_i64() {
        return Ok(int);
    }

    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    match number.as_f64() {
        Some(float) if float.fract() == 0.0 && float >= -LIMIT && float < LIMIT => {
            #[expect(
                clippy::cast_possible_truncation,
                reason = "integral value checked to be within i64 range"
            )]
            let int = float as i64;
            Ok(int)
        }
        _ => Err(LiveQueryError::Decode(format!(
            "expected an integer, got {number}"
        ))),
    }
}
