use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::kind::MessageKind;

/// Typed message envelope: `{"kind": "...", "data": {...}}`.
///
/// This is the unit published to a queue, both for requests and replies.
///
/// Notes:
/// - `data` is omitted from the JSON when absent (parameterless kinds).
/// - A success reply carries `data.response`; a failure reply uses
///   [`MessageKind::Error`] with `data.error` (string).
/// - Decoding untrusted bytes is the validator's job, not this type's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    kind: MessageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, JsonValue>>,
}

impl Envelope {
    pub fn new(kind: MessageKind, data: Option<Map<String, JsonValue>>) -> Self {
        Self { kind, data }
    }

    /// Success reply echoing the request's reply kind.
    pub fn success(request_kind: MessageKind, response: JsonValue) -> Self {
        let mut data = Map::new();
        data.insert("response".to_string(), response);
        Self {
            kind: request_kind.reply_kind(),
            data: Some(data),
        }
    }

    /// Failure reply carrying opaque display text.
    pub fn failure(error: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), JsonValue::String(error.into()));
        Self {
            kind: MessageKind::Error,
            data: Some(data),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn data(&self) -> Option<&Map<String, JsonValue>> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Map<String, JsonValue>> {
        self.data
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    /// `data.response` of a success reply.
    pub fn response(&self) -> Option<&JsonValue> {
        self.data.as_ref().and_then(|d| d.get("response"))
    }

    /// `data.error` of a failure reply, when it is a string.
    pub fn error_text(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("error"))
            .and_then(JsonValue::as_str)
    }

    /// Encode as UTF-8 JSON for a message body.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a derived struct of JSON values cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
