//! Message validation: safe parsing, kind routing, closed-world payload checks.
//!
//! Validation runs in two stages so routing never pays for a full schema check:
//!
//! ```text
//! bytes ──parse──▶ RawEnvelope ──validate_kind──▶ MessageKind ──validate_payload──▶ typed data
//!   │                                   │                              │
//!   └─ None: drop (no reply possible)   └─ ValidationError             └─ ValidationError
//! ```
//!
//! The validator holds only immutable configuration, so the same input always
//! yields the same outcome.

use serde_json::{Map, Value as JsonValue};

use courier_core::MessageKind;

use crate::contract::QueueContract;
use crate::schema::{FieldType, PayloadSchema, schema_for};

/// Largest message body accepted by default (1 MiB).
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Object keys that could reach prototype/constructor slots in a dynamic consumer.
const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Field names whose values must never be logged or copied into errors.
const SENSITIVE_FIELDS: &[&str] = &["password", "attempt", "known_hash"];

const REDACTED: &str = "[REDACTED]";

/// Longest field label echoed back in an error.
const MAX_LABEL_CHARS: usize = 64;

/// Envelope decoded from bytes but not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    /// Candidate discriminant (`Null` when missing).
    pub kind: JsonValue,
    /// `data` as sent, if present.
    pub data: Option<JsonValue>,
    /// Top-level keys other than `kind` and `data`.
    pub extra_fields: Vec<String>,
}

/// A message that passed both validation stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMessage {
    pub kind: MessageKind,
    pub payload: Map<String, JsonValue>,
}

/// Rejection reason; the message names the first offending field only and
/// never includes field values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("\"kind\" is required")]
    MissingKind,

    #[error("\"kind\" must be a string")]
    KindNotString,

    #[error("\"kind\" must be one of [{allowed}]")]
    UnknownKind { allowed: String },

    #[error("\"kind\" '{kind}' is not accepted on this queue")]
    KindNotAccepted { kind: MessageKind },

    #[error("\"{field}\" is not allowed")]
    UnexpectedEnvelopeField { field: String },

    #[error("\"data\" is required")]
    DataRequired,

    #[error("\"data\" must be an object")]
    DataNotObject,

    #[error("\"{field}\" is required")]
    MissingField { field: &'static str },

    #[error("\"{field}\" must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("\"{field}\" is not allowed to be empty")]
    EmptyField { field: &'static str },

    #[error("\"{field}\" is not allowed")]
    UnexpectedField { field: String },
}

/// Parses and validates message bodies against the closed kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageValidator {
    max_envelope_bytes: usize,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self {
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
        }
    }
}

impl MessageValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_envelope_bytes(mut self, max: usize) -> Self {
        self.max_envelope_bytes = max;
        self
    }

    pub fn max_envelope_bytes(&self) -> usize {
        self.max_envelope_bytes
    }

    /// Decode a message body.
    ///
    /// Returns `None` (never panics or errors) for oversized bodies, invalid
    /// UTF-8/JSON, non-object roots, and objects carrying prototype or
    /// constructor keys at any depth.
    pub fn parse(&self, bytes: &[u8]) -> Option<RawEnvelope> {
        if bytes.len() > self.max_envelope_bytes {
            return None;
        }
        let value: JsonValue = serde_json::from_slice(bytes).ok()?;
        if !is_safe(&value) {
            return None;
        }
        let JsonValue::Object(mut root) = value else {
            return None;
        };

        let kind = root.remove("kind").unwrap_or(JsonValue::Null);
        let data = root.remove("data");
        let extra_fields = root.keys().map(|k| truncate_label(k)).collect();

        Some(RawEnvelope {
            kind,
            data,
            extra_fields,
        })
    }

    /// Stage one: exact, case-sensitive match against the queue's kinds.
    pub fn validate_kind(
        &self,
        candidate: &JsonValue,
        allowed: &[MessageKind],
    ) -> Result<MessageKind, ValidationError> {
        let text = match candidate {
            JsonValue::Null => return Err(ValidationError::MissingKind),
            JsonValue::String(text) => text,
            _ => return Err(ValidationError::KindNotString),
        };

        let Some(kind) = MessageKind::from_wire(text) else {
            return Err(ValidationError::UnknownKind {
                allowed: allowed
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        };

        if !allowed.contains(&kind) {
            return Err(ValidationError::KindNotAccepted { kind });
        }
        Ok(kind)
    }

    /// Stage two: closed-world check of `data` against the kind's schema.
    pub fn validate_payload(
        &self,
        envelope: &RawEnvelope,
        schema: &PayloadSchema,
    ) -> Result<Map<String, JsonValue>, ValidationError> {
        if let Some(field) = envelope.extra_fields.first() {
            return Err(ValidationError::UnexpectedEnvelopeField {
                field: field.clone(),
            });
        }

        let data = match &envelope.data {
            None if schema.fields.iter().any(|f| f.required) => {
                return Err(ValidationError::DataRequired);
            }
            None => return Ok(Map::new()),
            Some(JsonValue::Object(map)) => map,
            Some(_) => return Err(ValidationError::DataNotObject),
        };

        for spec in schema.fields {
            let Some(value) = data.get(spec.name) else {
                if spec.required {
                    return Err(ValidationError::MissingField { field: spec.name });
                }
                continue;
            };

            let type_ok = match spec.ty {
                FieldType::String => value.is_string(),
                FieldType::Bool => value.is_boolean(),
                FieldType::Number => value.is_number(),
                FieldType::Object => value.is_object(),
            };
            if !type_ok {
                return Err(ValidationError::WrongType {
                    field: spec.name,
                    expected: spec.ty.label(),
                });
            }

            if spec.non_empty && value.as_str().is_some_and(str::is_empty) {
                return Err(ValidationError::EmptyField { field: spec.name });
            }
        }

        if let Some(extra) = data.keys().find(|k| schema.field(k).is_none()) {
            return Err(ValidationError::UnexpectedField {
                field: truncate_label(extra),
            });
        }

        Ok(data.clone())
    }

    /// Both stages against a queue contract.
    pub fn validate(
        &self,
        envelope: &RawEnvelope,
        contract: &QueueContract,
    ) -> Result<ValidatedMessage, ValidationError> {
        let kind = self.validate_kind(&envelope.kind, contract.kinds())?;
        let payload = self.validate_payload(envelope, schema_for(kind))?;
        Ok(ValidatedMessage { kind, payload })
    }
}

fn is_safe(value: &JsonValue) -> bool {
    match value {
        JsonValue::Object(map) => map
            .iter()
            .all(|(key, nested)| !FORBIDDEN_KEYS.contains(&key.as_str()) && is_safe(nested)),
        JsonValue::Array(items) => items.iter().all(is_safe),
        _ => true,
    }
}

fn truncate_label(label: &str) -> String {
    label.chars().take(MAX_LABEL_CHARS).collect()
}

/// Copy of a payload with credential-looking values scrubbed, for log detail.
pub fn redact(payload: &Map<String, JsonValue>) -> Map<String, JsonValue> {
    payload
        .iter()
        .map(|(key, value)| {
            let value = if SENSITIVE_FIELDS.contains(&key.as_str()) {
                JsonValue::String(REDACTED.to_string())
            } else {
                redact_value(value)
            };
            (key.clone(), value)
        })
        .collect()
}

fn redact_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(nested) => JsonValue::Object(redact(nested)),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}
