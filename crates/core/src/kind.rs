//! Closed enumeration of message kinds and their per-kind wire profile.

use serde::{Deserialize, Serialize};

/// Caller-side field that must never cross the wire to a worker.
pub const INTERNAL_CORRELATION_FIELD: &str = "correlation_id";

/// Every message kind known to the fleet.
///
/// Each queue accepts a subset (see the queue contracts in `courier-messaging`).
/// The wire spelling is kebab-case and matched case-sensitively.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Ping,
    Pong,
    CreateHash,
    ValidateHash,
    FullBackup,
    SqlBackup,
    ConvertPhoto,
    SendEmail,
    Error,
}

/// Declarative description of how a kind is shaped on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KindProfile {
    /// Whether requests of this kind carry a `data` object at all.
    pub carries_payload: bool,
    /// Caller-side fields removed before publishing.
    pub internal_fields: &'static [&'static str],
    /// Kind used on a success reply.
    pub reply_kind: MessageKind,
}

const NO_PAYLOAD: &[&str] = &[];
const STRIP_CORRELATION: &[&str] = &[INTERNAL_CORRELATION_FIELD];

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::CreateHash,
        MessageKind::ValidateHash,
        MessageKind::FullBackup,
        MessageKind::SqlBackup,
        MessageKind::ConvertPhoto,
        MessageKind::SendEmail,
        MessageKind::Error,
    ];

    /// Wire spelling of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::CreateHash => "create-hash",
            MessageKind::ValidateHash => "validate-hash",
            MessageKind::FullBackup => "full-backup",
            MessageKind::SqlBackup => "sql-backup",
            MessageKind::ConvertPhoto => "convert-photo",
            MessageKind::SendEmail => "send-email",
            MessageKind::Error => "error",
        }
    }

    /// Exact, case-sensitive lookup of a wire spelling.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    pub fn profile(self) -> KindProfile {
        match self {
            MessageKind::Ping => KindProfile {
                carries_payload: false,
                internal_fields: NO_PAYLOAD,
                reply_kind: MessageKind::Pong,
            },
            MessageKind::FullBackup | MessageKind::SqlBackup => KindProfile {
                carries_payload: false,
                internal_fields: NO_PAYLOAD,
                reply_kind: self,
            },
            _ => KindProfile {
                carries_payload: true,
                internal_fields: STRIP_CORRELATION,
                reply_kind: self,
            },
        }
    }

    pub fn carries_payload(self) -> bool {
        self.profile().carries_payload
    }

    pub fn reply_kind(self) -> MessageKind {
        self.profile().reply_kind
    }
}

impl core::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
