//! Closed-world payload schemas, one per message kind.

use courier_core::MessageKind;

/// Primitive JSON type a field must carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Bool,
    Number,
    Object,
}

impl FieldType {
    pub fn label(self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::Bool => "a boolean",
            FieldType::Number => "a number",
            FieldType::Object => "an object",
        }
    }
}

/// One declared field of a payload schema.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    /// Strings must contain at least one character.
    pub non_empty: bool,
}

impl FieldSpec {
    pub const fn required_string(name: &'static str) -> Self {
        Self {
            name,
            ty: FieldType::String,
            required: true,
            non_empty: true,
        }
    }

    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
            non_empty: false,
        }
    }
}

/// Every field a kind's `data` object may contain. Anything else is rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PayloadSchema {
    pub kind: MessageKind,
    pub fields: &'static [FieldSpec],
}

impl PayloadSchema {
    /// Schema with no fields: `data` must be absent or an empty object.
    pub fn is_parameterless(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

const PING: PayloadSchema = PayloadSchema {
    kind: MessageKind::Ping,
    fields: &[],
};

const PONG: PayloadSchema = PayloadSchema {
    kind: MessageKind::Pong,
    fields: &[FieldSpec::optional("response", FieldType::String)],
};

const CREATE_HASH: PayloadSchema = PayloadSchema {
    kind: MessageKind::CreateHash,
    fields: &[FieldSpec::required_string("password")],
};

const VALIDATE_HASH: PayloadSchema = PayloadSchema {
    kind: MessageKind::ValidateHash,
    fields: &[
        FieldSpec::required_string("known_hash"),
        FieldSpec::required_string("attempt"),
    ],
};

const FULL_BACKUP: PayloadSchema = PayloadSchema {
    kind: MessageKind::FullBackup,
    fields: &[],
};

const SQL_BACKUP: PayloadSchema = PayloadSchema {
    kind: MessageKind::SqlBackup,
    fields: &[],
};

const CONVERT_PHOTO: PayloadSchema = PayloadSchema {
    kind: MessageKind::ConvertPhoto,
    fields: &[FieldSpec::required_string("filename")],
};

const SEND_EMAIL: PayloadSchema = PayloadSchema {
    kind: MessageKind::SendEmail,
    fields: &[
        FieldSpec::required_string("to"),
        FieldSpec::required_string("subject"),
        FieldSpec::required_string("body"),
    ],
};

const ERROR: PayloadSchema = PayloadSchema {
    kind: MessageKind::Error,
    fields: &[FieldSpec {
        name: "error",
        ty: FieldType::String,
        required: true,
        non_empty: false,
    }],
};

/// Lookup table from kind to its request schema.
pub fn schema_for(kind: MessageKind) -> &'static PayloadSchema {
    match kind {
        MessageKind::Ping => &PING,
        MessageKind::Pong => &PONG,
        MessageKind::CreateHash => &CREATE_HASH,
        MessageKind::ValidateHash => &VALIDATE_HASH,
        MessageKind::FullBackup => &FULL_BACKUP,
        MessageKind::SqlBackup => &SQL_BACKUP,
        MessageKind::ConvertPhoto => &CONVERT_PHOTO,
        MessageKind::SendEmail => &SEND_EMAIL,
        MessageKind::Error => &ERROR,
    }
}
