//! Capability services behind the worker queues.
//!
//! Each service turns a validated payload into a result or a
//! [`CapabilityError`]; the shared worker loop in `courier-infra` does the
//! rest.

pub mod backup;
pub mod config;
pub mod email;
pub mod hash;
pub mod photo;

use std::sync::Arc;

use courier_core::{CapabilityError, CapabilityResult};
use courier_messaging::HandlerRegistry;
use courier_messaging::handler::Payload;

pub use backup::{BackupScripts, BackupService};
pub use config::{ServiceKind, WorkerConfig};
pub use email::{EmailHandler, EmailMessage, LogMailer, MailError, Mailer};
pub use hash::{HashCost, HashService};
pub use photo::{ImageConverter, PhotoConverter, PhotoHandler};

/// Handler table for the service `config` selects.
pub fn handlers_for(config: &WorkerConfig) -> HandlerRegistry {
    match config.service {
        ServiceKind::Hash => HashService::new().handlers(),
        ServiceKind::Backup => BackupService::new(config.backup.clone()).handlers(),
        ServiceKind::Photo => PhotoHandler::new(Arc::new(ImageConverter::new(
            config.upload_dir.clone(),
            config.photo_format,
        )))
        .handlers(),
        ServiceKind::Email => EmailHandler::new(Arc::new(LogMailer)).handlers(),
    }
}

/// A string field the validator has already checked for presence.
pub(crate) fn required_str(payload: &Payload, field: &'static str) -> CapabilityResult<String> {
    payload
        .get(field)
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| CapabilityError::invalid_input(format!("\"{field}\" is required")))
}
