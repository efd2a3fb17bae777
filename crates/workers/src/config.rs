//! Worker process settings, read from the environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use image::ImageFormat;

use courier_infra::config::parse_var;
use courier_infra::{ConfigError, CourierConfig};
use courier_messaging::QueueContract;

use crate::backup::BackupScripts;
use crate::photo::parse_format;

pub const DEFAULT_FULL_BACKUP_SCRIPT: &str = "/usr/local/bin/full-backup.sh";
pub const DEFAULT_SQL_BACKUP_SCRIPT: &str = "/usr/local/bin/sql-backup.sh";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_PHOTO_FORMAT: &str = "webp";

/// Which capability a worker process serves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    Hash,
    Backup,
    Photo,
    Email,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Hash => "hash",
            ServiceKind::Backup => "backup",
            ServiceKind::Photo => "photo",
            ServiceKind::Email => "email",
        }
    }

    pub fn contract(self) -> QueueContract {
        match self {
            ServiceKind::Hash => QueueContract::hash(),
            ServiceKind::Backup => QueueContract::backup(),
            ServiceKind::Photo => QueueContract::photo(),
            ServiceKind::Email => QueueContract::email(),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hash" => Ok(ServiceKind::Hash),
            "backup" => Ok(ServiceKind::Backup),
            "photo" => Ok(ServiceKind::Photo),
            "email" => Ok(ServiceKind::Email),
            other => Err(format!(
                "unknown service '{other}' (expected hash, backup, photo or email)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub courier: CourierConfig,
    pub service: ServiceKind,
    pub backup: BackupScripts,
    pub upload_dir: PathBuf,
    pub photo_format: ImageFormat,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let courier = CourierConfig::from_lookup(&lookup)?;

        let raw_service = lookup("COURIER_SERVICE")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("COURIER_SERVICE"))?;
        let service = raw_service
            .trim()
            .parse::<ServiceKind>()
            .map_err(|reason| ConfigError::Invalid {
                var: "COURIER_SERVICE",
                value: raw_service.clone(),
                reason,
            })?;

        let path = |var: &str, default: &str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .map_or_else(|| PathBuf::from(default), PathBuf::from)
        };
        let backup = BackupScripts {
            full: path("COURIER_BACKUP_FULL_SCRIPT", DEFAULT_FULL_BACKUP_SCRIPT),
            sql: path("COURIER_BACKUP_SQL_SCRIPT", DEFAULT_SQL_BACKUP_SCRIPT),
        };
        let upload_dir = path("COURIER_UPLOAD_DIR", DEFAULT_UPLOAD_DIR);

        let raw_format = parse_var(&lookup, "COURIER_PHOTO_FORMAT", DEFAULT_PHOTO_FORMAT.to_string())?;
        let photo_format = parse_format(&raw_format).map_err(|reason| ConfigError::Invalid {
            var: "COURIER_PHOTO_FORMAT",
            value: raw_format.clone(),
            reason,
        })?;

        Ok(Self {
            courier,
            service,
            backup,
            upload_dir,
            photo_format,
        })
    }
}
