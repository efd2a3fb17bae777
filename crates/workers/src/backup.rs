//! Backup service: runs the configured backup scripts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::process::Command;
use tracing::{info, warn};

use courier_core::{CapabilityError, CapabilityResult, MessageKind};
use courier_messaging::handler::Payload;
use courier_messaging::{CapabilityHandler, HandlerRegistry};

/// Longest stderr excerpt carried into an error reply.
const STDERR_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupScripts {
    pub full: PathBuf,
    pub sql: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BackupService {
    scripts: BackupScripts,
}

impl BackupService {
    pub fn new(scripts: BackupScripts) -> Self {
        Self { scripts }
    }

    pub fn scripts(&self) -> &BackupScripts {
        &self.scripts
    }

    /// Run the script for `kind`; `true` on a zero exit status.
    pub async fn run(&self, kind: MessageKind) -> CapabilityResult<bool> {
        let script = match kind {
            MessageKind::FullBackup => &self.scripts.full,
            MessageKind::SqlBackup => &self.scripts.sql,
            other => return Err(CapabilityError::Unhandled(other.to_string())),
        };
        run_script(script).await?;
        Ok(true)
    }

    pub fn handlers(self) -> HandlerRegistry {
        let service = Arc::new(self);
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(MessageKind::FullBackup, service.clone())
            .register(MessageKind::SqlBackup, service);
        handlers
    }
}

async fn run_script(script: &Path) -> CapabilityResult<()> {
    let started = std::time::Instant::now();
    let output = Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            CapabilityError::external(format!("cannot start {}: {e}", script.display()))
        })?;

    if output.status.success() {
        info!(
            script = %script.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backup finished"
        );
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
    warn!(script = %script.display(), status = %output.status, stderr = %excerpt, "backup failed");

    let status = output
        .status
        .code()
        .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"));
    let mut message = format!("{} exited with {status}", script.display());
    if !excerpt.is_empty() {
        message.push_str(": ");
        message.push_str(&excerpt);
    }
    Err(CapabilityError::external(message))
}

#[async_trait]
impl CapabilityHandler for BackupService {
    async fn handle(&self, kind: MessageKind, _payload: Payload) -> CapabilityResult<JsonValue> {
        Ok(json!(self.run(kind).await?))
    }
}
