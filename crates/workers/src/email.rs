//! Email service: best-effort delivery through a [`Mailer`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use courier_core::{CapabilityResult, MessageKind};
use courier_messaging::handler::Payload;
use courier_messaging::{CapabilityHandler, HandlerRegistry};

use crate::required_str;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    #[error("mail transport unavailable: {0}")]
    Transport(String),

    #[error("recipient rejected: {0}")]
    Rejected(String),
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            body_chars = message.body.chars().count(),
            "email sent"
        );
        Ok(())
    }
}

/// Handles `send-email`; delivery failures are logged and never reported back.
pub struct EmailHandler {
    mailer: Arc<dyn Mailer>,
}

impl EmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    pub fn handlers(self) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers.register(MessageKind::SendEmail, Arc::new(self));
        handlers
    }
}

#[async_trait]
impl CapabilityHandler for EmailHandler {
    async fn handle(&self, _kind: MessageKind, payload: Payload) -> CapabilityResult<JsonValue> {
        let message = EmailMessage {
            to: required_str(&payload, "to")?,
            subject: required_str(&payload, "subject")?,
            body: required_str(&payload, "body")?,
        };
        if let Err(e) = self.mailer.send(&message).await {
            warn!(to = %message.to, error = %e, "email not delivered");
        }
        Ok(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<EmailMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for Recording {
        async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Transport("smtp down".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("to".into(), json!("ops@example.com"));
        payload.insert("subject".into(), json!("nightly"));
        payload.insert("body".into(), json!("backup done"));
        payload
    }

    #[tokio::test]
    async fn message_is_handed_to_the_mailer() {
        let mailer = Arc::new(Recording::default());
        let handler = EmailHandler::new(mailer.clone());
        assert_eq!(
            handler.handle(MessageKind::SendEmail, payload()).await,
            Ok(JsonValue::Null)
        );
        assert_eq!(
            mailer.sent.lock().unwrap().as_slice(),
            &[EmailMessage {
                to: "ops@example.com".into(),
                subject: "nightly".into(),
                body: "backup done".into(),
            }]
        );
    }

    #[tokio::test]
    async fn delivery_failure_is_not_an_error() {
        let handler = EmailHandler::new(Arc::new(Recording {
            fail: true,
            ..Default::default()
        }));
        assert_eq!(
            handler.handle(MessageKind::SendEmail, payload()).await,
            Ok(JsonValue::Null)
        );
    }

    #[tokio::test]
    async fn log_mailer_always_succeeds() {
        let message = EmailMessage {
            to: "a@example.com".into(),
            subject: "s".into(),
            body: "b".into(),
        };
        assert_eq!(LogMailer.send(&message).await, Ok(()));
    }
}
