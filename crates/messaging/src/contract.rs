//! Queue contracts: which kinds each service queue accepts.

use courier_core::{CallClass, MessageKind, QueueConfig};

pub const HASH_QUEUE: &str = "hash";
pub const BACKUP_QUEUE: &str = "backup";
pub const PHOTO_QUEUE: &str = "photo";
pub const EMAIL_QUEUE: &str = "email";

/// Closed, queue-scoped kind enumeration plus the queue's timeout class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueContract {
    name: String,
    kinds: Vec<MessageKind>,
    call_class: CallClass,
}

impl QueueContract {
    /// Build a contract; `ping` is always accepted.
    pub fn new(name: impl Into<String>, kinds: &[MessageKind], call_class: CallClass) -> Self {
        let mut all = vec![MessageKind::Ping];
        all.extend(kinds.iter().copied().filter(|k| *k != MessageKind::Ping));
        Self {
            name: name.into(),
            kinds: all,
            call_class,
        }
    }

    pub fn hash() -> Self {
        Self::new(
            HASH_QUEUE,
            &[MessageKind::CreateHash, MessageKind::ValidateHash],
            CallClass::Short,
        )
    }

    pub fn backup() -> Self {
        Self::new(
            BACKUP_QUEUE,
            &[MessageKind::FullBackup, MessageKind::SqlBackup],
            CallClass::Long,
        )
    }

    pub fn photo() -> Self {
        Self::new(PHOTO_QUEUE, &[MessageKind::ConvertPhoto], CallClass::Medium)
    }

    pub fn email() -> Self {
        Self::new(EMAIL_QUEUE, &[MessageKind::SendEmail], CallClass::Short)
    }

    /// Same contract on a differently named queue.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kinds(&self) -> &[MessageKind] {
        &self.kinds
    }

    pub fn call_class(&self) -> CallClass {
        self.call_class
    }

    pub fn accepts(&self, kind: MessageKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Durable declaration for the worker side. Messages nobody consumes
    /// within the call class TTL are discarded.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::durable(self.name.clone()).with_message_ttl(self.call_class.ttl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_contract_accepts_ping() {
        for contract in [
            QueueContract::hash(),
            QueueContract::backup(),
            QueueContract::photo(),
            QueueContract::email(),
        ] {
            assert!(contract.accepts(MessageKind::Ping), "{}", contract.name());
            assert!(!contract.accepts(MessageKind::Error));
            assert!(!contract.accepts(MessageKind::Pong));
        }
    }

    #[test]
    fn queues_recognize_distinct_subsets() {
        assert!(QueueContract::hash().accepts(MessageKind::CreateHash));
        assert!(!QueueContract::hash().accepts(MessageKind::FullBackup));
        assert!(QueueContract::backup().accepts(MessageKind::SqlBackup));
        assert!(!QueueContract::photo().accepts(MessageKind::SendEmail));
    }

    #[test]
    fn ping_is_not_duplicated() {
        let contract = QueueContract::new("q", &[MessageKind::Ping, MessageKind::SendEmail], CallClass::Short);
        assert_eq!(contract.kinds(), &[MessageKind::Ping, MessageKind::SendEmail]);
    }

    #[test]
    fn worker_queue_is_durable() {
        let cfg = QueueContract::backup().with_name("backup-eu").queue_config();
        assert!(cfg.durable);
        assert_eq!(cfg.name, "backup-eu");
    }

    #[test]
    fn worker_queue_ttl_follows_the_call_class() {
        let expected = [
            (QueueContract::hash(), 1_500),
            (QueueContract::backup(), 20_000),
            (QueueContract::photo(), 5_000),
            (QueueContract::email(), 1_500),
        ];
        for (contract, ttl_ms) in expected {
            let cfg = contract.queue_config();
            assert_eq!(
                cfg.message_ttl,
                Some(std::time::Duration::from_millis(ttl_ms)),
                "{}",
                contract.name()
            );
            assert_eq!(cfg.expires, None);
        }
    }
}
