mod maildir;
mod memory;

pub use maildir::MaildirMailbox;
pub use memory::MemoryMailbox;

/// One raw message pulled from the feedback mailbox
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Mailbox-local identifier, used to delete the message once processed
    pub id: String,
    pub data: Vec<u8>,
}

/// Feedback-mailbox boundary.
///
/// The production deployment plugs a remote retrieval client in here; the
/// crate ships a maildir-style file store and an in-memory store.
#[async_trait::async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch every message currently waiting in the mailbox
    async fn fetch_bounce_messages(&self) -> anyhow::Result<Vec<RawMessage>>;

    /// Remove a processed message so it is never ingested twice
    async fn delete(&self, message_id: &str) -> anyhow::Result<()>;
}
