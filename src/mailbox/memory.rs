use std::sync::Mutex;

use super::{Mailbox, RawMessage};

/// In-memory feedback mailbox for tests and local development
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    messages: Mutex<Vec<RawMessage>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: &str, data: impl Into<Vec<u8>>) {
        self.messages.lock().unwrap().push(RawMessage {
            id: id.to_string(),
            data: data.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl Mailbox for MemoryMailbox {
    async fn fetch_bounce_messages(&self) -> anyhow::Result<Vec<RawMessage>> {
        Ok(self.messages.lock().unwrap().clone())
    }

    async fn delete(&self, message_id: &str) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .retain(|message| message.id != message_id);
        Ok(())
    }
}
