use std::path::{Path, PathBuf};

use anyhow::Context;

use tokio::fs;

use super::{Mailbox, RawMessage};

/// File-based feedback mailbox: one `.eml` file per message in a single
/// directory. Message ids are the file names.
#[derive(Debug, Clone)]
pub struct MaildirMailbox {
    dir: PathBuf,
}

impl MaildirMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Message ids double as file names, so anything that could escape the
    /// mailbox directory is rejected outright.
    fn message_path(&self, message_id: &str) -> anyhow::Result<PathBuf> {
        if message_id.contains('/') || message_id.contains('\\') || message_id.contains("..") {
            anyhow::bail!("Invalid mailbox message id: {}", message_id);
        }
        Ok(self.dir.join(message_id))
    }

    fn is_message_file(path: &Path) -> bool {
        path.extension().map(|ext| ext == "eml").unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl Mailbox for MaildirMailbox {
    #[tracing::instrument(name = "Fetch mailbox messages", skip(self))]
    async fn fetch_bounce_messages(&self) -> anyhow::Result<Vec<RawMessage>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to open mailbox directory {}", self.dir.display()))?;

        let mut messages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !Self::is_message_file(&path) {
                continue;
            }
            let Some(id) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let data = fs::read(&path)
                .await
                .with_context(|| format!("Failed to read mailbox message {}", path.display()))?;
            messages.push(RawMessage {
                id: id.to_string(),
                data,
            });
        }

        // Directory order is arbitrary; process oldest file names first
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(messages)
    }

    #[tracing::instrument(name = "Delete mailbox message", skip(self))]
    async fn delete(&self, message_id: &str) -> anyhow::Result<()> {
        let path = self.message_path(message_id)?;
        fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to delete mailbox message {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok};

    use super::*;

    #[tokio::test]
    async fn fetch_returns_only_eml_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("02.eml"), b"second").unwrap();
        std::fs::write(dir.path().join("01.eml"), b"first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mailbox = MaildirMailbox::new(dir.path());
        let messages = mailbox.fetch_bounce_messages().await.unwrap();

        assert_eq!(2, messages.len());
        assert_eq!("01.eml", messages[0].id);
        assert_eq!(b"first".to_vec(), messages[0].data);
        assert_eq!("02.eml", messages[1].id);
    }

    #[tokio::test]
    async fn delete_removes_the_message_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01.eml"), b"bounce").unwrap();

        let mailbox = MaildirMailbox::new(dir.path());
        assert_ok!(mailbox.delete("01.eml").await);

        assert!(!dir.path().join("01.eml").exists());
    }

    #[tokio::test]
    async fn delete_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = MaildirMailbox::new(dir.path());

        assert_err!(mailbox.delete("../outside.eml").await);
    }

    #[tokio::test]
    async fn fetch_fails_when_directory_is_missing() {
        let mailbox = MaildirMailbox::new("/nonexistent/mailbox/dir");

        assert_err!(mailbox.fetch_bounce_messages().await);
    }
}
