mod email_client;

pub use email_client::{EmailAuthorizationToken, EmailClient};

use crate::domain::EmailAddress;

/// One custom message header, e.g. `List-Unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailHeader {
    pub name: String,
    pub value: String,
}

/// A fully personalized message, ready for the transport
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub headers: Vec<EmailHeader>,
}

/// Outbound mail transport boundary.
/// NOTE: Intended to facilitate easier testing/mocking
#[async_trait::async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, recipient: &EmailAddress, email: &OutgoingEmail) -> anyhow::Result<()>;
}
