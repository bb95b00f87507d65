use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::domain::EmailAddress;

/// One row of the valid-recipient set for a newsletter: a confirmed,
/// non-guest user holding a subscription in health `ok` or `problematic`.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: Uuid,
    pub email: EmailAddress,
    pub first_name: String,
    pub last_name: String,
    /// First time the user accessed the site; input to the unsubscribe secret
    pub first_access: DateTime<Utc>,
    /// Suppress the unsubscribe block for this recipient
    pub no_unsub_link: bool,
}

impl Recipient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}
