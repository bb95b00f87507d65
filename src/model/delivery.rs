use uuid::Uuid;

use chrono::{DateTime, Utc};

use serde::Serialize;

/// Request to create a pending delivery during fan-out
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub issue_id: Uuid,
    pub newsletter_id: Uuid,
    pub user_id: Uuid,
}

/// Stored Delivery record, one per (issue, user).
///
/// At most one row may exist per (issue, user) pair; this is the fan-out
/// idempotence guarantee, backed by a unique index.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    /// ID of the delivery
    pub id: Uuid,
    pub issue_id: Uuid,
    pub newsletter_id: Uuid,
    pub user_id: Uuid,
    /// `None` while the send is pending; set exactly once, on success
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Delivery {
    pub fn is_pending(&self) -> bool {
        self.delivered_at.is_none()
    }
}
