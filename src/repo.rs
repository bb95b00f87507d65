mod memory;
mod postgres;

pub use memory::{MemStore, UserRecord};
pub use postgres::PgStore;

use chrono::{DateTime, Utc};

use uuid::Uuid;

use crate::domain::EmailAddress;
use crate::error::Result;
use crate::model::{
    Bounce, Delivery, DeliveryStatus, Issue, NewBounce, NewDelivery, Newsletter, Recipient,
    SubscriberHealth, Subscription,
};

/// Storage abstraction for the delivery-and-bounce pipeline.
/// NOTE: Intended to facilitate easier testing/mocking
/// TODO: Swap async-trait for std async traits when those become stable
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Fetch a newsletter by id
    async fn fetch_newsletter(&self, id: Uuid) -> Result<Option<Newsletter>>;

    /// Issues whose publish time has passed and whose delivery is not finished
    async fn fetch_due_issues(&self, now: DateTime<Utc>) -> Result<Vec<Issue>>;

    /// Advance an issue's delivery status
    async fn update_issue_status(&self, issue_id: Uuid, status: DeliveryStatus) -> Result<()>;

    /// Issues of a newsletter published inside a window, ascending by
    /// (publish time, id)
    async fn fetch_issues_published_between(
        &self,
        newsletter_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Issue>>;

    /// The most recently published issue of a newsletter older than `before`
    async fn fetch_latest_published_issue(
        &self,
        newsletter_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Option<Issue>>;

    /// The valid-recipient set for a newsletter: confirmed, non-guest users
    /// holding a subscription in health `ok` or `problematic`.
    /// Rows with an unparseable stored email are skipped with a warning.
    async fn fetch_valid_recipients(&self, newsletter_id: Uuid) -> Result<Vec<Recipient>>;

    /// Recipient data for a single subscribed user, regardless of health
    async fn fetch_recipient(
        &self,
        newsletter_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Recipient>>;

    /// Number of delivery rows that exist for an issue, pending or not
    async fn count_deliveries(&self, issue_id: Uuid) -> Result<u64>;

    /// Number of delivery rows for an issue still awaiting a send
    async fn count_pending_deliveries(&self, issue_id: Uuid) -> Result<u64>;

    /// Bulk-insert pending deliveries; duplicates per (issue, user) are ignored
    async fn insert_deliveries(&self, deliveries: &[NewDelivery]) -> Result<()>;

    /// Delivery rows for an issue still awaiting a send
    async fn fetch_pending_deliveries(&self, issue_id: Uuid) -> Result<Vec<Delivery>>;

    /// Record a successful send; sets the delivered-at timestamp
    async fn mark_delivered(&self, delivery_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Bump the sent-newsletter counter of one (newsletter, user) subscription
    async fn increment_sent_count(&self, newsletter_id: Uuid, user_id: Uuid) -> Result<()>;

    /// Cumulative sent count for a user across all subscriptions
    async fn total_sent_count(&self, user_id: Uuid) -> Result<i64>;

    /// All subscriptions held by a user
    async fn fetch_subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>>;

    /// Overwrite a subscription's health state
    async fn update_subscription_health(
        &self,
        subscription_id: Uuid,
        health: SubscriberHealth,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Resolve a bounced address to a user holding at least one subscription
    /// to the newsletter. Ambiguity tie-break: the highest user id wins.
    async fn resolve_subscriber_email(
        &self,
        newsletter_id: Uuid,
        email: &EmailAddress,
    ) -> Result<Option<Uuid>>;

    /// Append one bounce record
    async fn insert_bounce(&self, bounce: &NewBounce) -> Result<Uuid>;

    /// Bounce counts for a user with `created_at >= since`: (total, hard)
    async fn count_bounces_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<(u64, u64)>;

    /// All bounce rows for a user, newest first
    async fn fetch_bounces_for_user(&self, user_id: Uuid) -> Result<Vec<Bounce>>;
}
