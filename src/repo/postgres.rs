use chrono::{DateTime, Utc};

use sqlx::PgPool;

use uuid::Uuid;

use crate::domain::EmailAddress;
use crate::error::Result;
use crate::model::{
    Bounce, Delivery, DeliveryStatus, Issue, NewBounce, NewDelivery, Newsletter, Recipient,
    SubscriberHealth, Subscription,
};

use super::Store;

/// Postgres-backed pipeline store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NewsletterRow {
    id: Uuid,
    name: String,
    subscription_mode: String,
}

impl TryFrom<NewsletterRow> for Newsletter {
    type Error = crate::error::Error;

    fn try_from(row: NewsletterRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            subscription_mode: row.subscription_mode.parse()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IssueRow {
    id: Uuid,
    newsletter_id: Uuid,
    title: String,
    html_content: String,
    publish_at: DateTime<Utc>,
    status: String,
}

impl TryFrom<IssueRow> for Issue {
    type Error = crate::error::Error;

    fn try_from(row: IssueRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            newsletter_id: row.newsletter_id,
            title: row.title,
            html_content: row.html_content,
            publish_at: row.publish_at,
            status: row.status.parse()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    newsletter_id: Uuid,
    user_id: Uuid,
    health: String,
    subscribed_at: DateTime<Utc>,
    health_changed_at: DateTime<Utc>,
    sent_newsletters: i64,
    no_unsub_link: bool,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = crate::error::Error;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            newsletter_id: row.newsletter_id,
            user_id: row.user_id,
            health: row.health.parse()?,
            subscribed_at: row.subscribed_at,
            health_changed_at: row.health_changed_at,
            sent_newsletters: row.sent_newsletters,
            no_unsub_link: row.no_unsub_link,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecipientRow {
    user_id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    first_access: DateTime<Utc>,
    no_unsub_link: bool,
}

impl RecipientRow {
    /// Parse the stored email; rows carrying a malformed address yield `None`
    fn into_recipient(self) -> Option<Recipient> {
        match self.email.parse::<EmailAddress>() {
            Ok(email) => Some(Recipient {
                user_id: self.user_id,
                email,
                first_name: self.first_name,
                last_name: self.last_name,
                first_access: self.first_access,
                no_unsub_link: self.no_unsub_link,
            }),
            Err(error) => {
                tracing::warn!(
                    error.cause_chain = ?error,
                    "Skipping recipient with malformed stored email (user: {})",
                    self.user_id
                );
                None
            }
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    issue_id: Uuid,
    newsletter_id: Uuid,
    user_id: Uuid,
    delivered_at: Option<DateTime<Utc>>,
}

impl From<DeliveryRow> for Delivery {
    fn from(row: DeliveryRow) -> Self {
        Self {
            id: row.id,
            issue_id: row.issue_id,
            newsletter_id: row.newsletter_id,
            user_id: row.user_id,
            delivered_at: row.delivered_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BounceRow {
    id: Uuid,
    user_id: Uuid,
    issue_id: Option<Uuid>,
    status_code: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<BounceRow> for Bounce {
    type Error = crate::error::Error;

    fn try_from(row: BounceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            issue_id: row.issue_id,
            status_code: row.status_code,
            kind: row.kind.parse()?,
            created_at: row.created_at,
        })
    }
}

const RECIPIENT_COLUMNS: &str = "\
    u.id as user_id, u.email, u.first_name, u.last_name, \
    u.first_access, s.no_unsub_link";

#[async_trait::async_trait]
impl Store for PgStore {
    #[tracing::instrument(name = "Fetch newsletter", skip(self))]
    async fn fetch_newsletter(&self, id: Uuid) -> Result<Option<Newsletter>> {
        let row = sqlx::query_as::<_, NewsletterRow>(
            "select id, name, subscription_mode from newsletters where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Newsletter::try_from).transpose()
    }

    #[tracing::instrument(name = "Fetch due issues", skip(self))]
    async fn fetch_due_issues(&self, now: DateTime<Utc>) -> Result<Vec<Issue>> {
        let rows = sqlx::query_as::<_, IssueRow>(
            "select id, newsletter_id, title, html_content, publish_at, status \
             from issues \
             where publish_at <= $1 and status in ('unknown', 'in_progress') \
             order by publish_at, id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Issue::try_from).collect()
    }

    #[tracing::instrument(name = "Update issue status", skip(self))]
    async fn update_issue_status(&self, issue_id: Uuid, status: DeliveryStatus) -> Result<()> {
        sqlx::query("update issues set status = $2 where id = $1")
            .bind(issue_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "Fetch issues published in window", skip(self))]
    async fn fetch_issues_published_between(
        &self,
        newsletter_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Issue>> {
        let rows = sqlx::query_as::<_, IssueRow>(
            "select id, newsletter_id, title, html_content, publish_at, status \
             from issues \
             where newsletter_id = $1 and publish_at >= $2 and publish_at <= $3 \
             order by publish_at, id",
        )
        .bind(newsletter_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Issue::try_from).collect()
    }

    #[tracing::instrument(name = "Fetch latest published issue", skip(self))]
    async fn fetch_latest_published_issue(
        &self,
        newsletter_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Option<Issue>> {
        let row = sqlx::query_as::<_, IssueRow>(
            "select id, newsletter_id, title, html_content, publish_at, status \
             from issues \
             where newsletter_id = $1 and publish_at <= $2 \
             order by publish_at desc, id desc \
             limit 1",
        )
        .bind(newsletter_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Issue::try_from).transpose()
    }

    #[tracing::instrument(name = "Fetch valid recipients", skip(self))]
    async fn fetch_valid_recipients(&self, newsletter_id: Uuid) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientRow>(&format!(
            "select {RECIPIENT_COLUMNS} \
             from subscriptions s \
             join users u on u.id = s.user_id \
             where s.newsletter_id = $1 \
               and s.health in ('ok', 'problematic') \
               and u.confirmed_at is not null \
               and not u.is_guest \
             order by u.id"
        ))
        .bind(newsletter_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(RecipientRow::into_recipient)
            .collect())
    }

    #[tracing::instrument(name = "Fetch recipient", skip(self))]
    async fn fetch_recipient(
        &self,
        newsletter_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Recipient>> {
        let row = sqlx::query_as::<_, RecipientRow>(&format!(
            "select {RECIPIENT_COLUMNS} \
             from subscriptions s \
             join users u on u.id = s.user_id \
             where s.newsletter_id = $1 and s.user_id = $2"
        ))
        .bind(newsletter_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(RecipientRow::into_recipient))
    }

    #[tracing::instrument(name = "Count deliveries", skip(self))]
    async fn count_deliveries(&self, issue_id: Uuid) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "select count(*) from deliveries where issue_id = $1",
        )
        .bind(issue_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    #[tracing::instrument(name = "Count pending deliveries", skip(self))]
    async fn count_pending_deliveries(&self, issue_id: Uuid) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "select count(*) from deliveries where issue_id = $1 and delivered_at is null",
        )
        .bind(issue_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    #[tracing::instrument(name = "Bulk-insert pending deliveries", skip(self, deliveries))]
    async fn insert_deliveries(&self, deliveries: &[NewDelivery]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for delivery in deliveries {
            sqlx::query(
                "insert into deliveries (id, issue_id, newsletter_id, user_id) \
                 values ($1, $2, $3, $4) \
                 on conflict (issue_id, user_id) do nothing",
            )
            .bind(Uuid::new_v4())
            .bind(delivery.issue_id)
            .bind(delivery.newsletter_id)
            .bind(delivery.user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(name = "Fetch pending deliveries", skip(self))]
    async fn fetch_pending_deliveries(&self, issue_id: Uuid) -> Result<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            "select id, issue_id, newsletter_id, user_id, delivered_at \
             from deliveries \
             where issue_id = $1 and delivered_at is null \
             order by id",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Delivery::from).collect())
    }

    #[tracing::instrument(name = "Mark delivery sent", skip(self))]
    async fn mark_delivered(&self, delivery_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "update deliveries set delivered_at = $2 \
             where id = $1 and delivered_at is null",
        )
        .bind(delivery_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(name = "Increment sent counter", skip(self))]
    async fn increment_sent_count(&self, newsletter_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "update subscriptions set sent_newsletters = sent_newsletters + 1 \
             where newsletter_id = $1 and user_id = $2",
        )
        .bind(newsletter_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(name = "Total sent count", skip(self))]
    async fn total_sent_count(&self, user_id: Uuid) -> Result<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            "select coalesce(sum(sent_newsletters), 0)::bigint \
             from subscriptions where user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    #[tracing::instrument(name = "Fetch subscriptions for user", skip(self))]
    async fn fetch_subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "select id, newsletter_id, user_id, health, subscribed_at, \
                    health_changed_at, sent_newsletters, no_unsub_link \
             from subscriptions where user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    #[tracing::instrument(name = "Update subscription health", skip(self))]
    async fn update_subscription_health(
        &self,
        subscription_id: Uuid,
        health: SubscriberHealth,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "update subscriptions set health = $2, health_changed_at = $3 where id = $1",
        )
        .bind(subscription_id)
        .bind(health.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(name = "Resolve bounced address", skip(self))]
    async fn resolve_subscriber_email(
        &self,
        newsletter_id: Uuid,
        email: &EmailAddress,
    ) -> Result<Option<Uuid>> {
        // Highest user id wins when several users share the address
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "select u.id \
             from users u \
             join subscriptions s on s.user_id = u.id \
             where s.newsletter_id = $1 and u.email = $2 \
             order by u.id desc \
             limit 1",
        )
        .bind(newsletter_id)
        .bind(email.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    #[tracing::instrument(name = "Insert bounce", skip(self))]
    async fn insert_bounce(&self, bounce: &NewBounce) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "insert into bounces (id, user_id, issue_id, status_code, kind, created_at) \
             values ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(bounce.user_id)
        .bind(bounce.issue_id)
        .bind(&bounce.status_code)
        .bind(bounce.kind.as_str())
        .bind(bounce.created_at)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    #[tracing::instrument(name = "Count bounces in window", skip(self))]
    async fn count_bounces_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        let (total, hard) = sqlx::query_as::<_, (i64, i64)>(
            "select count(*), count(*) filter (where kind = 'hard') \
             from bounces \
             where user_id = $1 and created_at >= $2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok((total as u64, hard as u64))
    }

    #[tracing::instrument(name = "Fetch bounces for user", skip(self))]
    async fn fetch_bounces_for_user(&self, user_id: Uuid) -> Result<Vec<Bounce>> {
        let rows = sqlx::query_as::<_, BounceRow>(
            "select id, user_id, issue_id, status_code, kind, created_at \
             from bounces where user_id = $1 \
             order by created_at desc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Bounce::try_from).collect()
    }
}
