use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use uuid::Uuid;

use crate::domain::EmailAddress;
use crate::error::Result;
use crate::model::{
    Bounce, BounceKind, Delivery, DeliveryStatus, Issue, NewBounce, NewDelivery, Newsletter,
    Recipient, SubscriberHealth, Subscription, SubscriptionMode,
};

use super::Store;

/// A stored user account, as far as the pipeline cares about it
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: EmailAddress,
    pub first_name: String,
    pub last_name: String,
    pub first_access: DateTime<Utc>,
    pub confirmed: bool,
    pub guest: bool,
}

#[derive(Debug, Default)]
struct Inner {
    newsletters: HashMap<Uuid, Newsletter>,
    users: HashMap<Uuid, UserRecord>,
    subscriptions: HashMap<Uuid, Subscription>,
    issues: HashMap<Uuid, Issue>,
    deliveries: HashMap<Uuid, Delivery>,
    bounces: Vec<Bounce>,
}

/// In-memory pipeline store.
///
/// Backs the unit and scenario tests, and serves single-process deployments
/// that do not want a database.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_newsletter(&self, name: &str, subscription_mode: SubscriptionMode) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().newsletters.insert(
            id,
            Newsletter {
                id,
                name: name.to_string(),
                subscription_mode,
            },
        );
        id
    }

    pub fn add_user(&self, user: UserRecord) -> Uuid {
        let id = user.id;
        self.inner.lock().unwrap().users.insert(id, user);
        id
    }

    pub fn add_subscription(
        &self,
        newsletter_id: Uuid,
        user_id: Uuid,
        health: SubscriberHealth,
        no_unsub_link: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.inner.lock().unwrap().subscriptions.insert(
            id,
            Subscription {
                id,
                newsletter_id,
                user_id,
                health,
                subscribed_at: now,
                health_changed_at: now,
                sent_newsletters: 0,
                no_unsub_link,
            },
        );
        id
    }

    pub fn add_issue(
        &self,
        newsletter_id: Uuid,
        title: &str,
        html_content: &str,
        publish_at: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().issues.insert(
            id,
            Issue {
                id,
                newsletter_id,
                title: title.to_string(),
                html_content: html_content.to_string(),
                publish_at,
                status: DeliveryStatus::Unknown,
            },
        );
        id
    }

    pub fn issue(&self, id: Uuid) -> Option<Issue> {
        self.inner.lock().unwrap().issues.get(&id).cloned()
    }

    pub fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.inner.lock().unwrap().subscriptions.get(&id).cloned()
    }

    pub fn deliveries_for_issue(&self, issue_id: Uuid) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> = self
            .inner
            .lock()
            .unwrap()
            .deliveries
            .values()
            .filter(|d| d.issue_id == issue_id)
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.user_id);
        deliveries
    }

    pub fn bounces(&self) -> Vec<Bounce> {
        self.inner.lock().unwrap().bounces.clone()
    }

    /// Directly append a bounce row, bypassing ingestion. Test seeding hook.
    pub fn seed_bounce(
        &self,
        user_id: Uuid,
        kind: BounceKind,
        created_at: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().bounces.push(Bounce {
            id,
            user_id,
            issue_id: None,
            status_code: "5.0.0".into(),
            kind,
            created_at,
        });
        id
    }

    /// Set a subscription's sent counter directly. Test seeding hook.
    pub fn seed_sent_count(&self, subscription_id: Uuid, sent: i64) {
        if let Some(subscription) = self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .get_mut(&subscription_id)
        {
            subscription.sent_newsletters = sent;
        }
    }
}

fn recipient_of(user: &UserRecord, subscription: &Subscription) -> Recipient {
    Recipient {
        user_id: user.id,
        email: user.email.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        first_access: user.first_access,
        no_unsub_link: subscription.no_unsub_link,
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn fetch_newsletter(&self, id: Uuid) -> Result<Option<Newsletter>> {
        Ok(self.inner.lock().unwrap().newsletters.get(&id).cloned())
    }

    async fn fetch_due_issues(&self, now: DateTime<Utc>) -> Result<Vec<Issue>> {
        let inner = self.inner.lock().unwrap();
        let mut issues: Vec<Issue> = inner
            .issues
            .values()
            .filter(|i| {
                i.publish_at <= now
                    && matches!(
                        i.status,
                        DeliveryStatus::Unknown | DeliveryStatus::InProgress
                    )
            })
            .cloned()
            .collect();
        issues.sort_by_key(|i| (i.publish_at, i.id));
        Ok(issues)
    }

    async fn update_issue_status(&self, issue_id: Uuid, status: DeliveryStatus) -> Result<()> {
        if let Some(issue) = self.inner.lock().unwrap().issues.get_mut(&issue_id) {
            issue.status = status;
        }
        Ok(())
    }

    async fn fetch_issues_published_between(
        &self,
        newsletter_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Issue>> {
        let inner = self.inner.lock().unwrap();
        let mut issues: Vec<Issue> = inner
            .issues
            .values()
            .filter(|i| {
                i.newsletter_id == newsletter_id
                    && i.publish_at >= since
                    && i.publish_at <= until
            })
            .cloned()
            .collect();
        issues.sort_by_key(|i| (i.publish_at, i.id));
        Ok(issues)
    }

    async fn fetch_latest_published_issue(
        &self,
        newsletter_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<Option<Issue>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .issues
            .values()
            .filter(|i| i.newsletter_id == newsletter_id && i.publish_at <= before)
            .max_by_key(|i| (i.publish_at, i.id))
            .cloned())
    }

    async fn fetch_valid_recipients(&self, newsletter_id: Uuid) -> Result<Vec<Recipient>> {
        let inner = self.inner.lock().unwrap();
        let mut recipients: Vec<Recipient> = inner
            .subscriptions
            .values()
            .filter(|s| s.newsletter_id == newsletter_id && s.health.is_scoreable())
            .filter_map(|s| {
                inner
                    .users
                    .get(&s.user_id)
                    .filter(|u| u.confirmed && !u.guest)
                    .map(|u| recipient_of(u, s))
            })
            .collect();
        recipients.sort_by_key(|r| r.user_id);
        Ok(recipients)
    }

    async fn fetch_recipient(
        &self,
        newsletter_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Recipient>> {
        let inner = self.inner.lock().unwrap();
        let subscription = inner
            .subscriptions
            .values()
            .find(|s| s.newsletter_id == newsletter_id && s.user_id == user_id);
        Ok(subscription.and_then(|s| inner.users.get(&user_id).map(|u| recipient_of(u, s))))
    }

    async fn count_deliveries(&self, issue_id: Uuid) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deliveries
            .values()
            .filter(|d| d.issue_id == issue_id)
            .count() as u64)
    }

    async fn count_pending_deliveries(&self, issue_id: Uuid) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deliveries
            .values()
            .filter(|d| d.issue_id == issue_id && d.is_pending())
            .count() as u64)
    }

    async fn insert_deliveries(&self, deliveries: &[NewDelivery]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for new in deliveries {
            let duplicate = inner
                .deliveries
                .values()
                .any(|d| d.issue_id == new.issue_id && d.user_id == new.user_id);
            if duplicate {
                continue;
            }
            let id = Uuid::new_v4();
            inner.deliveries.insert(
                id,
                Delivery {
                    id,
                    issue_id: new.issue_id,
                    newsletter_id: new.newsletter_id,
                    user_id: new.user_id,
                    delivered_at: None,
                },
            );
        }
        Ok(())
    }

    async fn fetch_pending_deliveries(&self, issue_id: Uuid) -> Result<Vec<Delivery>> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<Delivery> = inner
            .deliveries
            .values()
            .filter(|d| d.issue_id == issue_id && d.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|d| d.user_id);
        Ok(pending)
    }

    async fn mark_delivered(&self, delivery_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(delivery) = self.inner.lock().unwrap().deliveries.get_mut(&delivery_id) {
            if delivery.delivered_at.is_none() {
                delivery.delivered_at = Some(at);
            }
        }
        Ok(())
    }

    async fn increment_sent_count(&self, newsletter_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for subscription in inner.subscriptions.values_mut() {
            if subscription.newsletter_id == newsletter_id && subscription.user_id == user_id {
                subscription.sent_newsletters += 1;
            }
        }
        Ok(())
    }

    async fn total_sent_count(&self, user_id: Uuid) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.sent_newsletters)
            .sum())
    }

    async fn fetch_subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>> {
        let inner = self.inner.lock().unwrap();
        let mut subscriptions: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.id);
        Ok(subscriptions)
    }

    async fn update_subscription_health(
        &self,
        subscription_id: Uuid,
        health: SubscriberHealth,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(subscription) = self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .get_mut(&subscription_id)
        {
            subscription.health = health;
            subscription.health_changed_at = at;
        }
        Ok(())
    }

    async fn resolve_subscriber_email(
        &self,
        newsletter_id: Uuid,
        email: &EmailAddress,
    ) -> Result<Option<Uuid>> {
        let inner = self.inner.lock().unwrap();
        // Highest user id wins when several users share the address
        Ok(inner
            .users
            .values()
            .filter(|u| u.email == *email)
            .filter(|u| {
                inner
                    .subscriptions
                    .values()
                    .any(|s| s.newsletter_id == newsletter_id && s.user_id == u.id)
            })
            .map(|u| u.id)
            .max())
    }

    async fn insert_bounce(&self, bounce: &NewBounce) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().bounces.push(Bounce {
            id,
            user_id: bounce.user_id,
            issue_id: bounce.issue_id,
            status_code: bounce.status_code.clone(),
            kind: bounce.kind,
            created_at: bounce.created_at,
        });
        Ok(id)
    }

    async fn count_bounces_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        let in_window = inner
            .bounces
            .iter()
            .filter(|b| b.user_id == user_id && b.created_at >= since);
        let mut total = 0;
        let mut hard = 0;
        for bounce in in_window {
            total += 1;
            if bounce.kind == BounceKind::Hard {
                hard += 1;
            }
        }
        Ok((total, hard))
    }

    async fn fetch_bounces_for_user(&self, user_id: Uuid) -> Result<Vec<Bounce>> {
        let inner = self.inner.lock().unwrap();
        let mut bounces: Vec<Bounce> = inner
            .bounces
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bounces.sort_by_key(|b| std::cmp::Reverse(b.created_at));
        Ok(bounces)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn user(email: &str) -> UserRecord {
        UserRecord {
            id: Uuid::new_v4(),
            email: email.parse().unwrap(),
            first_name: "Test".into(),
            last_name: "User".into(),
            first_access: Utc::now(),
            confirmed: true,
            guest: false,
        }
    }

    #[tokio::test]
    async fn valid_recipients_excludes_unhealthy_and_unconfirmed() {
        let store = MemStore::new();
        let newsletter = store.add_newsletter("Weekly", SubscriptionMode::OptIn);

        let healthy = store.add_user(user("healthy@example.com"));
        store.add_subscription(newsletter, healthy, SubscriberHealth::Ok, false);

        let blacklisted = store.add_user(user("blacklisted@example.com"));
        store.add_subscription(newsletter, blacklisted, SubscriberHealth::Blacklisted, false);

        let mut unconfirmed = user("unconfirmed@example.com");
        unconfirmed.confirmed = false;
        let unconfirmed = store.add_user(unconfirmed);
        store.add_subscription(newsletter, unconfirmed, SubscriberHealth::Ok, false);

        let recipients = store.fetch_valid_recipients(newsletter).await.unwrap();
        assert_eq!(1, recipients.len());
        assert_eq!(healthy, recipients[0].user_id);
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_ignored() {
        let store = MemStore::new();
        let newsletter = store.add_newsletter("Weekly", SubscriptionMode::OptIn);
        let issue = store.add_issue(newsletter, "Issue 1", "<p>body</p>", Utc::now());
        let user_id = Uuid::new_v4();

        let new = NewDelivery {
            issue_id: issue,
            newsletter_id: newsletter,
            user_id,
        };
        store.insert_deliveries(&[new.clone()]).await.unwrap();
        store.insert_deliveries(&[new]).await.unwrap();

        assert_eq!(1, store.count_deliveries(issue).await.unwrap());
    }

    #[tokio::test]
    async fn bounced_address_resolution_prefers_highest_user_id() {
        let store = MemStore::new();
        let newsletter = store.add_newsletter("Weekly", SubscriptionMode::OptIn);

        let first = store.add_user(user("shared@example.com"));
        store.add_subscription(newsletter, first, SubscriberHealth::Ok, false);
        let second = store.add_user(user("shared@example.com"));
        store.add_subscription(newsletter, second, SubscriberHealth::Ok, false);

        let resolved = store
            .resolve_subscriber_email(newsletter, &"shared@example.com".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(Some(first.max(second)), resolved);
    }

    #[tokio::test]
    async fn bounce_window_counts_split_hard_and_total() {
        let store = MemStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        store.seed_bounce(user_id, BounceKind::Hard, now - Duration::days(10));
        store.seed_bounce(user_id, BounceKind::Soft, now - Duration::days(20));
        // Outside the window
        store.seed_bounce(user_id, BounceKind::Hard, now - Duration::days(400));

        let (total, hard) = store
            .count_bounces_since(user_id, now - Duration::days(365))
            .await
            .unwrap();

        assert_eq!(2, total);
        assert_eq!(1, hard);
    }
}
