use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use uuid::Uuid;

use crate::error::Result;
use crate::model::SubscriberHealth;
use crate::repo::Store;

/// Trailing window over which bounces are counted
pub const BOUNCE_WINDOW_DAYS: i64 = 365;

/// Floor for the sent-count denominator, so early bounces do not instantly
/// blacklist a brand-new subscriber
pub const MIN_SENT_FLOOR: i64 = 15;

const BLACKLIST_THRESHOLD: f64 = 0.30;
const PROBLEMATIC_THRESHOLD: f64 = 0.20;

/// Rolling bounce ratio. Hard bounces are deliberately double-counted (once
/// inside the total, once again alone) to weight them more heavily.
pub fn bounce_ratio(total: u64, hard: u64, sent: i64) -> f64 {
    (hard + total) as f64 / sent.max(MIN_SENT_FLOOR) as f64
}

/// Map a bounce ratio to a health state. Evaluated in descending order,
/// first match wins; blacklisting requires strictly more than the threshold.
pub fn health_for_ratio(ratio: f64) -> SubscriberHealth {
    if ratio > BLACKLIST_THRESHOLD {
        SubscriberHealth::Blacklisted
    } else if ratio >= PROBLEMATIC_THRESHOLD {
        SubscriberHealth::Problematic
    } else {
        SubscriberHealth::Ok
    }
}

/// Recomputes subscriber health after a bounce-ingestion pass
pub struct HealthScorer<'a, S> {
    store: &'a S,
}

impl<'a, S: Store> HealthScorer<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Rescore every user who received at least one new bounce this pass.
    ///
    /// The computed health is applied to the user's subscriptions currently
    /// in `ok` or `problematic`; an explicit `unsubscribed` (or an existing
    /// `blacklisted`) is never overridden, and the field is only written
    /// when it actually changes. Returns the number of updated
    /// subscriptions.
    #[tracing::instrument(name = "Rescore subscriber health", skip(self, user_ids))]
    pub async fn rescore(
        &self,
        user_ids: impl IntoIterator<Item = Uuid> + Send,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let since = now - Duration::days(BOUNCE_WINDOW_DAYS);

        let mut changed = 0;
        for user_id in user_ids.into_iter().collect::<BTreeSet<_>>() {
            let (total, hard) = self.store.count_bounces_since(user_id, since).await?;
            let sent = self.store.total_sent_count(user_id).await?;

            let ratio = bounce_ratio(total, hard, sent);
            let health = health_for_ratio(ratio);

            for subscription in self.store.fetch_subscriptions_for_user(user_id).await? {
                if !subscription.health.is_scoreable() || subscription.health == health {
                    continue;
                }
                self.store
                    .update_subscription_health(subscription.id, health, now)
                    .await?;
                changed += 1;
                tracing::info!(
                    "Subscription {} of user {} moved {} -> {} (ratio {:.3})",
                    subscription.id,
                    user_id,
                    subscription.health.as_str(),
                    health.as_str(),
                    ratio
                );
            }
        }
        Ok(changed)
    }
}
