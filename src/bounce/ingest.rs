use std::collections::BTreeSet;

use anyhow::Context;

use chrono::{DateTime, Duration, Utc};

use uuid::Uuid;

use crate::health::HealthScorer;
use crate::mailbox::Mailbox;
use crate::model::NewBounce;
use crate::repo::Store;

use super::classify::parse_bounce_report;
use super::correlate::{match_issue, IssueCandidate};

/// Default width of the candidate-issue window, in days
pub const DEFAULT_THRESHOLD_DAYS: i64 = 5;

/// What one ingestion pass did, reported upward for operator visibility
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub messages_processed: u64,
    /// Messages the classifier failed closed on
    pub messages_skipped: u64,
    pub bounces_recorded: u64,
    /// Classified recipients whose address resolved to no subscriber
    pub recipients_discarded: u64,
    /// Subscriptions whose health the scorer moved
    pub subscriptions_rescored: u64,
}

/// Drains the feedback mailbox, classifies each message, correlates bounced
/// addresses to subscribers and issues, persists bounce records, and hands
/// the affected users to the health scorer.
pub struct BounceIngestor<'a, S, M> {
    store: &'a S,
    mailbox: &'a M,
    newsletter_id: Uuid,
    threshold_days: i64,
    dry_run: bool,
}

impl<'a, S, M> BounceIngestor<'a, S, M>
where
    S: Store,
    M: Mailbox,
{
    pub fn new(store: &'a S, mailbox: &'a M, newsletter_id: Uuid) -> Self {
        Self {
            store,
            mailbox,
            newsletter_id,
            threshold_days: DEFAULT_THRESHOLD_DAYS,
            dry_run: false,
        }
    }

    pub fn with_threshold_days(mut self, threshold_days: i64) -> Self {
        self.threshold_days = threshold_days;
        self
    }

    /// Classify and correlate without persisting anything or touching the
    /// mailbox; used to validate mailbox credentials without side effects
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// One ingestion pass over everything currently in the mailbox.
    ///
    /// A mailbox connection failure aborts the pass with nothing mutated; a
    /// malformed message is skipped, not fatal. Returns the pass summary.
    #[tracing::instrument(name = "Bounce ingestion pass", skip(self), fields(newsletter_id = %self.newsletter_id, dry_run = self.dry_run))]
    pub async fn collect(&self, now: DateTime<Utc>) -> anyhow::Result<IngestOutcome> {
        if self
            .store
            .fetch_newsletter(self.newsletter_id)
            .await?
            .is_none()
        {
            anyhow::bail!("Unknown newsletter: {}", self.newsletter_id);
        }

        let since = now - Duration::days(self.threshold_days);
        let candidates: Vec<IssueCandidate> = self
            .store
            .fetch_issues_published_between(self.newsletter_id, since, now)
            .await?
            .iter()
            .map(IssueCandidate::from)
            .collect();

        let messages = self
            .mailbox
            .fetch_bounce_messages()
            .await
            .context("Failed to fetch messages from the feedback mailbox")?;

        let mut outcome = IngestOutcome::default();
        let mut affected_users = BTreeSet::new();

        for message in messages {
            let report = match parse_bounce_report(&message.data) {
                Ok(report) => report,
                Err(error) => {
                    tracing::warn!(
                        error.cause_chain = ?error,
                        "Skipping unclassifiable mailbox message {}",
                        message.id
                    );
                    outcome.messages_skipped += 1;
                    self.discard(&message.id).await?;
                    continue;
                }
            };

            let issue_id = self
                .correlate(&report.original_subject, &candidates, now)
                .await?;

            for recipient in &report.recipients {
                let resolved = self
                    .store
                    .resolve_subscriber_email(self.newsletter_id, &recipient.email)
                    .await?;
                let Some(user_id) = resolved else {
                    tracing::info!(
                        "Discarding bounce for {}: no subscriber holds that address",
                        recipient.email
                    );
                    outcome.recipients_discarded += 1;
                    continue;
                };

                if !self.dry_run {
                    self.store
                        .insert_bounce(&NewBounce {
                            user_id,
                            issue_id,
                            status_code: recipient.status_code.clone(),
                            kind: recipient.kind,
                            created_at: now,
                        })
                        .await?;
                }
                affected_users.insert(user_id);
                outcome.bounces_recorded += 1;
            }

            outcome.messages_processed += 1;
            self.discard(&message.id).await?;
        }

        if !self.dry_run {
            outcome.subscriptions_rescored = HealthScorer::new(self.store)
                .rescore(affected_users, now)
                .await?;
        }

        tracing::info!(
            "Ingestion pass recorded {} bounces from {} messages ({} skipped)",
            outcome.bounces_recorded,
            outcome.messages_processed,
            outcome.messages_skipped
        );
        Ok(outcome)
    }

    /// Scan the candidate set in ascending publish order; fall back to the
    /// most recently published issue when the subject matches nothing
    async fn correlate(
        &self,
        subject: &str,
        candidates: &[IssueCandidate],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Uuid>> {
        if let Some(issue_id) = match_issue(subject, candidates) {
            return Ok(Some(issue_id));
        }
        if let Some(latest) = candidates.last() {
            return Ok(Some(latest.id));
        }
        let fallback = self
            .store
            .fetch_latest_published_issue(self.newsletter_id, now)
            .await?;
        Ok(fallback.map(|issue| issue.id))
    }

    /// Processed messages are removed so they are never ingested twice;
    /// in dry-run mode the mailbox is left untouched
    async fn discard(&self, message_id: &str) -> anyhow::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.mailbox.delete(message_id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::mailbox::{MemoryMailbox, RawMessage};
    use crate::model::{BounceKind, SubscriberHealth, SubscriptionMode};
    use crate::repo::{MemStore, UserRecord};

    use super::*;

    fn hard_bounce_message(recipient: &str, original_subject: &str) -> String {
        format!(
            "From: MAILER-DAEMON@mail.example.com\r\n\
             Subject: Undelivered Mail Returned to Sender\r\n\
             Content-Type: multipart/report; report-type=delivery-status; boundary=\"B\"\r\n\
             \r\n\
             --B\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Final-Recipient: rfc822; {recipient}\r\n\
             Action: failed\r\n\
             Status: 5.1.1\r\n\
             --B\r\n\
             Content-Type: message/rfc822\r\n\
             \r\n\
             Subject: {original_subject}\r\n\
             \r\n\
             Hi\r\n\
             --B--\r\n"
        )
    }

    struct Fixture {
        store: MemStore,
        mailbox: MemoryMailbox,
        newsletter_id: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemStore::new();
            let newsletter_id = store.add_newsletter("Weekly", SubscriptionMode::OptIn);
            Self {
                store,
                mailbox: MemoryMailbox::new(),
                newsletter_id,
            }
        }

        fn ingestor(&self) -> BounceIngestor<'_, MemStore, MemoryMailbox> {
            BounceIngestor::new(&self.store, &self.mailbox, self.newsletter_id)
        }

        fn subscriber(&self, email: &str) -> Uuid {
            let user_id = self.store.add_user(UserRecord {
                id: Uuid::new_v4(),
                email: email.parse().unwrap(),
                first_name: "Test".into(),
                last_name: "User".into(),
                first_access: Utc::now(),
                confirmed: true,
                guest: false,
            });
            self.store
                .add_subscription(self.newsletter_id, user_id, SubscriberHealth::Ok, false);
            user_id
        }
    }

    #[tokio::test]
    async fn hard_bounce_is_recorded_against_the_matching_issue() {
        let fx = Fixture::new();
        let user_id = fx.subscriber("u2@example.com");
        let now = Utc::now();
        let issue_id =
            fx.store
                .add_issue(fx.newsletter_id, "March News", "<p>b</p>", now - Duration::days(1));
        fx.mailbox.push(
            "m1.eml",
            hard_bounce_message("u2@example.com", "March News"),
        );

        let outcome = fx.ingestor().collect(now).await.unwrap();

        assert_eq!(1, outcome.messages_processed);
        assert_eq!(1, outcome.bounces_recorded);

        let bounces = fx.store.bounces();
        assert_eq!(1, bounces.len());
        assert_eq!(user_id, bounces[0].user_id);
        assert_eq!(Some(issue_id), bounces[0].issue_id);
        assert_eq!(BounceKind::Hard, bounces[0].kind);
        assert_eq!("5.1.1", bounces[0].status_code);

        // Processed mail is removed so the same bounce is never re-ingested
        assert!(fx.mailbox.is_empty());
    }

    #[tokio::test]
    async fn unmatched_subject_falls_back_to_latest_candidate() {
        let fx = Fixture::new();
        fx.subscriber("u2@example.com");
        let now = Utc::now();
        fx.store
            .add_issue(fx.newsletter_id, "Old Issue", "<p>b</p>", now - Duration::days(4));
        let latest =
            fx.store
                .add_issue(fx.newsletter_id, "New Issue", "<p>b</p>", now - Duration::days(1));
        fx.mailbox.push(
            "m1.eml",
            hard_bounce_message("u2@example.com", "Completely unrelated"),
        );

        fx.ingestor().collect(now).await.unwrap();

        assert_eq!(Some(latest), fx.store.bounces()[0].issue_id);
    }

    #[tokio::test]
    async fn empty_candidate_window_falls_back_to_store_lookup() {
        let fx = Fixture::new();
        fx.subscriber("u2@example.com");
        let now = Utc::now();
        // Published well outside the 5-day candidate window
        let old_issue =
            fx.store
                .add_issue(fx.newsletter_id, "Ancient", "<p>b</p>", now - Duration::days(40));
        fx.mailbox.push(
            "m1.eml",
            hard_bounce_message("u2@example.com", "whatever"),
        );

        fx.ingestor().collect(now).await.unwrap();

        assert_eq!(Some(old_issue), fx.store.bounces()[0].issue_id);
    }

    #[tokio::test]
    async fn unresolvable_address_is_discarded() {
        let fx = Fixture::new();
        fx.subscriber("subscribed@example.com");
        let now = Utc::now();
        fx.store
            .add_issue(fx.newsletter_id, "March News", "<p>b</p>", now - Duration::days(1));
        fx.mailbox.push(
            "m1.eml",
            hard_bounce_message("stranger@example.com", "March News"),
        );

        let outcome = fx.ingestor().collect(now).await.unwrap();

        assert_eq!(1, outcome.recipients_discarded);
        assert_eq!(0, outcome.bounces_recorded);
        assert!(fx.store.bounces().is_empty());
        // Still consumed from the mailbox
        assert!(fx.mailbox.is_empty());
    }

    #[tokio::test]
    async fn malformed_message_is_skipped_not_fatal() {
        let fx = Fixture::new();
        let user_id = fx.subscriber("u2@example.com");
        let now = Utc::now();
        fx.store
            .add_issue(fx.newsletter_id, "March News", "<p>b</p>", now - Duration::days(1));
        fx.mailbox
            .push("00-vacation.eml", "Subject: away\r\n\r\nBack Monday\r\n");
        fx.mailbox.push(
            "01-bounce.eml",
            hard_bounce_message("u2@example.com", "March News"),
        );

        let outcome = fx.ingestor().collect(now).await.unwrap();

        assert_eq!(1, outcome.messages_skipped);
        assert_eq!(1, outcome.messages_processed);
        assert_eq!(user_id, fx.store.bounces()[0].user_id);
        assert!(fx.mailbox.is_empty());
    }

    #[tokio::test]
    async fn dry_run_persists_nothing_and_keeps_the_mailbox() {
        let fx = Fixture::new();
        fx.subscriber("u2@example.com");
        let now = Utc::now();
        fx.store
            .add_issue(fx.newsletter_id, "March News", "<p>b</p>", now - Duration::days(1));
        fx.mailbox.push(
            "m1.eml",
            hard_bounce_message("u2@example.com", "March News"),
        );

        let outcome = fx.ingestor().dry_run().collect(now).await.unwrap();

        // Classification and correlation still happen
        assert_eq!(1, outcome.messages_processed);
        assert_eq!(1, outcome.bounces_recorded);
        // But nothing is persisted and the mailbox is untouched
        assert!(fx.store.bounces().is_empty());
        assert_eq!(1, fx.mailbox.len());
        assert_eq!(0, outcome.subscriptions_rescored);
    }

    #[tokio::test]
    async fn repeated_bounces_demote_the_subscriber() {
        let fx = Fixture::new();
        let user_id = fx.subscriber("u2@example.com");
        let now = Utc::now();
        fx.store
            .add_issue(fx.newsletter_id, "March News", "<p>b</p>", now - Duration::days(1));
        // One prior hard bounce inside the window
        fx.store
            .seed_bounce(user_id, BounceKind::Hard, now - Duration::days(30));
        fx.mailbox.push(
            "m1.eml",
            hard_bounce_message("u2@example.com", "March News"),
        );

        let outcome = fx.ingestor().collect(now).await.unwrap();

        // (2 hard + 2 total) / max(0, 15) ≈ 0.27: problematic
        assert_eq!(1, outcome.subscriptions_rescored);
        let subscription = fx
            .store
            .fetch_subscriptions_for_user(user_id)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(SubscriberHealth::Problematic, subscription.health);
    }

    #[tokio::test]
    async fn mailbox_failure_aborts_the_pass_without_mutation() {
        struct BrokenMailbox;

        #[async_trait::async_trait]
        impl Mailbox for BrokenMailbox {
            async fn fetch_bounce_messages(&self) -> anyhow::Result<Vec<RawMessage>> {
                anyhow::bail!("connection refused")
            }

            async fn delete(&self, _message_id: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let store = MemStore::new();
        let newsletter_id = store.add_newsletter("Weekly", SubscriptionMode::OptIn);
        let mailbox = BrokenMailbox;

        let result = BounceIngestor::new(&store, &mailbox, newsletter_id)
            .collect(Utc::now())
            .await;

        assert!(result.is_err());
        assert!(store.bounces().is_empty());
    }
}
