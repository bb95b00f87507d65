use chrono::{DateTime, Utc};

use url::Url;

use crate::client::{EmailHeader, MailTransport, OutgoingEmail};
use crate::error::Result;
use crate::model::{DeliveryStatus, Issue, NewDelivery};
use crate::personalize;
use crate::repo::Store;

/// What one delivery pass did, reported upward for operator visibility
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub issues_processed: u64,
    pub sent: u64,
    /// Sends that failed at the transport; the rows stay pending and are
    /// retried on the next tick
    pub failed: u64,
}

/// Fans issues out to their valid recipients and drives the per-recipient
/// send loop.
///
/// Issue state machine: `unknown → in_progress → {delivered, failed}`. The
/// `in_progress` transition happens exactly once, guarded by "no delivery
/// rows exist yet"; `delivered` is reached when no pending rows remain.
pub struct DeliveryScheduler<'a, S, T> {
    store: &'a S,
    transport: &'a T,
    issue_base_url: Url,
    unsubscribe_base_url: Url,
}

impl<'a, S, T> DeliveryScheduler<'a, S, T>
where
    S: Store,
    T: MailTransport,
{
    pub fn new(
        store: &'a S,
        transport: &'a T,
        issue_base_url: Url,
        unsubscribe_base_url: Url,
    ) -> Self {
        Self {
            store,
            transport,
            issue_base_url,
            unsubscribe_base_url,
        }
    }

    /// One delivery tick: fan out and deliver every due issue.
    /// A failure on one issue is logged and does not abort the others.
    #[tracing::instrument(name = "Delivery tick", skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<DeliveryOutcome> {
        let mut outcome = DeliveryOutcome::default();

        for issue in self.store.fetch_due_issues(now).await? {
            outcome.issues_processed += 1;

            if self
                .store
                .fetch_newsletter(issue.newsletter_id)
                .await?
                .is_none()
            {
                // Orphaned issue: fan-out can never produce recipients
                tracing::error!(
                    "Issue {} references missing newsletter {}; marking failed",
                    issue.id,
                    issue.newsletter_id
                );
                self.store
                    .update_issue_status(issue.id, DeliveryStatus::Failed)
                    .await?;
                continue;
            }

            match self.process_issue(&issue, now).await {
                Ok((sent, failed)) => {
                    outcome.sent += sent;
                    outcome.failed += failed;
                }
                Err(error) => {
                    // Progress is durable per row; the next tick resumes
                    tracing::error!(
                        error.cause_chain = ?error,
                        "Failed to process issue {}; will retry next tick",
                        issue.id
                    );
                }
            }
        }

        if outcome.failed > 0 {
            tracing::error!(
                "Delivery tick left {} sends pending after transport failures",
                outcome.failed
            );
        }
        Ok(outcome)
    }

    async fn process_issue(&self, issue: &Issue, now: DateTime<Utc>) -> Result<(u64, u64)> {
        self.fan_out(issue, now).await?;
        self.deliver_pending(issue, now).await
    }

    /// Create one pending delivery per valid recipient and move the issue to
    /// `in_progress`. Idempotent: a second invocation is a no-op because
    /// delivery rows already exist.
    #[tracing::instrument(name = "Fan out issue", skip(self, issue), fields(issue_id = %issue.id))]
    pub async fn fan_out(&self, issue: &Issue, now: DateTime<Utc>) -> Result<bool> {
        if issue.publish_at > now {
            return Ok(false);
        }
        if self.store.count_deliveries(issue.id).await? > 0 {
            return Ok(false);
        }

        let recipients = self
            .store
            .fetch_valid_recipients(issue.newsletter_id)
            .await?;

        let deliveries: Vec<NewDelivery> = recipients
            .iter()
            .map(|recipient| NewDelivery {
                issue_id: issue.id,
                newsletter_id: issue.newsletter_id,
                user_id: recipient.user_id,
            })
            .collect();

        self.store.insert_deliveries(&deliveries).await?;
        self.store
            .update_issue_status(issue.id, DeliveryStatus::InProgress)
            .await?;

        tracing::info!(
            "Fanned out issue {} to {} recipients",
            issue.id,
            deliveries.len()
        );
        Ok(true)
    }

    /// Send every pending delivery of an issue. Transport failures leave the
    /// row pending; once no pending rows remain the issue is `delivered`.
    /// Returns (sent, failed) counts.
    #[tracing::instrument(name = "Deliver pending", skip(self, issue), fields(issue_id = %issue.id))]
    pub async fn deliver_pending(&self, issue: &Issue, now: DateTime<Utc>) -> Result<(u64, u64)> {
        let issue_url = self.issue_url(issue);

        let mut sent = 0;
        let mut failed = 0;
        for delivery in self.store.fetch_pending_deliveries(issue.id).await? {
            let Some(recipient) = self
                .store
                .fetch_recipient(issue.newsletter_id, delivery.user_id)
                .await?
            else {
                tracing::warn!(
                    "Skipping delivery {}: user {} is no longer resolvable",
                    delivery.id,
                    delivery.user_id
                );
                continue;
            };

            let email = match personalize::personalize(
                &issue.html_content,
                &recipient,
                &issue_url,
                &self.unsubscribe_base_url,
            ) {
                Ok(email) => email,
                Err(error) => {
                    tracing::warn!(
                        error.cause_chain = ?error,
                        "Skipping delivery {}: failed to personalize content",
                        delivery.id
                    );
                    continue;
                }
            };

            let mut headers = Vec::new();
            if let Some(url) = &email.unsubscribe_url {
                headers.push(EmailHeader {
                    name: "List-Unsubscribe".into(),
                    value: format!("<{}>", url),
                });
            }
            let outgoing = OutgoingEmail {
                subject: issue.title.clone(),
                html_body: email.html_body,
                text_body: email.text_body,
                headers,
            };

            match self.transport.send(&recipient.email, &outgoing).await {
                Ok(()) => {
                    self.store.mark_delivered(delivery.id, now).await?;
                    self.store
                        .increment_sent_count(issue.newsletter_id, recipient.user_id)
                        .await?;
                    sent += 1;
                }
                Err(error) => {
                    // Row stays pending; retried on the next tick
                    tracing::warn!(
                        error.cause_chain = ?error,
                        "Transport failed for delivery {} (user: {})",
                        delivery.id,
                        delivery.user_id
                    );
                    failed += 1;
                }
            }
        }

        if self.store.count_pending_deliveries(issue.id).await? == 0 {
            self.store
                .update_issue_status(issue.id, DeliveryStatus::Delivered)
                .await?;
            tracing::info!("Issue {} fully delivered", issue.id);
        }

        Ok((sent, failed))
    }

    fn issue_url(&self, issue: &Issue) -> String {
        format!(
            "{}/{}",
            self.issue_base_url.as_str().trim_end_matches('/'),
            issue.id
        )
    }
}
