use anyhow::Context;

use chrono::Utc;

use sqlx::PgPool;

use courier::bounce::BounceIngestor;
use courier::client::EmailClient;
use courier::delivery::DeliveryScheduler;
use courier::lock::FileLock;
use courier::mailbox::MaildirMailbox;
use courier::repo::PgStore;
use courier::settings::Settings;
use courier::telemetry;

/// One scheduler tick per invocation: a delivery pass, then a
/// bounce-ingestion pass. The host cron decides the cadence.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().expect("Failed to load settings");

    let subscriber = telemetry::create_subscriber("info".into(), std::io::stdout);
    telemetry::set_subscriber(subscriber)?;

    let pool = PgPool::connect_with(settings.database.with_db())
        .await
        .context("Failed to connect to the database")?;
    let store = PgStore::new(pool);
    store.migrate().await?;

    let email_client = EmailClient::new(
        settings.email.sender(),
        settings.email.api_timeout(),
        settings.email.api_base_url(),
        settings.email.api_auth_token(),
    )?;

    let lock = FileLock::new(settings.delivery.lock_file());
    let Some(_guard) = lock.try_acquire().context("Failed to take the tick lock")? else {
        tracing::info!("Another tick is still running; skipping this one");
        return Ok(());
    };

    let now = Utc::now();

    let scheduler = DeliveryScheduler::new(
        &store,
        &email_client,
        settings.delivery.issue_base_url(),
        settings.delivery.unsubscribe_base_url(),
    );
    let outcome = scheduler.run(now).await?;
    tracing::info!(
        "Delivery tick finished: {} issues, {} sent, {} left pending",
        outcome.issues_processed,
        outcome.sent,
        outcome.failed
    );

    if settings.mailbox.enabled() {
        let mailbox = MaildirMailbox::new(settings.mailbox.maildir());
        let ingestor = BounceIngestor::new(&store, &mailbox, settings.mailbox.newsletter_id())
            .with_threshold_days(settings.mailbox.bounce_threshold_days());
        let outcome = ingestor.collect(now).await?;
        tracing::info!(
            "Bounce ingestion finished: {} bounces recorded, {} subscriptions rescored",
            outcome.bounces_recorded,
            outcome.subscriptions_rescored
        );
    }

    Ok(())
}
