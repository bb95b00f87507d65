/// Bounce ingestion: classification, issue correlation, mailbox drain
pub mod bounce;
/// REST clients for outside services
pub mod client;
/// Issue delivery scheduling and fan-out
pub mod delivery;
/// Domain objects
pub mod domain;
/// Error enums
pub mod error;
/// Subscriber health scoring
pub mod health;
/// Cooperative tick lock
pub mod lock;
/// Feedback mailbox access
pub mod mailbox;
/// Stored record types
pub mod model;
/// Per-recipient content personalization
pub mod personalize;
/// Repositories
pub mod repo;
/// Application settings
pub mod settings;
/// Application telemetry for tracing and logging
pub mod telemetry;
