mod classify;
mod correlate;
mod ingest;

pub use classify::{parse_bounce_report, BounceReport, BouncedRecipient};
pub use correlate::{match_issue, IssueCandidate};
pub use ingest::{BounceIngestor, IngestOutcome};
