use chrono::{DateTime, Utc};

use uuid::Uuid;

use crate::model::Issue;

/// The slice of an issue that subject correlation needs
#[derive(Debug, Clone)]
pub struct IssueCandidate {
    pub id: Uuid,
    pub title: String,
    pub publish_at: DateTime<Utc>,
}

impl From<&Issue> for IssueCandidate {
    fn from(issue: &Issue) -> Self {
        Self {
            id: issue.id,
            title: issue.title.clone(),
            publish_at: issue.publish_at,
        }
    }
}

/// Correlate a bounce's original subject line to an issue.
///
/// Candidates must be in ascending (publish time, id) order; the first one
/// whose title appears as a substring of the subject wins. Best-effort by
/// nature: callers fall back to the most recently published issue when
/// nothing matches.
pub fn match_issue(subject: &str, candidates: &[IssueCandidate]) -> Option<Uuid> {
    candidates
        .iter()
        .find(|candidate| !candidate.title.is_empty() && subject.contains(&candidate.title))
        .map(|candidate| candidate.id)
}
