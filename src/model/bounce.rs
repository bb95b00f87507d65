use std::str::FromStr;

use uuid::Uuid;

use chrono::{DateTime, Utc};

use serde::Serialize;

use crate::error::Error;

/// Permanent vs. transient delivery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceKind {
    Hard,
    Soft,
}

impl BounceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }
}

impl FromStr for BounceKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "hard" => Ok(Self::Hard),
            "soft" => Ok(Self::Soft),
            other => Err(Error::ParsingError(format!(
                "{} is not a bounce kind",
                other
            ))),
        }
    }
}

/// Request to record one detected bounce event
#[derive(Debug, Clone)]
pub struct NewBounce {
    pub user_id: Uuid,
    /// Best-effort issue correlation; `None` when no issue could be matched
    pub issue_id: Option<Uuid>,
    /// Status code reported by the remote server, e.g. `5.1.1`
    pub status_code: String,
    pub kind: BounceKind,
    pub created_at: DateTime<Utc>,
}

/// Stored Bounce record. Append-only; never updated or deduplicated.
#[derive(Debug, Clone, Serialize)]
pub struct Bounce {
    /// ID of the bounce
    pub id: Uuid,
    pub user_id: Uuid,
    pub issue_id: Option<Uuid>,
    pub status_code: String,
    pub kind: BounceKind,
    pub created_at: DateTime<Utc>,
}
