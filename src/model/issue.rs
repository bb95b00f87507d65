use std::str::FromStr;

use uuid::Uuid;

use chrono::{DateTime, Utc};

use serde::Serialize;

use crate::error::Error;

/// Delivery progress of an issue.
///
/// The variants are opaque named states; the stored codes carry no ordering
/// and must never be compared numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Delivery has not started
    Unknown,
    /// Fan-out happened, pending deliveries remain
    InProgress,
    /// Every delivery for the issue succeeded
    Delivered,
    /// Delivery could not be started or completed
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::InProgress => "in_progress",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unknown" => Ok(Self::Unknown),
            "in_progress" => Ok(Self::InProgress),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(Error::ParsingError(format!(
                "{} is not a delivery status",
                other
            ))),
        }
    }
}

/// Stored Issue record
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    /// ID of the issue
    pub id: Uuid,
    pub newsletter_id: Uuid,
    pub title: String,
    /// Fully rendered HTML body, ready for personalization
    pub html_content: String,
    /// Scheduled publication time; fan-out starts once this has passed
    pub publish_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}
