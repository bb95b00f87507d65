use std::str::FromStr;

use uuid::Uuid;

use chrono::{DateTime, Utc};

use serde::Serialize;

use crate::error::Error;

/// A subscriber's standing, derived from bounce history or explicit action.
///
/// Opaque named states; never compare the stored codes numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberHealth {
    Ok,
    Problematic,
    Blacklisted,
    Unsubscribed,
}

impl SubscriberHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Problematic => "problematic",
            Self::Blacklisted => "blacklisted",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    /// Whether the health scorer may overwrite this state.
    /// An explicit `unsubscribed` (and an existing `blacklisted`) survive
    /// rescoring; only active subscriptions move between states.
    pub fn is_scoreable(&self) -> bool {
        matches!(self, Self::Ok | Self::Problematic)
    }
}

impl FromStr for SubscriberHealth {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ok" => Ok(Self::Ok),
            "problematic" => Ok(Self::Problematic),
            "blacklisted" => Ok(Self::Blacklisted),
            "unsubscribed" => Ok(Self::Unsubscribed),
            other => Err(Error::ParsingError(format!(
                "{} is not a subscriber health state",
                other
            ))),
        }
    }
}

/// Stored Subscription record, one per (newsletter, user)
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    /// ID of the subscription
    pub id: Uuid,
    pub newsletter_id: Uuid,
    pub user_id: Uuid,
    pub health: SubscriberHealth,
    pub subscribed_at: DateTime<Utc>,
    /// Last time `health` changed, by scorer or explicit action
    pub health_changed_at: DateTime<Utc>,
    /// Cumulative count of issues sent to this user on this subscription
    pub sent_newsletters: i64,
    /// Suppress the unsubscribe block for this recipient
    pub no_unsub_link: bool,
}
