use std::str::FromStr;

use uuid::Uuid;

use serde::Serialize;

use crate::error::Error;

/// How users end up subscribed to a newsletter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Users subscribe themselves
    OptIn,
    /// Users are subscribed on enrolment and may leave
    OptOut,
    /// Users are subscribed and cannot leave
    Forced,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptIn => "opt_in",
            Self::OptOut => "opt_out",
            Self::Forced => "forced",
        }
    }
}

impl FromStr for SubscriptionMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "opt_in" => Ok(Self::OptIn),
            "opt_out" => Ok(Self::OptOut),
            "forced" => Ok(Self::Forced),
            other => Err(Error::ParsingError(format!(
                "{} is not a subscription mode",
                other
            ))),
        }
    }
}

/// Stored Newsletter record
#[derive(Debug, Clone, Serialize)]
pub struct Newsletter {
    /// ID of the newsletter
    pub id: Uuid,
    pub name: String,
    pub subscription_mode: SubscriptionMode,
}
