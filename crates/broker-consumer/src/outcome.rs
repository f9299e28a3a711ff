//! Delivery outcomes a received message can be settled with.

use crate::error::ConsumerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Disposition given to a received message
///
/// The numeric codes are stable and are what [`DeliveryOutcome::try_from`]
/// accepts; any other value is a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    /// Processed; the broker stops tracking the message
    Accept = 1,
    /// Malformed or unprocessable; the broker applies its dead-letter policy
    Reject = 2,
    /// Redeliver later without touching the delivery count
    Release = 3,
    /// Redeliver later and increment the delivery count
    Retry = 4,
}

impl DeliveryOutcome {
    /// All outcomes in code order
    pub const ALL: [DeliveryOutcome; 4] = [
        DeliveryOutcome::Accept,
        DeliveryOutcome::Reject,
        DeliveryOutcome::Release,
        DeliveryOutcome::Retry,
    ];

    /// Stable numeric code
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Release => "release",
            Self::Retry => "retry",
        }
    }

    /// Whether the message goes back to the broker for another delivery
    pub fn is_redelivery(&self) -> bool {
        matches!(self, Self::Release | Self::Retry)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i32> for DeliveryOutcome {
    type Error = ConsumerError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Accept),
            2 => Ok(Self::Reject),
            3 => Ok(Self::Release),
            4 => Ok(Self::Retry),
            _ => Err(ConsumerError::InvalidOutcome { value }),
        }
    }
}

impl FromStr for DeliveryOutcome {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            "release" => Ok(Self::Release),
            "retry" => Ok(Self::Retry),
            _ => Err(ConsumerError::UnknownOutcome {
                name: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[path = "outcome_tests.rs"]
mod tests;
