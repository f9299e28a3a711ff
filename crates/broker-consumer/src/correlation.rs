//! Correlation identifiers grouping the log lines of one processing attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, never reused token identifying one processing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate new correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get string representation
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse::<Uuid>()?))
    }
}

/// Current correlation identifier of one supervising loop
///
/// Owned by the loop (single writer) and passed by reference down the
/// receive/handle/log chain instead of living in global state.
#[derive(Debug)]
pub struct CorrelationContext {
    current: CorrelationId,
    minted: u64,
}

impl CorrelationContext {
    /// Start a context with a freshly minted identifier
    pub fn new() -> Self {
        Self {
            current: CorrelationId::new(),
            minted: 1,
        }
    }

    /// Identifier in effect for the current processing attempt
    pub fn current(&self) -> &CorrelationId {
        &self.current
    }

    /// Replace the current identifier with a fresh one and return it
    pub fn renew(&mut self) -> &CorrelationId {
        self.current = CorrelationId::new();
        self.minted += 1;
        &self.current
    }

    /// Number of identifiers minted so far, including the initial one
    pub fn minted(&self) -> u64 {
        self.minted
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "correlation_tests.rs"]
mod tests;
