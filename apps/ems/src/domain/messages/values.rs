//! Value types shared by client and brokerd messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broker-allocated request id.
///
/// Brokers hand out either integers or strings; both are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReqId {
    /// Numeric id.
    Int(i64),
    /// Textual id.
    Str(String),
}

impl ReqId {
    /// True for an empty or whitespace-only string id.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Str(s) if s.trim().is_empty())
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for ReqId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for ReqId {
    fn from(id: &str) -> Self {
        Self::Str(id.to_string())
    }
}

impl From<String> for ReqId {
    fn from(id: String) -> Self {
        Self::Str(id)
    }
}

/// What the client wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Buy side.
    Buy,
    /// Sell side.
    Sell,
    /// Notify the client when the level is crossed; never reaches a broker.
    Alert,
}

impl Action {
    /// Wire literal.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Alert => "alert",
        }
    }

    /// True for buy and sell.
    #[must_use]
    pub const fn is_trade(&self) -> bool {
        matches!(self, Self::Buy | Self::Sell)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the order is held until it clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Held by the ems and evaluated against a trigger.
    Dark,
    /// Forwarded to the broker immediately.
    Live,
}

impl ExecMode {
    /// Wire literal.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dark => "dark",
            Self::Live => "live",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing dialog state carried by a `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resp {
    /// Sent to the broker, not yet acknowledged as working.
    Pending,
    /// Working at the broker.
    Open,
    /// Held in the ems waiting for its trigger.
    DarkOpen,
    /// Dark order promoted: forwarded to the broker, or an alert fired.
    Triggered,
    /// Fully cleared.
    Closed,
    /// Partially executed.
    Fill,
    /// Canceled.
    Canceled,
    /// Failed.
    Error,
}

impl Resp {
    /// Wire literal.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::DarkOpen => "dark_open",
            Self::Triggered => "triggered",
            Self::Closed => "closed",
            Self::Fill => "fill",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }

    /// Whether the dialog ends with this response.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Canceled | Self::Error)
    }
}

impl fmt::Display for Resp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order state as reported by a broker adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerdStatusKind {
    /// Accepted but not yet working.
    Pending,
    /// Working.
    Open,
    /// Execution progress; `remaining` says whether it is complete.
    Fill,
    /// Canceled at the venue.
    Canceled,
    /// Rejected or failed at the venue.
    Error,
}

impl BrokerdStatusKind {
    /// Wire literal.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Fill => "fill",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BrokerdStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
