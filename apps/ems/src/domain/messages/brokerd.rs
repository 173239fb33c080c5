//! ems <-> brokerd messages.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::{SchemaError, Validate, require_non_negative, require_text};
use super::values::{Action, BrokerdStatusKind, ReqId};

// =============================================================================
// ems -> brokerd
// =============================================================================

/// Create (no `reqid`) or modify (with `reqid`) a broker order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerdOrder {
    /// ems dialog id.
    pub oid: String,
    /// Account to trade in.
    pub account: String,
    /// Request time.
    pub time_ns: i64,
    /// Buy or sell.
    pub action: Action,
    /// Existing broker order to modify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<ReqId>,
    /// Instrument symbol.
    pub symbol: String,
    /// Limit price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Order size.
    #[serde(with = "rust_decimal::serde::float")]
    pub size: Decimal,
}

impl Validate for BrokerdOrder {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("oid", &self.oid)?;
        require_text("symbol", &self.symbol)?;
        require_non_negative("price", self.price)?;
        if !self.action.is_trade() {
            return Err(SchemaError::invalid("action", "brokers only accept buy or sell"));
        }
        if self.size.is_zero() {
            return Err(SchemaError::invalid("size", "must not be zero"));
        }
        Ok(())
    }
}

/// Cancel a broker order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerdCancel {
    /// ems dialog id.
    pub oid: String,
    /// Account the order lives in.
    pub account: String,
    /// Request time.
    pub time_ns: i64,
    /// Broker order to cancel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<ReqId>,
}

impl Validate for BrokerdCancel {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("oid", &self.oid)
    }
}

/// Requests the ems sends to a broker adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum BrokerdRequest {
    /// Create or modify.
    Order(BrokerdOrder),
    /// Cancel.
    Cancel(BrokerdCancel),
}

impl BrokerdRequest {
    /// RPC method the request travels under.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Order(_) => "order",
            Self::Cancel(_) => "cancel",
        }
    }

    /// Dialog the request belongs to.
    #[must_use]
    pub fn oid(&self) -> &str {
        match self {
            Self::Order(order) => &order.oid,
            Self::Cancel(cancel) => &cancel.oid,
        }
    }

    /// Broker request id, when the request targets an existing order.
    #[must_use]
    pub const fn reqid(&self) -> Option<&ReqId> {
        match self {
            Self::Order(order) => order.reqid.as_ref(),
            Self::Cancel(cancel) => cancel.reqid.as_ref(),
        }
    }
}

impl Validate for BrokerdRequest {
    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Self::Order(order) => order.validate(),
            Self::Cancel(cancel) => cancel.validate(),
        }
    }
}

// =============================================================================
// brokerd -> ems
// =============================================================================

/// First reply to a `BrokerdOrder`, binding the broker's id to the dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerdOrderAck {
    /// Broker-allocated id.
    pub reqid: ReqId,
    /// ems dialog id from the request.
    pub oid: String,
    /// Account.
    #[serde(default)]
    pub account: String,
}

impl Validate for BrokerdOrderAck {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("oid", &self.oid)?;
        if self.reqid.is_blank() {
            return Err(SchemaError::invalid("reqid", "must not be empty"));
        }
        Ok(())
    }
}

/// Order state change at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerdStatus {
    /// Broker order id.
    pub reqid: ReqId,
    /// Broker event time.
    pub time_ns: i64,
    /// New state.
    pub status: BrokerdStatusKind,
    /// Account.
    pub account: String,
    /// Cumulative filled size.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub filled: Decimal,
    /// Size still working.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub remaining: Decimal,
    /// Failure or cancel reason.
    #[serde(default)]
    pub reason: String,
    /// Broker specific extras.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_details: Option<Value>,
}

impl Validate for BrokerdStatus {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_negative("filled", self.filled)?;
        require_non_negative("remaining", self.remaining)
    }
}

/// One execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerdFill {
    /// Broker order id.
    pub reqid: ReqId,
    /// ems receive time.
    pub time_ns: i64,
    /// Executed size.
    #[serde(with = "rust_decimal::serde::float")]
    pub size: Decimal,
    /// Execution price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Side, when the broker reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Broker clock, epoch seconds.
    pub broker_time: f64,
    /// Broker specific extras (commissions and the like).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_details: Option<Value>,
}

impl Validate for BrokerdFill {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_negative("price", self.price)?;
        if self.size.is_zero() {
            return Err(SchemaError::invalid("size", "must not be zero"));
        }
        Ok(())
    }
}

/// Failure reported by a broker adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerdError {
    /// ems dialog id.
    pub oid: String,
    /// Broker order id; absent when the failure happened before submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<ReqId>,
    /// Instrument symbol.
    pub symbol: String,
    /// Human readable reason.
    pub reason: String,
    /// Broker specific extras.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_details: Option<Value>,
}

impl Validate for BrokerdError {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("oid", &self.oid)
    }
}

/// Position snapshot; not tied to any dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerdPosition {
    /// Broker name.
    pub broker: String,
    /// Account.
    pub account: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Signed position size.
    #[serde(with = "rust_decimal::serde::float")]
    pub size: Decimal,
    /// Average entry price.
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_price: Decimal,
    /// Settlement currency.
    #[serde(default)]
    pub currency: String,
}

impl Validate for BrokerdPosition {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("broker", &self.broker)?;
        require_text("symbol", &self.symbol)
    }
}

/// Events a broker adapter sends to the ems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum BrokerdEvent {
    /// Order acknowledged.
    Ack(BrokerdOrderAck),
    /// Order state change.
    Status(BrokerdStatus),
    /// Execution.
    Fill(BrokerdFill),
    /// Failure.
    Error(BrokerdError),
    /// Position snapshot.
    Position(BrokerdPosition),
}

impl BrokerdEvent {
    /// Wire tag, used as a metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ack(_) => "ack",
            Self::Status(_) => "status",
            Self::Fill(_) => "fill",
            Self::Error(_) => "error",
            Self::Position(_) => "position",
        }
    }
}

impl Validate for BrokerdEvent {
    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Self::Ack(ack) => ack.validate(),
            Self::Status(status) => status.validate(),
            Self::Fill(fill) => fill.validate(),
            Self::Error(error) => error.validate(),
            Self::Position(position) => position.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::messages::schema::from_value;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn status_defaults_optional_amounts() {
        let event: BrokerdEvent = from_value(json!({
            "name": "status",
            "reqid": "b1",
            "time_ns": 10,
            "status": "open",
            "account": "acct1"
        }))
        .unwrap();
        let BrokerdEvent::Status(status) = event else {
            panic!("expected status");
        };
        assert_eq!(status.filled, Decimal::ZERO);
        assert_eq!(status.remaining, Decimal::ZERO);
        assert_eq!(status.reason, "");
    }

    #[test]
    fn ack_requires_reqid() {
        let err = from_value::<BrokerdEvent>(json!({"name": "ack", "oid": "a1"})).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));

        let err = from_value::<BrokerdEvent>(json!({"name": "ack", "oid": "a1", "reqid": ""}))
            .unwrap_err();
        assert_eq!(err, SchemaError::invalid("reqid", "must not be empty"));
    }

    #[test]
    fn fill_accepts_integer_reqid() {
        let event: BrokerdEvent = from_value(json!({
            "name": "fill",
            "reqid": 77,
            "time_ns": 11,
            "size": 0.5,
            "price": 100.25,
            "broker_time": 1_700_000_000.5
        }))
        .unwrap();
        let BrokerdEvent::Fill(fill) = event else {
            panic!("expected fill");
        };
        assert_eq!(fill.reqid, ReqId::Int(77));
        assert_eq!(fill.size, dec!(0.5));
        assert_eq!(fill.price, dec!(100.25));
        assert!(fill.action.is_none());
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        assert!(from_value::<BrokerdEvent>(json!({"name": "heartbeat"})).is_err());
    }

    #[test]
    fn alert_never_reaches_a_broker() {
        let order = BrokerdOrder {
            oid: "a1".into(),
            account: "acct1".into(),
            time_ns: 1,
            action: Action::Alert,
            reqid: None,
            symbol: "XBTUSD".into(),
            price: dec!(100),
            size: dec!(1),
        };
        assert!(matches!(
            order.validate(),
            Err(SchemaError::InvalidField { field: "action", .. })
        ));
    }

    #[test]
    fn request_method_and_reqid() {
        let cancel = BrokerdRequest::Cancel(BrokerdCancel {
            oid: "a1".into(),
            account: "acct1".into(),
            time_ns: 5,
            reqid: Some(ReqId::from("b1")),
        });
        assert_eq!(cancel.method(), "cancel");
        assert_eq!(cancel.oid(), "a1");
        assert_eq!(cancel.reqid(), Some(&ReqId::from("b1")));
    }
}
