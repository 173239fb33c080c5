//! Client <-> ems messages.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::brokerd::BrokerdPosition;
use super::schema::{SchemaError, Validate, require_non_negative, require_text};
use super::values::{Action, ExecMode, ReqId, Resp};

// =============================================================================
// Client -> ems
// =============================================================================

/// Open or modify an order dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Client-generated dialog id, unique per client session.
    pub oid: String,
    /// Buy, sell or alert.
    pub action: Action,
    /// Dark (held by the ems) or live (sent to the broker).
    pub exec_mode: ExecMode,
    /// Instrument symbol.
    pub symbol: String,
    /// Account to trade in.
    pub account: String,
    /// Limit price, or the trigger level for dark orders.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Order size; the sign repeats the side.
    #[serde(with = "rust_decimal::serde::float")]
    pub size: Decimal,
    /// Preferred brokers, in order.
    #[serde(default)]
    pub brokers: Vec<String>,
}

impl Validate for Order {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("oid", &self.oid)?;
        require_text("symbol", &self.symbol)?;
        require_non_negative("price", self.price)?;
        if self.size.is_zero() {
            return Err(SchemaError::invalid("size", "must not be zero"));
        }
        if self.action == Action::Alert && self.exec_mode != ExecMode::Dark {
            return Err(SchemaError::invalid(
                "exec_mode",
                "alerts can only be submitted in dark mode",
            ));
        }
        Ok(())
    }
}

/// Remove a dark trigger or cancel a live order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    /// Dialog to cancel.
    pub oid: String,
    /// Instrument symbol.
    pub symbol: String,
}

impl Validate for Cancel {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("oid", &self.oid)?;
        require_text("symbol", &self.symbol)
    }
}

/// Last traded price for a symbol, used to evaluate dark triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument symbol.
    pub symbol: String,
    /// Last price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

impl Validate for Quote {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("symbol", &self.symbol)?;
        require_non_negative("price", self.price)
    }
}

/// A client request that drives a dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Open or modify.
    Order(Order),
    /// Cancel.
    Cancel(Cancel),
}

impl ClientRequest {
    /// Dialog the request targets.
    #[must_use]
    pub fn oid(&self) -> &str {
        match self {
            Self::Order(order) => &order.oid,
            Self::Cancel(cancel) => &cancel.oid,
        }
    }
}

impl Validate for ClientRequest {
    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Self::Order(order) => order.validate(),
            Self::Cancel(cancel) => cancel.validate(),
        }
    }
}

/// Everything a client connection may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ClientInbound {
    /// Open or modify.
    Order(Order),
    /// Cancel.
    Cancel(Cancel),
    /// Price update for dark triggers.
    Quote(Quote),
}

impl ClientInbound {
    /// The dialog request, if this is one.
    #[must_use]
    pub fn into_request(self) -> Option<ClientRequest> {
        match self {
            Self::Order(order) => Some(ClientRequest::Order(order)),
            Self::Cancel(cancel) => Some(ClientRequest::Cancel(cancel)),
            Self::Quote(_) => None,
        }
    }
}

impl Validate for ClientInbound {
    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Self::Order(order) => order.validate(),
            Self::Cancel(cancel) => cancel.validate(),
            Self::Quote(quote) => quote.validate(),
        }
    }
}

// =============================================================================
// ems -> Client
// =============================================================================

/// Dialog state change relayed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Dialog id.
    pub oid: String,
    /// Emission time, non-decreasing per dialog.
    pub time_ns: i64,
    /// New state.
    pub resp: Resp,
    /// Broker request id, once acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<ReqId>,
    /// The client request this status answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<ClientRequest>,
    /// Origin label for orders not placed through this ems.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Human readable failure reason for `error` responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The broker message that caused this status, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brokerd_msg: Option<Value>,
}

impl Status {
    /// Status with no optional fields set.
    #[must_use]
    pub fn new(oid: impl Into<String>, time_ns: i64, resp: Resp) -> Self {
        Self {
            oid: oid.into(),
            time_ns,
            resp,
            reqid: None,
            req: None,
            src: None,
            reason: None,
            brokerd_msg: None,
        }
    }

    /// Attach the broker request id.
    #[must_use]
    pub fn with_reqid(mut self, reqid: Option<ReqId>) -> Self {
        self.reqid = reqid;
        self
    }

    /// Attach the originating client request.
    #[must_use]
    pub fn with_req(mut self, req: Option<ClientRequest>) -> Self {
        self.req = req;
        self
    }

    /// Attach a failure reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the broker message that caused the status.
    #[must_use]
    pub fn with_brokerd_msg(mut self, msg: Option<Value>) -> Self {
        self.brokerd_msg = msg;
        self
    }
}

impl Validate for Status {
    fn validate(&self) -> Result<(), SchemaError> {
        require_text("oid", &self.oid)?;
        if let Some(req) = &self.req {
            req.validate()?;
        }
        Ok(())
    }
}

/// Everything the ems pushes to a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Dialog update.
    Status(Status),
    /// Position snapshot relayed from a broker.
    Position(BrokerdPosition),
}

impl Validate for ClientEvent {
    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Self::Status(status) => status.validate(),
            Self::Position(position) => position.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::messages::schema::{decode, from_value};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn order_json() -> Value {
        json!({
            "name": "order",
            "oid": "a1",
            "action": "buy",
            "exec_mode": "live",
            "symbol": "XBTUSD",
            "account": "acct1",
            "price": 100,
            "size": 1
        })
    }

    #[test]
    fn order_decodes_with_default_brokers() {
        let request: ClientRequest = from_value(order_json()).unwrap();
        let ClientRequest::Order(order) = request else {
            panic!("expected order");
        };
        assert_eq!(order.oid, "a1");
        assert_eq!(order.price, dec!(100));
        assert_eq!(order.size, dec!(1));
        assert!(order.brokers.is_empty());
    }

    #[test]
    fn missing_required_field_is_schema_error() {
        let mut value = order_json();
        value.as_object_mut().unwrap().remove("account");
        let err = from_value::<ClientRequest>(value).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));
    }

    #[test]
    fn unknown_action_is_schema_error() {
        let mut value = order_json();
        value["action"] = json!("short");
        assert!(matches!(
            from_value::<ClientRequest>(value),
            Err(SchemaError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut value = order_json();
        value["tif"] = json!("gtc");
        assert!(from_value::<ClientRequest>(value).is_ok());
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut value = order_json();
        value["size"] = json!(0);
        assert_eq!(
            from_value::<ClientRequest>(value),
            Err(SchemaError::invalid("size", "must not be zero"))
        );
    }

    #[test]
    fn live_alert_is_rejected() {
        let mut value = order_json();
        value["action"] = json!("alert");
        let err = from_value::<ClientRequest>(value).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidField { field: "exec_mode", .. }));
    }

    #[test]
    fn quote_is_client_inbound() {
        let inbound: ClientInbound =
            decode(r#"{"name":"quote","symbol":"XBTUSD","price":101.5}"#).unwrap();
        assert_eq!(
            inbound,
            ClientInbound::Quote(Quote {
                symbol: "XBTUSD".into(),
                price: dec!(101.5),
            })
        );
        assert!(inbound.into_request().is_none());
    }

    #[test]
    fn status_omits_absent_optionals() {
        let status = Status::new("a1", 7, Resp::DarkOpen);
        let value = serde_json::to_value(ClientEvent::Status(status)).unwrap();
        assert_eq!(
            value,
            json!({"name": "status", "oid": "a1", "time_ns": 7, "resp": "dark_open"})
        );
    }

    #[test]
    fn status_carries_request_back_reference() {
        let cancel = Cancel {
            oid: "a1".into(),
            symbol: "XBTUSD".into(),
        };
        let status = Status::new("a1", 9, Resp::Canceled)
            .with_reqid(Some(ReqId::from("b1")))
            .with_req(Some(ClientRequest::Cancel(cancel.clone())));
        let text = serde_json::to_string(&ClientEvent::Status(status)).unwrap();

        let ClientEvent::Status(decoded) = decode::<ClientEvent>(&text).unwrap() else {
            panic!("expected status");
        };
        assert_eq!(decoded.reqid, Some(ReqId::from("b1")));
        assert_eq!(decoded.req, Some(ClientRequest::Cancel(cancel)));
    }
}
