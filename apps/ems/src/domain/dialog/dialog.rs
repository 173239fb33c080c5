//! Dialog aggregate.
//!
//! One dialog per client order. It remembers what the client last asked
//! for, what the broker has acknowledged, what was executed, and the
//! requests that must wait for the broker's ack before they can be sent.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::messages::{
    BrokerdCancel, BrokerdOrder, Cancel, ClientRequest, ExecMode, Order, ReqId, SchemaError,
    Status, Validate,
};

use super::errors::RoutingError;
use super::state::DialogState;
use super::trigger::DarkTrigger;

/// Largest difference between executed and ordered size still counted as equal.
pub const FILL_TOLERANCE: Decimal = dec!(0.00000001);

/// Lifecycle of one client order.
#[derive(Debug, Clone)]
pub struct Dialog {
    order: Order,
    state: DialogState,
    broker: Option<String>,
    reqid: Option<ReqId>,
    last_request: ClientRequest,
    queued_cancel: Option<Cancel>,
    queued_modify: Option<Order>,
    executed: Decimal,
    fill_count: u32,
    broker_filled: Decimal,
    broker_remaining: Decimal,
    trigger: Option<DarkTrigger>,
    last_time_ns: i64,
}

impl Dialog {
    /// Open a dialog for a validated order.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the order fails validation.
    pub fn open(order: Order) -> Result<Self, SchemaError> {
        order.validate()?;
        let trigger = (order.exec_mode == ExecMode::Dark).then(|| DarkTrigger::new(order.price));
        Ok(Self {
            last_request: ClientRequest::Order(order.clone()),
            order,
            state: DialogState::Created,
            broker: None,
            reqid: None,
            queued_cancel: None,
            queued_modify: None,
            executed: Decimal::ZERO,
            fill_count: 0,
            broker_filled: Decimal::ZERO,
            broker_remaining: Decimal::ZERO,
            trigger,
            last_time_ns: i64::MIN,
        })
    }

    /// Dialog id.
    #[must_use]
    pub fn oid(&self) -> &str {
        &self.order.oid
    }

    /// The order as currently working.
    #[must_use]
    pub const fn order(&self) -> &Order {
        &self.order
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> DialogState {
        self.state
    }

    /// Broker the order was routed to.
    #[must_use]
    pub fn broker(&self) -> Option<&str> {
        self.broker.as_deref()
    }

    /// Broker request id, once acknowledged.
    #[must_use]
    pub const fn reqid(&self) -> Option<&ReqId> {
        self.reqid.as_ref()
    }

    /// The last client request applied to this dialog.
    #[must_use]
    pub const fn last_request(&self) -> &ClientRequest {
        &self.last_request
    }

    /// Size executed so far, summed from fills.
    #[must_use]
    pub const fn executed(&self) -> Decimal {
        self.executed
    }

    /// Number of fills recorded.
    #[must_use]
    pub const fn fill_count(&self) -> u32 {
        self.fill_count
    }

    /// Latest (filled, remaining) reported by the broker.
    #[must_use]
    pub const fn broker_amounts(&self) -> (Decimal, Decimal) {
        (self.broker_filled, self.broker_remaining)
    }

    /// Dark trigger, for dark orders.
    #[must_use]
    pub const fn trigger(&self) -> Option<&DarkTrigger> {
        self.trigger.as_ref()
    }

    /// Whether a cancel is waiting for the broker's ack.
    #[must_use]
    pub const fn has_queued_cancel(&self) -> bool {
        self.queued_cancel.is_some()
    }

    /// Whether a modify is waiting for the broker's ack.
    #[must_use]
    pub const fn has_queued_modify(&self) -> bool {
        self.queued_modify.is_some()
    }

    // =========================================================================
    // State changes
    // =========================================================================

    /// Move to `to` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidTransition`] and leaves the state as is.
    pub fn transition(&mut self, to: DialogState) -> Result<(), RoutingError> {
        if !self.state.can_transition_to(to) {
            return Err(RoutingError::InvalidTransition {
                oid: self.order.oid.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Bind the broker's request id.
    ///
    /// Returns `false` when the same id was already bound.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Rebind`] if a different id is bound; the
    /// existing binding is kept.
    pub fn bind(&mut self, reqid: ReqId) -> Result<bool, RoutingError> {
        match &self.reqid {
            Some(bound) if *bound == reqid => Ok(false),
            Some(bound) => Err(RoutingError::Rebind {
                oid: self.order.oid.clone(),
                bound: bound.clone(),
                attempted: reqid,
            }),
            None => {
                self.reqid = Some(reqid);
                Ok(true)
            }
        }
    }

    /// Record the broker the order is routed to.
    pub fn route_to(&mut self, broker: impl Into<String>) {
        self.broker = Some(broker.into());
    }

    /// Remember `request` as the one statuses refer back to.
    pub fn record_request(&mut self, request: ClientRequest) {
        self.last_request = request;
    }

    /// Replace the working order. A dark order gets a fresh trigger.
    pub fn replace_order(&mut self, order: Order) {
        self.trigger = (order.exec_mode == ExecMode::Dark).then(|| DarkTrigger::new(order.price));
        self.order = order;
    }

    /// Hold a cancel until the ack arrives.
    pub fn queue_cancel(&mut self, cancel: Cancel) {
        self.queued_cancel = Some(cancel);
    }

    /// Hold a modify until the ack arrives. A later modify replaces it.
    pub fn queue_modify(&mut self, order: Order) {
        self.queued_modify = Some(order);
    }

    /// Take the held cancel.
    pub fn take_queued_cancel(&mut self) -> Option<Cancel> {
        self.queued_cancel.take()
    }

    /// Take the held modify.
    pub fn take_queued_modify(&mut self) -> Option<Order> {
        self.queued_modify.take()
    }

    /// Add one execution to the ledger.
    pub fn record_fill(&mut self, size: Decimal) {
        self.executed += size.abs();
        self.fill_count = self.fill_count.saturating_add(1);
    }

    /// Store the broker's view of execution progress.
    pub fn update_broker_amounts(&mut self, filled: Decimal, remaining: Decimal) {
        self.broker_filled = filled;
        self.broker_remaining = remaining;
    }

    /// Difference between executed and ordered size, if outside tolerance.
    #[must_use]
    pub fn fill_discrepancy(&self) -> Option<Decimal> {
        let diff = self.executed - self.order.size.abs();
        (diff.abs() > FILL_TOLERANCE).then_some(diff)
    }

    /// Evaluate the dark trigger against `price`.
    #[must_use]
    pub fn check_trigger(&mut self, price: Decimal) -> bool {
        self.trigger.as_mut().is_some_and(|trigger| trigger.check(price))
    }

    /// Clamp `now` so status times never go backwards.
    pub fn stamp(&mut self, now: i64) -> i64 {
        self.last_time_ns = self.last_time_ns.max(now);
        self.last_time_ns
    }

    // =========================================================================
    // Outbound messages
    // =========================================================================

    /// Status for the current state, or `None` while still `Created`.
    pub fn status(&mut self, now: i64) -> Option<Status> {
        let resp = self.state.resp()?;
        let time_ns = self.stamp(now);
        Some(
            Status::new(self.order.oid.clone(), time_ns, resp)
                .with_reqid(self.reqid.clone())
                .with_req(Some(self.last_request.clone())),
        )
    }

    /// Broker order for the working order; carries the reqid once bound.
    #[must_use]
    pub fn broker_order(&self, time_ns: i64) -> BrokerdOrder {
        BrokerdOrder {
            oid: self.order.oid.clone(),
            account: self.order.account.clone(),
            time_ns,
            action: self.order.action,
            reqid: self.reqid.clone(),
            symbol: self.order.symbol.clone(),
            price: self.order.price,
            size: self.order.size,
        }
    }

    /// Broker cancel for the bound order.
    #[must_use]
    pub fn broker_cancel(&self, time_ns: i64) -> BrokerdCancel {
        BrokerdCancel {
            oid: self.order.oid.clone(),
            account: self.order.account.clone(),
            time_ns,
            reqid: self.reqid.clone(),
        }
    }
}
