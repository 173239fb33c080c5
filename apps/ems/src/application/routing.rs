//! Order Routing State Machine
//!
//! [`RoutingEngine`] owns every open dialog. Each operation validates its
//! input, updates at most the dialogs it names and returns the messages to
//! emit: statuses and positions for clients, requests for brokers. The
//! engine does no I/O; the routing service delivers what it returns.
//!
//! # Dialog lookup
//!
//! Client requests and acks address dialogs by `oid`. Broker statuses and
//! fills address them by `(broker, reqid)`, indexed once the ack binds the
//! reqid. Terminal dialogs leave both tables, so later broker messages for
//! them are reported as unknown.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::application::ports::Clock;
use crate::domain::dialog::{Dialog, DialogState, RoutingError};
use crate::domain::messages::{
    Action, BrokerdError, BrokerdEvent, BrokerdFill, BrokerdOrderAck, BrokerdPosition,
    BrokerdRequest, BrokerdStatus, BrokerdStatusKind, Cancel, ClientRequest, ExecMode, Order,
    ReqId, Resp, Status, Validate,
};
use crate::observability::metrics::record_dialog_opened;

/// Reason given when no broker can take an order.
pub const NO_ROUTE: &str = "no route to broker";

/// Reason given when a broker session is lost for good.
pub const CONNECTION_LOST: &str = "connection lost";

const BROKER_ERROR: &str = "broker error";

/// Something the engine wants delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Emit {
    /// Dialog update for clients.
    Status(Status),
    /// Position snapshot for clients.
    Position(BrokerdPosition),
    /// Request for a broker adapter.
    Broker {
        /// Target broker.
        broker: String,
        /// Request to deliver.
        request: BrokerdRequest,
    },
}

/// Which brokers exist and which one an order goes to.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    brokers: BTreeSet<String>,
    accounts: HashMap<String, String>,
    default_broker: Option<String>,
}

impl Routes {
    /// Routes over the given broker names.
    #[must_use]
    pub fn new<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            accounts: HashMap::new(),
            default_broker: None,
        }
    }

    /// Route orders for `account` to `broker`.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>, broker: impl Into<String>) -> Self {
        self.accounts.insert(account.into(), broker.into());
        self
    }

    /// Broker for orders nothing else routes.
    #[must_use]
    pub fn with_default(mut self, broker: impl Into<String>) -> Self {
        self.default_broker = Some(broker.into());
        self
    }

    /// Configured broker names.
    pub fn brokers(&self) -> impl Iterator<Item = &str> {
        self.brokers.iter().map(String::as_str)
    }
}

/// The dialog table and the rules that drive it.
pub struct RoutingEngine {
    clock: Arc<dyn Clock>,
    routes: Routes,
    down: HashSet<String>,
    dialogs: HashMap<String, Dialog>,
    by_reqid: HashMap<(String, ReqId), String>,
    last_prices: HashMap<String, Decimal>,
    positions: HashMap<(String, String, String), BrokerdPosition>,
}

impl RoutingEngine {
    /// Empty engine.
    #[must_use]
    pub fn new(routes: Routes, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            routes,
            down: HashSet::new(),
            dialogs: HashMap::new(),
            by_reqid: HashMap::new(),
            last_prices: HashMap::new(),
            positions: HashMap::new(),
        }
    }

    /// Open dialog by oid.
    #[must_use]
    pub fn dialog(&self, oid: &str) -> Option<&Dialog> {
        self.dialogs.get(oid)
    }

    /// Number of open dialogs.
    #[must_use]
    pub fn open_dialogs(&self) -> usize {
        self.dialogs.len()
    }

    /// Latest position per (broker, account, symbol).
    pub fn positions(&self) -> impl Iterator<Item = &BrokerdPosition> {
        self.positions.values()
    }

    /// Whether `broker` is configured and its session is up.
    #[must_use]
    pub fn is_routable(&self, broker: &str) -> bool {
        self.routes.brokers.contains(broker) && !self.down.contains(broker)
    }

    // =========================================================================
    // Client requests
    // =========================================================================

    /// Apply a client request.
    ///
    /// # Errors
    ///
    /// See [`RoutingEngine::submit`] and [`RoutingEngine::cancel`].
    pub fn handle_request(&mut self, request: ClientRequest) -> Result<Vec<Emit>, RoutingError> {
        match request {
            ClientRequest::Order(order) => self.submit(order),
            ClientRequest::Cancel(cancel) => self.cancel(cancel),
        }
    }

    /// Open a dialog for `order`, or modify the open dialog with its oid.
    ///
    /// Live orders are forwarded to the resolved broker and go `pending`;
    /// dark orders go `dark_open` and wait for their trigger. An order no
    /// broker can take ends in `error` with reason [`NO_ROUTE`].
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Schema`] for an invalid order and
    /// [`RoutingError::ExecModeChange`] for a live dialog modified to dark.
    pub fn submit(&mut self, order: Order) -> Result<Vec<Emit>, RoutingError> {
        order.validate()?;
        if self.dialogs.contains_key(&order.oid) {
            return self.modify(order);
        }

        let now = self.clock.now_ns();
        let oid = order.oid.clone();
        let exec_mode = order.exec_mode;
        let dialog = Dialog::open(order)?;
        self.dialogs.insert(oid.clone(), dialog);
        record_dialog_opened(exec_mode.as_str());
        tracing::debug!(oid = %oid, exec_mode = %exec_mode, "Dialog opened");

        let mut emits = Vec::new();
        match exec_mode {
            ExecMode::Live => self.forward(&oid, now, Some(DialogState::Pending), &mut emits)?,
            ExecMode::Dark => {
                self.set_state(&oid, DialogState::DarkOpen, now, &mut emits)?;
                if self.trigger_fires_at_last(&oid) {
                    self.promote(&oid, now, &mut emits)?;
                }
            }
        }
        Ok(emits)
    }

    fn modify(&mut self, order: Order) -> Result<Vec<Emit>, RoutingError> {
        let now = self.clock.now_ns();
        let oid = order.oid.clone();
        let dialog = self.dialog_mut(&oid)?;
        let dark = dialog.state().is_dark();
        if !dark && order.exec_mode == ExecMode::Dark {
            return Err(RoutingError::ExecModeChange { oid });
        }
        dialog.record_request(ClientRequest::Order(order.clone()));

        let mut emits = Vec::new();
        match (dark, order.exec_mode) {
            (true, ExecMode::Dark) => {
                dialog.replace_order(order);
                self.set_state(&oid, DialogState::DarkOpen, now, &mut emits)?;
                if self.trigger_fires_at_last(&oid) {
                    self.promote(&oid, now, &mut emits)?;
                }
            }
            (true, ExecMode::Live) => {
                dialog.replace_order(order);
                self.promote(&oid, now, &mut emits)?;
            }
            (false, _) => match (dialog.reqid().is_some(), dialog.broker().map(str::to_string)) {
                (true, Some(broker)) => {
                    dialog.replace_order(order);
                    emits.push(Emit::Broker {
                        broker,
                        request: BrokerdRequest::Order(dialog.broker_order(now)),
                    });
                }
                _ => {
                    tracing::debug!(oid = %oid, "Modify held until broker ack");
                    dialog.queue_modify(order);
                }
            },
        }
        Ok(emits)
    }

    /// Cancel the dialog `cancel.oid`.
    ///
    /// Dark dialogs are canceled locally. Acknowledged live dialogs get a
    /// broker cancel; unacknowledged ones hold the cancel until the ack.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownDialog`] if no dialog is open for the oid.
    pub fn cancel(&mut self, cancel: Cancel) -> Result<Vec<Emit>, RoutingError> {
        cancel.validate()?;
        let now = self.clock.now_ns();
        let oid = cancel.oid.clone();
        let dialog = self.dialog_mut(&oid)?;
        dialog.record_request(ClientRequest::Cancel(cancel.clone()));

        let mut emits = Vec::new();
        if dialog.state().is_dark() || dialog.broker().is_none() {
            self.terminate(&oid, DialogState::Canceled, now, None, None, &mut emits)?;
            return Ok(emits);
        }

        match (dialog.reqid().is_some(), dialog.broker().map(str::to_string)) {
            (true, Some(broker)) => emits.push(Emit::Broker {
                broker,
                request: BrokerdRequest::Cancel(dialog.broker_cancel(now)),
            }),
            _ => {
                tracing::debug!(oid = %oid, "Cancel held until broker ack");
                dialog.queue_cancel(cancel);
            }
        }
        Ok(emits)
    }

    /// Status answering a refused client request.
    ///
    /// See [`RoutingEngine::rejection_for`].
    pub fn rejection(&mut self, request: ClientRequest, error: &RoutingError) -> Status {
        self.rejection_for(request.oid().to_string(), error.to_string())
            .with_req(Some(request))
    }

    /// Status answering a refused or undecodable request for `oid`.
    ///
    /// A refusal never changes a dialog. When one is open for the oid the
    /// status repeats its current `resp` with the reason attached; `error`
    /// is only sent for an oid with no open dialog.
    pub fn rejection_for(&mut self, oid: String, reason: String) -> Status {
        let now = self.clock.now_ns();
        match self.dialogs.get_mut(&oid).and_then(|dialog| dialog.status(now)) {
            Some(status) => status.with_reason(reason),
            None => Status::new(oid, now, Resp::Error).with_reason(reason),
        }
    }

    // =========================================================================
    // Broker events
    // =========================================================================

    /// Apply an event from `broker`.
    ///
    /// # Errors
    ///
    /// See the per-event handlers.
    pub fn handle_brokerd_event(
        &mut self,
        broker: &str,
        event: BrokerdEvent,
    ) -> Result<Vec<Emit>, RoutingError> {
        match event {
            BrokerdEvent::Ack(ack) => self.on_brokerd_ack(broker, ack),
            BrokerdEvent::Status(status) => self.on_brokerd_status(broker, status),
            BrokerdEvent::Fill(fill) => self.on_brokerd_fill(broker, fill),
            BrokerdEvent::Error(error) => self.on_brokerd_error(broker, error),
            BrokerdEvent::Position(position) => self.on_brokerd_position(position),
        }
    }

    /// Bind the broker's reqid, report `open` and flush held requests.
    ///
    /// A repeated ack with the same reqid changes nothing. A held cancel
    /// wins over a held modify.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownDialog`] for an unknown oid,
    /// [`RoutingError::ForeignBroker`] if the dialog was routed elsewhere and
    /// [`RoutingError::Rebind`] if the dialog is bound to another reqid.
    pub fn on_brokerd_ack(
        &mut self,
        broker: &str,
        ack: BrokerdOrderAck,
    ) -> Result<Vec<Emit>, RoutingError> {
        ack.validate()?;
        let now = self.clock.now_ns();
        let brokerd_msg = serde_json::to_value(&ack).ok();
        let oid = ack.oid;
        let dialog = self
            .dialogs
            .get_mut(&oid)
            .ok_or_else(|| RoutingError::UnknownDialog { oid: oid.clone() })?;

        if !dialog.state().can_transition_to(DialogState::Open) {
            return Err(RoutingError::InvalidTransition {
                oid,
                from: dialog.state(),
                to: DialogState::Open,
            });
        }
        if dialog.broker() != Some(broker) {
            return Err(RoutingError::ForeignBroker {
                oid,
                broker: broker.to_string(),
            });
        }
        if !dialog.bind(ack.reqid.clone())? {
            return Ok(Vec::new());
        }
        let routed = broker.to_string();
        self.by_reqid.insert((routed.clone(), ack.reqid.clone()), oid.clone());
        tracing::info!(oid = %oid, broker = %routed, reqid = %ack.reqid, "Dialog bound");

        dialog.transition(DialogState::Open)?;
        let mut emits = Vec::new();
        if let Some(status) = dialog.status(now) {
            emits.push(Emit::Status(status.with_brokerd_msg(brokerd_msg)));
        }

        if dialog.take_queued_cancel().is_some() {
            dialog.take_queued_modify();
            emits.push(Emit::Broker {
                broker: routed,
                request: BrokerdRequest::Cancel(dialog.broker_cancel(now)),
            });
        } else if let Some(order) = dialog.take_queued_modify() {
            dialog.replace_order(order);
            emits.push(Emit::Broker {
                broker: routed,
                request: BrokerdRequest::Order(dialog.broker_order(now)),
            });
        }
        Ok(emits)
    }

    /// Translate a broker status into the dialog's next state.
    ///
    /// A `fill` with nothing remaining closes the dialog.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownReqid`] for an unbound reqid and
    /// [`RoutingError::InvalidTransition`] if the state machine refuses.
    pub fn on_brokerd_status(
        &mut self,
        broker: &str,
        msg: BrokerdStatus,
    ) -> Result<Vec<Emit>, RoutingError> {
        msg.validate()?;
        let now = self.clock.now_ns();
        let oid = self.lookup(broker, &msg.reqid)?;
        let target = match msg.status {
            BrokerdStatusKind::Pending => DialogState::Pending,
            BrokerdStatusKind::Open => DialogState::Open,
            BrokerdStatusKind::Fill if msg.remaining > Decimal::ZERO => DialogState::Fill,
            BrokerdStatusKind::Fill => DialogState::Closed,
            BrokerdStatusKind::Canceled => DialogState::Canceled,
            BrokerdStatusKind::Error => DialogState::Error,
        };

        let dialog = self.dialog_mut(&oid)?;
        if !dialog.state().can_transition_to(target) {
            return Err(RoutingError::InvalidTransition {
                oid,
                from: dialog.state(),
                to: target,
            });
        }
        dialog.update_broker_amounts(msg.filled, msg.remaining);
        if target == DialogState::Closed
            && let Some(diff) = dialog.fill_discrepancy()
        {
            tracing::warn!(
                oid = %oid,
                executed = %dialog.executed(),
                ordered = %dialog.order().size,
                diff = %diff,
                "Closed dialog fills do not add up to the order size"
            );
        }

        let reason = match msg.status {
            BrokerdStatusKind::Error if msg.reason.is_empty() => Some(BROKER_ERROR.to_string()),
            _ if msg.reason.is_empty() => None,
            _ => Some(msg.reason.clone()),
        };
        let brokerd_msg = serde_json::to_value(&msg).ok();

        let mut emits = Vec::new();
        if target.is_terminal() {
            self.terminate(&oid, target, now, reason, brokerd_msg, &mut emits)?;
        } else {
            let dialog = self.dialog_mut(&oid)?;
            dialog.transition(target)?;
            if let Some(status) = dialog.status(now) {
                emits.push(Emit::Status(status.with_brokerd_msg(brokerd_msg)));
            }
        }
        Ok(emits)
    }

    /// Record an execution and report `fill`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownReqid`] for an unbound reqid.
    pub fn on_brokerd_fill(
        &mut self,
        broker: &str,
        fill: BrokerdFill,
    ) -> Result<Vec<Emit>, RoutingError> {
        fill.validate()?;
        let now = self.clock.now_ns();
        let oid = self.lookup(broker, &fill.reqid)?;
        let brokerd_msg = serde_json::to_value(&fill).ok();

        let dialog = self.dialog_mut(&oid)?;
        dialog.transition(DialogState::Fill)?;
        dialog.record_fill(fill.size);
        tracing::debug!(oid = %oid, size = %fill.size, price = %fill.price, "Fill recorded");

        Ok(dialog
            .status(now)
            .map(|status| Emit::Status(status.with_brokerd_msg(brokerd_msg)))
            .into_iter()
            .collect())
    }

    /// End the dialog in `error`.
    ///
    /// The dialog is found by oid, or by reqid when the oid does not name a
    /// dialog routed to `broker`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ForeignBroker`] if the oid names a dialog of
    /// another broker and [`RoutingError::UnknownDialog`] if nothing matches.
    pub fn on_brokerd_error(
        &mut self,
        broker: &str,
        error: BrokerdError,
    ) -> Result<Vec<Emit>, RoutingError> {
        error.validate()?;
        let now = self.clock.now_ns();
        let owned = self
            .dialogs
            .get(&error.oid)
            .is_some_and(|dialog| dialog.broker() == Some(broker));
        let by_reqid = error
            .reqid
            .as_ref()
            .and_then(|reqid| self.lookup(broker, reqid).ok());
        let oid = match (owned, by_reqid) {
            (true, _) => error.oid.clone(),
            (false, Some(oid)) => oid,
            (false, None) if self.dialogs.contains_key(&error.oid) => {
                return Err(RoutingError::ForeignBroker {
                    oid: error.oid,
                    broker: broker.to_string(),
                });
            }
            (false, None) => return Err(RoutingError::UnknownDialog { oid: error.oid }),
        };

        let reason = if error.reason.is_empty() {
            BROKER_ERROR.to_string()
        } else {
            error.reason.clone()
        };
        let brokerd_msg = serde_json::to_value(&error).ok();
        let mut emits = Vec::new();
        self.terminate(&oid, DialogState::Error, now, Some(reason), brokerd_msg, &mut emits)?;
        Ok(emits)
    }

    /// Store and relay a position snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Schema`] for an invalid snapshot.
    pub fn on_brokerd_position(
        &mut self,
        position: BrokerdPosition,
    ) -> Result<Vec<Emit>, RoutingError> {
        position.validate()?;
        let key = (
            position.broker.clone(),
            position.account.clone(),
            position.symbol.clone(),
        );
        self.positions.insert(key, position.clone());
        Ok(vec![Emit::Position(position)])
    }

    /// Report that a broker request for `oid` was refused or not delivered.
    ///
    /// A dialog without a bound reqid lost its only submission and ends in
    /// `error`. A bound dialog is still working at the broker: the refused
    /// cancel or modify is reported under the dialog's current `resp` and
    /// the dialog stays open.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownDialog`] if the dialog is already gone.
    pub fn on_request_refused(
        &mut self,
        oid: &str,
        reason: impl Into<String>,
    ) -> Result<Vec<Emit>, RoutingError> {
        let now = self.clock.now_ns();
        let reason = reason.into();
        let dialog = self.dialog_mut(oid)?;
        if dialog.reqid().is_some() {
            tracing::info!(oid = %oid, reason = %reason, "Broker refused request for working dialog");
            return Ok(dialog
                .status(now)
                .map(|status| Emit::Status(status.with_reason(reason)))
                .into_iter()
                .collect());
        }

        let mut emits = Vec::new();
        self.terminate(oid, DialogState::Error, now, Some(reason), None, &mut emits)?;
        Ok(emits)
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Record the last price for `symbol` and promote every dark dialog
    /// whose trigger it crosses.
    pub fn on_quote(&mut self, symbol: &str, price: Decimal) -> Vec<Emit> {
        let now = self.clock.now_ns();
        self.last_prices.insert(symbol.to_string(), price);

        let mut fired: Vec<String> = self
            .dialogs
            .values_mut()
            .filter(|d| d.state().is_dark() && d.order().symbol == symbol)
            .filter_map(|d| d.check_trigger(price).then(|| d.oid().to_string()))
            .collect();
        fired.sort();

        let mut emits = Vec::new();
        for oid in fired {
            if let Err(err) = self.promote(&oid, now, &mut emits) {
                tracing::warn!(oid = %oid, error = %err, "Failed to promote triggered dialog");
            }
        }
        emits
    }

    /// Promote a dark dialog as if its trigger had fired.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownDialog`] or, for a dialog that is not
    /// dark, [`RoutingError::InvalidTransition`].
    pub fn trigger(&mut self, oid: &str) -> Result<Vec<Emit>, RoutingError> {
        let now = self.clock.now_ns();
        let mut emits = Vec::new();
        self.promote(oid, now, &mut emits)?;
        Ok(emits)
    }

    fn trigger_fires_at_last(&mut self, oid: &str) -> bool {
        let Some(dialog) = self.dialogs.get_mut(oid) else {
            return false;
        };
        self.last_prices
            .get(&dialog.order().symbol)
            .copied()
            .is_some_and(|last| dialog.check_trigger(last))
    }

    fn promote(&mut self, oid: &str, now: i64, emits: &mut Vec<Emit>) -> Result<(), RoutingError> {
        self.set_state(oid, DialogState::Triggered, now, emits)?;
        tracing::info!(oid = %oid, "Dark dialog triggered");
        if self.dialog_mut(oid)?.order().action == Action::Alert {
            return self.terminate(oid, DialogState::Closed, now, None, None, emits);
        }
        self.forward(oid, now, None, emits)
    }

    // =========================================================================
    // Broker sessions
    // =========================================================================

    /// Fail every routed dialog of `broker` with [`CONNECTION_LOST`] and stop
    /// routing to it.
    pub fn on_broker_lost(&mut self, broker: &str) -> Vec<Emit> {
        let now = self.clock.now_ns();
        self.down.insert(broker.to_string());

        let mut lost: Vec<String> = self
            .dialogs
            .values()
            .filter(|d| d.broker() == Some(broker) && !d.state().is_dark())
            .map(|d| d.oid().to_string())
            .collect();
        lost.sort();
        tracing::warn!(broker = %broker, dialogs = lost.len(), "Broker session lost");

        let mut emits = Vec::new();
        for oid in lost {
            let reason = Some(CONNECTION_LOST.to_string());
            if let Err(err) = self.terminate(&oid, DialogState::Error, now, reason, None, &mut emits) {
                tracing::warn!(oid = %oid, error = %err, "Failed to fail dialog");
            }
        }
        emits
    }

    /// Route to `broker` again. Returns whether it was down.
    pub fn on_broker_up(&mut self, broker: &str) -> bool {
        self.down.remove(broker)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn dialog_mut(&mut self, oid: &str) -> Result<&mut Dialog, RoutingError> {
        self.dialogs
            .get_mut(oid)
            .ok_or_else(|| RoutingError::UnknownDialog {
                oid: oid.to_string(),
            })
    }

    fn lookup(&self, broker: &str, reqid: &ReqId) -> Result<String, RoutingError> {
        self.by_reqid
            .get(&(broker.to_string(), reqid.clone()))
            .cloned()
            .ok_or_else(|| RoutingError::UnknownReqid {
                broker: broker.to_string(),
                reqid: reqid.clone(),
            })
    }

    fn resolve_broker(&self, order: &Order) -> Option<String> {
        order
            .brokers
            .iter()
            .chain(self.routes.accounts.get(&order.account))
            .chain(self.routes.default_broker.as_ref())
            .find(|broker| self.is_routable(broker))
            .cloned()
    }

    fn set_state(
        &mut self,
        oid: &str,
        state: DialogState,
        now: i64,
        emits: &mut Vec<Emit>,
    ) -> Result<(), RoutingError> {
        let dialog = self.dialog_mut(oid)?;
        dialog.transition(state)?;
        if let Some(status) = dialog.status(now) {
            emits.push(Emit::Status(status));
        }
        Ok(())
    }

    /// Send the working order to its broker, moving to `state` if given.
    fn forward(
        &mut self,
        oid: &str,
        now: i64,
        state: Option<DialogState>,
        emits: &mut Vec<Emit>,
    ) -> Result<(), RoutingError> {
        let order = self
            .dialogs
            .get(oid)
            .map(Dialog::order)
            .ok_or_else(|| RoutingError::UnknownDialog {
                oid: oid.to_string(),
            })?;
        let Some(broker) = self.resolve_broker(order) else {
            tracing::warn!(oid = %oid, "No routable broker for order");
            return self.terminate(
                oid,
                DialogState::Error,
                now,
                Some(NO_ROUTE.to_string()),
                None,
                emits,
            );
        };

        let dialog = self.dialog_mut(oid)?;
        if let Some(state) = state {
            dialog.transition(state)?;
        }
        dialog.route_to(broker.clone());
        tracing::info!(oid = %oid, broker = %broker, "Order routed");
        emits.push(Emit::Broker {
            broker,
            request: BrokerdRequest::Order(dialog.broker_order(now)),
        });
        if state.is_some()
            && let Some(status) = dialog.status(now)
        {
            emits.push(Emit::Status(status));
        }
        Ok(())
    }

    /// Move to a terminal state, report it and drop the dialog.
    fn terminate(
        &mut self,
        oid: &str,
        state: DialogState,
        now: i64,
        reason: Option<String>,
        brokerd_msg: Option<Value>,
        emits: &mut Vec<Emit>,
    ) -> Result<(), RoutingError> {
        let dialog = self.dialog_mut(oid)?;
        dialog.transition(state)?;
        if let Some(mut status) = dialog.status(now) {
            status.reason = reason;
            emits.push(Emit::Status(status.with_brokerd_msg(brokerd_msg)));
        }

        if let Some(dialog) = self.dialogs.remove(oid)
            && let (Some(broker), Some(reqid)) = (dialog.broker(), dialog.reqid())
        {
            self.by_reqid.remove(&(broker.to_string(), reqid.clone()));
        }
        tracing::debug!(oid = %oid, state = %state, "Dialog finished");
        Ok(())
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("routes", &self.routes)
            .field("down", &self.down)
            .field("dialogs", &self.dialogs.len())
            .finish_non_exhaustive()
    }
}
