//! Routing Service
//!
//! [`EmsService`] is the one task that owns the [`RoutingEngine`]. Client
//! connections and broker relays never touch the engine; they post
//! [`EmsCommand`]s through an [`EmsHandle`] and the service applies them in
//! arrival order.
//!
//! # Delivery
//!
//! - statuses and positions: every connected client
//! - rejections of a client request: only the client that sent it
//! - broker requests: the broker's [`BrokerdPort`]; a missing or failing
//!   port ends an unacknowledged dialog in `error` and only reports the
//!   refusal for an acknowledged one

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::BrokerdPort;
use crate::application::routing::{Emit, NO_ROUTE, RoutingEngine};
use crate::domain::dialog::RoutingError;
use crate::domain::messages::{BrokerdEvent, BrokerdRequest, ClientEvent, ClientRequest};
use crate::observability::metrics::{
    record_broker_request, record_broker_request_failure, record_brokerd_event,
    record_rejected_request, record_status, record_unknown_brokerd_message, set_broker_up,
    set_connected_clients, set_open_dialogs,
};

// =============================================================================
// Commands
// =============================================================================

/// Identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Input to the routing service.
#[derive(Debug)]
pub enum EmsCommand {
    /// A client connected; its events go to `events`.
    ClientConnected {
        /// Connection id.
        client: ClientId,
        /// Outbound event queue.
        events: mpsc::UnboundedSender<ClientEvent>,
    },
    /// A client went away.
    ClientDisconnected {
        /// Connection id.
        client: ClientId,
    },
    /// A decoded client request.
    ClientRequest {
        /// Sender.
        client: ClientId,
        /// The request.
        request: ClientRequest,
    },
    /// A client frame that failed the schema but named an oid.
    RejectFrame {
        /// Sender.
        client: ClientId,
        /// Oid recovered from the frame.
        oid: String,
        /// Why the frame was refused.
        reason: String,
    },
    /// Last traded price for a symbol.
    Quote {
        /// Instrument.
        symbol: String,
        /// Price.
        price: Decimal,
    },
    /// Event from a broker adapter.
    BrokerdEvent {
        /// Adapter name.
        broker: String,
        /// The event.
        event: BrokerdEvent,
    },
    /// The adapter answered a request with an error.
    BrokerRequestFailed {
        /// Adapter name.
        broker: String,
        /// Dialog the request belonged to.
        oid: String,
        /// Error text from the adapter.
        reason: String,
    },
    /// The adapter's session is usable.
    BrokerUp {
        /// Adapter name.
        broker: String,
    },
    /// The adapter's session gave up reconnecting.
    BrokerLost {
        /// Adapter name.
        broker: String,
    },
}

/// The routing service stopped and no longer accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("routing service stopped")]
pub struct ServiceStopped;

/// Cloneable sender into the routing service.
#[derive(Debug, Clone)]
pub struct EmsHandle {
    inbox: mpsc::UnboundedSender<EmsCommand>,
}

impl EmsHandle {
    /// Post a command.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceStopped`] once the service has exited.
    pub fn send(&self, command: EmsCommand) -> Result<(), ServiceStopped> {
        self.inbox.send(command).map_err(|_| ServiceStopped)
    }

    /// Register a client and get its event queue.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceStopped`] once the service has exited.
    pub fn connect_client(
        &self,
        client: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>, ServiceStopped> {
        let (events, receiver) = mpsc::unbounded_channel();
        self.send(EmsCommand::ClientConnected { client, events })?;
        Ok(receiver)
    }

    /// Forget a client.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceStopped`] once the service has exited.
    pub fn disconnect_client(&self, client: ClientId) -> Result<(), ServiceStopped> {
        self.send(EmsCommand::ClientDisconnected { client })
    }

    /// Submit a client request.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceStopped`] once the service has exited.
    pub fn request(&self, client: ClientId, request: ClientRequest) -> Result<(), ServiceStopped> {
        self.send(EmsCommand::ClientRequest { client, request })
    }

    /// Publish a last price.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceStopped`] once the service has exited.
    pub fn quote(&self, symbol: impl Into<String>, price: Decimal) -> Result<(), ServiceStopped> {
        self.send(EmsCommand::Quote {
            symbol: symbol.into(),
            price,
        })
    }

    /// Deliver a broker event.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceStopped`] once the service has exited.
    pub fn brokerd_event(
        &self,
        broker: impl Into<String>,
        event: BrokerdEvent,
    ) -> Result<(), ServiceStopped> {
        self.send(EmsCommand::BrokerdEvent {
            broker: broker.into(),
            event,
        })
    }
}

// =============================================================================
// Service
// =============================================================================

/// Task owning the routing engine.
pub struct EmsService {
    engine: RoutingEngine,
    brokers: HashMap<String, Arc<dyn BrokerdPort>>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<ClientEvent>>,
    inbox: mpsc::UnboundedReceiver<EmsCommand>,
}

impl EmsService {
    /// Service over `engine` plus the handle that feeds it.
    #[must_use]
    pub fn new(engine: RoutingEngine) -> (Self, EmsHandle) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let service = Self {
            engine,
            brokers: HashMap::new(),
            clients: HashMap::new(),
            inbox,
        };
        (service, EmsHandle { inbox: inbox_tx })
    }

    /// Attach the port for `broker`.
    pub fn register_broker(&mut self, broker: impl Into<String>, port: Arc<dyn BrokerdPort>) {
        self.brokers.insert(broker.into(), port);
    }

    /// The engine, for inspection.
    #[must_use]
    pub const fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    /// Apply commands until `cancel` fires or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(brokers = self.brokers.len(), "Routing service started");
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!("Routing service cancelled");
                    break;
                }

                command = self.inbox.recv() => match command {
                    Some(command) => self.apply(command).await,
                    None => {
                        tracing::info!("All service handles dropped");
                        break;
                    }
                },
            }
        }
        tracing::info!(open_dialogs = self.engine.open_dialogs(), "Routing service stopped");
    }

    async fn apply(&mut self, command: EmsCommand) {
        match command {
            EmsCommand::ClientConnected { client, events } => {
                for position in self.engine.positions() {
                    let _ = events.send(ClientEvent::Position(position.clone()));
                }
                self.clients.insert(client, events);
                tracing::info!(client = %client, clients = self.clients.len(), "Client connected");
                set_connected_clients(self.clients.len());
            }
            EmsCommand::ClientDisconnected { client } => {
                if self.clients.remove(&client).is_some() {
                    tracing::info!(client = %client, "Client disconnected");
                }
                set_connected_clients(self.clients.len());
            }
            EmsCommand::ClientRequest { client, request } => {
                self.on_client_request(client, request).await;
            }
            EmsCommand::RejectFrame { client, oid, reason } => {
                record_rejected_request("schema");
                let status = self.engine.rejection_for(oid, reason);
                self.send_to(client, ClientEvent::Status(status));
            }
            EmsCommand::Quote { symbol, price } => {
                let emits = self.engine.on_quote(&symbol, price);
                self.dispatch(emits).await;
            }
            EmsCommand::BrokerdEvent { broker, event } => {
                record_brokerd_event(&broker, event.kind());
                match self.engine.handle_brokerd_event(&broker, event) {
                    Ok(emits) => self.dispatch(emits).await,
                    Err(err) => {
                        tracing::warn!(broker = %broker, error = %err, "Dropping brokerd event");
                        record_unknown_brokerd_message(&broker, err.kind());
                    }
                }
            }
            EmsCommand::BrokerRequestFailed {
                broker,
                oid,
                reason,
            } => {
                record_broker_request_failure(&broker);
                let emits = self.refused(&oid, reason);
                self.dispatch(emits).await;
            }
            EmsCommand::BrokerUp { broker } => {
                if self.engine.on_broker_up(&broker) {
                    tracing::info!(broker = %broker, "Broker routable again");
                }
                set_broker_up(&broker, true);
            }
            EmsCommand::BrokerLost { broker } => {
                set_broker_up(&broker, false);
                let emits = self.engine.on_broker_lost(&broker);
                self.dispatch(emits).await;
            }
        }
        set_open_dialogs(self.engine.open_dialogs());
    }

    async fn on_client_request(&mut self, client: ClientId, request: ClientRequest) {
        tracing::debug!(client = %client, oid = %request.oid(), "Client request");
        match self.engine.handle_request(request.clone()) {
            Ok(emits) => self.dispatch(emits).await,
            Err(err) => {
                tracing::info!(client = %client, oid = %request.oid(), error = %err, "Request rejected");
                record_rejected_request(err.kind());
                let status = self.engine.rejection(request, &err);
                record_status(status.resp.as_str());
                self.send_to(client, ClientEvent::Status(status));
            }
        }
    }

    /// Deliver emits. Failures of broker requests append their own emits.
    async fn dispatch(&mut self, emits: Vec<Emit>) {
        let mut queue = VecDeque::from(emits);
        while let Some(emit) = queue.pop_front() {
            match emit {
                Emit::Status(status) => {
                    record_status(status.resp.as_str());
                    self.broadcast(&ClientEvent::Status(status));
                }
                Emit::Position(position) => self.broadcast(&ClientEvent::Position(position)),
                Emit::Broker { broker, request } => {
                    if let Some((oid, reason)) = self.submit(&broker, request).await {
                        queue.extend(self.refused(&oid, reason));
                    }
                }
            }
        }
    }

    /// Hand `request` to its port. Returns the oid and reason on failure.
    async fn submit(&self, broker: &str, request: BrokerdRequest) -> Option<(String, String)> {
        let oid = request.oid().to_string();
        let Some(port) = self.brokers.get(broker) else {
            tracing::warn!(broker = %broker, oid = %oid, "No port for broker");
            return Some((oid, NO_ROUTE.to_string()));
        };

        record_broker_request(broker, request.method());
        match port.submit(request).await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(broker = %broker, oid = %oid, error = %err, "Broker request not accepted");
                record_broker_request_failure(broker);
                Some((oid, err.to_string()))
            }
        }
    }

    fn refused(&mut self, oid: &str, reason: String) -> Vec<Emit> {
        match self.engine.on_request_refused(oid, reason) {
            Ok(emits) => emits,
            Err(RoutingError::UnknownDialog { .. }) => {
                tracing::debug!(oid = %oid, "Refusal for finished dialog ignored");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(oid = %oid, error = %err, "Could not report refusal");
                Vec::new()
            }
        }
    }

    fn send_to(&mut self, client: ClientId, event: ClientEvent) {
        let delivered = self
            .clients
            .get(&client)
            .is_some_and(|events| events.send(event).is_ok());
        if !delivered && self.clients.remove(&client).is_some() {
            set_connected_clients(self.clients.len());
        }
    }

    fn broadcast(&mut self, event: &ClientEvent) {
        let before = self.clients.len();
        self.clients.retain(|client, events| {
            let alive = events.send(event.clone()).is_ok();
            if !alive {
                tracing::debug!(client = %client, "Dropping closed client queue");
            }
            alive
        });
        if self.clients.len() != before {
            set_connected_clients(self.clients.len());
        }
    }
}

impl fmt::Debug for EmsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmsService")
            .field("engine", &self.engine)
            .field("brokers", &self.brokers.keys().collect::<Vec<_>>())
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}
