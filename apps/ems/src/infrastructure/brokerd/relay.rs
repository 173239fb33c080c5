//! Brokerd Relay
//!
//! Carries one broker adapter's traffic over a JSON-RPC session.
//!
//! - requests: the service submits through [`BrokerdPort`]; the relay task
//!   writes them as `order` / `cancel` calls in submission order and awaits
//!   each response on its own task
//! - events: `brokerd_event` notifications are decoded and posted to the
//!   routing service
//! - failures: an error response is reported against that request's
//!   dialog; an exhausted session reports the broker lost
//!
//! After a loss the relay waits `restart_delay` and opens a fresh session,
//! reporting the broker up again once it connects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duplex_transport::{ChannelConfig, Connector, RpcConfig, RpcError, RpcNotification, RpcSession};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::routing::CONNECTION_LOST;
use crate::application::{BrokerdPort, BrokerdPortError, EmsCommand, EmsHandle, ServiceStopped};
use crate::domain::messages::{BrokerdEvent, BrokerdRequest, schema};
use crate::infrastructure::brokerd::hook::OpenTradeDialogHook;
use crate::observability::metrics::record_unknown_brokerd_message;

/// Notification carrying a [`BrokerdEvent`].
pub const BROKERD_EVENT: &str = "brokerd_event";

/// Relay parameters for one adapter.
#[derive(Debug, Clone)]
pub struct BrokerdRelayConfig {
    /// Broker name.
    pub broker: String,
    /// Channel to the adapter.
    pub channel: ChannelConfig,
    /// Session parameters.
    pub rpc: RpcConfig,
    /// Name announced in `open_trade_dialog`.
    pub client_name: String,
    /// Accounts announced in `open_trade_dialog`.
    pub accounts: Vec<String>,
    /// Pause between a lost session and the next one.
    pub restart_delay: Duration,
}

/// [`BrokerdPort`] backed by a relay task.
#[derive(Debug, Clone)]
pub struct BrokerdRelay {
    broker: String,
    requests: mpsc::UnboundedSender<BrokerdRequest>,
}

impl BrokerdRelay {
    /// Start the relay task.
    ///
    /// The task stops when `cancel` fires, the routing service stops or
    /// every relay handle is dropped.
    #[must_use]
    pub fn spawn(
        config: BrokerdRelayConfig,
        connector: Arc<dyn Connector>,
        service: EmsHandle,
        cancel: &CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let relay = Self {
            broker: config.broker.clone(),
            requests: requests_tx,
        };
        let task = RelayTask {
            config,
            connector,
            service,
            requests,
            cancel: cancel.child_token(),
        };
        (relay, tokio::spawn(task.run()))
    }

    /// Broker this relay serves.
    #[must_use]
    pub fn broker(&self) -> &str {
        &self.broker
    }
}

#[async_trait]
impl BrokerdPort for BrokerdRelay {
    async fn submit(&self, request: BrokerdRequest) -> Result<(), BrokerdPortError> {
        self.requests
            .send(request)
            .map_err(|_| BrokerdPortError::Unavailable(self.broker.clone()))
    }
}

// =============================================================================
// Relay Task
// =============================================================================

enum SessionEnd {
    Stopped,
    Lost(RpcError),
}

struct RelayTask {
    config: BrokerdRelayConfig,
    connector: Arc<dyn Connector>,
    service: EmsHandle,
    requests: mpsc::UnboundedReceiver<BrokerdRequest>,
    cancel: CancellationToken,
}

impl RelayTask {
    async fn run(mut self) {
        let broker = self.config.broker.clone();
        loop {
            let end = match self.connect().await {
                Ok(session) => {
                    tracing::info!(broker = %broker, url = %self.config.channel.url, "Brokerd session open");
                    if self.post(EmsCommand::BrokerUp { broker: broker.clone() }).is_err() {
                        break;
                    }
                    let end = self.pump(&session).await;
                    session.close();
                    end
                }
                Err(RpcError::Cancelled) => SessionEnd::Stopped,
                Err(err) => SessionEnd::Lost(err),
            };

            let SessionEnd::Lost(err) = end else {
                break;
            };
            tracing::error!(broker = %broker, error = %err, "Brokerd session lost");
            if self.post(EmsCommand::BrokerLost { broker: broker.clone() }).is_err() {
                break;
            }
            if !self.wait_for_restart().await {
                break;
            }
        }
        tracing::info!(broker = %broker, "Brokerd relay stopped");
    }

    async fn connect(&self) -> Result<RpcSession, RpcError> {
        let hook = OpenTradeDialogHook::new(self.config.client_name.clone(), self.config.accounts.clone());
        RpcSession::connect(
            self.config.channel.clone(),
            self.config.rpc,
            Arc::clone(&self.connector),
            Some(Arc::new(hook)),
            &self.cancel,
        )
        .await
    }

    async fn pump(&mut self, session: &RpcSession) -> SessionEnd {
        let Some(mut notifications) = session.notifications() else {
            return SessionEnd::Lost(RpcError::Cancelled);
        };

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return SessionEnd::Stopped,

                notification = notifications.recv() => match notification {
                    Some(notification) => {
                        if self.on_notification(notification).is_err() {
                            return SessionEnd::Stopped;
                        }
                    }
                    None => {
                        return match session.closed_reason() {
                            Some(RpcError::Cancelled) | None => SessionEnd::Stopped,
                            Some(err) => SessionEnd::Lost(err),
                        };
                    }
                },

                request = self.requests.recv() => match request {
                    Some(request) => {
                        if let Err(err) = self.forward(session, request).await {
                            return SessionEnd::Lost(err);
                        }
                    }
                    None => return SessionEnd::Stopped,
                },
            }
        }
    }

    /// Write one request and watch its response on a separate task.
    async fn forward(&self, session: &RpcSession, request: BrokerdRequest) -> Result<(), RpcError> {
        let broker = self.config.broker.clone();
        let oid = request.oid().to_string();
        let method = request.method();

        let call = match session.request(method, &request).await {
            Ok(call) => call,
            Err(err @ RpcError::TransportExhausted(_)) => {
                self.post_failure(oid, CONNECTION_LOST.to_string());
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(broker = %broker, oid = %oid, error = %err, "Brokerd request not written");
                self.post_failure(oid, err.to_string());
                return Ok(());
            }
        };
        tracing::debug!(broker = %broker, oid = %oid, method, id = call.id(), "Brokerd request sent");

        let service = self.service.clone();
        tokio::spawn(async move {
            match call.response().await {
                Ok(_) => tracing::trace!(broker = %broker, oid = %oid, "Brokerd request accepted"),
                Err(RpcError::Remote(remote)) => {
                    tracing::warn!(broker = %broker, oid = %oid, error = %remote, "Brokerd refused request");
                    let refused = EmsCommand::BrokerRequestFailed {
                        broker: broker.clone(),
                        oid,
                        reason: remote.message,
                    };
                    if service.send(refused).is_err() {
                        tracing::debug!(broker = %broker, "Routing service gone, refusal dropped");
                    }
                }
                // Session loss is reported once by the relay task
                Err(err) => tracing::debug!(broker = %broker, oid = %oid, error = %err, "No response"),
            }
        });
        Ok(())
    }

    fn on_notification(&self, notification: RpcNotification) -> Result<(), ServiceStopped> {
        let broker = &self.config.broker;
        if notification.method != BROKERD_EVENT {
            tracing::debug!(broker = %broker, method = %notification.method, "Ignoring notification");
            return Ok(());
        }
        match schema::from_value::<BrokerdEvent>(notification.params) {
            Ok(event) => self.service.brokerd_event(broker.clone(), event),
            Err(err) => {
                tracing::warn!(broker = %broker, error = %err, "Malformed brokerd event");
                record_unknown_brokerd_message(broker, "schema");
                Ok(())
            }
        }
    }

    /// Fail requests queued while no session is up. Returns `false` when
    /// the relay should stop.
    async fn wait_for_restart(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.restart_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return false,

                request = self.requests.recv() => match request {
                    Some(request) => self.post_failure(request.oid().to_string(), CONNECTION_LOST.to_string()),
                    None => return false,
                },

                () = &mut sleep => return true,
            }
        }
    }

    fn post(&self, command: EmsCommand) -> Result<(), ServiceStopped> {
        self.service.send(command).inspect_err(|_| {
            tracing::info!(broker = %self.config.broker, "Routing service gone");
        })
    }

    fn post_failure(&self, oid: String, reason: String) {
        let _ = self.post(EmsCommand::BrokerRequestFailed {
            broker: self.config.broker.clone(),
            oid,
            reason,
        });
    }
}
