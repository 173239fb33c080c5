//! JSON-RPC 2.0 Multiplexer
//!
//! Many callers share one [`DuplexChannel`]. Each request gets the next
//! correlation id and a pending slot; one receive task owns the slot table
//! and wakes exactly one waiter per response.
//!
//! # Slot ownership
//!
//! Callers never touch the table. They send `Register`/`Forget` commands
//! to the receive task over an unbounded queue, and the task drains that
//! queue before looking at inbound frames. A slot is therefore registered
//! before its request is even written, so a fast response cannot race it.
//!
//! # Inbound frames
//!
//! - response (`id` + `result`/`error`): resolves the matching slot; an
//!   unknown id is logged and discarded
//! - notification (`method`, no `id`): forwarded to the notification queue
//! - anything else: logged and dropped

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use metrics::counter;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelConfig, ChannelReceiver, ChannelSender, DuplexChannel};
use crate::error::ChannelError;
use crate::link::{ConnectHook, Connector};

/// Protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

// =============================================================================
// Envelopes
// =============================================================================

/// Outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: u64,
    /// Remote method name.
    pub method: String,
    /// Call parameters.
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Build a request envelope.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Message without a correlation id, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Notification name.
    pub method: String,
    /// Payload.
    #[serde(default)]
    pub params: Value,
}

impl RpcNotification {
    /// Build a notification envelope.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Reply to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Id of the request being answered.
    #[serde(default)]
    pub id: Value,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcResponse {
    /// Successful reply to `id`.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error reply to `id`.
    #[must_use]
    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            result: None,
            error: Some(serde_json::json!({ "code": code, "message": message.into() })),
        }
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

// =============================================================================
// Errors
// =============================================================================

/// Error payload returned by the peer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("remote error {}: {message}", .code.map_or_else(|| "(no code)".to_string(), |c| c.to_string()))]
pub struct RemoteError {
    /// Numeric code, when the payload carried one.
    pub code: Option<i64>,
    /// Human readable message.
    pub message: String,
    /// The full error payload.
    pub data: Value,
}

impl RemoteError {
    /// Interpret an `error` field.
    #[must_use]
    pub fn from_payload(payload: Value) -> Self {
        let code = payload.get("code").and_then(Value::as_i64);
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| payload.to_string(), str::to_string);
        Self {
            code,
            message,
            data: payload,
        }
    }
}

/// Multiplexer call failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Peer answered with an error field.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The channel's reconnect budget ran out.
    #[error("transport exhausted: {0}")]
    TransportExhausted(ChannelError),
    /// Session was cancelled before a response arrived.
    #[error("rpc session cancelled")]
    Cancelled,
    /// Other channel failure.
    #[error("channel error: {0}")]
    Channel(ChannelError),
    /// Parameters could not be serialized.
    #[error("failed to encode params: {0}")]
    Encode(String),
    /// Result did not match the expected type.
    #[error("failed to decode result: {0}")]
    Decode(String),
}

impl From<ChannelError> for RpcError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Exhausted { .. } => Self::TransportExhausted(err),
            ChannelError::Cancelled => Self::Cancelled,
            other => Self::Channel(other),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Session parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcConfig {
    /// First correlation id handed out.
    pub start_id: u64,
}

type Slot = oneshot::Sender<Result<Value, RpcError>>;

enum Command {
    Register { id: u64, slot: Slot },
    Forget { id: u64 },
}

/// A JSON-RPC session over one duplex channel.
///
/// Dropping the session cancels its receive task and the channel.
pub struct RpcSession {
    sender: ChannelSender,
    next_id: AtomicU64,
    commands: mpsc::UnboundedSender<Command>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<RpcNotification>>>,
    closed: Arc<OnceLock<RpcError>>,
    cancel: CancellationToken,
}

/// A request that was written and is awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    method: String,
    wait: oneshot::Receiver<Result<Value, RpcError>>,
    closed: Arc<OnceLock<RpcError>>,
}

impl RpcSession {
    /// Start a session on an already connected channel.
    #[must_use]
    pub fn open(channel: DuplexChannel, config: RpcConfig, cancel: &CancellationToken) -> Self {
        let cancel = cancel.child_token();
        let (sender, receiver) = channel.split();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(OnceLock::new());

        let receive_loop = ReceiveLoop {
            pending: HashMap::new(),
            commands: commands_rx,
            notifications: notify_tx,
            closed: Arc::clone(&closed),
            cancel: cancel.clone(),
        };
        tokio::spawn(receive_loop.run(receiver));

        Self {
            sender,
            next_id: AtomicU64::new(config.start_id),
            commands: commands_tx,
            notifications: Mutex::new(Some(notify_rx)),
            closed,
            cancel,
        }
    }

    /// Connect a channel and open a session on it.
    ///
    /// # Errors
    ///
    /// Returns the channel's connect error.
    pub async fn connect(
        channel: ChannelConfig,
        config: RpcConfig,
        connector: Arc<dyn Connector>,
        hook: Option<Arc<dyn ConnectHook>>,
        cancel: &CancellationToken,
    ) -> Result<Self, RpcError> {
        let channel = DuplexChannel::connect(channel, connector, hook, cancel).await?;
        Ok(Self::open(channel, config, cancel))
    }

    /// Call `method` and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Remote`] if the peer answered with an error,
    /// [`RpcError::TransportExhausted`] if the channel gave up, or
    /// [`RpcError::Cancelled`] if the session closed first.
    pub async fn call<P: Serialize>(&self, method: &str, params: P) -> Result<Value, RpcError> {
        self.request(method, params).await?.response().await
    }

    /// Call `method` and decode its result as `T`.
    ///
    /// # Errors
    ///
    /// As [`RpcSession::call`], plus [`RpcError::Decode`].
    pub async fn call_as<T: DeserializeOwned, P: Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> Result<T, RpcError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Write a request and return without waiting for the response.
    ///
    /// Requests issued sequentially from one task go out in that order.
    ///
    /// # Errors
    ///
    /// Returns the session's terminal error if it already shut down, or the
    /// channel error that prevented the write.
    pub async fn request<P: Serialize>(&self, method: &str, params: P) -> Result<PendingCall, RpcError> {
        if let Some(err) = self.closed.get() {
            return Err(err.clone());
        }
        let params = serde_json::to_value(params).map_err(|e| RpcError::Encode(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, wait) = oneshot::channel();
        self.commands
            .send(Command::Register { id, slot })
            .map_err(|_| self.terminal_error())?;

        if let Err(err) = self.sender.send(&RpcRequest::new(id, method, params)).await {
            let _ = self.commands.send(Command::Forget { id });
            return Err(err.into());
        }

        counter!("duplex_transport_rpc_calls_total").increment(1);
        tracing::trace!(id, method, "Request sent");
        Ok(PendingCall {
            id,
            method: method.to_string(),
            wait,
            closed: Arc::clone(&self.closed),
        })
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns the channel error that prevented the write.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), RpcError> {
        let params = serde_json::to_value(params).map_err(|e| RpcError::Encode(e.to_string()))?;
        self.sender
            .send(&RpcNotification::new(method, params))
            .await
            .map_err(RpcError::from)
    }

    /// Take the inbound notification queue. Only the first call gets it.
    pub fn notifications(&self) -> Option<mpsc::UnboundedReceiver<RpcNotification>> {
        self.notifications.lock().take()
    }

    /// Why the session stopped, if it has.
    #[must_use]
    pub fn closed_reason(&self) -> Option<RpcError> {
        self.closed.get().cloned()
    }

    /// Cancel the receive task and the channel.
    pub fn close(&self) {
        self.cancel.cancel();
        self.sender.close();
    }

    fn terminal_error(&self) -> RpcError {
        self.closed.get().cloned().unwrap_or(RpcError::Cancelled)
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}

impl PendingCall {
    /// Correlation id of this call.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Method name of this call.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response.
    ///
    /// # Errors
    ///
    /// See [`RpcSession::call`].
    pub async fn response(self) -> Result<Value, RpcError> {
        match self.wait.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.closed.get().cloned().unwrap_or(RpcError::Cancelled)),
        }
    }
}

// =============================================================================
// Receive Loop
// =============================================================================

struct ReceiveLoop {
    pending: HashMap<u64, Slot>,
    commands: mpsc::UnboundedReceiver<Command>,
    notifications: mpsc::UnboundedSender<RpcNotification>,
    closed: Arc<OnceLock<RpcError>>,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(mut self, mut receiver: ChannelReceiver) {
        let terminal = loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break RpcError::Cancelled,

                Some(command) = self.commands.recv() => self.apply(command),

                message = receiver.recv() => match message {
                    Ok(message) => self.dispatch(message),
                    Err(err) => break RpcError::from(err),
                },
            }
        };

        let _ = self.closed.set(terminal.clone());
        // Registrations that raced the shutdown still get an answer
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        if !self.pending.is_empty() {
            tracing::debug!(
                outstanding = self.pending.len(),
                error = %terminal,
                "Failing outstanding calls"
            );
        }
        for (_, slot) in self.pending.drain() {
            let _ = slot.send(Err(terminal.clone()));
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { id, slot } => {
                self.pending.insert(id, slot);
            }
            Command::Forget { id } => {
                self.pending.remove(&id);
            }
        }
    }

    fn dispatch(&mut self, message: Value) {
        let is_response = message.get("result").is_some() || message.get("error").is_some();
        let has_id = message.get("id").is_some_and(|id| !id.is_null());

        if is_response {
            match serde_json::from_value::<RpcResponse>(message) {
                Ok(response) => self.resolve(response),
                Err(e) => tracing::warn!(error = %e, "Malformed response envelope"),
            }
        } else if !has_id && message.get("method").is_some() {
            match serde_json::from_value::<RpcNotification>(message) {
                Ok(notification) => {
                    if self.notifications.send(notification).is_err() {
                        tracing::trace!("Notification queue dropped, discarding");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Malformed notification envelope"),
            }
        } else {
            tracing::debug!(%message, "Ignoring frame that is neither response nor notification");
        }
    }

    fn resolve(&mut self, response: RpcResponse) {
        let slot = response.id.as_u64().and_then(|id| self.pending.remove(&id));
        let Some(slot) = slot else {
            tracing::warn!(id = %response.id, "Discarding response with no pending request");
            counter!("duplex_transport_rpc_unmatched_total").increment(1);
            return;
        };

        let outcome = match response.error {
            Some(error) if !error.is_null() => Err(RpcError::Remote(RemoteError::from_payload(error))),
            _ => Ok(response.result.unwrap_or(Value::Null)),
        };
        if slot.send(outcome).is_err() {
            tracing::debug!(id = %response.id, "Caller went away before its response");
        }
    }
}
