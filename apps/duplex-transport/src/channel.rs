//! Resilient Duplex Channel
//!
//! One logical, bidirectional message stream over a link that may fail at
//! any time. A single driver task owns the link; callers reach it only
//! through two queues:
//!
//! - **requests**: each outbound frame carries a completion slot, so `send`
//!   returns only after the frame was written (possibly on a later link)
//! - **frames**: inbound frames in arrival order
//!
//! Because only the driver touches the link, a failure seen on the write
//! path and one seen on the read path can never start two reconnects; every
//! queued caller waits on the same one.
//!
//! # Failure handling
//!
//! A recoverable [`TransportError`] closes the link and runs the connect
//! loop again (hook included). A failed write is retried once on each new
//! link. When the retry budget runs out, queued sends fail with
//! [`ChannelError::Exhausted`], the receiver yields that error once, and the
//! channel shuts down.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::Stream;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::codec::JsonCodec;
use crate::error::{ChannelError, TransportError};
use crate::link::{ConnectHook, Connector, Link};
use crate::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::websocket::WsConnector;

/// Upper bound on closing a broken link before reconnecting.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Configuration
// =============================================================================

/// Channel construction parameters.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Address handed to the connector.
    pub url: String,
    /// Retry budget and delay.
    pub reconnect: ReconnectConfig,
    /// Deadline for a single connect attempt, hook included.
    pub connect_timeout: Duration,
    /// Outbound request queue depth.
    pub outbound_capacity: usize,
    /// Inbound frame queue depth.
    pub inbound_capacity: usize,
}

impl ChannelConfig {
    /// Defaults for `url`: 1000 attempts, 500ms apart.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            inbound_capacity: 1024,
        }
    }

    /// Replace the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Replace the per-attempt connect deadline.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Connection state published by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Initial connect in progress.
    Connecting,
    /// Link is up.
    Connected,
    /// Link failed; `attempt` is the next connect attempt number.
    Reconnecting {
        /// 1-based attempt about to run.
        attempt: u32,
    },
    /// Retry budget used up.
    Exhausted,
    /// Shut down by cancellation or a fatal error.
    Closed,
}

// =============================================================================
// Handles
// =============================================================================

struct SendRequest {
    frame: String,
    done: oneshot::Sender<Result<(), ChannelError>>,
}

/// A connected channel. Split it to share the send side.
#[derive(Debug)]
pub struct DuplexChannel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

/// Clonable send half.
#[derive(Clone)]
pub struct ChannelSender {
    requests: mpsc::Sender<SendRequest>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    _guard: Arc<DropGuard>,
}

/// Receive half: the infinite sequence of inbound messages.
pub struct ChannelReceiver {
    frames: mpsc::Receiver<Result<String, ChannelError>>,
    buffered: VecDeque<Value>,
    cancel: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl DuplexChannel {
    /// Connect to `config.url`, running `hook` on every fresh link.
    ///
    /// Returns once the first link is up and the hook succeeded. The
    /// channel stops when `cancel` fires or every handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Exhausted`] if no attempt within the budget
    /// succeeded, [`ChannelError::Fatal`] on a non-recoverable error, or
    /// [`ChannelError::Cancelled`].
    pub async fn connect(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        hook: Option<Arc<dyn ConnectHook>>,
        cancel: &CancellationToken,
    ) -> Result<Self, ChannelError> {
        let cancel = cancel.child_token();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let outbound_capacity = config.outbound_capacity.max(1);
        let inbound_capacity = config.inbound_capacity.max(1);

        let mut driver = Driver {
            config,
            connector,
            hook,
            cancel: cancel.clone(),
            state: state_tx,
            reconnects: 0,
        };
        let link = driver.establish().await?;

        let (requests_tx, requests_rx) = mpsc::channel(outbound_capacity);
        let (frames_tx, frames_rx) = mpsc::channel(inbound_capacity);
        tokio::spawn(driver.run(link, requests_rx, frames_tx));

        let guard = Arc::new(cancel.clone().drop_guard());
        Ok(Self {
            sender: ChannelSender {
                requests: requests_tx,
                state: state_rx,
                cancel: cancel.clone(),
                _guard: Arc::clone(&guard),
            },
            receiver: ChannelReceiver {
                frames: frames_rx,
                buffered: VecDeque::new(),
                cancel,
                _guard: guard,
            },
        })
    }

    /// Connect over WebSocket with default settings.
    ///
    /// # Errors
    ///
    /// See [`DuplexChannel::connect`].
    pub async fn connect_url(url: &str, cancel: &CancellationToken) -> Result<Self, ChannelError> {
        Self::connect(ChannelConfig::new(url), Arc::new(WsConnector::new()), None, cancel).await
    }

    /// Send one message, blocking through any reconnect.
    ///
    /// # Errors
    ///
    /// See [`ChannelSender::send`].
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ChannelError> {
        self.sender.send(message).await
    }

    /// Receive the next message, blocking through any reconnect.
    ///
    /// # Errors
    ///
    /// See [`ChannelReceiver::recv`].
    pub async fn recv(&mut self) -> Result<Value, ChannelError> {
        self.receiver.recv().await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.sender.state()
    }

    /// Shut the channel down.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Separate the send and receive halves.
    #[must_use]
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

impl ChannelSender {
    /// Serialize and send one message.
    ///
    /// Completes once the frame was written. Link failures are retried
    /// behind the scenes.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Exhausted`] if the reconnect budget ran out
    /// while this send was queued, [`ChannelError::Closed`] once the channel
    /// is down, or [`ChannelError::Encode`].
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ChannelError> {
        let frame = JsonCodec::encode(message).map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.send_text(frame).await
    }

    /// Send one pre-encoded frame.
    ///
    /// # Errors
    ///
    /// See [`ChannelSender::send`].
    pub async fn send_text(&self, frame: String) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        let (done, wait) = oneshot::channel();
        self.requests
            .send(SendRequest { frame, done })
            .await
            .map_err(|_| ChannelError::Closed)?;
        wait.await.unwrap_or(Err(ChannelError::Cancelled))
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Shut the channel down.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ChannelReceiver {
    /// Next inbound message.
    ///
    /// Batch frames are flattened; malformed frames are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Exhausted`] exactly once when the reconnect
    /// budget runs out, then [`ChannelError::Closed`]. Returns
    /// [`ChannelError::Cancelled`] after cancellation.
    pub async fn recv(&mut self) -> Result<Value, ChannelError> {
        let next = std::future::poll_fn(|cx| self.poll_message(cx)).await;
        match next {
            Some(message) => message,
            None if self.cancel.is_cancelled() => Err(ChannelError::Cancelled),
            None => Err(ChannelError::Closed),
        }
    }

    fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Value, ChannelError>>> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Poll::Ready(Some(Ok(message)));
            }
            match ready!(self.frames.poll_recv(cx)) {
                Some(Ok(text)) => match JsonCodec::decode(&text) {
                    Ok(messages) => self.buffered.extend(messages),
                    Err(e) => {
                        tracing::warn!(error = %e, frame_len = text.len(), "Skipping malformed frame");
                        counter!("duplex_transport_malformed_frames_total").increment(1);
                    }
                },
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Stream for ChannelReceiver {
    type Item = Result<Value, ChannelError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_message(cx)
    }
}

impl std::fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("buffered", &self.buffered.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Driver
// =============================================================================

struct Driver {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    hook: Option<Arc<dyn ConnectHook>>,
    cancel: CancellationToken,
    state: watch::Sender<ChannelState>,
    reconnects: u64,
}

impl Driver {
    async fn run(
        mut self,
        mut link: Link,
        mut requests: mpsc::Receiver<SendRequest>,
        frames: mpsc::Sender<Result<String, ChannelError>>,
    ) {
        let failure = loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break None,

                Some(request) = requests.recv() => {
                    match self.write(&mut link, request.frame).await {
                        Ok(()) => {
                            let _ = request.done.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = request.done.send(Err(err.clone()));
                            break Some(err);
                        }
                    }
                }

                frame = link.recv_text() => match frame {
                    Ok(text) => {
                        if frames.send(Ok(text)).await.is_err() {
                            tracing::trace!(url = %self.config.url, "Receiver dropped, discarding frame");
                        }
                    }
                    Err(err) => {
                        if let Err(fatal) = self.reconnect(&mut link, err).await {
                            break Some(fatal);
                        }
                    }
                },
            }
        };

        match failure {
            None => {
                link.close().await;
                self.state.send_replace(ChannelState::Closed);
                tracing::debug!(url = %self.config.url, "Channel cancelled");
            }
            Some(err) => {
                requests.close();
                while let Ok(request) = requests.try_recv() {
                    let _ = request.done.send(Err(err.clone()));
                }
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    _ = frames.send(Err(err)) => {}
                }
            }
        }
    }

    /// Write `frame`, reconnecting and retrying once per link failure.
    async fn write(&mut self, link: &mut Link, frame: String) -> Result<(), ChannelError> {
        loop {
            match link.send_text(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => self.reconnect(link, err).await?,
            }
        }
    }

    async fn reconnect(&mut self, link: &mut Link, cause: TransportError) -> Result<(), ChannelError> {
        if !cause.is_recoverable() {
            self.state.send_replace(ChannelState::Closed);
            return Err(ChannelError::Fatal(cause));
        }

        tracing::warn!(url = %self.config.url, error = %cause, "Link failed, reconnecting");
        counter!("duplex_transport_link_failures_total", "kind" => cause.kind()).increment(1);

        let _ = tokio::time::timeout(CLOSE_TIMEOUT, link.close()).await;
        self.state.send_replace(ChannelState::Reconnecting { attempt: 1 });
        *link = self.establish().await?;

        self.reconnects += 1;
        counter!("duplex_transport_reconnects_total").increment(1);
        tracing::info!(
            url = %self.config.url,
            reconnects = self.reconnects,
            "Link re-established"
        );
        Ok(())
    }

    /// Connect loop shared by the initial connect and every reconnect.
    async fn establish(&mut self) -> Result<Link, ChannelError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let attempt = policy.attempt_count() + 1;
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return Err(ChannelError::Cancelled),
                outcome = self.attempt() => outcome,
            };

            let err = match outcome {
                Ok(link) => {
                    self.state.send_replace(ChannelState::Connected);
                    tracing::debug!(url = %self.config.url, attempt, "Link up");
                    return Ok(link);
                }
                Err(err) if !err.is_recoverable() => {
                    self.state.send_replace(ChannelState::Closed);
                    return Err(ChannelError::Fatal(err));
                }
                Err(err) => err,
            };

            let Some(delay) = policy.next_delay() else {
                tracing::error!(
                    url = %self.config.url,
                    attempts = policy.attempt_count(),
                    error = %err,
                    "Reconnect budget exhausted"
                );
                counter!("duplex_transport_exhausted_total").increment(1);
                self.state.send_replace(ChannelState::Exhausted);
                return Err(ChannelError::Exhausted {
                    attempts: policy.attempt_count(),
                    last_error: err,
                });
            };

            tracing::debug!(
                url = %self.config.url,
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "Connect attempt failed"
            );
            self.state.send_replace(ChannelState::Reconnecting {
                attempt: attempt + 1,
            });

            tokio::select! {
                () = self.cancel.cancelled() => return Err(ChannelError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self) -> Result<Link, TransportError> {
        let timeout = self.config.connect_timeout;
        let setup = async {
            let mut link = self.connector.connect(&self.config.url).await?;
            if let Some(hook) = &self.hook
                && let Err(err) = hook.on_connect(&mut link).await
            {
                link.close().await;
                return Err(err);
            }
            Ok(link)
        };

        tokio::time::timeout(timeout, setup)
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use serde_json::json;

    fn fast(url: &str, attempts: u32) -> ChannelConfig {
        ChannelConfig::new(url)
            .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(1), attempts))
    }

    #[tokio::test]
    async fn send_and_receive_json() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let cancel = CancellationToken::new();
        let mut channel = DuplexChannel::connect(fast("mem://a", 3), Arc::new(connector), None, &cancel)
            .await
            .unwrap();
        let mut peer = acceptor.accept().await.unwrap();

        channel.send(&json!({"op": "sub"})).await.unwrap();
        assert_eq!(peer.recv_json().await, Some(json!({"op": "sub"})));

        peer.send_text(r#"[{"n":1},{"n":2}]"#);
        assert_eq!(channel.recv().await.unwrap(), json!({"n": 1}));
        assert_eq!(channel.recv().await.unwrap(), json!({"n": 2}));
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let cancel = CancellationToken::new();
        let mut channel = DuplexChannel::connect(fast("mem://a", 3), Arc::new(connector), None, &cancel)
            .await
            .unwrap();
        let peer = acceptor.accept().await.unwrap();

        peer.send_text("{oops");
        peer.send_text(r#"{"ok":true}"#);
        assert_eq!(channel.recv().await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn initial_connect_exhausts_budget() {
        let (connector, _acceptor) = MemoryConnector::new();
        connector.refuse_all(true);
        let cancel = CancellationToken::new();

        let err = DuplexChannel::connect(fast("mem://a", 4), Arc::new(connector.clone()), None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Exhausted { attempts: 4, .. }));
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test]
    async fn cancel_closes_receiver() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let cancel = CancellationToken::new();
        let mut channel = DuplexChannel::connect(fast("mem://a", 3), Arc::new(connector), None, &cancel)
            .await
            .unwrap();
        let _peer = acceptor.accept().await.unwrap();

        cancel.cancel();
        assert_eq!(channel.recv().await, Err(ChannelError::Cancelled));
    }
}
