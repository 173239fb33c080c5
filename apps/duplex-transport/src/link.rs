//! Link and connector seam.
//!
//! A [`Link`] is one physical connection: a sink of outbound text frames
//! and a stream of inbound ones. The channel never touches sockets
//! directly; it asks a [`Connector`] for a fresh link whenever it needs one.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};

use crate::error::TransportError;

/// Outbound half of a link.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a link. The stream ending means the link closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One established connection.
pub struct Link {
    sink: FrameSink,
    stream: FrameStream,
}

impl Link {
    /// Build a link from its two halves.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns the transport error reported by the sink.
    pub async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink.send(frame).await
    }

    /// Read the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the stream has ended.
    pub async fn recv_text(&mut self) -> Result<String, TransportError> {
        self.stream.next().await.unwrap_or(Err(TransportError::Closed))
    }

    /// Close the outbound half, ignoring errors from an already broken link.
    pub async fn close(&mut self) {
        if let Err(err) = self.sink.close().await {
            tracing::trace!(error = %err, "Ignoring close error on link");
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Produces links to a URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new link.
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}

/// Session setup replayed on every fresh link before the channel uses it.
///
/// Subscriptions and authentication belong here. An error makes the
/// connect attempt count as failed.
#[async_trait]
pub trait ConnectHook: Send + Sync + 'static {
    /// Run setup against the new link.
    async fn on_connect(&self, link: &mut Link) -> Result<(), TransportError>;
}
