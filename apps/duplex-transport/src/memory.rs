//! In-process connector.
//!
//! Each successful connect hands a [`MemoryPeer`] (the far end) to the
//! [`MemoryAcceptor`]. Connect failures can be scripted, which makes link
//! loss and recovery reproducible without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use futures::channel::mpsc as frames;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::link::{Connector, Link};

#[derive(Debug)]
struct Script {
    refuse_next: u32,
    refuse_all: bool,
    attempts: u32,
}

/// Connector whose links terminate in the same process.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    script: Arc<Mutex<Script>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the far end of every link the connector opens.
#[derive(Debug)]
pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Far end of one in-memory link.
///
/// Dropping the peer breaks the link in both directions.
#[derive(Debug)]
pub struct MemoryPeer {
    to_client: frames::UnboundedSender<Result<String, TransportError>>,
    from_client: frames::UnboundedReceiver<String>,
}

impl MemoryConnector {
    /// Create a connector and the acceptor for its links.
    #[must_use]
    pub fn new() -> (Self, MemoryAcceptor) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(Script {
                refuse_next: 0,
                refuse_all: false,
                attempts: 0,
            })),
            peers: peers_tx,
        };
        (connector, MemoryAcceptor { peers: peers_rx })
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_next(&self, count: u32) {
        self.script.lock().refuse_next = count;
    }

    /// Refuse every connect attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.script.lock().refuse_all = refuse;
    }

    /// Connect attempts seen so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.script.lock().attempts
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        {
            let mut script = self.script.lock();
            script.attempts += 1;
            if script.refuse_all {
                return Err(TransportError::Rejected(format!("{url} refused")));
            }
            if script.refuse_next > 0 {
                script.refuse_next -= 1;
                return Err(TransportError::Rejected(format!("{url} refused")));
            }
        }

        let (client_tx, from_client) = frames::unbounded::<String>();
        let (to_client, client_rx) = frames::unbounded::<Result<String, TransportError>>();

        self.peers
            .send(MemoryPeer {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Rejected(format!("no acceptor for {url}")))?;

        Ok(Link::new(
            client_tx.sink_map_err(|_| TransportError::Closed),
            client_rx,
        ))
    }
}

impl MemoryAcceptor {
    /// Wait for the next link to be opened.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

impl MemoryPeer {
    /// Push a text frame to the client. Returns `false` if the link is gone.
    pub fn send_text(&self, frame: impl Into<String>) -> bool {
        self.to_client.unbounded_send(Ok(frame.into())).is_ok()
    }

    /// Push a JSON message to the client.
    pub fn send_json(&self, message: &Value) -> bool {
        self.send_text(message.to_string())
    }

    /// Fail the client's read side with `error`.
    pub fn fail(&self, error: TransportError) -> bool {
        self.to_client.unbounded_send(Err(error)).is_ok()
    }

    /// Next frame written by the client, or `None` once it closed the link.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Next frame written by the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let frame = self.recv_text().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Break the link.
    pub fn disconnect(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let mut link = connector.connect("mem://a").await.unwrap();
        let mut peer = acceptor.accept().await.unwrap();

        link.send_text("hello".into()).await.unwrap();
        assert_eq!(peer.recv_text().await.as_deref(), Some("hello"));

        assert!(peer.send_json(&json!({"x": 1})));
        assert_eq!(link.recv_text().await.unwrap(), r#"{"x":1}"#);
    }

    #[tokio::test]
    async fn dropping_peer_closes_link() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let mut link = connector.connect("mem://a").await.unwrap();
        acceptor.accept().await.unwrap().disconnect();

        assert_eq!(link.recv_text().await, Err(TransportError::Closed));
        assert_eq!(link.send_text("x".into()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn scripted_refusals_are_counted() {
        let (connector, _acceptor) = MemoryConnector::new();
        connector.refuse_next(2);

        assert!(connector.connect("mem://a").await.is_err());
        assert!(connector.connect("mem://a").await.is_err());
        assert!(connector.connect("mem://a").await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
