//! Client WebSocket Server
//!
//! Each accepted connection becomes one client of the routing service.
//! Inbound text frames are decoded as `ClientInbound`; outbound frames are
//! the client's `ClientEvent` queue, serialized as JSON.
//!
//! A frame that fails the schema is answered with an error status when an
//! `oid` can be read from it, and only logged otherwise.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::application::{ClientId, EmsCommand, EmsHandle, ServiceStopped};
use crate::domain::messages::{ClientInbound, ClientRequest, schema};
use crate::observability::metrics::record_malformed_client_frame;

/// Client server error.
#[derive(Debug, thiserror::Error)]
pub enum ClientServerError {
    /// The listener could not be bound.
    #[error("failed to bind client listener on {0}: {1}")]
    Bind(SocketAddr, String),
    /// The bound address could not be read.
    #[error("failed to read listener address: {0}")]
    LocalAddr(String),
}

/// Accepts client connections for the routing service.
#[derive(Debug)]
pub struct ClientServer {
    listener: TcpListener,
    service: EmsHandle,
    cancel: CancellationToken,
}

impl ClientServer {
    /// Bind `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientServerError::Bind`] if the address is unavailable.
    pub async fn bind(
        addr: SocketAddr,
        service: EmsHandle,
        cancel: CancellationToken,
    ) -> Result<Self, ClientServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClientServerError::Bind(addr, e.to_string()))?;
        Ok(Self {
            listener,
            service,
            cancel,
        })
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns [`ClientServerError::LocalAddr`] if the socket has no address.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ClientServerError::LocalAddr(e.to_string()))
    }

    /// Accept connections until cancelled.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(addr = %addr, "Client server listening");
        }
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            self.service.clone(),
                            self.cancel.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept client connection"),
                },
            }
        }
        tracing::info!("Client server stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: EmsHandle,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let client = ClientId::new();
    let Ok(mut events) = service.connect_client(client) else {
        return;
    };
    tracing::debug!(peer = %peer, client = %client, "Client session started");
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            tracing::debug!(client = %client, error = %e, "Client write failed");
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(client = %client, error = %e, "Failed to encode client event"),
                },
                None => break,
            },

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_frame(&service, client, text.as_str()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if handle_frame(&service, client, text).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(client = %client, error = %e, "Dropping non UTF-8 frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client = %client, error = %e, "Client read failed");
                    break;
                }
            },
        }
    }

    let _ = service.disconnect_client(client);
    let _ = write.close().await;
    tracing::debug!(client = %client, "Client session ended");
}

fn handle_frame(service: &EmsHandle, client: ClientId, text: &str) -> Result<(), ServiceStopped> {
    match schema::decode::<ClientInbound>(text) {
        Ok(ClientInbound::Order(order)) => service.request(client, ClientRequest::Order(order)),
        Ok(ClientInbound::Cancel(cancel)) => service.request(client, ClientRequest::Cancel(cancel)),
        Ok(ClientInbound::Quote(quote)) => service.quote(quote.symbol, quote.price),
        Err(err) => {
            record_malformed_client_frame();
            match recover_oid(text) {
                Some(oid) => service.send(EmsCommand::RejectFrame {
                    client,
                    oid,
                    reason: err.to_string(),
                }),
                None => {
                    tracing::warn!(client = %client, error = %err, "Dropping malformed client frame");
                    Ok(())
                }
            }
        }
    }
}

/// The frame's `oid`, if it is a JSON object carrying a non-empty one.
fn recover_oid(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("oid")?
        .as_str()
        .filter(|oid| !oid.trim().is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(r#"{"name":"order","oid":"a1"}"#, Some("a1") ; "object with oid")]
    #[test_case(r#"{"name":"order","oid":""}"#, None ; "blank oid")]
    #[test_case(r#"{"name":"order","oid":7}"#, None ; "numeric oid")]
    #[test_case(r#"{"name":"cancel"}"#, None ; "no oid")]
    #[test_case("not json", None ; "not json")]
    fn oid_recovery(frame: &str, expected: Option<&str>) {
        assert_eq!(recover_oid(frame).as_deref(), expected);
    }
}
