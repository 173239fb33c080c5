//! WebSocket connector.
//!
//! Text and binary (UTF-8) frames become channel frames; pings are answered
//! by tungstenite on the read path; a close frame ends the link.

use async_trait::async_trait;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::UrlError;

use crate::error::TransportError;
use crate::link::{Connector, Link};

/// Connects over `ws://` or `wss://`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    /// Create a new WebSocket connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        tracing::debug!(url, "Opening WebSocket");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(TransportError::from)
            .with(|frame: String| future::ready(Ok::<_, TransportError>(Message::Text(frame.into()))));

        let stream = read.filter_map(|item| {
            future::ready(match item {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping non UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "Server sent close frame");
                    Some(Err(TransportError::Closed))
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(e.into())),
            })
        });

        Ok(Link::new(sink, stream))
    }
}

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Io(e) => Self::Io(e.to_string()),
            WsError::Url(UrlError::UnableToConnect(addr)) => {
                Self::Io(format!("unable to connect to {addr}"))
            }
            WsError::Url(e) => Self::InvalidUrl(e.to_string()),
            WsError::Http(response) => Self::Rejected(format!("HTTP {}", response.status())),
            WsError::HttpFormat(e) => Self::Handshake(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_errors_map_to_closed() {
        assert_eq!(TransportError::from(WsError::ConnectionClosed), TransportError::Closed);
        assert_eq!(TransportError::from(WsError::AlreadyClosed), TransportError::Closed);
    }

    #[test]
    fn bad_scheme_is_fatal() {
        let err = TransportError::from(WsError::Url(UrlError::UnsupportedUrlScheme));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn io_errors_are_recoverable() {
        let err = TransportError::from(WsError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )));
        assert!(matches!(err, TransportError::Io(_)));
        assert!(err.is_recoverable());
    }
}
