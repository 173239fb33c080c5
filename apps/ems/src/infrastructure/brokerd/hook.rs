//! Session setup replayed on every brokerd link.

use async_trait::async_trait;
use duplex_transport::{ConnectHook, Link, RpcNotification, TransportError};
use serde::Serialize;

/// Notification announcing the ems to a broker adapter.
pub const OPEN_TRADE_DIALOG: &str = "open_trade_dialog";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct OpenTradeDialog<'a> {
    client: &'a str,
    accounts: &'a [String],
}

/// Sends `open_trade_dialog` before the session uses a fresh link, so the
/// adapter knows which accounts this client trades after every reconnect.
#[derive(Debug, Clone)]
pub struct OpenTradeDialogHook {
    client: String,
    accounts: Vec<String>,
}

impl OpenTradeDialogHook {
    /// Hook announcing `client` with `accounts`.
    #[must_use]
    pub const fn new(client: String, accounts: Vec<String>) -> Self {
        Self { client, accounts }
    }

    fn frame(&self) -> Result<String, TransportError> {
        let params = serde_json::to_value(OpenTradeDialog {
            client: &self.client,
            accounts: &self.accounts,
        })
        .map_err(|e| TransportError::Hook(e.to_string()))?;
        serde_json::to_string(&RpcNotification::new(OPEN_TRADE_DIALOG, params))
            .map_err(|e| TransportError::Hook(e.to_string()))
    }
}

#[async_trait]
impl ConnectHook for OpenTradeDialogHook {
    async fn on_connect(&self, link: &mut Link) -> Result<(), TransportError> {
        link.send_text(self.frame()?).await?;
        tracing::debug!(client = %self.client, accounts = self.accounts.len(), "Trade dialog opened");
        Ok(())
    }
}
