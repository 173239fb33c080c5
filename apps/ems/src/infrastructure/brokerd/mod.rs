//! Broker adapter sessions over JSON-RPC.

mod hook;
mod relay;

pub use hook::{OPEN_TRADE_DIALOG, OpenTradeDialogHook};
pub use relay::{BROKERD_EVENT, BrokerdRelay, BrokerdRelayConfig};
