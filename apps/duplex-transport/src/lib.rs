#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::items_after_statements
    )
)]

//! Duplex Transport - Self-Healing Message Channel
//!
//! A message-framed, bidirectional channel that hides reconnects from its
//! callers, plus a JSON-RPC 2.0 multiplexer that lets many logical callers
//! share one physical channel.
//!
//! # Layers (bottom → top)
//!
//! - `link`: the connector seam; a [`Link`] is one physical connection
//!   (text-frame sink + stream) produced by a [`Connector`]
//! - `websocket` / `memory`: connector implementations
//! - `reconnect`: retry budget and inter-attempt delay
//! - `channel`: [`DuplexChannel`], a single task owning the link, reached
//!   through send/receive queues; reconnects happen inside that task
//! - `rpc`: [`RpcSession`], correlation ids and pending-result slots owned
//!   by one receive task
//!
//! # Data Flow
//!
//! ```text
//!  callers ──send──► [request queue] ──► channel task ──► Link (ws / memory)
//!  callers ◄─recv─── [frame queue]  ◄──  channel task ◄── Link
//!                                           │
//!                                  reconnect + hook replay
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

pub mod channel;
pub mod codec;
pub mod error;
pub mod link;
pub mod memory;
pub mod reconnect;
pub mod rpc;
pub mod websocket;

// =============================================================================
// Re-exports
// =============================================================================

pub use channel::{ChannelConfig, ChannelReceiver, ChannelSender, ChannelState, DuplexChannel};
pub use codec::{CodecError, JsonCodec};
pub use error::{ChannelError, TransportError};
pub use link::{ConnectHook, Connector, Link};
pub use memory::{MemoryAcceptor, MemoryConnector, MemoryPeer};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rpc::{
    PendingCall, RemoteError, RpcConfig, RpcError, RpcNotification, RpcRequest, RpcResponse,
    RpcSession,
};
pub use websocket::WsConnector;
