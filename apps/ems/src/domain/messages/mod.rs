//! Message Taxonomy
//!
//! Immutable records for every step of an order dialog, plus the closed
//! unions each connection speaks. Unions are tagged by a `name` field on
//! the wire; records ignore fields they do not know, so new optional
//! fields never break older readers.
//!
//! | Union | Direction |
//! |-------|-----------|
//! | [`ClientInbound`] / [`ClientRequest`] | client -> ems |
//! | [`ClientEvent`] | ems -> client |
//! | [`BrokerdRequest`] | ems -> brokerd |
//! | [`BrokerdEvent`] | brokerd -> ems |

mod brokerd;
mod client;
pub mod schema;
mod values;

pub use brokerd::{
    BrokerdCancel, BrokerdError, BrokerdEvent, BrokerdFill, BrokerdOrder, BrokerdOrderAck,
    BrokerdPosition, BrokerdRequest, BrokerdStatus,
};
pub use client::{Cancel, ClientEvent, ClientInbound, ClientRequest, Order, Quote, Status};
pub use schema::{SchemaError, Validate};
pub use values::{Action, BrokerdStatusKind, ExecMode, ReqId, Resp};
