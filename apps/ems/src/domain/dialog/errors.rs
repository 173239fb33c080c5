//! Routing errors.

use crate::domain::messages::{ReqId, SchemaError};

use super::state::DialogState;

/// Why a routing operation was refused.
///
/// A refused operation never touches any dialog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// No open dialog has this oid.
    #[error("no open dialog for oid {oid}")]
    UnknownDialog {
        /// Requested oid.
        oid: String,
    },

    /// No open dialog is bound to this broker request id.
    #[error("no open dialog for {broker} reqid {reqid}")]
    UnknownReqid {
        /// Broker that sent the message.
        broker: String,
        /// Requested reqid.
        reqid: ReqId,
    },

    /// An ack tried to change an established binding.
    #[error("dialog {oid} is bound to reqid {bound}, refusing rebind to {attempted}")]
    Rebind {
        /// Dialog id.
        oid: String,
        /// Existing binding.
        bound: ReqId,
        /// Rejected reqid.
        attempted: ReqId,
    },

    /// A broker message named a dialog routed to another broker.
    #[error("dialog {oid} was not routed to {broker}")]
    ForeignBroker {
        /// Dialog id.
        oid: String,
        /// Broker that sent the message.
        broker: String,
    },

    /// The state machine does not allow the move.
    #[error("dialog {oid} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Dialog id.
        oid: String,
        /// Current state.
        from: DialogState,
        /// Requested state.
        to: DialogState,
    },

    /// A live order cannot be turned back into a dark one.
    #[error("dialog {oid} is live and cannot be moved back to dark")]
    ExecModeChange {
        /// Dialog id.
        oid: String,
    },

    /// The message failed validation.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl RoutingError {
    /// Metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownDialog { .. } => "unknown_dialog",
            Self::UnknownReqid { .. } => "unknown_reqid",
            Self::Rebind { .. } => "rebind",
            Self::ForeignBroker { .. } => "foreign_broker",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ExecModeChange { .. } => "exec_mode_change",
            Self::Schema(_) => "schema",
        }
    }
}
