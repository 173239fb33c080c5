//! Order dialogs: the aggregate, its state machine and dark triggers.

#[allow(clippy::module_inception)]
mod dialog;
mod errors;
mod state;
mod trigger;

pub use dialog::{Dialog, FILL_TOLERANCE};
pub use errors::RoutingError;
pub use state::DialogState;
pub use trigger::{DarkTrigger, TriggerDirection};
