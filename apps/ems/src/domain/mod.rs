//! Domain Layer
//!
//! Message records and dialog state. No I/O and no async.

pub mod dialog;
pub mod messages;
