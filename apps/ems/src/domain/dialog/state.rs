//! Dialog lifecycle states and the transitions between them.

use std::fmt;

use crate::domain::messages::Resp;

/// Where a dialog is in its lifecycle.
///
/// ```text
/// created -> pending -> open -> fill* -> closed
///         -> dark_open -> triggered -> open ...
/// canceled, error: from any non-terminal state
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    /// Just received, nothing emitted yet.
    Created,
    /// Sent to the broker, not yet working.
    Pending,
    /// Working at the broker.
    Open,
    /// Held locally waiting for its trigger.
    DarkOpen,
    /// Trigger fired; forwarded to the broker or, for alerts, about to close.
    Triggered,
    /// Partially executed.
    Fill,
    /// Fully cleared.
    Closed,
    /// Canceled.
    Canceled,
    /// Failed.
    Error,
}

impl DialogState {
    /// Whether the dialog ends here.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Canceled | Self::Error)
    }

    /// Whether the order is still held by the ems.
    #[must_use]
    pub const fn is_dark(&self) -> bool {
        matches!(self, Self::DarkOpen)
    }

    /// Client-facing response for this state. `Created` has none.
    #[must_use]
    pub const fn resp(&self) -> Option<Resp> {
        match self {
            Self::Created => None,
            Self::Pending => Some(Resp::Pending),
            Self::Open => Some(Resp::Open),
            Self::DarkOpen => Some(Resp::DarkOpen),
            Self::Triggered => Some(Resp::Triggered),
            Self::Fill => Some(Resp::Fill),
            Self::Closed => Some(Resp::Closed),
            Self::Canceled => Some(Resp::Canceled),
            Self::Error => Some(Resp::Error),
        }
    }

    /// Check if moving to `to` is allowed.
    ///
    /// Repeating a working state (a second `open`, another partial `fill`)
    /// is allowed; nothing leaves a terminal state.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Self::Canceled | Self::Error) {
            return true;
        }
        matches!(
            (self, to),
            // From Created
            (Self::Created, Self::Pending | Self::DarkOpen)
                // From Pending
                | (Self::Pending, Self::Pending | Self::Open | Self::Fill | Self::Closed)
                // From DarkOpen
                | (Self::DarkOpen, Self::DarkOpen | Self::Triggered)
                // From Triggered
                | (Self::Triggered, Self::Pending | Self::Open | Self::Fill | Self::Closed)
                // From Open
                | (Self::Open, Self::Open | Self::Pending | Self::Fill | Self::Closed)
                // From Fill
                | (Self::Fill, Self::Fill | Self::Open | Self::Pending | Self::Closed)
        )
    }

    /// All states reachable in one step.
    #[must_use]
    pub fn valid_next_states(&self) -> Vec<Self> {
        ALL.iter().copied().filter(|to| self.can_transition_to(*to)).collect()
    }
}

const ALL: [DialogState; 9] = [
    DialogState::Created,
    DialogState::Pending,
    DialogState::Open,
    DialogState::DarkOpen,
    DialogState::Triggered,
    DialogState::Fill,
    DialogState::Closed,
    DialogState::Canceled,
    DialogState::Error,
];

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Open => "open",
            Self::DarkOpen => "dark_open",
            Self::Triggered => "triggered",
            Self::Fill => "fill",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DialogState::Created, DialogState::Pending ; "live submit")]
    #[test_case(DialogState::Created, DialogState::DarkOpen ; "dark submit")]
    #[test_case(DialogState::DarkOpen, DialogState::Triggered ; "trigger")]
    #[test_case(DialogState::Triggered, DialogState::Open ; "triggered ack")]
    #[test_case(DialogState::Triggered, DialogState::Closed ; "alert fires")]
    #[test_case(DialogState::Pending, DialogState::Open ; "ack")]
    #[test_case(DialogState::Open, DialogState::Fill ; "partial fill")]
    #[test_case(DialogState::Fill, DialogState::Fill ; "another partial fill")]
    #[test_case(DialogState::Fill, DialogState::Closed ; "fully filled")]
    #[test_case(DialogState::DarkOpen, DialogState::Canceled ; "dark cancel")]
    #[test_case(DialogState::Pending, DialogState::Error ; "broker error")]
    fn allowed(from: DialogState, to: DialogState) {
        assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
    }

    #[test_case(DialogState::Created, DialogState::Open ; "open before submit")]
    #[test_case(DialogState::DarkOpen, DialogState::Open ; "dark skips trigger")]
    #[test_case(DialogState::DarkOpen, DialogState::Fill ; "dark fill")]
    #[test_case(DialogState::Pending, DialogState::DarkOpen ; "live to dark")]
    #[test_case(DialogState::Closed, DialogState::Open ; "reopen closed")]
    #[test_case(DialogState::Canceled, DialogState::Error ; "error after cancel")]
    #[test_case(DialogState::Error, DialogState::Canceled ; "cancel after error")]
    fn rejected(from: DialogState, to: DialogState) {
        assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for state in [DialogState::Closed, DialogState::Canceled, DialogState::Error] {
            assert!(state.is_terminal());
            assert!(state.valid_next_states().is_empty());
        }
    }

    #[test]
    fn every_live_state_can_fail_or_cancel() {
        for state in ALL.iter().filter(|s| !s.is_terminal()) {
            let next = state.valid_next_states();
            assert!(next.contains(&DialogState::Canceled), "{state}");
            assert!(next.contains(&DialogState::Error), "{state}");
        }
    }

    #[test]
    fn resp_mapping() {
        assert_eq!(DialogState::Created.resp(), None);
        assert_eq!(DialogState::DarkOpen.resp(), Some(Resp::DarkOpen));
        assert_eq!(DialogState::Fill.resp(), Some(Resp::Fill));
    }
}
