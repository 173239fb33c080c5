//! Dark order triggers.
//!
//! A trigger watches one price level. Its direction is fixed the first time
//! a price is known: a level above the market fires when the price rises to
//! it, any other level fires when the price falls to it.

use rust_decimal::Decimal;

/// Which way the price must cross the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDirection {
    /// Fires at or above the level.
    Above,
    /// Fires at or below the level.
    Below,
}

impl TriggerDirection {
    /// Direction for `level` given the current market price.
    #[must_use]
    pub fn for_level(level: Decimal, last: Decimal) -> Self {
        if level > last { Self::Above } else { Self::Below }
    }
}

/// Price condition held by a dark dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DarkTrigger {
    level: Decimal,
    direction: Option<TriggerDirection>,
}

impl DarkTrigger {
    /// Unarmed trigger at `level`.
    #[must_use]
    pub const fn new(level: Decimal) -> Self {
        Self {
            level,
            direction: None,
        }
    }

    /// Trigger level.
    #[must_use]
    pub const fn level(&self) -> Decimal {
        self.level
    }

    /// Direction, once a price has been seen.
    #[must_use]
    pub const fn direction(&self) -> Option<TriggerDirection> {
        self.direction
    }

    /// Evaluate `price`, arming the trigger on the first price seen.
    #[must_use]
    pub fn check(&mut self, price: Decimal) -> bool {
        let level = self.level;
        let direction = *self
            .direction
            .get_or_insert_with(|| TriggerDirection::for_level(level, price));
        match direction {
            TriggerDirection::Above => price >= level,
            TriggerDirection::Below => price <= level,
        }
    }
}
