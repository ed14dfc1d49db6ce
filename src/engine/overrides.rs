use crate::model::*;

use super::pattern::Base;

/// Result of layering a date override over the base pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `overridden` is true when the override changed quantity or shift.
    Deliver {
        quantity: Packets,
        shift: Shift,
        overridden: bool,
    },
    Suppressed,
    NotScheduled,
}

/// Apply a date-scoped override to the base result.
///
/// Precedence:
/// 1. an override quantity wins, including 0 (suppresses the date);
/// 2. an override shift wins for this date only;
/// 3. with no base delivery and no override quantity the date stays unscheduled,
///    a shift on its own never creates a delivery.
///
/// `fallback_shift` is the default in effect on the date, used when an override
/// quantity schedules an otherwise unscheduled date without naming a shift.
pub fn apply_overrides(base: Base, date_override: Option<&DateOverride>, fallback_shift: Shift) -> Outcome {
    let (quantity, shift, overridden) = match (base, date_override) {
        (Base::NotScheduled, None) => return Outcome::NotScheduled,
        (Base::NotScheduled, Some(o)) => match o.quantity {
            None => return Outcome::NotScheduled,
            Some(q) => (q, o.shift.unwrap_or(fallback_shift), true),
        },
        (Base::Scheduled { quantity, shift }, None) => (quantity, shift, false),
        (Base::Scheduled { quantity, shift }, Some(o)) => {
            let q = o.quantity.unwrap_or(quantity);
            let s = o.shift.unwrap_or(shift);
            (q, s, q != quantity || s != shift)
        }
    };
    if quantity.is_positive() {
        Outcome::Deliver {
            quantity,
            shift,
            overridden,
        }
    } else {
        Outcome::Suppressed
    }
}
