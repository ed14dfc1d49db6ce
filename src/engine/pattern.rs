use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// What the recurrence rule alone says about a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    Scheduled { quantity: Packets, shift: Shift },
    NotScheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeError {
    #[error("subscription {0} uses weekly_pattern without any weekdays")]
    EmptyWeeklyPattern(Ulid),
    #[error("subscription {0} has a corrupt weekday set")]
    CorruptWeekdays(Ulid),
}

/// Base delivery from the subscription's mode. Defaults are read as of `date`,
/// so permanent changes never leak into earlier dates.
///
/// `DayByDay` and `Irregular` are never scheduled here; the override layer is the
/// only thing that can put a delivery on those subscriptions.
pub fn evaluate_base(sub: &Subscription, date: Date) -> Result<Base, ModeError> {
    if sub.start_date.is_some_and(|start| date < start) {
        return Ok(Base::NotScheduled);
    }
    let scheduled = match sub.mode {
        SubscriptionMode::FixedDaily => true,
        SubscriptionMode::WeeklyPattern => {
            if !sub.weekdays.is_valid() {
                return Err(ModeError::CorruptWeekdays(sub.id));
            }
            if sub.weekdays.is_empty() {
                return Err(ModeError::EmptyWeeklyPattern(sub.id));
            }
            sub.weekdays.contains_date(date)
        }
        SubscriptionMode::DayByDay | SubscriptionMode::Irregular => false,
    };
    if scheduled {
        Ok(Base::Scheduled {
            quantity: sub.quantity.at(date),
            shift: sub.shift.at(date),
        })
    } else {
        Ok(Base::NotScheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(day: u32) -> Date {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
    }

    fn sub(mode: SubscriptionMode, days: &[u8]) -> Subscription {
        Subscription {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            product_id: Ulid::new(),
            mode,
            weekdays: WeekdaySet::from_days(days).unwrap(),
            start_date: None,
            status: SubscriptionStatus::Active,
            quantity: Versioned::new(Packets::from(2)),
            shift: Versioned::new(Shift::Morning),
        }
    }

    #[test]
    fn fixed_daily_is_always_scheduled() {
        let s = sub(SubscriptionMode::FixedDaily, &[]);
        for day in 1..=31 {
            assert_eq!(
                evaluate_base(&s, d(day)).unwrap(),
                Base::Scheduled { quantity: Packets::from(2), shift: Shift::Morning }
            );
        }
    }

    #[test]
    fn weekly_pattern_follows_weekdays() {
        // Mon, Wed, Fri. 2026-10-12 is a Monday.
        let s = sub(SubscriptionMode::WeeklyPattern, &[1, 3, 5]);
        assert!(matches!(evaluate_base(&s, d(12)).unwrap(), Base::Scheduled { .. }));
        assert_eq!(evaluate_base(&s, d(13)).unwrap(), Base::NotScheduled);
        assert!(matches!(evaluate_base(&s, d(14)).unwrap(), Base::Scheduled { .. }));
        assert!(matches!(evaluate_base(&s, d(16)).unwrap(), Base::Scheduled { .. }));
        assert_eq!(evaluate_base(&s, d(17)).unwrap(), Base::NotScheduled);
        assert_eq!(evaluate_base(&s, d(18)).unwrap(), Base::NotScheduled);
    }

    #[test]
    fn override_driven_modes_never_schedule() {
        for mode in [SubscriptionMode::DayByDay, SubscriptionMode::Irregular] {
            let s = sub(mode, &[0, 1, 2, 3, 4, 5, 6]);
            assert_eq!(evaluate_base(&s, d(12)).unwrap(), Base::NotScheduled);
        }
    }

    #[test]
    fn empty_weekly_pattern_is_invalid_mode() {
        let s = sub(SubscriptionMode::WeeklyPattern, &[]);
        assert_eq!(evaluate_base(&s, d(12)), Err(ModeError::EmptyWeeklyPattern(s.id)));
    }

    #[test]
    fn before_start_date_not_scheduled() {
        let mut s = sub(SubscriptionMode::FixedDaily, &[]);
        s.start_date = Some(d(15));
        assert_eq!(evaluate_base(&s, d(14)).unwrap(), Base::NotScheduled);
        assert!(matches!(evaluate_base(&s, d(15)).unwrap(), Base::Scheduled { .. }));
    }

    #[test]
    fn defaults_read_as_of_date() {
        let mut s = sub(SubscriptionMode::FixedDaily, &[]);
        s.shift.set_from(d(20), Shift::Evening);
        s.quantity.set_from(d(25), Packets::from(3));
        assert_eq!(
            evaluate_base(&s, d(19)).unwrap(),
            Base::Scheduled { quantity: Packets::from(2), shift: Shift::Morning }
        );
        assert_eq!(
            evaluate_base(&s, d(20)).unwrap(),
            Base::Scheduled { quantity: Packets::from(2), shift: Shift::Evening }
        );
        assert_eq!(
            evaluate_base(&s, d(26)).unwrap(),
            Base::Scheduled { quantity: Packets::from(3), shift: Shift::Evening }
        );
    }
}
