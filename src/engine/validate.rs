use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// The local calendar date. The engine's default clock.
pub fn today() -> Date {
    chrono::Local::now().date_naive()
}

pub(crate) fn validate_date(date: Date) -> Result<(), EngineError> {
    if date < min_valid_date() || date > max_valid_date() {
        return Err(EngineError::validation(format!(
            "date {date} outside {} to {}",
            min_valid_date(),
            max_valid_date()
        )));
    }
    Ok(())
}

/// Permanent changes only ever take effect from today onward.
pub(crate) fn validate_effective_from(effective_from: Date, today: Date) -> Result<(), EngineError> {
    validate_date(effective_from)?;
    if effective_from < today {
        return Err(EngineError::validation(format!(
            "permanent change cannot start in the past: {effective_from} is before {today}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_range(from: Date, to: Date) -> Result<(), EngineError> {
    validate_date(from)?;
    validate_date(to)?;
    if from > to {
        return Err(EngineError::validation(format!("range starts after it ends: {from} > {to}")));
    }
    if (to - from).num_days() + 1 > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

/// Zero is allowed: it is how a date gets suppressed.
pub(crate) fn validate_quantity(quantity: Packets) -> Result<(), EngineError> {
    if quantity.is_negative() {
        return Err(EngineError::validation(format!("negative quantity: {quantity}")));
    }
    if quantity > Packets::from(MAX_QUANTITY_PACKETS) {
        return Err(EngineError::LimitExceeded("quantity too large"));
    }
    Ok(())
}

/// One-off additions must actually add something.
pub(crate) fn validate_added_quantity(quantity: Packets) -> Result<(), EngineError> {
    validate_quantity(quantity)?;
    if !quantity.is_positive() {
        return Err(EngineError::validation("added product quantity must be positive"));
    }
    Ok(())
}

pub(crate) fn validate_text(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.is_some_and(|v| v.len() > max) {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_pause(pause: &PauseInterval) -> Result<(), EngineError> {
    validate_date(pause.start)?;
    if let Some(end) = pause.end {
        validate_date(end)?;
        if end < pause.start {
            return Err(EngineError::validation(format!(
                "pause ends before it starts: {} > {end}",
                pause.start
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_subscription(sub: &Subscription) -> Result<(), EngineError> {
    validate_quantity(sub.quantity.current())?;
    if let Some(start) = sub.start_date {
        validate_date(start)?;
    }
    if !sub.weekdays.is_valid() {
        return Err(EngineError::validation("weekday set out of range"));
    }
    if sub.mode == SubscriptionMode::WeeklyPattern && sub.weekdays.is_empty() {
        return Err(EngineError::validation("weekly_pattern needs at least one weekday"));
    }
    if sub.status == SubscriptionStatus::Stopped {
        return Err(EngineError::validation("a subscription cannot be created stopped; use a stop instead"));
    }
    Ok(())
}

/// Stopped is terminal from `stopped_at` on: nothing may pause, override or re-default
/// a date the stop already covers. Dates before a scheduled stop stay writable.
pub(crate) fn ensure_not_stopped_on(ss: &SubscriptionState, date: Date) -> Result<(), EngineError> {
    let stopped = match &ss.stop {
        Some(record) => record.stopped_at <= date,
        None => ss.subscription.status == SubscriptionStatus::Stopped,
    };
    if stopped {
        return Err(EngineError::Conflict(ss.subscription.id));
    }
    Ok(())
}

/// Status moves allowed through `set_subscription_status`. Stopping has its own
/// operation because it records a date and a reason.
pub(crate) fn check_transition(
    id: ulid::Ulid,
    from: SubscriptionStatus,
    to: SubscriptionStatus,
) -> Result<(), EngineError> {
    use SubscriptionStatus::*;
    match (from, to) {
        (Stopped, _) => Err(EngineError::Conflict(id)),
        (Draft, Active | Paused) | (Active, Paused) | (Paused, Active) => Ok(()),
        (a, b) if a == b => Ok(()),
        _ => Err(EngineError::InvalidTransition { id, from, to }),
    }
}
