use tracing::{error, warn};

use crate::model::*;

use super::gating::{gate, Gate};
use super::ledger::{additions_on, as_line};
use super::overrides::{apply_overrides, Outcome};
use super::pattern::{evaluate_base, Base};
use super::EngineError;

// ── Delivery resolution ─────────────────────────────────────────

/// Resolve everything one customer receives on `date`.
///
/// 1. customers that are not trial/active get nothing, add-ons included;
/// 2. draft and status-paused subscriptions contribute nothing;
/// 3. stopped/paused gating suppresses the subscription for the date;
/// 4. open subscriptions go through pattern then overrides;
/// 5. added entries for the date are appended regardless of any gating.
///
/// Pure over `state`. The only failure is a subscription whose back-reference
/// does not point at this customer.
pub fn resolve(state: &CustomerState, date: Date) -> Result<ResolvedDelivery, EngineError> {
    let customer = &state.customer;
    check_integrity(state)?;

    let mut delivery = ResolvedDelivery::empty(customer.id, date);
    if !customer.status.receives_deliveries() {
        return Ok(delivery);
    }

    delivery
        .lines
        .extend(state.subscriptions.values().filter_map(|ss| resolve_subscription(ss, date)));
    delivery
        .lines
        .extend(additions_on(&state.additions, date).iter().map(as_line));
    Ok(delivery)
}

pub(crate) fn check_integrity(state: &CustomerState) -> Result<(), EngineError> {
    for ss in state.subscriptions.values() {
        if ss.subscription.customer_id != state.customer.id {
            error!(
                subscription_id = %ss.subscription.id,
                customer_id = %ss.subscription.customer_id,
                owner = %state.customer.id,
                "subscription back-reference mismatch"
            );
            metrics::counter!(crate::observability::INTEGRITY_ERRORS_TOTAL).increment(1);
            return Err(EngineError::Integrity {
                subscription_id: ss.subscription.id,
                customer_id: ss.subscription.customer_id,
            });
        }
    }
    Ok(())
}

/// The base/override line a single subscription contributes on `date`, if any.
pub fn resolve_subscription(ss: &SubscriptionState, date: Date) -> Option<LineItem> {
    let sub = &ss.subscription;
    if matches!(sub.status, SubscriptionStatus::Draft | SubscriptionStatus::Paused) {
        return None;
    }
    if gate(ss, date) != Gate::Open {
        return None;
    }

    let base = evaluate_base(sub, date).unwrap_or_else(|e| {
        warn!(subscription_id = %sub.id, %date, "treating as not scheduled: {e}");
        metrics::counter!(crate::observability::RESOLUTION_ANOMALIES_TOTAL).increment(1);
        Base::NotScheduled
    });

    match apply_overrides(base, ss.overrides.get(&date), sub.shift.at(date)) {
        Outcome::Deliver {
            quantity,
            shift,
            overridden,
        } => Some(LineItem {
            product_id: sub.product_id,
            quantity,
            shift,
            source: if overridden {
                LineSource::Override
            } else {
                LineSource::Base
            },
            subscription_id: Some(sub.id),
            entry_id: None,
        }),
        Outcome::Suppressed | Outcome::NotScheduled => None,
    }
}

/// Subscriptions that would deliver on `date` if they were not paused.
/// Used by the calendar to mark paused days.
pub fn paused_on(state: &CustomerState, date: Date) -> Vec<ulid::Ulid> {
    state
        .subscriptions
        .values()
        .filter(|ss| ss.subscription.status == SubscriptionStatus::Active && gate(ss, date) == Gate::Paused)
        .map(|ss| ss.subscription.id)
        .collect()
}
