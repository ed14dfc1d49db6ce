use chrono::Days;

use crate::model::*;

// ── Pause / stop gating ─────────────────────────────────────────

/// Outcome of the pause/stop check for one subscription on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Paused,
    Stopped,
}

/// Stopped beats paused beats open. Stopped holds from `stopped_at` inclusive
/// and nothing layered on top can reopen it.
pub fn gate(state: &SubscriptionState, date: Date) -> Gate {
    match &state.stop {
        Some(stop) if date >= stop.stopped_at => return Gate::Stopped,
        // A stopped status without a record has no start date: stopped everywhere.
        None if state.subscription.status == SubscriptionStatus::Stopped => return Gate::Stopped,
        _ => {}
    }
    if is_paused(&state.pauses, date) {
        Gate::Paused
    } else {
        Gate::Open
    }
}

/// True if any interval covers `date`. Overlapping intervals behave as their union.
/// `pauses` must be sorted by start.
pub fn is_paused(pauses: &[PauseInterval], date: Date) -> bool {
    // Everything at index >= right_bound starts after `date` → can't cover it.
    let right_bound = pauses.partition_point(|p| p.start <= date);
    pauses[..right_bound].iter().any(|p| p.covers(date))
}

/// Inclusive date span; `end == None` runs forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSpan {
    pub start: Date,
    pub end: Option<Date>,
}

/// Collapse overlapping and adjacent pauses into disjoint spans for display.
/// Gating never needs this; the union is implicit there.
pub fn merged_pauses(pauses: &[PauseInterval]) -> Vec<DateSpan> {
    let mut sorted: Vec<DateSpan> = pauses
        .iter()
        .map(|p| DateSpan {
            start: p.start,
            end: p.end,
        })
        .collect();
    sorted.sort_by_key(|s| s.start);

    let mut merged: Vec<DateSpan> = Vec::new();
    for span in sorted {
        if let Some(last) = merged.last_mut() {
            match last.end {
                None => continue,
                Some(last_end) if last_end.checked_add_days(Days::new(1)).is_some_and(|next| span.start <= next) => {
                    last.end = match span.end {
                        None => None,
                        Some(end) => Some(end.max(last_end)),
                    };
                    continue;
                }
                _ => {}
            }
        }
        merged.push(span);
    }
    merged
}

/// Effect of resuming deliveries on `resume_on`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Resumption {
    /// Pauses that covered `resume_on`, cut to end the day before.
    pub truncated: Vec<PauseInterval>,
    /// Pauses that would have started on `resume_on`.
    pub removed: Vec<ulid::Ulid>,
}

impl Resumption {
    pub fn is_empty(&self) -> bool {
        self.truncated.is_empty() && self.removed.is_empty()
    }
}

/// Work out which pauses a resume on `resume_on` closes. Pauses starting
/// after that date are planned separately and stay untouched.
pub fn plan_resume(pauses: &[PauseInterval], resume_on: Date) -> Resumption {
    let mut plan = Resumption::default();
    for p in pauses.iter().filter(|p| p.covers(resume_on)) {
        match resume_on.checked_sub_days(Days::new(1)) {
            Some(day_before) if p.start <= day_before => plan.truncated.push(PauseInterval {
                end: Some(day_before),
                ..p.clone()
            }),
            _ => plan.removed.push(p.id),
        }
    }
    plan
}
