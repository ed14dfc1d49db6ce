use crate::model::*;

/// Added entries for `date`, in `(date, id)` order. Never gated by any subscription.
pub fn additions_on(additions: &[AddedProductEntry], date: Date) -> &[AddedProductEntry] {
    let lo = additions.partition_point(|e| e.date.is_some_and(|d| d < date));
    let hi = additions.partition_point(|e| e.date.is_some_and(|d| d <= date));
    &additions[lo..hi]
}

/// Entries waiting for a planner to give them a date.
pub fn undated(additions: &[AddedProductEntry]) -> &[AddedProductEntry] {
    let first = additions.partition_point(|e| e.date.is_some());
    &additions[first..]
}

pub fn as_line(entry: &AddedProductEntry) -> LineItem {
    LineItem {
        product_id: entry.product_id,
        quantity: entry.quantity,
        shift: entry.shift,
        source: LineSource::Added,
        subscription_id: None,
        entry_id: Some(entry.id),
    }
}
