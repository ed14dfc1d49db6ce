use std::collections::BTreeMap;

use chrono::{Datelike, Days, Months, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::resolve::{paused_on, resolve};
use super::EngineError;

// ── Calendar / list projection ──────────────────────────────────

/// Pre-resolution filters (customer fields) and post-resolution filters (line fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFilter {
    pub date: Date,
    pub area: Option<String>,
    pub delivery_boy_id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
    pub status: Option<CustomerStatus>,
    pub shift: Option<Shift>,
    pub product_id: Option<Ulid>,
}

impl DeliveryFilter {
    pub fn for_date(date: Date) -> Self {
        Self {
            date,
            area: None,
            delivery_boy_id: None,
            staff_id: None,
            status: None,
            shift: None,
            product_id: None,
        }
    }

    pub fn admits_customer(&self, customer: &Customer) -> bool {
        self.area.as_ref().is_none_or(|a| customer.area.as_ref() == Some(a))
            && self.delivery_boy_id.is_none_or(|b| customer.delivery_boy_id == Some(b))
            && self.staff_id.is_none_or(|s| customer.staff_id == Some(s))
            && self.status.is_none_or(|s| customer.status == s)
    }

    /// Records with no customer behind them (orphans) pass only when no customer
    /// field is filtered on.
    pub fn admits_missing_customer(&self) -> bool {
        self.area.is_none() && self.delivery_boy_id.is_none() && self.staff_id.is_none() && self.status.is_none()
    }

    /// Shift filtering happens here, after resolution; stored shifts are never touched.
    pub fn admits_line(&self, line: &LineItem) -> bool {
        self.shift.is_none_or(|s| line.shift.satisfies(s)) && self.product_id.is_none_or(|p| line.product_id == p)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRow {
    pub customer_id: Ulid,
    pub name: Option<String>,
    pub area: Option<String>,
    pub delivery_boy_id: Option<Ulid>,
    pub lines: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductTotal {
    pub product_id: Ulid,
    pub quantity: Packets,
    pub lines: usize,
}

impl ProductTotal {
    pub fn liters(&self) -> Decimal {
        self.quantity.liters()
    }
}

/// A record that could not be resolved. Reported next to the list instead of vanishing.
#[derive(Debug)]
pub struct ResolutionFailure {
    pub customer_id: Ulid,
    pub error: EngineError,
}

#[derive(Debug)]
pub struct DeliveryList {
    pub date: Date,
    pub rows: Vec<CustomerRow>,
    pub totals: Vec<ProductTotal>,
    pub failures: Vec<ResolutionFailure>,
}

/// Stable order for lines on a row: product, shift, source, then origin id.
pub fn sort_lines(lines: &mut [LineItem]) {
    lines.sort_by_key(|l| (l.product_id, l.shift, l.source, l.subscription_id, l.entry_id));
}

/// Sort key for customers on a list: name (unnamed last), then id.
pub fn customer_sort_key(customer: &Customer) -> (bool, Option<String>, Ulid) {
    (customer.name.is_none(), customer.name.clone(), customer.id)
}

/// Shape one customer's resolution into a list row. `None` when nothing survives the filter.
pub fn shape_row(customer: &Customer, delivery: ResolvedDelivery, filter: &DeliveryFilter) -> Option<CustomerRow> {
    let mut lines: Vec<LineItem> = delivery.lines.into_iter().filter(|l| filter.admits_line(l)).collect();
    if lines.is_empty() {
        return None;
    }
    sort_lines(&mut lines);
    Some(CustomerRow {
        customer_id: customer.id,
        name: customer.name.clone(),
        area: customer.area.clone(),
        delivery_boy_id: customer.delivery_boy_id,
        lines,
    })
}

/// Quantity totals per product, ordered by product id.
pub fn product_totals(rows: &[CustomerRow]) -> Vec<ProductTotal> {
    let mut totals: BTreeMap<Ulid, ProductTotal> = BTreeMap::new();
    for line in rows.iter().flat_map(|r| r.lines.iter()) {
        let t = totals.entry(line.product_id).or_insert(ProductTotal {
            product_id: line.product_id,
            quantity: Packets::ZERO,
            lines: 0,
        });
        t.quantity += line.quantity;
        t.lines += 1;
    }
    totals.into_values().collect()
}

// ── Month view ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCell {
    pub date: Date,
    pub lines: Vec<LineItem>,
    /// Subscriptions whose base delivery is paused on this date.
    pub paused: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthView {
    pub customer_id: Ulid,
    pub year: i32,
    pub month: u32,
    pub days: Vec<DayCell>,
}

/// First and last day of a month.
pub fn month_bounds(year: i32, month: u32) -> Result<(Date, Date), EngineError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| EngineError::validation(format!("no such month: {year}-{month:02}")))?;
    let last = first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.checked_sub_days(Days::new(1)))
        .ok_or_else(|| EngineError::validation(format!("month out of range: {year}-{month:02}")))?;
    Ok((first, last))
}

/// Every date of an inclusive range.
pub fn dates(from: Date, to: Date) -> impl Iterator<Item = Date> {
    from.iter_days().take_while(move |d| *d <= to)
}

pub fn day_cell(state: &CustomerState, date: Date) -> Result<DayCell, EngineError> {
    let mut delivery = resolve(state, date)?;
    sort_lines(&mut delivery.lines);
    Ok(DayCell {
        date,
        lines: delivery.lines,
        paused: paused_on(state, date),
    })
}

pub fn month_view(state: &CustomerState, year: i32, month: u32) -> Result<MonthView, EngineError> {
    let (first, last) = month_bounds(year, month)?;
    let days = dates(first, last)
        .map(|date| day_cell(state, date))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MonthView {
        customer_id: state.customer.id,
        year: first.year(),
        month: first.month(),
        days,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> Date {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    fn customer(name: Option<&str>, area: &str) -> Customer {
        Customer {
            id: Ulid::new(),
            name: name.map(Into::into),
            status: CustomerStatus::Active,
            area: Some(area.into()),
            delivery_boy_id: None,
            staff_id: None,
        }
    }

    fn line(product_id: Ulid, qty: u32, shift: Shift) -> LineItem {
        LineItem {
            product_id,
            quantity: Packets::from(qty),
            shift,
            source: LineSource::Base,
            subscription_id: None,
            entry_id: None,
        }
    }

    #[test]
    fn customer_filters() {
        let c = customer(Some("Asha"), "north");
        let mut f = DeliveryFilter::for_date(d(10, 14));
        assert!(f.admits_customer(&c));
        f.area = Some("south".into());
        assert!(!f.admits_customer(&c));
        f.area = Some("north".into());
        f.status = Some(CustomerStatus::Trial);
        assert!(!f.admits_customer(&c));
        f.status = None;
        f.delivery_boy_id = Some(Ulid::new());
        assert!(!f.admits_customer(&c));
    }

    #[test]
    fn any_customer_filter_excludes_orphans() {
        let mut f = DeliveryFilter::for_date(d(10, 14));
        f.shift = Some(Shift::Evening);
        assert!(f.admits_missing_customer());
        f.status = Some(CustomerStatus::Trial);
        assert!(!f.admits_missing_customer());
    }

    #[test]
    fn both_line_survives_morning_filter() {
        let c = customer(Some("Asha"), "north");
        let p = Ulid::new();
        let mut f = DeliveryFilter::for_date(d(10, 14));
        f.shift = Some(Shift::Morning);
        let delivery = ResolvedDelivery {
            customer_id: c.id,
            date: f.date,
            lines: vec![line(p, 1, Shift::Both), line(p, 1, Shift::Evening)],
        };
        let row = shape_row(&c, delivery, &f).unwrap();
        assert_eq!(row.lines.len(), 1);
        assert_eq!(row.lines[0].shift, Shift::Both);
    }

    #[test]
    fn fully_filtered_row_is_dropped() {
        let c = customer(Some("Asha"), "north");
        let mut f = DeliveryFilter::for_date(d(10, 14));
        f.product_id = Some(Ulid::new());
        let delivery = ResolvedDelivery {
            customer_id: c.id,
            date: f.date,
            lines: vec![line(Ulid::new(), 1, Shift::Morning)],
        };
        assert!(shape_row(&c, delivery, &f).is_none());
    }

    #[test]
    fn totals_group_by_product() {
        let milk = Ulid::new();
        let bread = Ulid::new();
        let rows = vec![
            CustomerRow {
                customer_id: Ulid::new(),
                name: None,
                area: None,
                delivery_boy_id: None,
                lines: vec![line(milk, 2, Shift::Morning), line(bread, 1, Shift::Morning)],
            },
            CustomerRow {
                customer_id: Ulid::new(),
                name: None,
                area: None,
                delivery_boy_id: None,
                lines: vec![line(milk, 3, Shift::Evening)],
            },
        ];
        let totals = product_totals(&rows);
        let milk_total = totals.iter().find(|t| t.product_id == milk).unwrap();
        assert_eq!(milk_total.quantity, Packets::from(5));
        assert_eq!(milk_total.lines, 2);
        assert_eq!(milk_total.liters().to_string(), "2.5");
        assert_eq!(totals.len(), 2);
    }

    #[test]
    fn unnamed_customers_sort_last() {
        let mut cs = [customer(None, "a"), customer(Some("Zed"), "a"), customer(Some("Asha"), "a")];
        cs.sort_by_key(customer_sort_key);
        assert_eq!(cs[0].name.as_deref(), Some("Asha"));
        assert_eq!(cs[1].name.as_deref(), Some("Zed"));
        assert_eq!(cs[2].name, None);
    }

    #[test]
    fn month_bounds_handle_lengths() {
        assert_eq!(month_bounds(2026, 2).unwrap(), (d(2, 1), d(2, 28)));
        assert_eq!(month_bounds(2028, 2).unwrap().1, NaiveDate::from_ymd_opt(2028, 2, 29).unwrap());
        assert_eq!(month_bounds(2026, 12).unwrap().1, d(12, 31));
        assert!(month_bounds(2026, 13).is_err());
    }

    #[test]
    fn month_view_has_one_cell_per_day() {
        let mut state = CustomerState::new(customer(Some("Asha"), "north"));
        let sub = Subscription {
            id: Ulid::new(),
            customer_id: state.customer.id,
            product_id: Ulid::new(),
            mode: SubscriptionMode::WeeklyPattern,
            weekdays: WeekdaySet::from_days(&[1, 3, 5]).unwrap(),
            start_date: None,
            status: SubscriptionStatus::Active,
            quantity: Versioned::new(Packets::from(1)),
            shift: Versioned::new(Shift::Morning),
        };
        state.subscriptions.insert(sub.id, SubscriptionState::new(sub));
        let view = month_view(&state, 2026, 10).unwrap();
        assert_eq!(view.days.len(), 31);
        let delivering = view.days.iter().filter(|c| !c.lines.is_empty()).count();
        let expected = dates(d(10, 1), d(10, 31))
            .filter(|date| [1, 3, 5].contains(&weekday_index(*date)))
            .count();
        assert_eq!(delivering, expected);
    }

    #[test]
    fn date_range_is_inclusive() {
        let all: Vec<_> = dates(d(10, 30), d(11, 2)).collect();
        assert_eq!(all, vec![d(10, 30), d(10, 31), d(11, 1), d(11, 2)]);
        assert_eq!(dates(d(10, 2), d(10, 1)).count(), 0);
    }
}
