use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds. Only used for audit stamps; scheduling is by calendar date.
pub type Ms = i64;

/// Calendar date in the dairy's local time.
pub type Date = NaiveDate;

/// Display-only conversion factor. Packets are the unit of record.
pub const LITERS_PER_PACKET: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// A quantity in packets.
///
/// Serialized as its decimal string so WAL payloads stay exact and
/// self-describing formats are not required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Packets(pub Decimal);

impl Packets {
    pub const ZERO: Packets = Packets(Decimal::ZERO);

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn liters(&self) -> Decimal {
        (self.0 * LITERS_PER_PACKET).normalize()
    }
}

impl From<u32> for Packets {
    fn from(n: u32) -> Self {
        Packets(Decimal::from(n))
    }
}

impl Add for Packets {
    type Output = Packets;

    fn add(self, rhs: Packets) -> Packets {
        Packets(self.0 + rhs.0)
    }
}

impl AddAssign for Packets {
    fn add_assign(&mut self, rhs: Packets) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for Packets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Packets {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Packets)
    }
}

impl Serialize for Packets {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Packets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Returned when a textual enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Plain enums that travel as lowercase text on the wire.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

text_enum!(
    /// Delivery round. `Both` means the line goes out on the morning and the evening round.
    Shift, "shift" {
        Morning => "morning",
        Evening => "evening",
        Both => "both",
    }
);

impl Shift {
    /// Whether a line delivered in `self` belongs on a list filtered to `filter`.
    pub fn satisfies(self, filter: Shift) -> bool {
        filter == Shift::Both || self == Shift::Both || self == filter
    }
}

text_enum!(
    CustomerStatus, "customer status" {
        Trial => "trial",
        Active => "active",
        Paused => "paused",
        Stopped => "stopped",
    }
);

impl CustomerStatus {
    pub fn receives_deliveries(self) -> bool {
        matches!(self, CustomerStatus::Trial | CustomerStatus::Active)
    }
}

text_enum!(
    SubscriptionStatus, "subscription status" {
        Draft => "draft",
        Active => "active",
        Paused => "paused",
        Stopped => "stopped",
    }
);

text_enum!(
    /// Recurrence rule deciding which dates are scheduled without an override.
    SubscriptionMode, "subscription mode" {
        FixedDaily => "fixed_daily",
        WeeklyPattern => "weekly_pattern",
        DayByDay => "day_by_day",
        Irregular => "irregular",
    }
);

impl SubscriptionMode {
    /// Modes with no implicit recurrence: every delivery comes from a date override.
    pub fn is_override_driven(self) -> bool {
        matches!(self, SubscriptionMode::DayByDay | SubscriptionMode::Irregular)
    }
}

text_enum!(
    LineSource, "line source" {
        Base => "base",
        Override => "override",
        Added => "added",
    }
);

/// Days of the week as a bit set. Bit `n` is weekday `n`, 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: WeekdaySet = WeekdaySet(0);
    pub const ALL: WeekdaySet = WeekdaySet(0b0111_1111);

    /// Build from weekday numbers. Returns `None` if any day is outside 0..=6.
    pub fn from_days(days: &[u8]) -> Option<Self> {
        let mut bits = 0u8;
        for &d in days {
            if d > 6 {
                return None;
            }
            bits |= 1 << d;
        }
        Some(WeekdaySet(bits))
    }

    pub fn contains(&self, day: u8) -> bool {
        day <= 6 && self.0 & (1 << day) != 0
    }

    pub fn contains_date(&self, date: Date) -> bool {
        self.contains(weekday_index(date))
    }

    pub fn is_empty(&self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    /// False if bits outside the seven weekdays are set (only reachable through corrupt input).
    pub fn is_valid(&self) -> bool {
        self.0 & !Self::ALL.0 == 0
    }

    pub fn days(&self) -> impl Iterator<Item = u8> + '_ {
        (0u8..7).filter(move |d| self.contains(*d))
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days: Vec<String> = self.days().map(|d| d.to_string()).collect();
        f.write_str(&days.join(","))
    }
}

impl FromStr for WeekdaySet {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || UnknownVariant {
            kind: "weekday list",
            value: s.to_string(),
        };
        let mut days = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            days.push(part.parse::<u8>().map_err(|_| bad())?);
        }
        WeekdaySet::from_days(&days).ok_or_else(bad)
    }
}

/// Weekday number with Sunday = 0, matching the weekly-pattern encoding.
pub fn weekday_index(date: Date) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// A default that can be changed permanently from a given date onward.
///
/// Reads are always "as of" a date, so a permanent change never rewrites
/// what an earlier date resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    initial: T,
    /// Sorted by date, at most one change per date.
    changes: Vec<(Date, T)>,
}

impl<T: Copy + PartialEq> Versioned<T> {
    pub fn new(initial: T) -> Self {
        Self {
            initial,
            changes: Vec::new(),
        }
    }

    pub fn at(&self, date: Date) -> T {
        let idx = self.changes.partition_point(|(d, _)| *d <= date);
        if idx == 0 {
            self.initial
        } else {
            self.changes[idx - 1].1
        }
    }

    pub fn current(&self) -> T {
        self.changes.last().map_or(self.initial, |(_, v)| *v)
    }

    /// Make `value` the default from `from` onward. Changes scheduled at or
    /// after `from` are superseded.
    pub fn set_from(&mut self, from: Date, value: T) {
        let keep = self.changes.partition_point(|(d, _)| *d < from);
        self.changes.truncate(keep);
        self.changes.push((from, value));
    }

    /// False when `set_from(from, value)` would leave every read unchanged.
    pub fn would_change(&self, from: Date, value: T) -> bool {
        self.at(from) != value || self.changes.iter().any(|(d, _)| *d > from)
    }

    pub fn initial(&self) -> T {
        self.initial
    }

    pub fn changes(&self) -> &[(Date, T)] {
        &self.changes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub name: Option<String>,
    pub status: CustomerStatus,
    pub area: Option<String>,
    pub delivery_boy_id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Ulid,
    /// Back-reference to the owning customer. Checked on every resolution.
    pub customer_id: Ulid,
    pub product_id: Ulid,
    pub mode: SubscriptionMode,
    /// Only meaningful for `WeeklyPattern`.
    pub weekdays: WeekdaySet,
    /// Dates before this are never scheduled by the pattern.
    pub start_date: Option<Date>,
    pub status: SubscriptionStatus,
    pub quantity: Versioned<Packets>,
    pub shift: Versioned<Shift>,
}

/// Inclusive date range during which base deliveries are suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseInterval {
    pub id: Ulid,
    pub subscription_id: Ulid,
    pub start: Date,
    /// `None` = paused until further notice.
    pub end: Option<Date>,
}

impl PauseInterval {
    pub fn covers(&self, date: Date) -> bool {
        self.start <= date && self.end.is_none_or(|end| date <= end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRecord {
    pub subscription_id: Ulid,
    pub reason: Option<String>,
    /// First date with no delivery.
    pub stopped_at: Date,
}

/// Date-scoped correction. Never touches the subscription's defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub customer_id: Ulid,
    pub subscription_id: Ulid,
    pub date: Date,
    pub quantity: Option<Packets>,
    pub shift: Option<Shift>,
}

/// One-off product on top of whatever the subscriptions resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedProductEntry {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub product_id: Ulid,
    /// `None` = deliver whenever available; left to a planner, never resolved here.
    pub date: Option<Date>,
    pub quantity: Packets,
    pub shift: Shift,
    pub added_by: Option<String>,
    pub added_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Ulid,
    pub quantity: Packets,
    pub shift: Shift,
    pub source: LineSource,
    pub subscription_id: Option<Ulid>,
    pub entry_id: Option<Ulid>,
}

impl LineItem {
    pub fn liters(&self) -> Decimal {
        self.quantity.liters()
    }
}

/// Everything to deliver to one customer on one date. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDelivery {
    pub customer_id: Ulid,
    pub date: Date,
    pub lines: Vec<LineItem>,
}

impl ResolvedDelivery {
    pub fn empty(customer_id: Ulid, date: Date) -> Self {
        Self {
            customer_id,
            date,
            lines: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// ── In-memory state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub subscription: Subscription,
    /// Sorted by `start`.
    pub pauses: Vec<PauseInterval>,
    pub stop: Option<StopRecord>,
    pub overrides: BTreeMap<Date, DateOverride>,
}

impl SubscriptionState {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            pauses: Vec::new(),
            stop: None,
            overrides: BTreeMap::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some() || self.subscription.status == SubscriptionStatus::Stopped
    }

    /// Insert or replace a pause, keeping `pauses` sorted by start date.
    pub fn upsert_pause(&mut self, pause: PauseInterval) {
        self.remove_pause(pause.id);
        let pos = self
            .pauses
            .binary_search_by_key(&pause.start, |p| p.start)
            .unwrap_or_else(|e| e);
        self.pauses.insert(pos, pause);
    }

    pub fn remove_pause(&mut self, id: Ulid) -> Option<PauseInterval> {
        let pos = self.pauses.iter().position(|p| p.id == id)?;
        Some(self.pauses.remove(pos))
    }
}

#[derive(Debug, Clone)]
pub struct CustomerState {
    pub customer: Customer,
    /// Keyed by subscription id so iteration order is stable.
    pub subscriptions: BTreeMap<Ulid, SubscriptionState>,
    /// Dated entries sorted by `(date, id)`; undated entries last.
    pub additions: Vec<AddedProductEntry>,
}

impl CustomerState {
    pub fn new(customer: Customer) -> Self {
        Self {
            customer,
            subscriptions: BTreeMap::new(),
            additions: Vec::new(),
        }
    }

    pub fn insert_addition(&mut self, entry: AddedProductEntry) {
        self.remove_addition(entry.id);
        let key = addition_sort_key(&entry);
        let pos = self
            .additions
            .binary_search_by(|e| addition_sort_key(e).cmp(&key))
            .unwrap_or_else(|e| e);
        self.additions.insert(pos, entry);
    }

    pub fn remove_addition(&mut self, id: Ulid) -> Option<AddedProductEntry> {
        let pos = self.additions.iter().position(|e| e.id == id)?;
        Some(self.additions.remove(pos))
    }

    pub fn find_addition(&self, id: Ulid) -> Option<&AddedProductEntry> {
        self.additions.iter().find(|e| e.id == id)
    }
}

/// `None` dates sort after every real date.
fn addition_sort_key(entry: &AddedProductEntry) -> (bool, Option<Date>, Ulid) {
    (entry.date.is_none(), entry.date, entry.id)
}

/// Every state change, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CustomerUpserted {
        customer: Customer,
    },
    CustomerStatusChanged {
        id: Ulid,
        status: CustomerStatus,
    },
    SubscriptionCreated {
        subscription: Subscription,
    },
    SubscriptionStatusChanged {
        id: Ulid,
        customer_id: Ulid,
        status: SubscriptionStatus,
    },
    ShiftChanged {
        id: Ulid,
        customer_id: Ulid,
        shift: Shift,
        effective_from: Date,
    },
    QuantityChanged {
        id: Ulid,
        customer_id: Ulid,
        quantity: Packets,
        effective_from: Date,
    },
    PauseSet {
        customer_id: Ulid,
        pause: PauseInterval,
    },
    PauseCleared {
        id: Ulid,
        subscription_id: Ulid,
        customer_id: Ulid,
    },
    PausesResumed {
        subscription_id: Ulid,
        customer_id: Ulid,
        resume_on: Date,
    },
    SubscriptionStopped {
        customer_id: Ulid,
        record: StopRecord,
    },
    OverrideSet {
        date_override: DateOverride,
    },
    OverrideCleared {
        customer_id: Ulid,
        subscription_id: Ulid,
        date: Date,
    },
    AdditionAdded {
        entry: AddedProductEntry,
    },
    AdditionRemoved {
        id: Ulid,
        customer_id: Ulid,
    },
}

impl Event {
    /// The customer whose state the event changes.
    pub fn customer_id(&self) -> Ulid {
        match self {
            Event::CustomerUpserted { customer } => customer.id,
            Event::CustomerStatusChanged { id, .. } => *id,
            Event::SubscriptionCreated { subscription } => subscription.customer_id,
            Event::SubscriptionStatusChanged { customer_id, .. }
            | Event::ShiftChanged { customer_id, .. }
            | Event::QuantityChanged { customer_id, .. }
            | Event::PauseSet { customer_id, .. }
            | Event::PauseCleared { customer_id, .. }
            | Event::PausesResumed { customer_id, .. }
            | Event::SubscriptionStopped { customer_id, .. }
            | Event::OverrideCleared { customer_id, .. }
            | Event::AdditionRemoved { customer_id, .. } => *customer_id,
            Event::OverrideSet { date_override } => date_override.customer_id,
            Event::AdditionAdded { entry } => entry.customer_id,
        }
    }
}
