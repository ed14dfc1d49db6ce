use chrono::NaiveDate;

use crate::model::Date;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_CUSTOMERS_PER_TENANT: usize = 200_000;
pub const MAX_SUBSCRIPTIONS_PER_CUSTOMER: usize = 64;
pub const MAX_PAUSES_PER_SUBSCRIPTION: usize = 512;
pub const MAX_OVERRIDES_PER_SUBSCRIPTION: usize = 4_096;
pub const MAX_ADDITIONS_PER_CUSTOMER: usize = 4_096;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1_024;

/// Widest inclusive date range a single projection may cover.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Upper bound on a single line quantity, in packets.
pub const MAX_QUANTITY_PACKETS: u32 = 10_000;

/// Accepted calendar window. Keeps date arithmetic far from chrono's edges.
pub fn min_valid_date() -> Date {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn max_valid_date() -> Date {
    NaiveDate::from_ymd_opt(2199, 12, 31).unwrap_or(NaiveDate::MAX)
}
