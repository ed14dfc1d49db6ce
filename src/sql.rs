use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::DeliveryFilter;
use crate::model::*;

/// Parsed command from SQL input.
///
/// Dates a client may leave out (`effective_from`, `resume_on`, `stopped_at`) stay `None`
/// here; the server fills them with its current local date.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertCustomer(Customer),
    SetCustomerStatus {
        customer_id: Ulid,
        status: CustomerStatus,
    },
    CreateSubscription(Subscription),
    SetSubscriptionStatus {
        subscription_id: Ulid,
        status: SubscriptionStatus,
    },
    ChangeShift {
        subscription_id: Ulid,
        shift: Shift,
        effective_from: Option<Date>,
    },
    ChangeQuantity {
        subscription_id: Ulid,
        quantity: Packets,
        effective_from: Option<Date>,
    },
    SetPause(PauseInterval),
    ClearPause {
        id: Ulid,
    },
    Resume {
        subscription_id: Ulid,
        resume_on: Option<Date>,
    },
    Stop {
        subscription_id: Ulid,
        reason: Option<String>,
        stopped_at: Option<Date>,
    },
    StopProduct {
        customer_id: Ulid,
        product_id: Ulid,
        reason: Option<String>,
        stopped_at: Option<Date>,
    },
    SetOverride(DateOverride),
    ClearOverride {
        subscription_id: Ulid,
        date: Date,
    },
    /// `added_at` is left at zero and stamped by the engine.
    AddProduct(AddedProductEntry),
    RemoveProduct {
        id: Ulid,
    },
    SelectDeliveries {
        customer_id: Ulid,
        from: Date,
        to: Date,
    },
    SelectDeliveryList(DeliveryFilter),
    SelectProductTotals(DeliveryFilter),
    SelectCalendar {
        customer_id: Ulid,
        year: i32,
        month: u32,
    },
    SelectCustomers,
    SelectSubscriptions {
        customer_id: Ulid,
    },
    SelectPauses {
        subscription_id: Ulid,
    },
    SelectOverrides {
        subscription_id: Ulid,
    },
    SelectAdditions {
        customer_id: Ulid,
        undated_only: bool,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// What a LISTEN channel name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `customer_{id}`: changes to one customer.
    Customer(Ulid),
    /// `customers`: every change in the tenant.
    All,
}

pub fn parse_channel(channel: &str) -> Result<Channel, SqlError> {
    let channel = channel.trim().trim_matches('"');
    if channel.eq_ignore_ascii_case("customers") {
        return Ok(Channel::All);
    }
    let id = channel
        .strip_prefix("customer_")
        .ok_or_else(|| SqlError::Parse(format!("invalid channel: {channel} (expected customer_{{id}} or customers)")))?;
    Ulid::from_string(id)
        .map(Channel::Customer)
        .map_err(|e| SqlError::Parse(format!("bad ULID in channel: {e}")))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: trimmed[7..].trim().to_string(),
        });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        return Ok(Command::Unlisten {
            channel: trimmed[9..].trim().to_string(),
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const CUSTOMERS: &[&str] = &["id", "name", "status", "area", "delivery_boy_id", "staff_id"];
const CUSTOMER_STATUS: &[&str] = &["customer_id", "status"];
const SUBSCRIPTIONS: &[&str] = &[
    "id",
    "customer_id",
    "product_id",
    "mode",
    "quantity",
    "shift",
    "weekdays",
    "start_date",
    "status",
];
const SUBSCRIPTION_STATUS: &[&str] = &["subscription_id", "status"];
const SHIFT_CHANGES: &[&str] = &["subscription_id", "shift", "effective_from"];
const QUANTITY_CHANGES: &[&str] = &["subscription_id", "quantity", "effective_from"];
const PAUSES: &[&str] = &["id", "subscription_id", "start_date", "end_date"];
const RESUMES: &[&str] = &["subscription_id", "resume_on"];
const STOPS: &[&str] = &["subscription_id", "reason", "stopped_at"];
const PRODUCT_STOPS: &[&str] = &["customer_id", "product_id", "reason", "stopped_at"];
const OVERRIDES: &[&str] = &["customer_id", "subscription_id", "date", "quantity", "shift"];
const ADDITIONS: &[&str] = &["id", "customer_id", "product_id", "date", "quantity", "shift", "added_by"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let values = &rows[0];

    match table.as_str() {
        "customers" => {
            let row = Row::new("customers", CUSTOMERS, &columns, values)?;
            Ok(Command::UpsertCustomer(Customer {
                id: row.req("id")?,
                name: row.opt("name")?,
                status: row.opt("status")?.unwrap_or(CustomerStatus::Active),
                area: row.opt("area")?,
                delivery_boy_id: row.opt("delivery_boy_id")?,
                staff_id: row.opt("staff_id")?,
            }))
        }
        "customer_status" => {
            let row = Row::new("customer_status", CUSTOMER_STATUS, &columns, values)?;
            Ok(Command::SetCustomerStatus {
                customer_id: row.req("customer_id")?,
                status: row.req("status")?,
            })
        }
        "subscriptions" => {
            let row = Row::new("subscriptions", SUBSCRIPTIONS, &columns, values)?;
            Ok(Command::CreateSubscription(Subscription {
                id: row.req("id")?,
                customer_id: row.req("customer_id")?,
                product_id: row.req("product_id")?,
                mode: row.req("mode")?,
                weekdays: row.opt("weekdays")?.unwrap_or(WeekdaySet::EMPTY),
                start_date: row.opt("start_date")?,
                status: row.opt("status")?.unwrap_or(SubscriptionStatus::Active),
                quantity: Versioned::new(row.req("quantity")?),
                shift: Versioned::new(row.req("shift")?),
            }))
        }
        "subscription_status" => {
            let row = Row::new("subscription_status", SUBSCRIPTION_STATUS, &columns, values)?;
            Ok(Command::SetSubscriptionStatus {
                subscription_id: row.req("subscription_id")?,
                status: row.req("status")?,
            })
        }
        "shift_changes" => {
            let row = Row::new("shift_changes", SHIFT_CHANGES, &columns, values)?;
            Ok(Command::ChangeShift {
                subscription_id: row.req("subscription_id")?,
                shift: row.req("shift")?,
                effective_from: row.opt("effective_from")?,
            })
        }
        "quantity_changes" => {
            let row = Row::new("quantity_changes", QUANTITY_CHANGES, &columns, values)?;
            Ok(Command::ChangeQuantity {
                subscription_id: row.req("subscription_id")?,
                quantity: row.req("quantity")?,
                effective_from: row.opt("effective_from")?,
            })
        }
        "pauses" => {
            let row = Row::new("pauses", PAUSES, &columns, values)?;
            Ok(Command::SetPause(PauseInterval {
                id: row.req("id")?,
                subscription_id: row.req("subscription_id")?,
                start: row.req("start_date")?,
                end: row.opt("end_date")?,
            }))
        }
        "resumes" => {
            let row = Row::new("resumes", RESUMES, &columns, values)?;
            Ok(Command::Resume {
                subscription_id: row.req("subscription_id")?,
                resume_on: row.opt("resume_on")?,
            })
        }
        "stops" => {
            let row = Row::new("stops", STOPS, &columns, values)?;
            Ok(Command::Stop {
                subscription_id: row.req("subscription_id")?,
                reason: row.opt("reason")?,
                stopped_at: row.opt("stopped_at")?,
            })
        }
        "product_stops" => {
            let row = Row::new("product_stops", PRODUCT_STOPS, &columns, values)?;
            Ok(Command::StopProduct {
                customer_id: row.req("customer_id")?,
                product_id: row.req("product_id")?,
                reason: row.opt("reason")?,
                stopped_at: row.opt("stopped_at")?,
            })
        }
        "overrides" => {
            let row = Row::new("overrides", OVERRIDES, &columns, values)?;
            Ok(Command::SetOverride(DateOverride {
                customer_id: row.req("customer_id")?,
                subscription_id: row.req("subscription_id")?,
                date: row.req("date")?,
                quantity: row.opt("quantity")?,
                shift: row.opt("shift")?,
            }))
        }
        "additions" => {
            let row = Row::new("additions", ADDITIONS, &columns, values)?;
            Ok(Command::AddProduct(AddedProductEntry {
                id: row.req("id")?,
                customer_id: row.req("customer_id")?,
                product_id: row.req("product_id")?,
                date: row.opt("date")?,
                quantity: row.req("quantity")?,
                shift: row.opt("shift")?.unwrap_or(Shift::Morning),
                added_by: row.opt("added_by")?,
                added_at: 0,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row, addressed by column name. Without a column list the values are
/// taken in the table's declared order and trailing columns may be left out.
struct Row<'a> {
    table: &'static str,
    fields: HashMap<&'static str, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        schema: &'static [&'static str],
        columns: &[String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let mut fields = HashMap::with_capacity(values.len());
        if columns.is_empty() {
            if values.len() > schema.len() {
                return Err(SqlError::WrongArity(table, schema.len(), values.len()));
            }
            fields.extend(schema.iter().copied().zip(values));
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            for (column, value) in columns.iter().zip(values) {
                let name = schema
                    .iter()
                    .copied()
                    .find(|c| *c == column.as_str())
                    .ok_or_else(|| SqlError::UnknownColumn {
                        table,
                        column: column.clone(),
                    })?;
                fields.insert(name, value);
            }
        }
        Ok(Self { table, fields })
    }

    fn opt<T>(&self, column: &'static str) -> Result<Option<T>, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(expr) = self.fields.get(column) else {
            return Ok(None);
        };
        literal(expr)?.map(|text| parse_text(&text, column)).transpose()
    }

    fn req<T>(&self, column: &'static str) -> Result<T, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.opt(column)?.ok_or(SqlError::MissingValue {
            table: self.table,
            column,
        })
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let selection = delete.selection.as_ref();

    match table.as_str() {
        "pauses" => {
            let filters = Filters::from_selection("pauses", &["id"], selection)?;
            Ok(Command::ClearPause {
                id: filters.require_eq("id")?,
            })
        }
        "overrides" => {
            let filters = Filters::from_selection("overrides", &["subscription_id", "date"], selection)?;
            Ok(Command::ClearOverride {
                subscription_id: filters.require_eq("subscription_id")?,
                date: filters.require_eq("date")?,
            })
        }
        "additions" => {
            let filters = Filters::from_selection("additions", &["id"], selection)?;
            Ok(Command::RemoveProduct {
                id: filters.require_eq("id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

const LIST_FILTERS: &[&str] = &["date", "area", "delivery_boy_id", "staff_id", "status", "shift", "product_id"];

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let selection = select.selection.as_ref();

    match table.as_str() {
        "deliveries" => {
            let filters = Filters::from_selection("deliveries", &["customer_id", "date"], selection)?;
            let (from, to) = filters.date_range("date")?;
            Ok(Command::SelectDeliveries {
                customer_id: filters.require_eq("customer_id")?,
                from,
                to,
            })
        }
        "delivery_list" => {
            let filters = Filters::from_selection("delivery_list", LIST_FILTERS, selection)?;
            Ok(Command::SelectDeliveryList(filters.delivery_filter()?))
        }
        "product_totals" => {
            let filters = Filters::from_selection("product_totals", LIST_FILTERS, selection)?;
            Ok(Command::SelectProductTotals(filters.delivery_filter()?))
        }
        "calendar" => {
            let filters = Filters::from_selection("calendar", &["customer_id", "month"], selection)?;
            let month: String = filters.require_eq("month")?;
            let (year, month) = parse_month(&month)?;
            Ok(Command::SelectCalendar {
                customer_id: filters.require_eq("customer_id")?,
                year,
                month,
            })
        }
        "customers" => {
            Filters::from_selection("customers", &[], selection)?;
            Ok(Command::SelectCustomers)
        }
        "subscriptions" => {
            let filters = Filters::from_selection("subscriptions", &["customer_id"], selection)?;
            Ok(Command::SelectSubscriptions {
                customer_id: filters.require_eq("customer_id")?,
            })
        }
        "pauses" => {
            let filters = Filters::from_selection("pauses", &["subscription_id"], selection)?;
            Ok(Command::SelectPauses {
                subscription_id: filters.require_eq("subscription_id")?,
            })
        }
        "overrides" => {
            let filters = Filters::from_selection("overrides", &["subscription_id"], selection)?;
            Ok(Command::SelectOverrides {
                subscription_id: filters.require_eq("subscription_id")?,
            })
        }
        "additions" => {
            let filters = Filters::from_selection("additions", &["customer_id", "date"], selection)?;
            Ok(Command::SelectAdditions {
                customer_id: filters.require_eq("customer_id")?,
                undated_only: filters.is_null("date")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `YYYY-MM`.
fn parse_month(text: &str) -> Result<(i32, u32), SqlError> {
    let bad = || SqlError::BadValue {
        column: "month".into(),
        message: format!("expected YYYY-MM, got {text:?}"),
    };
    let (year, month) = text.trim().split_once('-').ok_or_else(bad)?;
    let year = year.parse().map_err(|_| bad())?;
    let month = month.parse().map_err(|_| bad())?;
    Ok((year, month))
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
    IsNull,
}

#[derive(Debug)]
struct Predicate {
    column: String,
    op: Op,
    value: Option<String>,
}

/// Flatten a conjunction of `column op literal` terms. Anything else is rejected
/// rather than silently ignored.
fn collect_predicates(expr: &Expr, out: &mut Vec<Predicate>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Eq => Op::Eq,
                BinaryOperator::GtEq => Op::GtEq,
                BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push(Predicate {
                column,
                op,
                value: literal(right)?,
            });
            Ok(())
        }
        Expr::Between {
            expr: inner,
            negated: false,
            low,
            high,
        } => {
            let column = expr_column_name(inner).ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push(Predicate {
                column: column.clone(),
                op: Op::GtEq,
                value: literal(low)?,
            });
            out.push(Predicate {
                column,
                op: Op::LtEq,
                value: literal(high)?,
            });
            Ok(())
        }
        Expr::IsNull(inner) => {
            let column = expr_column_name(inner).ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push(Predicate {
                column,
                op: Op::IsNull,
                value: None,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

struct Filters {
    table: &'static str,
    predicates: Vec<Predicate>,
}

impl Filters {
    fn from_selection(table: &'static str, allowed: &[&str], selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut predicates = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut predicates)?;
        }
        if let Some(p) = predicates.iter().find(|p| !allowed.contains(&p.column.as_str())) {
            return Err(SqlError::UnknownColumn {
                table,
                column: p.column.clone(),
            });
        }
        Ok(Self { table, predicates })
    }

    fn eq<T>(&self, column: &'static str) -> Result<Option<T>, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(p) = self.predicates.iter().find(|p| p.column == column) else {
            return Ok(None);
        };
        match (p.op, &p.value) {
            (Op::Eq, Some(text)) => parse_text(text, column).map(Some),
            (Op::Eq, None) => Err(SqlError::BadValue {
                column: column.into(),
                message: "comparison with NULL".into(),
            }),
            _ => Err(SqlError::Unsupported(format!("{} supports only = on {column}", self.table))),
        }
    }

    fn require_eq<T>(&self, column: &'static str) -> Result<T, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.eq(column)?.ok_or(SqlError::MissingFilter(column))
    }

    /// `col = d`, or both `col >= a` and `col <= b` (also written `BETWEEN`).
    fn date_range(&self, column: &'static str) -> Result<(Date, Date), SqlError> {
        let (mut from, mut to) = (None, None);
        for p in self.predicates.iter().filter(|p| p.column == column) {
            let text = p.value.as_deref().ok_or_else(|| SqlError::BadValue {
                column: column.into(),
                message: "comparison with NULL".into(),
            })?;
            let date: Date = parse_text(text, column)?;
            match p.op {
                Op::Eq => {
                    from = Some(date);
                    to = Some(date);
                }
                Op::GtEq => from = Some(date),
                Op::LtEq => to = Some(date),
                Op::IsNull => return Err(SqlError::Unsupported(format!("IS NULL on {column}"))),
            }
        }
        Ok((
            from.ok_or(SqlError::MissingFilter(column))?,
            to.ok_or(SqlError::MissingFilter(column))?,
        ))
    }

    fn is_null(&self, column: &'static str) -> Result<bool, SqlError> {
        match self.predicates.iter().find(|p| p.column == column) {
            None => Ok(false),
            Some(p) if p.op == Op::IsNull => Ok(true),
            Some(_) => Err(SqlError::Unsupported(format!("only IS NULL is supported on {column}"))),
        }
    }

    fn delivery_filter(&self) -> Result<DeliveryFilter, SqlError> {
        Ok(DeliveryFilter {
            date: self.require_eq("date")?,
            area: self.eq("area")?,
            delivery_boy_id: self.eq("delivery_boy_id")?,
            staff_id: self.eq("staff_id")?,
            status: self.eq("status")?,
            shift: self.eq("shift")?,
            product_id: self.eq("product_id")?,
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// A literal's text, or `None` for NULL. Casts such as `'2026-10-16'::date` are looked through.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal: {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr)?.map(|s| format!("-{s}"))),
        Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => literal(inner),
        other => Err(SqlError::Parse(format!("expected value, got {other}"))),
    }
}

fn parse_text<T>(text: &str, column: &str) -> Result<T, SqlError>
where
    T: FromStr,
    T::Err: Display,
{
    text.trim().parse().map_err(|e: T::Err| SqlError::BadValue {
        column: column.to_string(),
        message: e.to_string(),
    })
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{table}: {column} is required")]
    MissingValue { table: &'static str, column: &'static str },
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad value for {column}: {message}")]
    BadValue { column: String, message: String },
}
