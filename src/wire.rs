use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt, StreamExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::MilkrunAuthSource;
use crate::engine::{Engine, EngineError, ListItem};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Channel, Command, SqlError};
use crate::tenant::TenantManager;

/// Query handler for one connection. Holds that connection's LISTEN subscriptions.
pub struct MilkrunHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MilkrunQueryParser>,
    listeners: Mutex<HashMap<String, broadcast::Receiver<Event>>>,
}

impl MilkrunHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MilkrunQueryParser),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Run one command, recording its outcome and latency.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            // ── Registration ──
            Command::UpsertCustomer(customer) => {
                engine.upsert_customer(customer).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetCustomerStatus { customer_id, status } => {
                engine.set_customer_status(customer_id, status).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CreateSubscription(sub) => {
                engine.create_subscription(sub).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetSubscriptionStatus { subscription_id, status } => {
                engine
                    .set_subscription_status(subscription_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }

            // ── Temporal modifications ──
            Command::ChangeShift {
                subscription_id,
                shift,
                effective_from,
            } => {
                let from = effective_from.unwrap_or_else(|| engine.today());
                engine
                    .set_permanent_shift(subscription_id, shift, from)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ChangeQuantity {
                subscription_id,
                quantity,
                effective_from,
            } => {
                let from = effective_from.unwrap_or_else(|| engine.today());
                engine
                    .set_permanent_quantity(subscription_id, quantity, from)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetPause(pause) => {
                engine.set_pause(pause).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ClearPause { id } => {
                engine.clear_pause(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::Resume {
                subscription_id,
                resume_on,
            } => {
                engine
                    .resume(subscription_id, resume_on.unwrap_or_else(|| engine.today()))
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::Stop {
                subscription_id,
                reason,
                stopped_at,
            } => {
                engine
                    .stop(subscription_id, reason, stopped_at.unwrap_or_else(|| engine.today()))
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::StopProduct {
                customer_id,
                product_id,
                reason,
                stopped_at,
            } => {
                let stopped = engine
                    .stop_product(customer_id, product_id, reason, stopped_at.unwrap_or_else(|| engine.today()))
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(stopped.len()))
            }
            Command::SetOverride(date_override) => {
                engine.set_date_override(date_override).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ClearOverride { subscription_id, date } => {
                engine
                    .clear_date_override(subscription_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::AddProduct(entry) => {
                engine.add_one_off_product(entry).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RemoveProduct { id } => {
                engine.remove_one_off_product(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }

            // ── Projections ──
            Command::SelectDeliveries { customer_id, from, to } => {
                let deliveries = engine.stream_range(customer_id, from, to).await.map_err(engine_err)?;
                let schema = Arc::new(deliveries_schema());
                let encoder_schema = schema.clone();
                let rows = deliveries.flat_map(move |result| {
                    let rows: Vec<PgWireResult<DataRow>> = match result {
                        Ok(delivery) => delivery
                            .lines
                            .iter()
                            .map(|line| delivery_row(&encoder_schema, &delivery, line))
                            .collect(),
                        Err(e) => vec![Err(engine_err(e))],
                    };
                    stream::iter(rows)
                });
                Ok(Response::Query(QueryResponse::new(schema, rows)))
            }
            Command::SelectDeliveryList(filter) => {
                let items = engine.stream_delivery_list(filter).await.map_err(engine_err)?;
                let schema = Arc::new(delivery_list_schema());
                let encoder_schema = schema.clone();
                let rows = items.flat_map(move |item| stream::iter(list_item_rows(&encoder_schema, item)));
                Ok(Response::Query(QueryResponse::new(schema, rows)))
            }
            Command::SelectProductTotals(filter) => {
                let totals = engine.product_totals(filter).await.map_err(engine_err)?;
                let schema = Arc::new(product_totals_schema());
                let rows: Vec<PgWireResult<DataRow>> = totals
                    .iter()
                    .map(|t| -> PgWireResult<DataRow> {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&t.product_id.to_string())?;
                        encoder.encode_field(&t.quantity.to_string())?;
                        encoder.encode_field(&t.liters().to_string())?;
                        encoder.encode_field(&(t.lines as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectCalendar {
                customer_id,
                year,
                month,
            } => {
                let view = engine.month_view(customer_id, year, month).await.map_err(engine_err)?;
                let schema = Arc::new(calendar_schema());
                let rows: Vec<PgWireResult<DataRow>> = view
                    .days
                    .iter()
                    .map(|cell| -> PgWireResult<DataRow> {
                        let lines = serde_json::to_string(&cell.lines).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                        let paused =
                            serde_json::to_string(&cell.paused).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&cell.date.to_string())?;
                        encoder.encode_field(&lines)?;
                        encoder.encode_field(&paused)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }

            // ── Listings ──
            Command::SelectCustomers => {
                let customers = engine.list_customers().await;
                let schema = Arc::new(customers_schema());
                let rows: Vec<PgWireResult<DataRow>> = customers
                    .iter()
                    .map(|c| -> PgWireResult<DataRow> {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.name)?;
                        encoder.encode_field(&c.status.to_string())?;
                        encoder.encode_field(&c.area)?;
                        encoder.encode_field(&opt_id(c.delivery_boy_id))?;
                        encoder.encode_field(&opt_id(c.staff_id))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSubscriptions { customer_id } => {
                let subs = engine.get_subscriptions(customer_id).await;
                let schema = Arc::new(subscriptions_schema());
                let mut rows = Vec::with_capacity(subs.len());
                for sub in &subs {
                    let stopped_at = engine.get_stop(sub.id).await.map(|s| s.stopped_at.to_string());
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&sub.id.to_string())?;
                    encoder.encode_field(&sub.customer_id.to_string())?;
                    encoder.encode_field(&sub.product_id.to_string())?;
                    encoder.encode_field(&sub.mode.to_string())?;
                    encoder.encode_field(&sub.quantity.current().to_string())?;
                    encoder.encode_field(&sub.shift.current().to_string())?;
                    encoder.encode_field(&sub.weekdays.to_string())?;
                    encoder.encode_field(&sub.start_date.map(|d| d.to_string()))?;
                    encoder.encode_field(&sub.status.to_string())?;
                    encoder.encode_field(&stopped_at)?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectPauses { subscription_id } => {
                let pauses = engine.get_pauses(subscription_id).await;
                let schema = Arc::new(pauses_schema());
                let rows: Vec<PgWireResult<DataRow>> = pauses
                    .iter()
                    .map(|p| -> PgWireResult<DataRow> {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.subscription_id.to_string())?;
                        encoder.encode_field(&p.start.to_string())?;
                        encoder.encode_field(&p.end.map(|d| d.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectOverrides { subscription_id } => {
                let overrides = engine.get_overrides(subscription_id).await;
                let schema = Arc::new(overrides_schema());
                let rows: Vec<PgWireResult<DataRow>> = overrides
                    .iter()
                    .map(|o| -> PgWireResult<DataRow> {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&o.customer_id.to_string())?;
                        encoder.encode_field(&o.subscription_id.to_string())?;
                        encoder.encode_field(&o.date.to_string())?;
                        encoder.encode_field(&o.quantity.map(|q| q.to_string()))?;
                        encoder.encode_field(&o.shift.map(|s| s.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAdditions {
                customer_id,
                undated_only,
            } => {
                let entries = if undated_only {
                    engine.get_undated_additions(customer_id).await
                } else {
                    engine.get_additions(customer_id).await
                };
                let schema = Arc::new(additions_schema());
                let rows: Vec<PgWireResult<DataRow>> = entries
                    .iter()
                    .map(|e| -> PgWireResult<DataRow> {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.customer_id.to_string())?;
                        encoder.encode_field(&e.product_id.to_string())?;
                        encoder.encode_field(&e.date.map(|d| d.to_string()))?;
                        encoder.encode_field(&e.quantity.to_string())?;
                        encoder.encode_field(&e.shift.to_string())?;
                        encoder.encode_field(&e.added_by)?;
                        encoder.encode_field(&e.added_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }

            // ── Change feed ──
            Command::Listen { channel } => {
                let rx = match sql::parse_channel(&channel).map_err(sql_err)? {
                    Channel::Customer(id) => engine.notify.subscribe(id),
                    Channel::All => engine.notify.subscribe_all(),
                };
                // A repeated LISTEN keeps the existing subscription.
                self.listeners.lock().await.entry(channel).or_insert(rx);
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listeners.lock().await.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listeners.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Forward events that arrived on this connection's LISTEN channels.
    /// Delivered at statement boundaries.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listeners = self.listeners.lock().await;
            listeners.retain(|channel, rx| loop {
                match rx.try_recv() {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(payload) => pending.push((channel.clone(), payload)),
                        Err(e) => warn!(%channel, "dropping unserializable notification: {e}"),
                    },
                    Err(broadcast::error::TryRecvError::Empty) => break true,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!(%channel, "listener lagged, {n} notifications lost");
                    }
                    Err(broadcast::error::TryRecvError::Closed) => break false,
                }
            });
        }
        for (channel, payload) in pending {
            debug!(%channel, "notify");
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn opt_id(id: Option<Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn fields(names: &[&str]) -> Vec<FieldInfo> {
    names.iter().map(|n| text_field(n)).collect()
}

const LINE_COLUMNS: &[&str] = &["product_id", "quantity", "liters", "shift", "source", "subscription_id", "entry_id"];

fn deliveries_schema() -> Vec<FieldInfo> {
    let mut schema = fields(&["customer_id", "date"]);
    schema.extend(fields(LINE_COLUMNS));
    schema
}

fn delivery_list_schema() -> Vec<FieldInfo> {
    let mut schema = fields(&["customer_id", "name", "area", "delivery_boy_id"]);
    schema.extend(fields(LINE_COLUMNS));
    schema.push(text_field("error"));
    schema
}

fn product_totals_schema() -> Vec<FieldInfo> {
    let mut schema = fields(&["product_id", "quantity", "liters"]);
    schema.push(FieldInfo::new("lines".into(), None, None, Type::INT8, FieldFormat::Text));
    schema
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date"),
        FieldInfo::new("lines".into(), None, None, Type::JSON, FieldFormat::Text),
        FieldInfo::new("paused".into(), None, None, Type::JSON, FieldFormat::Text),
    ]
}

fn customers_schema() -> Vec<FieldInfo> {
    fields(&["id", "name", "status", "area", "delivery_boy_id", "staff_id"])
}

fn subscriptions_schema() -> Vec<FieldInfo> {
    fields(&[
        "id",
        "customer_id",
        "product_id",
        "mode",
        "quantity",
        "shift",
        "weekdays",
        "start_date",
        "status",
        "stopped_at",
    ])
}

fn pauses_schema() -> Vec<FieldInfo> {
    fields(&["id", "subscription_id", "start_date", "end_date"])
}

fn overrides_schema() -> Vec<FieldInfo> {
    fields(&["customer_id", "subscription_id", "date", "quantity", "shift"])
}

fn additions_schema() -> Vec<FieldInfo> {
    let mut schema = fields(&["id", "customer_id", "product_id", "date", "quantity", "shift", "added_by"]);
    schema.push(FieldInfo::new("added_at".into(), None, None, Type::INT8, FieldFormat::Text));
    schema
}

/// Result columns for a statement, worked out from its table name alone so it also
/// works before parameters are bound.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next() != Some("select") {
        return vec![];
    }
    let Some(table) = words.skip_while(|w| *w != "from").nth(1) else {
        return vec![];
    };
    match table.trim_end_matches(';') {
        "deliveries" => deliveries_schema(),
        "delivery_list" => delivery_list_schema(),
        "product_totals" => product_totals_schema(),
        "calendar" => calendar_schema(),
        "customers" => customers_schema(),
        "subscriptions" => subscriptions_schema(),
        "pauses" => pauses_schema(),
        "overrides" => overrides_schema(),
        "additions" => additions_schema(),
        _ => vec![],
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn encode_line(encoder: &mut DataRowEncoder, line: &LineItem) -> PgWireResult<()> {
    encoder.encode_field(&line.product_id.to_string())?;
    encoder.encode_field(&line.quantity.to_string())?;
    encoder.encode_field(&line.liters().to_string())?;
    encoder.encode_field(&line.shift.to_string())?;
    encoder.encode_field(&line.source.to_string())?;
    encoder.encode_field(&opt_id(line.subscription_id))?;
    encoder.encode_field(&opt_id(line.entry_id))?;
    Ok(())
}

fn delivery_row(schema: &Arc<Vec<FieldInfo>>, delivery: &ResolvedDelivery, line: &LineItem) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&delivery.customer_id.to_string())?;
    encoder.encode_field(&delivery.date.to_string())?;
    encode_line(&mut encoder, line)?;
    Ok(encoder.take_row())
}

/// One row per line; a failed record becomes a single row carrying only its error.
fn list_item_rows(schema: &Arc<Vec<FieldInfo>>, item: ListItem) -> Vec<PgWireResult<DataRow>> {
    match item {
        ListItem::Row(row) => row
            .lines
            .iter()
            .map(|line| -> PgWireResult<DataRow> {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&row.customer_id.to_string())?;
                encoder.encode_field(&row.name)?;
                encoder.encode_field(&row.area)?;
                encoder.encode_field(&opt_id(row.delivery_boy_id))?;
                encode_line(&mut encoder, line)?;
                encoder.encode_field(&None::<String>)?;
                Ok(encoder.take_row())
            })
            .collect(),
        ListItem::Failure(failure) => {
            let encode = || -> PgWireResult<DataRow> {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&failure.customer_id.to_string())?;
                for _ in 0..3 + LINE_COLUMNS.len() {
                    encoder.encode_field(&None::<String>)?;
                }
                encoder.encode_field(&failure.error.to_string())?;
                Ok(encoder.take_row())
            };
            vec![encode()]
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for MilkrunHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let response = self.run(&engine, cmd).await;
        self.flush_notifications(client).await?;
        Ok(vec![response?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MilkrunQueryParser;

#[async_trait]
impl QueryParser for MilkrunQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for MilkrunHandler {
    type Statement = String;
    type QueryParser = MilkrunQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let response = self.run(&engine, cmd).await;
        self.flush_notifications(client).await?;
        response
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Substitute `$1`, `$2`, ... with bound parameter values (text format) as quoted literals.
/// One pass over the statement: placeholders inside string literals and inside bound
/// values are left alone.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut rest = sql;
    while let Some(c) = rest.chars().next() {
        rest = &rest[c.len_utf8()..];
        if c == '\'' {
            in_literal = !in_literal;
        } else if c == '$' && !in_literal {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            let param = rest[..digits]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| params.get(i));
            if let Some(param) = param {
                match param {
                    Some(bytes) => {
                        out.push('\'');
                        out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                        out.push('\'');
                    }
                    None => out.push_str("NULL"),
                }
                rest = &rest[digits..];
                continue;
            }
        }
        out.push(c);
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MilkrunFactory {
    handler: Arc<MilkrunHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<MilkrunAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl MilkrunFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MilkrunHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                MilkrunAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MilkrunFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes. Each connection gets its own handler,
/// so LISTEN state never leaks between clients.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(MilkrunFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) | EngineError::OverrideNotFound { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) | EngineError::InvalidTransition { .. } => "55000",
        EngineError::Integrity { .. } => "XX001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) | SqlError::MissingFilter(_) => "42601",
        SqlError::Unsupported(_) => "0A000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        SqlError::MissingValue { .. } => "23502",
        SqlError::BadValue { .. } => "22P02",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
