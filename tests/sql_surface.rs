use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, Local, NaiveDate};
use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use milkrun::tenant::TenantManager;
use milkrun::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("milkrun_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "milkrun".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_to(addr: SocketAddr, dbname: &str) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("milkrun")
        .password("milkrun");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn connect(addr: SocketAddr) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    connect_to(addr, "dairy").await
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> Option<&'a str> {
    row.get(name)
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a database error, got {err}"))
}

/// Notifications arrive at statement boundaries; run a cheap statement, then wait.
async fn next_notification(
    client: &Client,
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    client.batch_execute("SELECT * FROM customers").await.unwrap();
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

struct Asha {
    customer: Ulid,
    milk: Ulid,
    milk_product: Ulid,
}

/// Mon/Wed/Fri milk, 2 packets in the morning. 2026-10-14 is a Wednesday.
async fn setup_asha(client: &Client) -> Asha {
    let asha = Asha {
        customer: Ulid::new(),
        milk: Ulid::new(),
        milk_product: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO customers VALUES ('{}', 'Asha', 'active', 'north', NULL, NULL)",
            asha.customer
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO subscriptions VALUES ('{}', '{}', '{}', 'weekly_pattern', 2, 'morning', '1,3,5', NULL, 'active')",
            asha.milk, asha.customer, asha.milk_product
        ))
        .await
        .unwrap();
    asha
}

// ── Resolution over the wire ─────────────────────────────────

#[tokio::test]
async fn asha_scenario_end_to_end() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let asha = setup_asha(&client).await;

    let tue = rows(
        &client,
        &format!("SELECT * FROM deliveries WHERE customer_id = '{}' AND date = '2026-10-13'", asha.customer),
    )
    .await;
    assert!(tue.is_empty());

    let bread = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO additions VALUES ('{bread}', '{}', '{}', '2026-10-14', 1, 'morning', 'delivery_boy')",
            asha.customer,
            Ulid::new()
        ))
        .await
        .unwrap();

    let wed = rows(
        &client,
        &format!("SELECT * FROM deliveries WHERE customer_id = '{}' AND date = '2026-10-14'", asha.customer),
    )
    .await;
    assert_eq!(wed.len(), 2);
    assert_eq!(col(&wed[0], "source"), Some("base"));
    assert_eq!(col(&wed[0], "quantity"), Some("2"));
    assert_eq!(col(&wed[0], "liters"), Some("1"));
    assert_eq!(col(&wed[0], "subscription_id"), Some(asha.milk.to_string().as_str()));
    assert_eq!(col(&wed[0], "entry_id"), None);
    assert_eq!(col(&wed[1], "source"), Some("added"));
    assert_eq!(col(&wed[1], "entry_id"), Some(bread.to_string().as_str()));

    // Open-ended pause from Wednesday: bread stays, milk goes.
    client
        .batch_execute(&format!(
            "INSERT INTO pauses VALUES ('{}', '{}', '2026-10-14', NULL)",
            Ulid::new(),
            asha.milk
        ))
        .await
        .unwrap();
    let range = rows(
        &client,
        &format!(
            "SELECT * FROM deliveries WHERE customer_id = '{}' AND date >= '2026-10-12' AND date <= '2026-10-18'",
            asha.customer
        ),
    )
    .await;
    let days: Vec<_> = range.iter().map(|r| (col(r, "date").unwrap(), col(r, "source").unwrap())).collect();
    assert_eq!(days, [("2026-10-12", "base"), ("2026-10-14", "added")]);
}

/// The Monday after the server's today, so a permanent change on it is never backdated.
fn next_monday() -> NaiveDate {
    let today = Local::now().date_naive();
    let ahead = 7 - u64::from(today.weekday().num_days_from_monday());
    today + Days::new(ahead)
}

#[tokio::test]
async fn overrides_and_permanent_changes() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let asha = setup_asha(&client).await;
    let mon = next_monday();
    let wed = mon + Days::new(2);
    let fri = mon + Days::new(4);
    let following_mon = mon + Days::new(7);

    client
        .batch_execute(&format!(
            "INSERT INTO overrides VALUES ('{}', '{}', '{wed}', 0, NULL)",
            asha.customer, asha.milk
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO shift_changes VALUES ('{}', 'evening', '{following_mon}')",
            asha.milk
        ))
        .await
        .unwrap();

    let range = rows(
        &client,
        &format!(
            "SELECT * FROM deliveries WHERE customer_id = '{}' AND date >= '{mon}' AND date <= '{following_mon}'",
            asha.customer
        ),
    )
    .await;
    let days: Vec<_> = range.iter().map(|r| (col(r, "date").unwrap(), col(r, "shift").unwrap())).collect();
    let (mon, fri, following_mon) = (mon.to_string(), fri.to_string(), following_mon.to_string());
    assert_eq!(
        days,
        [
            (mon.as_str(), "morning"),
            (fri.as_str(), "morning"),
            (following_mon.as_str(), "evening")
        ]
    );

    // A permanent change may not reach back before today.
    assert_eq!(
        sqlstate(
            &client,
            &format!("INSERT INTO shift_changes VALUES ('{}', 'both', '2020-01-06')", asha.milk)
        )
        .await,
        "22023"
    );

    let overrides = rows(&client, &format!("SELECT * FROM overrides WHERE subscription_id = '{}'", asha.milk)).await;
    assert_eq!(overrides.len(), 1);
    assert_eq!(col(&overrides[0], "quantity"), Some("0"));

    client
        .batch_execute(&format!(
            "DELETE FROM overrides WHERE subscription_id = '{}' AND date = '{wed}'",
            asha.milk
        ))
        .await
        .unwrap();
    let wed = rows(
        &client,
        &format!("SELECT * FROM deliveries WHERE customer_id = '{}' AND date = '{wed}'", asha.customer),
    )
    .await;
    assert_eq!(wed.len(), 1);

    let subs = rows(&client, &format!("SELECT * FROM subscriptions WHERE customer_id = '{}'", asha.customer)).await;
    assert_eq!(col(&subs[0], "shift"), Some("evening"));
    assert_eq!(col(&subs[0], "weekdays"), Some("1,3,5"));
    assert_eq!(col(&subs[0], "stopped_at"), None);
}

#[tokio::test]
async fn stop_product_and_listing() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let asha = setup_asha(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO product_stops VALUES ('{}', '{}', 'moved', '2026-10-15')",
            asha.customer, asha.milk_product
        ))
        .await
        .unwrap();

    let subs = rows(&client, &format!("SELECT * FROM subscriptions WHERE customer_id = '{}'", asha.customer)).await;
    assert_eq!(col(&subs[0], "status"), Some("stopped"));
    assert_eq!(col(&subs[0], "stopped_at"), Some("2026-10-15"));

    let fri = rows(
        &client,
        &format!("SELECT * FROM deliveries WHERE customer_id = '{}' AND date = '2026-10-16'", asha.customer),
    )
    .await;
    assert!(fri.is_empty());
}

#[tokio::test]
async fn delivery_list_and_product_totals() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let asha = setup_asha(&client).await;

    let ravi = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO customers VALUES ('{ravi}', 'Ravi', 'trial', 'south')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO subscriptions VALUES ('{}', '{ravi}', '{}', 'fixed_daily', 1, 'evening')",
            Ulid::new(),
            asha.milk_product
        ))
        .await
        .unwrap();

    let list = rows(&client, "SELECT * FROM delivery_list WHERE date = '2026-10-14'").await;
    let names: Vec<_> = list.iter().map(|r| col(r, "name").unwrap()).collect();
    assert_eq!(names, ["Asha", "Ravi"]);
    assert!(list.iter().all(|r| col(r, "error").is_none()));

    let evening = rows(&client, "SELECT * FROM delivery_list WHERE date = '2026-10-14' AND shift = 'evening'").await;
    assert_eq!(evening.len(), 1);
    assert_eq!(col(&evening[0], "name"), Some("Ravi"));

    let north = rows(&client, "SELECT * FROM delivery_list WHERE date = '2026-10-14' AND area = 'north'").await;
    assert_eq!(north.len(), 1);

    let totals = rows(&client, "SELECT * FROM product_totals WHERE date = '2026-10-14'").await;
    assert_eq!(totals.len(), 1);
    assert_eq!(col(&totals[0], "product_id"), Some(asha.milk_product.to_string().as_str()));
    assert_eq!(col(&totals[0], "quantity"), Some("3"));
    assert_eq!(col(&totals[0], "liters"), Some("1.5"));
    assert_eq!(col(&totals[0], "lines"), Some("2"));
}

#[tokio::test]
async fn calendar_month_view() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let asha = setup_asha(&client).await;
    client
        .batch_execute(&format!(
            "INSERT INTO pauses VALUES ('{}', '{}', '2026-10-16', '2026-10-16')",
            Ulid::new(),
            asha.milk
        ))
        .await
        .unwrap();

    let days = rows(
        &client,
        &format!("SELECT * FROM calendar WHERE customer_id = '{}' AND month = '2026-10'", asha.customer),
    )
    .await;
    assert_eq!(days.len(), 31);

    let wed: serde_json::Value = serde_json::from_str(col(&days[13], "lines").unwrap()).unwrap();
    assert_eq!(col(&days[13], "date"), Some("2026-10-14"));
    assert_eq!(wed.as_array().map(Vec::len), Some(1));
    assert_eq!(wed[0]["source"], "Base");

    let paused: Vec<String> = serde_json::from_str(col(&days[15], "paused").unwrap()).unwrap();
    assert_eq!(paused, [asha.milk.to_string()]);
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let asha = setup_asha(&client).await;

    let customer = asha.customer.to_string();
    let subs = client
        .query("SELECT * FROM subscriptions WHERE customer_id = $1", &[&customer])
        .await
        .unwrap();
    assert_eq!(subs.len(), 1);
    let id: String = subs[0].get("id");
    assert_eq!(id, asha.milk.to_string());
    let start_date: Option<String> = subs[0].get("start_date");
    assert_eq!(start_date, None);

    let pause_id = Ulid::new().to_string();
    let milk = asha.milk.to_string();
    let written = client
        .execute(
            "INSERT INTO pauses VALUES ($1, $2, $3, NULL)",
            &[&pause_id, &milk, &"2026-10-14"],
        )
        .await
        .unwrap();
    assert_eq!(written, 1);

    let pauses = rows(&client, &format!("SELECT * FROM pauses WHERE subscription_id = '{milk}'")).await;
    assert_eq!(col(&pauses[0], "id"), Some(pause_id.as_str()));
    assert_eq!(col(&pauses[0], "end_date"), None);
}

// ── Errors ───────────────────────────────────────────────────

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let asha = setup_asha(&client).await;

    let ghost = Ulid::new();
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM deliveries WHERE customer_id = '{ghost}' AND date = '2026-10-14'")).await,
        "P0002"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM invoices").await, "42P01");
    assert_eq!(
        sqlstate(&client, "SELECT * FROM delivery_list WHERE date = 'not-a-date'").await,
        "22P02"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!("INSERT INTO overrides VALUES ('{}', '{}', '2026-10-14', -1, NULL)", asha.customer, asha.milk)
        )
        .await,
        "22023"
    );

    client
        .batch_execute(&format!("INSERT INTO stops VALUES ('{}', NULL, '2026-10-14')", asha.milk))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(
            &client,
            &format!("INSERT INTO overrides VALUES ('{}', '{}', '2026-10-16', 3, NULL)", asha.customer, asha.milk)
        )
        .await,
        "55000"
    );

    // The connection is still usable after errors.
    assert_eq!(rows(&client, "SELECT * FROM customers").await.len(), 1);
}

// ── Tenancy ──────────────────────────────────────────────────

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, tm) = start_test_server().await;
    let (north, _) = connect_to(addr, "north_dairy").await;
    let (south, _) = connect_to(addr, "south_dairy").await;

    setup_asha(&north).await;
    assert_eq!(rows(&north, "SELECT * FROM customers").await.len(), 1);
    assert!(rows(&south, "SELECT * FROM customers").await.is_empty());
    assert_eq!(tm.tenant_count(), 2);
}

// ── LISTEN / NOTIFY ──────────────────────────────────────────

#[tokio::test]
async fn listen_receives_customer_changes() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;
    let asha = setup_asha(&writer).await;

    let channel = format!("customer_{}", asha.customer);
    listener.batch_execute(&format!("LISTEN {channel}")).await.unwrap();

    writer
        .batch_execute(&format!(
            "INSERT INTO overrides VALUES ('{}', '{}', '2026-10-14', 0, NULL)",
            asha.customer, asha.milk
        ))
        .await
        .unwrap();

    let n = next_notification(&listener, &mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(n.channel(), channel);
    let payload: serde_json::Value = serde_json::from_str(n.payload()).expect("payload should be JSON");
    assert!(payload.get("OverrideSet").is_some(), "unexpected payload {payload}");
}

#[tokio::test]
async fn notifications_only_for_subscribed_customer() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;
    let asha = setup_asha(&writer).await;
    let other = setup_asha(&writer).await;

    listener
        .batch_execute(&format!("LISTEN customer_{}", asha.customer))
        .await
        .unwrap();
    writer
        .batch_execute(&format!("INSERT INTO customer_status VALUES ('{}', 'paused')", other.customer))
        .await
        .unwrap();

    assert!(next_notification(&listener, &mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_all_customers_channel() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    listener.batch_execute("LISTEN customers").await.unwrap();

    let (writer, _) = connect(addr).await;
    setup_asha(&writer).await;

    let first = next_notification(&listener, &mut rx, Duration::from_secs(5)).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.channel(), "customers");
    assert!(first.payload().contains("CustomerUpserted"));
    assert!(second.payload().contains("SubscriptionCreated"));
}

#[tokio::test]
async fn listen_duplicate_is_idempotent() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;
    let asha = setup_asha(&writer).await;

    let listen = format!("LISTEN customer_{}", asha.customer);
    listener.batch_execute(&listen).await.unwrap();
    listener.batch_execute(&listen).await.unwrap();

    writer
        .batch_execute(&format!("INSERT INTO customer_status VALUES ('{}', 'paused')", asha.customer))
        .await
        .unwrap();

    assert!(next_notification(&listener, &mut rx, Duration::from_secs(5)).await.is_some());
    assert!(next_notification(&listener, &mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;
    let asha = setup_asha(&writer).await;

    let channel = format!("customer_{}", asha.customer);
    listener.batch_execute(&format!("LISTEN {channel}")).await.unwrap();
    listener.batch_execute("LISTEN customers").await.unwrap();
    listener.batch_execute(&format!("UNLISTEN {channel}")).await.unwrap();

    writer
        .batch_execute(&format!("INSERT INTO customer_status VALUES ('{}', 'paused')", asha.customer))
        .await
        .unwrap();
    let n = next_notification(&listener, &mut rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(n.channel(), "customers");

    listener.batch_execute("UNLISTEN *").await.unwrap();
    writer
        .batch_execute(&format!("INSERT INTO customer_status VALUES ('{}', 'active')", asha.customer))
        .await
        .unwrap();
    assert!(next_notification(&listener, &mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_rejects_unknown_channel() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let err = client.batch_execute("LISTEN resource_42").await.unwrap_err();
    assert!(err.as_db_error().is_some());
}
