use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fitslot::auth::FitslotAuthSource;
use fitslot::booking::BookingService;
use fitslot::notify::LogSink;
use fitslot::store::{Store, StoreOptions, now_ms};
use fitslot::wire::{self, FitslotFactory};

const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fitslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(
        Store::open(dir.join("fitslot.wal"), StoreOptions::default())
            .await
            .unwrap(),
    );
    let service = Arc::new(BookingService::new(store, Arc::new(LogSink)).with_slot_price(1000));
    let auth = FitslotAuthSource::new("fitslot").with_role(Some("fitslot".into()));
    let factory = Arc::new(FitslotFactory::new(service, auth));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("fitslot")
        .user("fitslot")
        .password("fitslot");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn query_rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query_one(client: &Client, sql: &str) -> SimpleQueryRow {
    let mut rows = query_rows(client, sql).await;
    assert_eq!(rows.len(), 1, "expected one row from {sql}");
    rows.remove(0)
}

fn col(row: &SimpleQueryRow, name: &str) -> String {
    row.get(name).unwrap().to_string()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().unwrap().code().to_string()
}

async fn new_user(client: &Client, email: &str) -> i64 {
    let row = query_one(
        client,
        &format!("INSERT INTO users (email, name) VALUES ('{email}', 'Test User')"),
    )
    .await;
    col(&row, "id").parse().unwrap()
}

async fn new_slot(client: &Client, gym_id: i64, capacity: u32) -> i64 {
    let start = now_ms() + 24 * HOUR;
    let end = start + HOUR;
    let row = query_one(
        client,
        &format!(
            r#"INSERT INTO slots (gym_id, start, "end", capacity) VALUES ({gym_id}, {start}, {end}, {capacity})"#
        ),
    )
    .await;
    col(&row, "id").parse().unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_with_wallet_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let user = new_user(&client, "wire@example.com").await;
    let slot = new_slot(&client, 1, 5).await;

    let row = query_one(
        &client,
        &format!("INSERT INTO topups (user_id, amount) VALUES ({user}, 5000)"),
    )
    .await;
    assert_eq!(col(&row, "balance"), "5000");

    let row = query_one(
        &client,
        &format!("INSERT INTO bookings (user_id, slot_id) VALUES ({user}, {slot})"),
    )
    .await;
    assert_eq!(col(&row, "slot_id"), slot.to_string());
    assert_eq!(col(&row, "payment_method"), "wallet");
    let details: serde_json::Value = serde_json::from_str(&col(&row, "payment_details")).unwrap();
    assert_eq!(details["amount_debited"], 1000);
    assert_eq!(details["balance_after"], 4000);

    let wallet = query_one(&client, &format!("SELECT * FROM wallets WHERE user_id = {user}")).await;
    assert_eq!(col(&wallet, "balance"), "4000");
    assert_eq!(col(&wallet, "currency"), "KZT");

    let txs = query_rows(
        &client,
        &format!("SELECT * FROM wallet_transactions WHERE user_id = {user}"),
    )
    .await;
    assert_eq!(txs.len(), 2);
    assert_eq!(col(&txs[0], "type"), "booking_payment");
    assert_eq!(col(&txs[0], "amount"), "-1000");
    assert_eq!(col(&txs[1], "type"), "topup");

    let paged = query_rows(
        &client,
        &format!("SELECT * FROM wallet_transactions WHERE user_id = {user} LIMIT 1 OFFSET 1"),
    )
    .await;
    assert_eq!(paged.len(), 1);
    assert_eq!(col(&paged[0], "type"), "topup");

    let slot_row = query_one(&client, &format!("SELECT * FROM slots WHERE id = {slot}")).await;
    assert_eq!(col(&slot_row, "booked"), "1");
    assert_eq!(col(&slot_row, "available"), "4");
}

#[tokio::test]
async fn subscription_pays_instead_of_wallet() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let user = new_user(&client, "member@example.com").await;
    let slot = new_slot(&client, 7, 5).await;
    let from = now_ms() - HOUR;
    let until = now_ms() + 30 * 24 * HOUR;
    query_one(
        &client,
        &format!(
            "INSERT INTO subscriptions (user_id, gym_id, visits_limit, price, valid_from, valid_until) \
             VALUES ({user}, 7, 4, 0, {from}, {until})"
        ),
    )
    .await;

    let row = query_one(
        &client,
        &format!("INSERT INTO bookings (user_id, slot_id) VALUES ({user}, {slot})"),
    )
    .await;
    assert_eq!(col(&row, "payment_method"), "subscription");

    let subs = query_rows(
        &client,
        &format!("SELECT * FROM subscriptions WHERE user_id = {user}"),
    )
    .await;
    assert_eq!(subs.len(), 1);
    assert_eq!(col(&subs[0], "visits_used"), "1");
    assert_eq!(col(&subs[0], "visits_limit"), "4");

    let txs = query_rows(
        &client,
        &format!("SELECT * FROM wallet_transactions WHERE user_id = {user}"),
    )
    .await;
    assert!(txs.is_empty());
}

#[tokio::test]
async fn booking_errors_carry_stable_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let user = new_user(&client, "errors@example.com").await;
    let slot = new_slot(&client, 1, 1).await;

    // No funds yet.
    let book = format!("INSERT INTO bookings (user_id, slot_id) VALUES ({user}, {slot})");
    assert_eq!(sqlstate(&client, &book).await, "P0004");

    client
        .batch_execute(&format!(
            "INSERT INTO topups (user_id, amount) VALUES ({user}, 3000)"
        ))
        .await
        .unwrap();
    query_one(&client, &book).await;
    assert_eq!(sqlstate(&client, &book).await, "23505");

    let other = new_user(&client, "other@example.com").await;
    client
        .batch_execute(&format!(
            "INSERT INTO topups (user_id, amount) VALUES ({other}, 3000)"
        ))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(
            &client,
            &format!("INSERT INTO bookings (user_id, slot_id) VALUES ({other}, {slot})")
        )
        .await,
        "53400"
    );

    assert_eq!(
        sqlstate(
            &client,
            &format!("INSERT INTO bookings (user_id, slot_id) VALUES ({user}, 999999)")
        )
        .await,
        "P0002"
    );
    assert_eq!(sqlstate(&client, "SELEKT nothing").await, "42601");
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO users (email, name) VALUES ('errors@example.com', 'Again')"
        )
        .await,
        "23505"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!("INSERT INTO topups (user_id, amount) VALUES ({user}, 0)")
        )
        .await,
        "22023"
    );
}

#[tokio::test]
async fn cancel_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let user = new_user(&client, "cancel@example.com").await;
    let other = new_user(&client, "intruder@example.com").await;
    let slot = new_slot(&client, 1, 2).await;
    client
        .batch_execute(&format!(
            "INSERT INTO topups (user_id, amount) VALUES ({user}, 1000)"
        ))
        .await
        .unwrap();
    let row = query_one(
        &client,
        &format!("INSERT INTO bookings (user_id, slot_id) VALUES ({user}, {slot})"),
    )
    .await;
    let booking = col(&row, "id");

    let cancel_as = |who: i64| format!("DELETE FROM bookings WHERE id = {booking} AND user_id = {who}");
    assert_eq!(sqlstate(&client, &cancel_as(other)).await, "42501");

    client.batch_execute(&cancel_as(user)).await.unwrap();
    assert_eq!(sqlstate(&client, &cancel_as(user)).await, "55000");

    let bookings = query_rows(
        &client,
        &format!("SELECT * FROM bookings WHERE slot_id = {slot}"),
    )
    .await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(col(&bookings[0], "status"), "cancelled");

    // No refund on cancellation.
    let wallet = query_one(&client, &format!("SELECT * FROM wallets WHERE user_id = {user}")).await;
    assert_eq!(col(&wallet, "balance"), "0");
}

#[tokio::test]
async fn unknown_ids_read_as_empty() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    assert!(query_rows(&client, "SELECT * FROM users WHERE id = 424242").await.is_empty());
    assert!(query_rows(&client, "SELECT * FROM slots WHERE id = 424242").await.is_empty());
    assert!(
        query_rows(&client, "SELECT * FROM bookings WHERE slot_id = 424242")
            .await
            .is_empty()
    );
    assert!(
        query_rows(&client, "SELECT * FROM bookings WHERE user_id = 424242")
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn gym_bookings_and_stats_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let ann = new_user(&client, "ann.gym@example.com").await;
    let bob = new_user(&client, "bob.gym@example.com").await;
    let slot = new_slot(&client, 11, 5).await;
    let other_gym = new_slot(&client, 12, 5).await;
    for user in [ann, bob] {
        client
            .batch_execute(&format!(
                "INSERT INTO topups (user_id, amount) VALUES ({user}, 5000)"
            ))
            .await
            .unwrap();
    }

    let book = |user: i64, slot: i64| {
        format!("INSERT INTO bookings (user_id, slot_id) VALUES ({user}, {slot})")
    };
    let first = col(&query_one(&client, &book(ann, slot)).await, "id");
    query_one(&client, &book(bob, slot)).await;
    query_one(&client, &book(ann, other_gym)).await;
    client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = {first} AND user_id = {ann}"
        ))
        .await
        .unwrap();

    let at_gym = query_rows(&client, "SELECT * FROM bookings WHERE gym_id = 11").await;
    assert_eq!(at_gym.len(), 2);
    assert_eq!(col(&at_gym[0], "user_email"), "bob.gym@example.com");
    assert_eq!(col(&at_gym[0], "gym_id"), "11");
    assert_eq!(col(&at_gym[1], "id"), first);
    assert_eq!(col(&at_gym[1], "status"), "cancelled");
    assert_eq!(col(&at_gym[1], "user_name"), "Test User");

    // Slot listings are newest first too.
    let on_slot = query_rows(&client, &format!("SELECT * FROM bookings WHERE slot_id = {slot}")).await;
    assert_eq!(col(&on_slot[1], "id"), first);

    let by_gym = query_rows(&client, "SELECT * FROM booking_stats_by_gym").await;
    let gym_11 = by_gym.iter().find(|r| col(r, "gym_id") == "11").unwrap();
    assert_eq!(col(gym_11, "booked"), "1");
    assert_eq!(col(gym_11, "cancelled"), "1");

    let by_day = query_rows(
        &client,
        &format!("SELECT * FROM booking_stats_by_day WHERE created_at BETWEEN 0 AND {}", now_ms()),
    )
    .await;
    let booked: i64 = by_day.iter().map(|r| col(r, "booked").parse::<i64>().unwrap()).sum();
    assert_eq!(booked, 2);

    assert!(query_rows(&client, "SELECT * FROM bookings WHERE gym_id = 424242").await.is_empty());
    assert_eq!(
        sqlstate(&client, "SELECT * FROM booking_stats_by_gym WHERE gym_id = 11").await,
        "42601"
    );
}

#[tokio::test]
async fn other_roles_cannot_log_in() {
    let addr = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("fitslot")
        .user("mallory")
        .password("fitslot");

    let err = config.connect(NoTls).await.err().unwrap();
    assert_eq!(err.code().unwrap().code(), "28000");
}
