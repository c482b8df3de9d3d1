use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::error;

use crate::auth::FitslotAuthSource;
use crate::booking::{BookingError, BookingService};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, BookingFilter, Command, SqlError, StatsGrouping};
use crate::store::{NewSubscription, Store, StoreError, now_ms};

pub struct FitslotHandler {
    service: Arc<BookingService>,
    query_parser: Arc<FitslotQueryParser>,
}

impl FitslotHandler {
    pub fn new(service: Arc<BookingService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(FitslotQueryParser),
        }
    }

    fn store(&self) -> &Store {
        self.service.store()
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let store = self.store();
        match cmd {
            Command::InsertUser { email, name } => {
                let user = store.register_user(&email, &name).await.map_err(store_err)?;
                single_row(ResultShape::Id, format, |enc| enc.encode_field(&user.id))
            }
            Command::InsertSlot {
                gym_id,
                start,
                end,
                capacity,
            } => {
                let slot = store
                    .create_slot(gym_id, start, end, capacity)
                    .await
                    .map_err(store_err)?;
                single_row(ResultShape::Id, format, |enc| enc.encode_field(&slot.id))
            }
            Command::InsertSubscription {
                user_id,
                gym_id,
                visits_limit,
                price,
                valid_from,
                valid_until,
            } => {
                let (sub, _) = store
                    .purchase_subscription(NewSubscription {
                        user_id,
                        gym_id,
                        visits_limit,
                        price,
                        valid_from,
                        valid_until,
                    })
                    .await
                    .map_err(store_err)?;
                single_row(ResultShape::Id, format, |enc| enc.encode_field(&sub.id))
            }
            Command::InsertTopUp { user_id, amount } => {
                let tx = store.top_up(user_id, amount).await.map_err(store_err)?;
                single_row(ResultShape::Balance, format, |enc| {
                    enc.encode_field(&tx.balance_after)
                })
            }
            Command::InsertBooking { user_id, slot_id } => {
                let outcome = self
                    .service
                    .book_slot(user_id, slot_id)
                    .await
                    .map_err(booking_err)?;
                let details = serde_json::to_string(&outcome.payment).map_err(|e| {
                    user_error("XX000", format!("encode payment details: {e}"))
                })?;
                single_row(ResultShape::Outcome, format, |enc| {
                    enc.encode_field(&outcome.booking.id)?;
                    enc.encode_field(&outcome.booking.slot_id)?;
                    enc.encode_field(&outcome.payment.method().as_str())?;
                    enc.encode_field(&details)
                })
            }
            Command::DeleteBooking { id, user_id } => {
                self.service
                    .cancel_booking(user_id, id)
                    .await
                    .map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUser { id } => {
                let users: Vec<User> = store.get_user_by_id(id).into_iter().collect();
                rows(ResultShape::User, format, users, |enc, user| {
                    enc.encode_field(&user.id)?;
                    enc.encode_field(&user.email)?;
                    enc.encode_field(&user.name)
                })
            }
            Command::SelectSlot { id } => {
                let found = match store.slot_availability(id).await {
                    Ok(a) => vec![a],
                    Err(StoreError::SlotNotFound(_)) => Vec::new(),
                    Err(e) => return Err(store_err(e)),
                };
                rows(ResultShape::Slot, format, found, |enc, a| {
                    enc.encode_field(&a.slot.id)?;
                    enc.encode_field(&a.slot.gym_id)?;
                    enc.encode_field(&a.slot.span.start)?;
                    enc.encode_field(&a.slot.span.end)?;
                    enc.encode_field(&i64::from(a.slot.capacity))?;
                    enc.encode_field(&i64::from(a.booked))?;
                    enc.encode_field(&i64::from(a.available))?;
                    enc.encode_field(&a.is_full)
                })
            }
            Command::SelectWallet { user_id } => {
                let wallet = store.get_or_create_wallet(user_id).await.map_err(store_err)?;
                rows(ResultShape::Wallet, format, vec![wallet], |enc, w| {
                    enc.encode_field(&w.id)?;
                    enc.encode_field(&w.user_id)?;
                    enc.encode_field(&w.balance)?;
                    enc.encode_field(&w.currency)?;
                    enc.encode_field(&w.created_at)?;
                    enc.encode_field(&w.updated_at)
                })
            }
            Command::SelectTransactions {
                user_id,
                limit,
                offset,
            } => {
                let txs = store
                    .get_transactions(user_id, limit.unwrap_or(0), offset.unwrap_or(0))
                    .await;
                rows(ResultShape::Transactions, format, txs, |enc, tx| {
                    enc.encode_field(&tx.id.to_string())?;
                    enc.encode_field(&tx.wallet_id)?;
                    enc.encode_field(&tx.amount)?;
                    enc.encode_field(&tx.kind.as_str())?;
                    enc.encode_field(&tx.balance_after)?;
                    enc.encode_field(&tx.created_at)
                })
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::User(user_id) => self.service.user_bookings(user_id).await,
                    BookingFilter::Slot(slot_id) => match store.slot_bookings(slot_id).await {
                        Ok(b) => b,
                        Err(StoreError::SlotNotFound(_)) => Vec::new(),
                        Err(e) => return Err(store_err(e)),
                    },
                };
                rows(ResultShape::Bookings, format, bookings, |enc, b| {
                    enc.encode_field(&b.id)?;
                    enc.encode_field(&b.user_id)?;
                    enc.encode_field(&b.slot_id)?;
                    enc.encode_field(&b.status.as_str())?;
                    enc.encode_field(&b.created_at)
                })
            }
            Command::SelectSubscriptions { user_id } => {
                let subs = store.list_active_subscriptions(user_id, now_ms()).await;
                rows(ResultShape::Subscriptions, format, subs, |enc, s| {
                    enc.encode_field(&s.id)?;
                    enc.encode_field(&s.user_id)?;
                    enc.encode_field(&s.gym_id)?;
                    enc.encode_field(&s.status.as_str())?;
                    enc.encode_field(&s.visits_limit.map(i64::from))?;
                    enc.encode_field(&i64::from(s.visits_used))?;
                    enc.encode_field(&s.price)?;
                    enc.encode_field(&s.valid_from)?;
                    enc.encode_field(&s.valid_until)
                })
            }
            Command::SelectGymBookings { gym_id } => {
                let details = store.gym_bookings(gym_id).await;
                rows(ResultShape::GymBookings, format, details, |enc, d| {
                    enc.encode_field(&d.booking.id)?;
                    enc.encode_field(&d.booking.user_id)?;
                    enc.encode_field(&d.booking.slot_id)?;
                    enc.encode_field(&d.booking.status.as_str())?;
                    enc.encode_field(&d.booking.created_at)?;
                    enc.encode_field(&d.gym_id)?;
                    enc.encode_field(&d.span.start)?;
                    enc.encode_field(&d.span.end)?;
                    enc.encode_field(&d.user_name)?;
                    enc.encode_field(&d.user_email)
                })
            }
            Command::SelectStats { grouping, created } => {
                let (from, to) = created.bounds();
                match grouping {
                    StatsGrouping::Day => {
                        let stats = store.booking_stats_by_day(from, to).await;
                        rows(ResultShape::DailyStats, format, stats, |enc, d| {
                            enc.encode_field(&d.day)?;
                            enc.encode_field(&i64::from(d.counts.booked))?;
                            enc.encode_field(&i64::from(d.counts.cancelled))
                        })
                    }
                    StatsGrouping::Gym => {
                        let stats = store.booking_stats_by_gym(from, to).await;
                        rows(ResultShape::GymStats, format, stats, |enc, g| {
                            enc.encode_field(&g.gym_id)?;
                            enc.encode_field(&i64::from(g.counts.booked))?;
                            enc.encode_field(&i64::from(g.counts.cancelled))
                        })
                    }
                }
            }
        }
    }
}

// ── Result shapes ────────────────────────────────────────────────

/// The column layout each command answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultShape {
    Empty,
    Id,
    Balance,
    Outcome,
    User,
    Slot,
    Wallet,
    Transactions,
    Bookings,
    GymBookings,
    Subscriptions,
    DailyStats,
    GymStats,
}

impl ResultShape {
    /// Describe-time guess from the statement text; `$n` placeholders keep
    /// the statement from going through the real parser yet.
    fn of_sql(sql: &str) -> Self {
        let lower = sql.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
            .filter(|t| !t.is_empty())
            .collect();
        let table_after = |keyword: &str| {
            tokens
                .iter()
                .position(|t| *t == keyword)
                .and_then(|i| tokens.get(i + 1))
                .map(|t| t.trim_matches('"'))
        };
        let by_user_or_slot = lower.contains("user_id") || lower.contains("slot_id");

        match tokens.first().copied() {
            Some("insert") => match table_after("into") {
                Some("bookings") => ResultShape::Outcome,
                Some("topups") => ResultShape::Balance,
                Some("users" | "slots" | "subscriptions") => ResultShape::Id,
                _ => ResultShape::Empty,
            },
            Some("select") => match table_after("from") {
                Some("users") => ResultShape::User,
                Some("slots") => ResultShape::Slot,
                Some("wallets") => ResultShape::Wallet,
                Some("wallet_transactions") => ResultShape::Transactions,
                Some("bookings") if !by_user_or_slot && lower.contains("gym_id") => {
                    ResultShape::GymBookings
                }
                Some("bookings") => ResultShape::Bookings,
                Some("subscriptions") => ResultShape::Subscriptions,
                Some("booking_stats_by_day") => ResultShape::DailyStats,
                Some("booking_stats_by_gym") => ResultShape::GymStats,
                _ => ResultShape::Empty,
            },
            _ => ResultShape::Empty,
        }
    }

    fn columns(self) -> &'static [(&'static str, Type)] {
        match self {
            ResultShape::Empty => &[],
            ResultShape::Id => &[("id", Type::INT8)],
            ResultShape::Balance => &[("balance", Type::INT8)],
            ResultShape::Outcome => &[
                ("id", Type::INT8),
                ("slot_id", Type::INT8),
                ("payment_method", Type::VARCHAR),
                ("payment_details", Type::VARCHAR),
            ],
            ResultShape::User => &[
                ("id", Type::INT8),
                ("email", Type::VARCHAR),
                ("name", Type::VARCHAR),
            ],
            ResultShape::Slot => &[
                ("id", Type::INT8),
                ("gym_id", Type::INT8),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("capacity", Type::INT8),
                ("booked", Type::INT8),
                ("available", Type::INT8),
                ("is_full", Type::BOOL),
            ],
            ResultShape::Wallet => &[
                ("id", Type::INT8),
                ("user_id", Type::INT8),
                ("balance", Type::INT8),
                ("currency", Type::VARCHAR),
                ("created_at", Type::INT8),
                ("updated_at", Type::INT8),
            ],
            ResultShape::Transactions => &[
                ("id", Type::VARCHAR),
                ("wallet_id", Type::INT8),
                ("amount", Type::INT8),
                ("type", Type::VARCHAR),
                ("balance_after", Type::INT8),
                ("created_at", Type::INT8),
            ],
            ResultShape::Bookings => &[
                ("id", Type::INT8),
                ("user_id", Type::INT8),
                ("slot_id", Type::INT8),
                ("status", Type::VARCHAR),
                ("created_at", Type::INT8),
            ],
            ResultShape::GymBookings => &[
                ("id", Type::INT8),
                ("user_id", Type::INT8),
                ("slot_id", Type::INT8),
                ("status", Type::VARCHAR),
                ("created_at", Type::INT8),
                ("gym_id", Type::INT8),
                ("slot_start", Type::INT8),
                ("slot_end", Type::INT8),
                ("user_name", Type::VARCHAR),
                ("user_email", Type::VARCHAR),
            ],
            ResultShape::DailyStats => &[
                ("day", Type::INT8),
                ("booked", Type::INT8),
                ("cancelled", Type::INT8),
            ],
            ResultShape::GymStats => &[
                ("gym_id", Type::INT8),
                ("booked", Type::INT8),
                ("cancelled", Type::INT8),
            ],
            ResultShape::Subscriptions => &[
                ("id", Type::INT8),
                ("user_id", Type::INT8),
                ("gym_id", Type::INT8),
                ("status", Type::VARCHAR),
                ("visits_limit", Type::INT8),
                ("visits_used", Type::INT8),
                ("price", Type::INT8),
                ("valid_from", Type::INT8),
                ("valid_until", Type::INT8),
            ],
        }
    }

    fn schema(self, format: &Format) -> Vec<FieldInfo> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| {
                FieldInfo::new(
                    (*name).into(),
                    None,
                    None,
                    ty.clone(),
                    format.format_for(i),
                )
            })
            .collect()
    }
}

fn rows<T>(
    shape: ResultShape,
    format: &Format,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(shape.schema(format));
    let rows: Vec<PgWireResult<DataRow>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn single_row(
    shape: ResultShape,
    format: &Format,
    encode: impl Fn(&mut DataRowEncoder) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    rows(shape, format, vec![()], |enc, _| encode(enc))
}

#[async_trait]
impl SimpleQueryHandler for FitslotHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FitslotQueryParser;

#[async_trait]
impl QueryParser for FitslotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let text = Format::UnifiedText;
        Ok(ResultShape::of_sql(stmt).schema(column_format.unwrap_or(&text)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FitslotHandler {
    type Statement = String;
    type QueryParser = FitslotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql, &portal.result_column_format).await
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
        let schema = ResultShape::of_sql(&target.statement).schema(&Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let shape = ResultShape::of_sql(&target.statement.statement);
        Ok(DescribePortalResponse::new(
            shape.schema(&target.result_column_format),
        ))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// One left-to-right pass: each `$N` outside a string literal is replaced
/// exactly once, and bound text is never scanned again.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let param = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                if let Some(param) = param {
                    out.push_str(&sql[copied..i]);
                    match param {
                        Some(text) => {
                            out.push('\'');
                            out.push_str(&text.replace('\'', "''"));
                            out.push('\'');
                        }
                        None => out.push_str("NULL"),
                    }
                    copied = end;
                }
                i = end.max(i + 1);
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FitslotFactory {
    handler: Arc<FitslotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FitslotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FitslotFactory {
    pub fn new(service: Arc<BookingService>, auth_source: FitslotAuthSource) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FitslotHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FitslotFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<FitslotFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// Stable SQLSTATE for each booking outcome.
fn booking_sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::SlotNotFound(_) | BookingError::BookingNotFound(_) => "P0002",
        BookingError::SlotInPast(_) => "22023",
        BookingError::SlotFull(_) => "53400",
        BookingError::AlreadyBooked { .. } => "23505",
        BookingError::InsufficientBalance { .. } => "P0004",
        BookingError::Forbidden { .. } => "42501",
        BookingError::AlreadyCancelled(_) => "55000",
        BookingError::StorageUnavailable(_) => "57P03",
        BookingError::InvariantViolation(_) => "XX000",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    if let BookingError::InvariantViolation(_) = e {
        error!("invariant violation surfaced to client: {e}");
    }
    user_error(booking_sqlstate(&e), e.to_string())
}

fn store_err(e: StoreError) -> PgWireError {
    match e {
        StoreError::InvalidArgument(_) => user_error("22023", e.to_string()),
        StoreError::EmailTaken(_) => user_error("23505", e.to_string()),
        other => booking_err(BookingError::from(other)),
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
