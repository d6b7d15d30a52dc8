use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{
    BookingReceipt, BookingRequest, Engine, EngineError, ErrorKind, HoldRequest, ReleaseOutcome,
};
use crate::inventory::InMemoryInventory;
use crate::observability::{command_label, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::{TenantContext, TenantError};

pub struct RentalHandler {
    engine: Arc<Engine>,
    inventory: Arc<InMemoryInventory>,
    query_parser: Arc<RentalQueryParser>,
}

impl RentalHandler {
    pub fn new(engine: Arc<Engine>, inventory: Arc<InMemoryInventory>) -> Self {
        Self {
            engine,
            inventory,
            query_parser: Arc::new(RentalQueryParser),
        }
    }

    /// The connection's database name is its tenant context.
    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<TenantContext> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_default();
        TenantContext::from_database(&db).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            user_error("3D000", format!("invalid database {db:?}: {e}"))
        })
    }

    async fn run(&self, tenant: &TenantContext, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(tenant, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, tenant: &TenantContext, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertItems { items } => {
                let tenant_id = tenant.require_tenant().map_err(tenant_err)?;
                let count = items.len();
                for (item_id, total) in items {
                    self.inventory.set_total_quantity(tenant_id, item_id, total);
                }
                debug!(tenant = %tenant_id, count, "items upserted");
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::InsertHold {
                item_id,
                quantity,
                start,
                end,
                ttl_ms,
                customer_id,
                session_id,
            } => {
                let mut req = HoldRequest::new(tenant.clone(), item_id, quantity, start, end);
                if let Some(ms) = ttl_ms {
                    req = req.ttl(Duration::from_millis(ms.max(0) as u64));
                }
                req.customer_id = customer_id;
                req.session_id = session_id;
                let hold = self.engine.create_hold(req).await.map_err(engine_err)?;

                let schema = Arc::new(hold_created_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&hold.id.to_string())?;
                encoder.encode_field(&hold.tenant_id.to_string())?;
                encoder.encode_field(&hold.expires_at)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::DeleteHold { id } => {
                let rows = match self.engine.release_hold(tenant, id).await.map_err(engine_err)? {
                    ReleaseOutcome::Released(_) => 1,
                    ReleaseOutcome::NotFound => 0,
                };
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(rows))])
            }
            Command::SelectHold { id } => {
                let schema = Arc::new(hold_schema());
                let rows: Vec<PgWireResult<_>> = self
                    .engine
                    .get_hold(tenant, id)
                    .into_iter()
                    .map(|hold| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&hold.id.to_string())?;
                        encoder.encode_field(&hold.tenant_id.to_string())?;
                        encoder.encode_field(&hold.item_id.to_string())?;
                        encoder.encode_field(&i64::from(hold.quantity))?;
                        encoder.encode_field(&hold.span.start)?;
                        encoder.encode_field(&hold.span.end)?;
                        encoder.encode_field(&hold.expires_at)?;
                        encoder.encode_field(&hold.customer_id)?;
                        encoder.encode_field(&hold.session_id)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertBooking {
                customer_id,
                start,
                end,
                idempotency_key,
                lines,
                hold_ids,
            } => {
                let tenant_id = tenant.require_tenant().map_err(tenant_err)?;
                let mut req = BookingRequest::new(tenant_id.clone(), customer_id, lines, start, end);
                req.idempotency_key = idempotency_key;
                req.consume_holds = hold_ids;
                let BookingReceipt { booking, replayed } =
                    self.engine.create_booking(req).await.map_err(engine_err)?;

                let schema = Arc::new(booking_created_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&booking.id.to_string())?;
                encoder.encode_field(&booking.status.label().to_string())?;
                encoder.encode_field(&replayed)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::DeleteBooking { id } => {
                let tenant_id = tenant.require_tenant().map_err(tenant_err)?;
                self.engine
                    .cancel_booking(tenant_id, id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBooking { id } => {
                let tenant_id = tenant.require_tenant().map_err(tenant_err)?;
                let schema = Arc::new(booking_schema());
                // One row per line; unknown and foreign ids read as no rows.
                let booking = self.engine.get_booking(tenant_id, id);
                let rows: Vec<PgWireResult<_>> = booking
                    .iter()
                    .flat_map(|b| b.lines.iter().map(move |line| (b, line)))
                    .map(|(b, line)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.tenant_id.to_string())?;
                        encoder.encode_field(&b.customer_id)?;
                        encoder.encode_field(&b.status.label().to_string())?;
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&line.item_id.to_string())?;
                        encoder.encode_field(&i64::from(line.quantity))?;
                        encoder.encode_field(&line.unit_price_snapshot)?;
                        encoder.encode_field(&b.idempotency_key)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { item_id, start, end } => {
                let availability = self
                    .engine
                    .availability(tenant, item_id, start, end)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&item_id.to_string())?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&end)?;
                encoder.encode_field(&i64::from(availability.total_quantity))?;
                encoder.encode_field(&i64::from(availability.committed_and_held))?;
                encoder.encode_field(&i64::from(availability.available))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn hold_created_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("tenant_id"), int8("expires_at")]
}

fn hold_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tenant_id"),
        text("item_id"),
        int8("quantity"),
        int8("start"),
        int8("end"),
        int8("expires_at"),
        text("customer_id"),
        text("session_id"),
    ]
}

fn booking_created_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("status"),
        FieldInfo::new("replayed".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tenant_id"),
        text("customer_id"),
        text("status"),
        int8("start"),
        int8("end"),
        text("item_id"),
        int8("quantity"),
        int8("unit_price"),
        text("idempotency_key"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("item_id"),
        int8("start"),
        int8("end"),
        int8("total_quantity"),
        int8("committed_and_held"),
        int8("available"),
    ]
}

/// Row description for a statement that may still carry `$N` placeholders,
/// so it is classified by its leading keywords rather than fully parsed.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };
    match words.first().copied() {
        Some("insert") => match table_after("into") {
            Some("holds") => hold_created_schema(),
            Some("bookings") => booking_created_schema(),
            _ => vec![],
        },
        Some("select") => match table_after("from") {
            Some("holds") => hold_schema(),
            Some("bookings") => booking_schema(),
            Some("availability") => availability_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RentalHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        self.run(&tenant, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentalQueryParser;

#[async_trait]
impl QueryParser for RentalQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentalHandler {
    type Statement = String;
    type QueryParser = RentalQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&tenant, &sql).await?;
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Startup ──────────────────────────────────────────────────────

/// Every user authenticates with the one shared server password.
#[derive(Debug)]
pub struct SharedPassword {
    password: String,
}

impl SharedPassword {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentalFactory {
    handler: Arc<RentalHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentalFactory {
    pub fn new(engine: Arc<Engine>, inventory: Arc<InMemoryInventory>, password: String) -> Self {
        Self {
            handler: Arc::new(RentalHandler::new(engine, inventory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentalFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    inventory: Arc<InMemoryInventory>,
    password: String,
) -> io::Result<()> {
    let factory = RentalFactory::new(engine, inventory, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each error class.
fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BadRequest => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::Transient => "40001",
        ErrorKind::NotFound => "02000",
        ErrorKind::Internal => "XX000",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn tenant_err(e: TenantError) -> PgWireError {
    engine_err(e.into())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
