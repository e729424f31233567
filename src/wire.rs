use std::fmt::Debug;
use std::io;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::PaddockAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind, default_horizon};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};
use crate::venue::VenueManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    venues: Arc<VenueManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(PaddockFactory::new(venues, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct PaddockHandler {
    venues: Arc<VenueManager>,
    query_parser: Arc<PaddockQueryParser>,
}

impl PaddockHandler {
    pub fn new(venues: Arc<VenueManager>) -> Self {
        Self {
            venues,
            query_parser: Arc::new(PaddockQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.venues.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("venue error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertArena { id, name } => {
                engine.create_arena(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteArena { id } => {
                engine.deactivate_arena(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectArenas => {
                let schema = Arc::new(arena_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_arenas()
                    .await
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.name)?;
                        encoder.encode_field(&info.active)?;
                        encoder.encode_field(&(info.confirmed as i64))?;
                        encoder.encode_field(&(info.pending as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertHorse { id, owner_id, name } => {
                engine
                    .register_horse(id, owner_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteHorse { id } => {
                engine.remove_horse(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertStaff { id } => {
                engine.grant_staff(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteStaff { id } => {
                engine.revoke_staff(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SetQuotaConfig { config } => {
                engine
                    .set_quota_config(Some(config))
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ClearQuotaConfig => {
                engine.set_quota_config(None).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectQuotaConfig => {
                let schema = Arc::new(quota_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .quota_config()
                    .await
                    .into_iter()
                    .map(|config| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&config.max_booking_duration)?;
                        encoder.encode_field(&config.min_advance_notice)?;
                        encoder.encode_field(&config.max_advance_days.map(i64::from))?;
                        encoder.encode_field(&config.max_future_total)?;
                        encoder.encode_field(&config.max_daily_total)?;
                        encoder.encode_field(&config.max_weekly_total)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking(draft) => {
                let booking = engine.admit(draft).await.map_err(engine_err)?;
                Ok(booking_response(vec![booking]))
            }
            Command::Reschedule { id, start, end } => {
                let booking = engine
                    .reschedule(id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(booking_response(vec![booking]))
            }
            Command::CancelBooking { id } => {
                let booking = engine.cancel(id).await.map_err(engine_err)?;
                Ok(booking_response(vec![booking]))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(booking_response(vec![booking]))
            }
            Command::SelectBookings {
                arena_id,
                start,
                end,
            } => {
                let window = match (start, end) {
                    (Some(start), Some(end)) => Some(Span::try_new(start, end).ok_or_else(
                        || engine_err(EngineError::InvalidSpan { start, end }),
                    )?),
                    _ => None,
                };
                let mut bookings = engine
                    .list_bookings(arena_id, window)
                    .await
                    .map_err(engine_err)?;
                // A single bound is an open-ended window.
                if window.is_none() {
                    bookings.retain(|b| {
                        start.is_none_or(|s| b.span.start >= s) && end.is_none_or(|e| b.span.end <= e)
                    });
                }
                Ok(booking_response(bookings))
            }
            Command::Reconcile { horizon } => {
                let horizon = horizon.unwrap_or_else(|| default_horizon(engine.now()));
                let report = engine
                    .run_reconciliation(horizon)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(reconcile_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(report.processed as i64))?;
                encoder.encode_field(&(report.confirmed as i64))?;
                encoder.encode_field(&horizon)?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn booking_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<DataRow>> = bookings
        .iter()
        .map(|b| encode_booking(&schema, b))
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.arena_id.to_string())?;
    encoder.encode_field(&b.horse_id.map(|h| h.to_string()))?;
    encoder.encode_field(&b.requester_id.to_string())?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.class.to_string())?;
    encoder.encode_field(&b.state.to_string())?;
    encoder.encode_field(&b.created_at)?;
    Ok(encoder.take_row())
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("arena_id", Type::VARCHAR),
        field("horse_id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("class", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn arena_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("active", Type::BOOL),
        field("confirmed", Type::INT8),
        field("pending", Type::INT8),
    ]
}

fn quota_schema() -> Vec<FieldInfo> {
    vec![
        field("max_booking_duration", Type::INT8),
        field("min_advance_notice", Type::INT8),
        field("max_advance_days", Type::INT8),
        field("max_future_total", Type::INT8),
        field("max_daily_total", Type::INT8),
        field("max_weekly_total", Type::INT8),
    ]
}

fn reconcile_schema() -> Vec<FieldInfo> {
    vec![
        field("processed", Type::INT8),
        field("confirmed", Type::INT8),
        field("horizon", Type::INT8),
    ]
}

/// Result columns for a statement, judged from its text since parameters are still unbound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let upper = upper.split_whitespace().collect::<Vec<_>>().join(" ");
    if upper.starts_with("SELECT") {
        if upper.contains("FROM ARENAS") {
            arena_schema()
        } else if upper.contains("FROM QUOTA_CONFIG") {
            quota_schema()
        } else if upper.contains("FROM RECONCILE") {
            reconcile_schema()
        } else if upper.contains("FROM BOOKINGS") {
            booking_schema()
        } else {
            vec![]
        }
    } else if upper.starts_with("INSERT INTO BOOKINGS")
        || upper.starts_with("INSERT INTO RESCHEDULES")
        || upper.starts_with("DELETE FROM BOOKINGS")
    {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for PaddockHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PaddockQueryParser;

#[async_trait]
impl QueryParser for PaddockQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for PaddockHandler {
    type Statement = String;
    type QueryParser = PaddockQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
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
/// Replaced from the highest index down so `$1` never clobbers `$10`.
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

// ── Factory ──────────────────────────────────────────────────────

pub struct PaddockFactory {
    handler: Arc<PaddockHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PaddockAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl PaddockFactory {
    pub fn new(venues: Arc<VenueManager>, password: String) -> Self {
        let auth_source = PaddockAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(PaddockHandler::new(venues)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PaddockFactory {
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

/// SQLSTATE for an engine rejection.
fn sqlstate(e: &EngineError) -> &'static str {
    match e.kind() {
        ErrorKind::Validation => "22023",
        ErrorKind::CapacityConflict => "23P01",
        ErrorKind::Ownership | ErrorKind::Privilege => "42501",
        ErrorKind::QuotaHardRule => "P0001",
        ErrorKind::NotFound => "P0002",
        ErrorKind::State | ErrorKind::Storage => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
