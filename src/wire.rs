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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::PitstopAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct PitstopHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<PitstopQueryParser>,
}

impl PitstopHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(PitstopQueryParser),
        }
    }

    /// The login user is the caller's identity; the configured admin login
    /// gets administrator rights.
    fn principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let user = client
            .metadata()
            .get(pgwire::api::METADATA_USER)
            .cloned()
            .ok_or_else(|| user_error("28000", "no user in startup message".into()))?;
        Ok(Principal {
            is_admin: user == self.admin_user,
            user_id: user,
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let principal = self.principal(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(cmd, &principal).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!("{label} by {} -> {status}", principal.user_id);
        result
    }

    async fn execute_command(
        &self,
        cmd: Command,
        principal: &Principal,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::SelectAvailableSlots(query) => {
                let slots = engine.available_slots(&query).await.map_err(engine_err)?;
                let schema = Arc::new(slot_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_timestamp(slot.span.start))?;
                        encoder.encode_field(&format_timestamp(slot.span.end))?;
                        encoder.encode_field(&slot.employee_id.to_string())?;
                        encoder.encode_field(&slot.employee_name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectServices => {
                let services = engine.list_services().await.map_err(engine_err)?;
                let schema = Arc::new(service_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .iter()
                    .map(|service| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&service.id)?;
                        encoder.encode_field(&service.name)?;
                        encoder.encode_field(&service.description)?;
                        encoder.encode_field(&i64::from(service.duration_minutes))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectReservations => {
                let views = engine
                    .reservations_for_user(&principal.user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_response(&views)?])
            }
            Command::SelectVehicles => {
                let vehicles = engine
                    .vehicles_for_user(&principal.user_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(vehicle_schema());
                let rows: Vec<PgWireResult<_>> = vehicles
                    .iter()
                    .map(|vehicle| encode_vehicle(&schema, vehicle))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertReservation(request) => {
                let view = engine
                    .create_reservation(&request, &principal.user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_response(std::slice::from_ref(&view))?])
            }
            Command::CancelReservation { id } => {
                engine
                    .cancel_reservation(id, principal)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::UpdateReservationStatus { id, status } => {
                engine
                    .update_reservation_status(id, status, principal)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertVehicle(vehicle) => {
                engine
                    .register_vehicle(&vehicle, principal)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::InsertService(service) => {
                engine
                    .upsert_service(&service, principal)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::InsertEmployee(employee) => {
                engine
                    .upsert_employee(&employee, principal)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::InsertSchedule {
                employee_id,
                start,
                end,
            } => {
                let schedule = engine
                    .add_schedule(employee_id, start, end, principal)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schedule_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&schedule.id.to_string())?;
                encoder.encode_field(&schedule.employee_id.to_string())?;
                encoder.encode_field(&format_timestamp(schedule.span.start))?;
                encoder.encode_field(&format_timestamp(schedule.span.end))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::DeleteSchedule { id } => {
                engine
                    .remove_schedule(id, principal)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
        }
    }
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn reservation_response(views: &[ReservationView]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = views
        .iter()
        .map(|view| {
            let r = &view.reservation;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.service_id)?;
            encoder.encode_field(&view.service_name)?;
            encoder.encode_field(&i64::from(view.service_duration_minutes))?;
            encoder.encode_field(&r.vehicle_license_plate)?;
            encoder.encode_field(&r.employee_id.to_string())?;
            encoder.encode_field(&view.employee_name)?;
            encoder.encode_field(&format_timestamp(r.span.start))?;
            encoder.encode_field(&format_timestamp(r.span.end))?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.recommendation_text)?;
            encoder.encode_field(&format_timestamp(r.created_at))?;
            encoder.encode_field(&format_timestamp(r.updated_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_vehicle(
    schema: &Arc<Vec<FieldInfo>>,
    vehicle: &Vehicle,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&vehicle.license_plate)?;
    encoder.encode_field(&vehicle.brand)?;
    encoder.encode_field(&vehicle.model)?;
    encoder.encode_field(&vehicle.production_year)?;
    encoder.encode_field(&vehicle.vin)?;
    encoder.encode_field(&vehicle.car_type)?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text("start_ts"),
        text("end_ts"),
        text("employee_id"),
        text("employee_name"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        int8("service_id"),
        text("service_name"),
        int8("duration_minutes"),
        text("vehicle_license_plate"),
        text("employee_id"),
        text("employee_name"),
        text("start_ts"),
        text("end_ts"),
        text("status"),
        text("recommendation_text"),
        text("created_at"),
        text("updated_at"),
    ]
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        int8("id"),
        text("name"),
        text("description"),
        int8("duration_minutes"),
    ]
}

fn vehicle_schema() -> Vec<FieldInfo> {
    vec![
        text("license_plate"),
        text("brand"),
        text("model"),
        FieldInfo::new("production_year".into(), None, None, Type::INT4, FieldFormat::Text),
        text("vin"),
        text("car_type"),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("employee_id"),
        text("start_ts"),
        text("end_ts"),
    ]
}

/// Row shape a statement will produce, judged from its text. Used by the
/// describe messages, where `$n` placeholders are still unbound.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let is_select = words.first() == Some(&"select");
    let is_insert_into = |table: &str| {
        words.first() == Some(&"insert")
            && words
                .get(2)
                .is_some_and(|t| t.trim_end_matches('(') == table)
    };

    if is_select && lower.contains("available_slots") {
        slot_schema()
    } else if (is_select && lower.contains("reservations")) || is_insert_into("reservations") {
        reservation_schema()
    } else if is_select && lower.contains("services") {
        service_schema()
    } else if is_select && lower.contains("vehicles") {
        vehicle_schema()
    } else if is_insert_into("employee_schedules") {
        schedule_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for PitstopHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(&*client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PitstopQueryParser;

#[async_trait]
impl QueryParser for PitstopQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for PitstopHandler {
    type Statement = String;
    type QueryParser = PitstopQueryParser;

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
        let sql = substitute_params(portal);
        let responses = self.run(&*client, &sql).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Replace `$1`, `$2`, ... with the bound text parameters as quoted literals.
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

fn bind_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct PitstopFactory {
    handler: Arc<PitstopHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PitstopAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl PitstopFactory {
    pub fn new(engine: Arc<Engine>, password: String, admin_user: String) -> Self {
        let auth_source = PitstopAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(PitstopHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PitstopFactory {
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
    password: String,
    admin_user: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = PitstopFactory::new(engine, password, admin_user);
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

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
