use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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

use crate::auth::AppointdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, AppointmentFilter, Command, SqlError};

pub struct AppointdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<AppointdQueryParser>,
}

impl AppointdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(AppointdQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertPatient(patient) => {
                engine.register_patient(patient).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertDoctor(doctor) => {
                engine.register_doctor(doctor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertAppointment {
                patient_id,
                doctor_id,
                span,
                notes,
            } => {
                let appointment = engine
                    .create_appointment(patient_id, doctor_id, span, notes)
                    .await
                    .map_err(engine_err)?;
                appointment_response(vec![appointment])
            }
            Command::UpdateAppointment { id, patch } => {
                let appointment = engine
                    .update_appointment(id, patch)
                    .await
                    .map_err(engine_err)?;
                appointment_response(vec![appointment])
            }
            Command::CancelAppointment { id } => {
                let appointment = engine.cancel_appointment(id).await.map_err(engine_err)?;
                appointment_response(vec![appointment])
            }
            Command::CompleteAppointment { id } => {
                let appointment = engine.complete_appointment(id).await.map_err(engine_err)?;
                appointment_response(vec![appointment])
            }
            Command::DeleteAppointment { id } => {
                engine.remove_appointment(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAppointments(filter) => {
                let appointments = match filter {
                    AppointmentFilter::All => engine.list_appointments().await,
                    AppointmentFilter::Id(id) => match engine.get_appointment(id).await {
                        Ok(a) => vec![a],
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    AppointmentFilter::Doctor(doctor_id) => {
                        engine.list_doctor_appointments(doctor_id).await
                    }
                    AppointmentFilter::Patient(patient_id) => {
                        engine.list_patient_appointments(patient_id).await
                    }
                    AppointmentFilter::Overlapping { doctor_id, span } => {
                        engine.conflicts(doctor_id, span).await
                    }
                };
                appointment_response(appointments)
            }
            Command::SelectPatients { id } => {
                let patients = match id {
                    Some(id) => engine.get_patient(id).ok().into_iter().collect(),
                    None => engine.list_patients(),
                };
                let schema = Arc::new(patient_schema());
                let rows: Vec<PgWireResult<_>> = patients
                    .iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.name)?;
                        encoder.encode_field(&p.email)?;
                        encoder.encode_field(&p.phone)?;
                        encoder.encode_field(&p.birth_date)?;
                        encoder.encode_field(&p.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectDoctors { id } => {
                let doctors = match id {
                    Some(id) => engine.get_doctor(id).ok().into_iter().collect(),
                    None => engine.list_doctors(),
                };
                let schema = Arc::new(doctor_schema());
                let rows: Vec<PgWireResult<_>> = doctors
                    .iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&d.id.to_string())?;
                        encoder.encode_field(&d.name)?;
                        encoder.encode_field(&d.specialty)?;
                        encoder.encode_field(&d.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn appointment_response(appointments: Vec<Appointment>) -> PgWireResult<Response> {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.patient_id.to_string())?;
            encoder.encode_field(&a.doctor_id.to_string())?;
            encoder.encode_field(&a.span.start)?;
            encoder.encode_field(&a.span.end)?;
            encoder.encode_field(&a.status.as_str())?;
            encoder.encode_field(&a.notes)?;
            encoder.encode_field(&a.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("patient_id", Type::VARCHAR),
        text_field("doctor_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("notes", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn patient_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
        text_field("phone", Type::VARCHAR),
        text_field("birth_date", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn doctor_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("specialty", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

/// Result columns for a statement, from keywords alone (parameters are not
/// bound yet when clients ask).
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("APPOINTMENTS") {
        if upper.contains("DELETE") {
            vec![]
        } else {
            appointment_schema()
        }
    } else if !upper.contains("SELECT") {
        vec![]
    } else if upper.contains("PATIENTS") {
        patient_schema()
    } else if upper.contains("DOCTORS") {
        doctor_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for AppointdHandler {
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
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AppointdQueryParser;

#[async_trait]
impl QueryParser for AppointdQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AppointdHandler {
    type Statement = String;
    type QueryParser = AppointdQueryParser;

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
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Byte ranges and indexes of the `$N` placeholders in `sql`. Text inside
/// quoted literals or identifiers is skipped.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>()
                    && n > 0
                {
                    found.push((i..end, n));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|(_, n)| *n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... with bound parameter values (text format) in one
/// left-to-right pass. Substituted values are never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut bound = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = params.get(n - 1) else {
            continue;
        };
        bound.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                bound.push('\'');
                bound.push_str(&text.replace('\'', "''"));
                bound.push('\'');
            }
            None => bound.push_str("NULL"),
        }
        copied = range.end;
    }
    bound.push_str(&sql[copied..]);
    bound
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppointdFactory {
    handler: Arc<AppointdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<AppointdAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl AppointdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = AppointdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AppointdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AppointdFactory {
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
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = AppointdFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidWindow(_) => "22023",
        EngineError::UnknownPatient(_) | EngineError::UnknownDoctor(_) => "23503",
        EngineError::Unavailable { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::DuplicateId(_) | EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::DuplicateId(_) | EngineError::WalError(_) => {
            tracing::error!("engine error: {e}");
        }
        EngineError::Unavailable { .. } => {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!("rejected: {e}");
        }
        _ => tracing::debug!("rejected: {e}"),
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    tracing::debug!("bad statement: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn sqlstate_codes() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::InvalidWindow(Span::new(2, 1))), "22023");
        assert_eq!(sqlstate(&EngineError::UnknownDoctor(id)), "23503");
        assert_eq!(
            sqlstate(&EngineError::Unavailable {
                conflict: id,
                span: Span::new(1, 2)
            }),
            "23P01"
        );
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM appointments"), 0);
        assert_eq!(
            count_params("SELECT * FROM appointments WHERE doctor_id = $1 AND start < $3 AND \"end\" > $2"),
            3
        );
        assert_eq!(count_params("SELECT $10"), 10);
        assert_eq!(count_params("SELECT * FROM patients WHERE name = '$4' AND id = $1"), 1);
    }

    #[test]
    fn bind_params_does_not_rescan_values() {
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let params = [Some(id.as_bytes()), Some("see $1, it's cheap".as_bytes())];
        assert_eq!(
            bind_params("UPDATE appointments SET notes = $2 WHERE id = $1", &params),
            format!("UPDATE appointments SET notes = 'see $1, it''s cheap' WHERE id = '{id}'")
        );
        assert!(matches!(
            crate::sql::parse_sql(&bind_params(
                "UPDATE appointments SET notes = $2 WHERE id = $1",
                &params
            )),
            Ok(crate::sql::Command::UpdateAppointment { .. })
        ));
    }

    #[test]
    fn bind_params_multi_digit_null_and_literals() {
        let params: Vec<Option<&[u8]>> = (1..=10)
            .map(|n| if n == 3 { None } else { Some(if n == 10 { &b"ten"[..] } else { &b"x"[..] }) })
            .collect();
        assert_eq!(bind_params("SELECT $10, $1, $3", &params), "SELECT 'ten', 'x', NULL");
        assert_eq!(bind_params("SELECT '$1', $1", &params), "SELECT '$1', 'x'");
        // Unbound placeholders are left for the parser to reject.
        assert_eq!(bind_params("SELECT $11", &params), "SELECT $11");
    }

    #[test]
    fn schema_by_keywords() {
        assert_eq!(schema_for_statement("select * from appointments").len(), 8);
        assert_eq!(
            schema_for_statement("UPDATE appointments SET status = $1 WHERE id = $2").len(),
            8
        );
        assert!(schema_for_statement("DELETE FROM appointments WHERE id = $1").is_empty());
        assert_eq!(schema_for_statement("SELECT * FROM patients").len(), 6);
        assert_eq!(schema_for_statement("SELECT * FROM doctors WHERE id = $1").len(), 4);
        assert!(schema_for_statement("INSERT INTO doctors VALUES ($1, $2, $3)").is_empty());
    }
}
