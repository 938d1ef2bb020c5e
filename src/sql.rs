use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Row selection for `SELECT ... FROM appointments`.
#[derive(Debug, PartialEq)]
pub enum AppointmentFilter {
    All,
    Id(Ulid),
    Doctor(Ulid),
    Patient(Ulid),
    /// Active appointments on the doctor overlapping the span.
    Overlapping { doctor_id: Ulid, span: Span },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPatient(Patient),
    InsertDoctor(Doctor),
    InsertAppointment {
        patient_id: Ulid,
        doctor_id: Ulid,
        span: Span,
        notes: Option<String>,
    },
    UpdateAppointment {
        id: Ulid,
        patch: AppointmentPatch,
    },
    CancelAppointment {
        id: Ulid,
    },
    CompleteAppointment {
        id: Ulid,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectAppointments(AppointmentFilter),
    SelectPatients {
        id: Option<Ulid>,
    },
    SelectDoctors {
        id: Option<Ulid>,
    },
}

const PATIENT_COLUMNS: &[&str] = &["id", "name", "email", "phone", "birth_date"];
const DOCTOR_COLUMNS: &[&str] = &["id", "name", "specialty"];
const APPOINTMENT_COLUMNS: &[&str] = &["patient_id", "doctor_id", "start", "end", "notes"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "patients" => {
            let row = InsertRow::new(insert, PATIENT_COLUMNS)?;
            Ok(Command::InsertPatient(Patient {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_string_expr(row.required("name")?)?,
                email: row.optional("email").map(parse_string_or_null).transpose()?.flatten(),
                phone: row.optional("phone").map(parse_string_or_null).transpose()?.flatten(),
                birth_date: row
                    .optional("birth_date")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
                created_at: 0,
            }))
        }
        "doctors" => {
            let row = InsertRow::new(insert, DOCTOR_COLUMNS)?;
            Ok(Command::InsertDoctor(Doctor {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_string_expr(row.required("name")?)?,
                specialty: parse_string_expr(row.required("specialty")?)?,
                created_at: 0,
            }))
        }
        "appointments" => {
            let row = InsertRow::new(insert, APPOINTMENT_COLUMNS)?;
            if row.optional("id").is_some() {
                return Err(SqlError::Unsupported(
                    "appointment ids are assigned by the server".into(),
                ));
            }
            Ok(Command::InsertAppointment {
                patient_id: parse_ulid_expr(row.required("patient_id")?)?,
                doctor_id: parse_ulid_expr(row.required("doctor_id")?)?,
                span: Span::new(
                    parse_i64_expr(row.required("start")?)?,
                    parse_i64_expr(row.required("end")?)?,
                ),
                notes: row.optional("notes").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = AppointmentPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "start" => patch.start = Some(parse_i64_expr(value)?),
            "end" => patch.end = Some(parse_i64_expr(value)?),
            "doctor_id" => patch.doctor_id = Some(parse_ulid_expr(value)?),
            "notes" => patch.notes = Some(parse_string_or_null(value)?),
            "status" => patch.status = Some(parse_status_expr(value)?),
            other => return Err(SqlError::ReadOnlyColumn(other.to_string())),
        }
    }

    if patch == AppointmentPatch::status(Status::Cancelled) {
        return Ok(Command::CancelAppointment { id });
    }
    if patch == AppointmentPatch::status(Status::Completed) {
        return Ok(Command::CompleteAppointment { id });
    }
    Ok(Command::UpdateAppointment { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "appointments" => Ok(Command::DeleteAppointment { id }),
        "patients" | "doctors" => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "appointments" => Ok(Command::SelectAppointments(filters.appointment_filter()?)),
        "patients" => Ok(Command::SelectPatients {
            id: filters.only_id()?,
        }),
        "doctors" => Ok(Command::SelectDoctors {
            id: filters.only_id()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// WHERE-clause conjuncts we understand.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    doctor_id: Option<Ulid>,
    patient_id: Option<Ulid>,
    /// `start < x`: the query window's end.
    starts_before: Option<Ms>,
    /// `"end" > x`: the query window's start.
    ends_after: Option<Ms>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)
                }
                ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                    Some("id") => {
                        self.id = Some(parse_ulid_expr(right)?);
                        Ok(())
                    }
                    Some("doctor_id") => {
                        self.doctor_id = Some(parse_ulid_expr(right)?);
                        Ok(())
                    }
                    Some("patient_id") => {
                        self.patient_id = Some(parse_ulid_expr(right)?);
                        Ok(())
                    }
                    _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
                },
                ast::BinaryOperator::Lt if expr_column_name(left).as_deref() == Some("start") => {
                    self.starts_before = Some(parse_i64_expr(right)?);
                    Ok(())
                }
                ast::BinaryOperator::Gt if expr_column_name(left).as_deref() == Some("end") => {
                    self.ends_after = Some(parse_i64_expr(right)?);
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
            },
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn appointment_filter(self) -> Result<AppointmentFilter, SqlError> {
        match self {
            Filters {
                id: None,
                doctor_id: None,
                patient_id: None,
                starts_before: None,
                ends_after: None,
            } => Ok(AppointmentFilter::All),
            Filters {
                id: Some(id),
                doctor_id: None,
                patient_id: None,
                starts_before: None,
                ends_after: None,
            } => Ok(AppointmentFilter::Id(id)),
            Filters {
                id: None,
                doctor_id: Some(doctor_id),
                patient_id: None,
                starts_before: None,
                ends_after: None,
            } => Ok(AppointmentFilter::Doctor(doctor_id)),
            Filters {
                id: None,
                doctor_id: None,
                patient_id: Some(patient_id),
                starts_before: None,
                ends_after: None,
            } => Ok(AppointmentFilter::Patient(patient_id)),
            Filters {
                id: None,
                doctor_id: Some(doctor_id),
                patient_id: None,
                starts_before: Some(end),
                ends_after: Some(start),
            } => Ok(AppointmentFilter::Overlapping {
                doctor_id,
                span: Span::new(start, end),
            }),
            Filters {
                doctor_id: Some(_),
                starts_before,
                ends_after,
                ..
            } if starts_before.is_none() != ends_after.is_none() => Err(
                SqlError::MissingFilter(if starts_before.is_none() { "start" } else { "end" }),
            ),
            _ => Err(SqlError::Unsupported("combination of filters".into())),
        }
    }

    fn only_id(self) -> Result<Option<Ulid>, SqlError> {
        if self.doctor_id.is_some()
            || self.patient_id.is_some()
            || self.starts_before.is_some()
            || self.ends_after.is_some()
        {
            return Err(SqlError::Unsupported("only id filters are supported".into()));
        }
        Ok(self.id)
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// The first VALUES row of an INSERT, keyed by column. Without a column
/// list, values bind to `defaults` in order.
struct InsertRow {
    values: Vec<(String, Expr)>,
}

impl InsertRow {
    fn new(insert: &ast::Insert, defaults: &[&str]) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        }
        let row = &rows[0];
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
            return Err(SqlError::WrongArity("INSERT", columns.len(), row.len()));
        }
        for column in &columns {
            if !defaults.contains(&column.as_str()) && column != "id" {
                return Err(SqlError::UnknownColumn(column.clone()));
            }
        }
        Ok(Self {
            values: columns.into_iter().zip(row.iter().cloned()).collect(),
        })
    }

    fn optional(&self, column: &str) -> Option<&Expr> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.optional(column).ok_or(SqlError::MissingColumn(column))
    }
}

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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_status_expr(expr: &Expr) -> Result<Status, SqlError> {
    parse_string_expr(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    ReadOnlyColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column cannot be updated: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
