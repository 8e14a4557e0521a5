use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;
use uuid::Uuid;

use crate::model::*;

/// Parsed command from SQL input. Values are positional in the documented
/// column order; the column list of an INSERT is not consulted.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailableSlots(SlotQuery),
    SelectServices,
    SelectReservations,
    SelectVehicles,
    InsertReservation(CreateReservationRequest),
    /// `DELETE FROM reservations`: a soft cancel.
    CancelReservation { id: ReservationId },
    UpdateReservationStatus {
        id: ReservationId,
        status: ReservationStatus,
    },
    InsertVehicle(NewVehicle),
    InsertService(Service),
    InsertEmployee(Employee),
    InsertSchedule {
        employee_id: EmployeeId,
        start: Ms,
        end: Ms,
    },
    DeleteSchedule { id: ScheduleId },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |expected: usize| -> Result<(), SqlError> {
        if values.len() < expected {
            Err(SqlError::WrongArity(table.clone(), expected, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "reservations" => {
            arity(5)?;
            Ok(Command::InsertReservation(CreateReservationRequest {
                service_id: parse_i64(&values[0])?,
                vehicle_license_plate: parse_string(&values[1])?,
                employee_id: parse_uuid(&values[2])?,
                start: parse_timestamp_expr(&values[3])?,
                end: parse_timestamp_expr(&values[4])?,
            }))
        }
        "vehicles" => {
            arity(4)?;
            let production_year = parse_i64(&values[3])?;
            Ok(Command::InsertVehicle(NewVehicle {
                license_plate: parse_string(&values[0])?,
                brand: parse_string(&values[1])?,
                model: parse_string(&values[2])?,
                production_year: i32::try_from(production_year)
                    .map_err(|_| SqlError::Parse(format!("{production_year} out of range")))?,
                vin: values.get(4).map(parse_string_or_null).transpose()?.flatten(),
                car_type: values.get(5).map(parse_string_or_null).transpose()?.flatten(),
            }))
        }
        "services" => {
            arity(4)?;
            Ok(Command::InsertService(Service {
                id: parse_i64(&values[0])?,
                name: parse_string(&values[1])?,
                description: parse_string_or_null(&values[2])?,
                duration_minutes: parse_u32(&values[3])?,
            }))
        }
        "employees" => {
            arity(2)?;
            Ok(Command::InsertEmployee(Employee {
                id: parse_uuid(&values[0])?,
                name: parse_string(&values[1])?,
            }))
        }
        "employee_schedules" => {
            arity(3)?;
            Ok(Command::InsertSchedule {
                employee_id: parse_uuid(&values[0])?,
                start: parse_timestamp_expr(&values[1])?,
                end: parse_timestamp_expr(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation { id }),
        "employee_schedules" => Ok(Command::DeleteSchedule { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => {
                let raw = parse_string(&assignment.value)?;
                status = Some(raw.parse::<ReservationStatus>().map_err(SqlError::Parse)?);
            }
            Some(other) => {
                return Err(SqlError::Unsupported(format!("cannot update column {other}")));
            }
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }
    Ok(Command::UpdateReservationStatus {
        id,
        status: status.ok_or(SqlError::MissingFilter("status"))?,
    })
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

    match table.as_str() {
        "available_slots" => {
            let mut query_filters = SlotFilters::default();
            if let Some(selection) = &select.selection {
                extract_slot_filters(selection, &mut query_filters)?;
            }
            Ok(Command::SelectAvailableSlots(SlotQuery {
                service_id: query_filters
                    .service_id
                    .ok_or(SqlError::MissingFilter("service_id"))?,
                start: query_filters.start,
                end: query_filters.end,
                limit: extract_limit(query)?,
            }))
        }
        "services" => Ok(Command::SelectServices),
        "reservations" => Ok(Command::SelectReservations),
        "vehicles" => Ok(Command::SelectVehicles),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct SlotFilters {
    service_id: Option<ServiceId>,
    start: Option<Ms>,
    end: Option<Ms>,
}

fn extract_slot_filters(expr: &Expr, filters: &mut SlotFilters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_slot_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, filters)?;
                extract_slot_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq if expr_column_name(left).as_deref() == Some("service_id") => {
                filters.service_id = Some(parse_i64(right)?);
            }
            ast::BinaryOperator::GtEq if expr_column_name(left).as_deref() == Some("start_ts") => {
                filters.start = Some(parse_timestamp_expr(right)?);
            }
            ast::BinaryOperator::LtEq if expr_column_name(left).as_deref() == Some("end_ts") => {
                filters.end = Some(parse_timestamp_expr(right)?);
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
}

fn extract_limit(query: &ast::Query) -> Result<Option<usize>, SqlError> {
    let limit = match &query.limit_clause {
        Some(LimitClause::LimitOffset { limit: Some(expr), .. }) => expr,
        Some(LimitClause::OffsetCommaLimit { limit, .. }) => limit,
        _ => return Ok(None),
    };
    let n = parse_i64(limit)?;
    usize::try_from(n)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("bad LIMIT: {n}")))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad id {s}: {e}")))
}

fn parse_uuid(expr: &Expr) -> Result<Uuid, SqlError> {
    let s = parse_string(expr)?;
    Uuid::parse_str(&s).map_err(|e| SqlError::Parse(format!("bad UUID {s}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Integer Unix milliseconds, or an RFC 3339 string.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}"))),
        Some(Value::SingleQuotedString(s)) => {
            parse_timestamp(s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected timestamp, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(String, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPLOYEE: &str = "6f1c2f4e-8a53-4c8e-9d35-0b3f3b1a9c11";
    const RESERVATION: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_select_slots_with_filters_and_limit() {
        let sql = "SELECT * FROM available_slots WHERE service_id = 3 \
                   AND start_ts >= '2040-06-04T09:00:00Z' AND end_ts <= 2222434800000 LIMIT 10";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::SelectAvailableSlots(SlotQuery {
                service_id: 3,
                start: Some(2_222_413_200_000),
                end: Some(2_222_434_800_000),
                limit: Some(10),
            })
        );
    }

    #[test]
    fn parse_select_slots_service_only() {
        let cmd = parse_sql("SELECT * FROM available_slots WHERE service_id = 1").unwrap();
        assert_eq!(cmd, Command::SelectAvailableSlots(SlotQuery::for_service(1)));
    }

    #[test]
    fn parse_select_slots_requires_service() {
        let err = parse_sql("SELECT * FROM available_slots WHERE start_ts >= 0").unwrap_err();
        assert!(matches!(err, SqlError::MissingFilter("service_id")));
    }

    #[test]
    fn parse_simple_selects() {
        assert_eq!(parse_sql("SELECT * FROM services").unwrap(), Command::SelectServices);
        assert_eq!(parse_sql("select * from reservations").unwrap(), Command::SelectReservations);
        assert_eq!(parse_sql("SELECT * FROM vehicles;").unwrap(), Command::SelectVehicles);
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            "INSERT INTO reservations (service_id, vehicle_license_plate, employee_id, start_ts, end_ts) \
             VALUES (1, 'KR 1234', '{EMPLOYEE}', '2040-06-04T09:00:00Z', '2040-06-04T09:30:00Z')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertReservation(CreateReservationRequest {
                service_id: 1,
                vehicle_license_plate: "KR 1234".into(),
                employee_id: Uuid::parse_str(EMPLOYEE).unwrap(),
                start: 2_222_413_200_000,
                end: 2_222_415_000_000,
            })
        );
    }

    #[test]
    fn parse_insert_reservation_bad_employee_id() {
        let sql = "INSERT INTO reservations VALUES (1, 'KR 1234', 'not-a-uuid', 0, 1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_reservation_wrong_arity() {
        let sql = "INSERT INTO reservations VALUES (1, 'KR 1234')";
        match parse_sql(sql) {
            Err(SqlError::WrongArity(table, 5, 2)) => assert_eq!(table, "reservations"),
            other => panic!("expected WrongArity, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_vehicle_optional_columns() {
        let cmd = parse_sql("INSERT INTO vehicles VALUES ('WA 1', 'Fiat', 'Panda', 2011)").unwrap();
        match cmd {
            Command::InsertVehicle(v) => {
                assert_eq!(v.production_year, 2011);
                assert_eq!(v.vin, None);
                assert_eq!(v.car_type, None);
            }
            _ => panic!("expected InsertVehicle, got {cmd:?}"),
        }

        let cmd = parse_sql(
            "INSERT INTO vehicles VALUES ('WA 1', 'Fiat', 'Panda', 2011, NULL, 'city car')",
        )
        .unwrap();
        match cmd {
            Command::InsertVehicle(v) => {
                assert_eq!(v.vin, None);
                assert_eq!(v.car_type.as_deref(), Some("city car"));
            }
            _ => panic!("expected InsertVehicle, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_service_and_employee() {
        let cmd = parse_sql("INSERT INTO services VALUES (4, 'Brakes', NULL, 90)").unwrap();
        assert_eq!(
            cmd,
            Command::InsertService(Service {
                id: 4,
                name: "Brakes".into(),
                description: None,
                duration_minutes: 90,
            })
        );

        let cmd = parse_sql(&format!("INSERT INTO employees VALUES ('{EMPLOYEE}', 'Ewa')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertEmployee(Employee {
                id: Uuid::parse_str(EMPLOYEE).unwrap(),
                name: "Ewa".into(),
            })
        );
    }

    #[test]
    fn parse_insert_service_negative_duration() {
        assert!(parse_sql("INSERT INTO services VALUES (4, 'Brakes', NULL, -5)").is_err());
    }

    #[test]
    fn parse_insert_schedule() {
        let sql = format!(
            "INSERT INTO employee_schedules (employee_id, start_ts, end_ts) \
             VALUES ('{EMPLOYEE}', 2222413200000, '2040-06-04T17:00:00Z')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertSchedule {
                employee_id: Uuid::parse_str(EMPLOYEE).unwrap(),
                start: 2_222_413_200_000,
                end: 2_222_442_000_000,
            }
        );
    }

    #[test]
    fn parse_delete_reservation_is_cancel() {
        let cmd = parse_sql(&format!("DELETE FROM reservations WHERE id = '{RESERVATION}'")).unwrap();
        match cmd {
            Command::CancelReservation { id } => assert_eq!(id.to_string(), RESERVATION),
            _ => panic!("expected CancelReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_delete_schedule() {
        let cmd =
            parse_sql(&format!("DELETE FROM employee_schedules WHERE id = '{RESERVATION}'")).unwrap();
        assert!(matches!(cmd, Command::DeleteSchedule { .. }));
    }

    #[test]
    fn parse_delete_requires_id() {
        assert!(matches!(
            parse_sql("DELETE FROM reservations"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql("DELETE FROM reservations WHERE status = 'New'"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_update_status() {
        let sql = format!("UPDATE reservations SET status = 'Completed' WHERE id = '{RESERVATION}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateReservationStatus { id, status } => {
                assert_eq!(id.to_string(), RESERVATION);
                assert_eq!(status, ReservationStatus::Completed);
            }
            other => panic!("expected UpdateReservationStatus, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_rejects_other_columns() {
        let sql = format!("UPDATE reservations SET start_ts = 0 WHERE id = '{RESERVATION}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        let sql = format!("UPDATE reservations SET status = 'Archived' WHERE id = '{RESERVATION}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
        let sql = format!("UPDATE vehicles SET status = 'New' WHERE id = '{RESERVATION}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_unknown_table() {
        assert!(matches!(
            parse_sql("SELECT * FROM invoices"),
            Err(SqlError::UnknownTable(t)) if t == "invoices"
        ));
    }

    #[test]
    fn parse_empty_and_garbage() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEKT nope"), Err(SqlError::Parse(_))));
        assert!(matches!(parse_sql("CREATE TABLE t (a INT)"), Err(SqlError::Unsupported(_))));
    }
}
