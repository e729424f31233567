use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertArena {
        id: Ulid,
        name: Option<String>,
    },
    DeleteArena {
        id: Ulid,
    },
    SelectArenas,
    InsertHorse {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
    },
    DeleteHorse {
        id: Ulid,
    },
    InsertStaff {
        id: Ulid,
    },
    DeleteStaff {
        id: Ulid,
    },
    SetQuotaConfig {
        config: QuotaConfig,
    },
    ClearQuotaConfig,
    SelectQuotaConfig,
    InsertBooking(BookingDraft),
    Reschedule {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        arena_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    Reconcile {
        horizon: Option<Ms>,
    },
}

const ARENA_COLUMNS: &[&str] = &["id", "name"];
const HORSE_COLUMNS: &[&str] = &["id", "owner_id", "name"];
const STAFF_COLUMNS: &[&str] = &["id"];
const QUOTA_COLUMNS: &[&str] = &[
    "max_booking_duration",
    "min_advance_notice",
    "max_advance_days",
    "max_future_total",
    "max_daily_total",
    "max_weekly_total",
];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "arena_id",
    "horse_id",
    "requester_id",
    "start",
    "end",
    "class",
];
const RESCHEDULE_COLUMNS: &[&str] = &["booking_id", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let known = match table.as_str() {
        "arenas" => ARENA_COLUMNS,
        "horses" => HORSE_COLUMNS,
        "staff" => STAFF_COLUMNS,
        "quota_config" => QUOTA_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        "reschedules" => RESCHEDULE_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let values = extract_insert_values(insert)?;
    let row = Row::new(&table, known, &insert.columns, &values)?;

    match table.as_str() {
        "arenas" => Ok(Command::InsertArena {
            id: parse_ulid(row.required("id")?)?,
            name: row.optional("name").map(parse_string_or_null).transpose()?.flatten(),
        }),
        "horses" => Ok(Command::InsertHorse {
            id: parse_ulid(row.required("id")?)?,
            owner_id: parse_ulid(row.required("owner_id")?)?,
            name: row.optional("name").map(parse_string_or_null).transpose()?.flatten(),
        }),
        "staff" => Ok(Command::InsertStaff {
            id: parse_ulid(row.required("id")?)?,
        }),
        "quota_config" => {
            let duration = |col: &'static str| -> Result<Option<Ms>, SqlError> {
                Ok(row.optional(col).map(parse_i64_or_null).transpose()?.flatten())
            };
            let max_advance_days = match row.optional("max_advance_days") {
                Some(expr) => parse_i64_or_null(expr)?
                    .map(|v| {
                        u32::try_from(v)
                            .map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
                    })
                    .transpose()?,
                None => None,
            };
            Ok(Command::SetQuotaConfig {
                config: QuotaConfig {
                    max_booking_duration: duration("max_booking_duration")?,
                    min_advance_notice: duration("min_advance_notice")?,
                    max_advance_days,
                    max_future_total: duration("max_future_total")?,
                    max_daily_total: duration("max_daily_total")?,
                    max_weekly_total: duration("max_weekly_total")?,
                },
            })
        }
        "bookings" => Ok(Command::InsertBooking(BookingDraft {
            id: parse_ulid(row.required("id")?)?,
            arena_id: parse_ulid(row.required("arena_id")?)?,
            horse_id: row
                .optional("horse_id")
                .map(parse_ulid_or_null)
                .transpose()?
                .flatten(),
            requester_id: parse_ulid(row.required("requester_id")?)?,
            start: parse_i64(row.required("start")?)?,
            end: parse_i64(row.required("end")?)?,
            class: parse_class(row.required("class")?)?,
        })),
        "reschedules" => Ok(Command::Reschedule {
            id: parse_ulid(row.required("booking_id")?)?,
            start: parse_i64(row.required("start")?)?,
            end: parse_i64(row.required("end")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table == "quota_config" {
        return match delete.selection {
            None => Ok(Command::ClearQuotaConfig),
            Some(_) => Err(SqlError::Unsupported("DELETE FROM quota_config takes no filter".into())),
        };
    }
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "arenas" => Ok(Command::DeleteArena { id }),
        "horses" => Ok(Command::DeleteHorse { id }),
        "staff" => Ok(Command::DeleteStaff { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        conjuncts(selection, &mut filters)?;
    }

    match table.as_str() {
        "arenas" | "quota_config" if !filters.is_empty() => {
            Err(SqlError::Unsupported(format!("filters on {table}")))
        }
        "arenas" => Ok(Command::SelectArenas),
        "quota_config" => Ok(Command::SelectQuotaConfig),
        "bookings" => parse_booking_filters(&filters),
        "reconcile" => {
            let mut horizon = None;
            for (col, op, value) in &filters {
                match (col.as_str(), op) {
                    ("horizon", BinaryOperator::Eq) => horizon = Some(parse_i64(value)?),
                    _ => return Err(SqlError::Unsupported(format!("reconcile filter on {col}"))),
                }
            }
            Ok(Command::Reconcile { horizon })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_booking_filters(filters: &[Filter<'_>]) -> Result<Command, SqlError> {
    let (mut id, mut arena_id, mut start, mut end) = (None, None, None, None);
    for (col, op, value) in filters {
        match (col.as_str(), op) {
            ("id", BinaryOperator::Eq) => id = Some(parse_ulid(value)?),
            ("arena_id", BinaryOperator::Eq) => arena_id = Some(parse_ulid(value)?),
            ("start", BinaryOperator::GtEq) => start = Some(parse_i64(value)?),
            ("end", BinaryOperator::LtEq) => end = Some(parse_i64(value)?),
            _ => return Err(SqlError::Unsupported(format!("booking filter {col} {op}"))),
        }
    }
    if let Some(id) = id {
        return Ok(Command::SelectBooking { id });
    }
    Ok(Command::SelectBookings {
        arena_id: arena_id.ok_or(SqlError::MissingFilter("arena_id"))?,
        start,
        end,
    })
}

// ── Helpers ───────────────────────────────────────────────────

/// One `VALUES` row addressed by column name.
struct Row<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    /// Without an explicit column list the table's columns are taken in order.
    fn new(
        table: &str,
        known: &[&str],
        columns: &[ast::Ident],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if columns.is_empty() {
            known.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(
                table.to_string(),
                columns.len(),
                values.len(),
            ));
        }
        if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { columns, values })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// `column <op> value` taken from a WHERE clause.
type Filter<'a> = (String, &'a BinaryOperator, &'a Expr);

/// Flatten `a AND b AND ...` into comparisons.
fn conjuncts<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, out)?;
            conjuncts(right, out)?;
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, op, right));
        }
        Expr::Nested(inner) => conjuncts(inner, out)?,
        _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
    Ok(())
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

/// The single row of an INSERT. Multi-row inserts are refused: every booking is
/// its own admission decision.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
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
            op: BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_ulid(expr).map(Some)
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64(expr).map(Some)
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_class(expr: &Expr) -> Result<BookingClass, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            BookingClass::parse(s).ok_or_else(|| SqlError::Parse(format!("unknown booking class {s:?}")))
        }
        _ => Err(SqlError::Parse(format!("expected booking class, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(String, usize, usize),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: {expected} columns but {got} values")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
