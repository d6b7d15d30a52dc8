use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::LineRequest;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Seed or update item totals of the connection's tenant.
    InsertItems {
        items: Vec<(Ulid, Quantity)>,
    },
    InsertHold {
        item_id: Ulid,
        quantity: Quantity,
        start: Ms,
        end: Ms,
        ttl_ms: Option<Ms>,
        customer_id: Option<String>,
        session_id: Option<String>,
    },
    DeleteHold {
        id: Ulid,
    },
    SelectHold {
        id: Ulid,
    },
    /// One booking; every VALUES row is one line.
    InsertBooking {
        customer_id: String,
        start: Ms,
        end: Ms,
        idempotency_key: Option<String>,
        lines: Vec<LineRequest>,
        hold_ids: Vec<Ulid>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectAvailability {
        item_id: Ulid,
        start: Ms,
        end: Ms,
    },
}

// Column order assumed when an INSERT names no columns.
const ITEM_COLUMNS: &[&str] = &["id", "total_quantity"];
const HOLD_COLUMNS: &[&str] = &["item_id", "quantity", "start", "end", "ttl_ms", "customer_id", "session_id"];
const BOOKING_COLUMNS: &[&str] = &[
    "customer_id",
    "item_id",
    "quantity",
    "start",
    "end",
    "idempotency_key",
    "unit_price",
    "hold_id",
];

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
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "items" => {
            let mut items = Vec::with_capacity(rows.len());
            for values in &rows {
                let row = Row::new("items", ITEM_COLUMNS, &columns, values)?;
                items.push((
                    parse_ulid(row.required("id")?)?,
                    parse_u32(row.required("total_quantity")?)?,
                ));
            }
            Ok(Command::InsertItems { items })
        }
        "holds" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("one hold per INSERT".into()));
            }
            let row = Row::new("holds", HOLD_COLUMNS, &columns, &rows[0])?;
            Ok(Command::InsertHold {
                item_id: parse_ulid(row.required("item_id")?)?,
                quantity: parse_u32(row.required("quantity")?)?,
                start: parse_i64(row.required("start")?)?,
                end: parse_i64(row.required("end")?)?,
                ttl_ms: row.optional("ttl_ms").map(parse_i64_or_null).transpose()?.flatten(),
                customer_id: row.optional("customer_id").map(parse_string_or_null).transpose()?.flatten(),
                session_id: row.optional("session_id").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => parse_insert_booking(&columns, &rows),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Rows must agree on everything but the line columns and `hold_id`.
fn parse_insert_booking(columns: &[String], rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut header: Option<(String, Ms, Ms, Option<String>)> = None;
    let mut lines = Vec::with_capacity(rows.len());
    let mut hold_ids = Vec::new();

    for (i, values) in rows.iter().enumerate() {
        let row = Row::new("bookings", BOOKING_COLUMNS, columns, values)?;
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));

        let this = (
            parse_string(row.required("customer_id")?).map_err(at_row)?,
            parse_i64(row.required("start")?).map_err(at_row)?,
            parse_i64(row.required("end")?).map_err(at_row)?,
            row.optional("idempotency_key")
                .map(parse_string_or_null)
                .transpose()
                .map_err(at_row)?
                .flatten(),
        );
        match &header {
            None => header = Some(this),
            Some(first) if *first == this => {}
            Some(_) => {
                return Err(SqlError::Parse(format!(
                    "row {i}: customer_id, start, end and idempotency_key must match the first row"
                )));
            }
        }

        lines.push(LineRequest {
            item_id: parse_ulid(row.required("item_id")?).map_err(at_row)?,
            quantity: parse_u32(row.required("quantity")?).map_err(at_row)?,
            unit_price: row
                .optional("unit_price")
                .map(parse_i64_or_null)
                .transpose()
                .map_err(at_row)?
                .flatten(),
        });
        if let Some(hold_id) = row
            .optional("hold_id")
            .map(parse_ulid_or_null)
            .transpose()
            .map_err(at_row)?
            .flatten()
        {
            hold_ids.push(hold_id);
        }
    }

    let (customer_id, start, end, idempotency_key) =
        header.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::InsertBooking {
        customer_id,
        start,
        end,
        idempotency_key,
        lines,
        hold_ids,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "holds" => Ok(Command::DeleteHold { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
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

    match table.as_str() {
        "bookings" => Ok(Command::SelectBooking {
            id: extract_where_id(&select.selection)?,
        }),
        "holds" => Ok(Command::SelectHold {
            id: extract_where_id(&select.selection)?,
        }),
        "availability" => {
            let (mut item_id, mut start, mut end) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut item_id, &mut start, &mut end)?;
            }
            Ok(Command::SelectAvailability {
                item_id: item_id.ok_or(SqlError::MissingFilter("item_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_availability_filters(
    expr: &Expr,
    item_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, item_id, start, end)?;
                extract_availability_filters(right, item_id, start, end)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("item_id") {
                    *item_id = Some(parse_ulid(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Rows ──────────────────────────────────────────────────────

/// One VALUES row addressed by column name: the INSERT's own column list
/// when it has one, the table's default order otherwise.
struct Row<'a> {
    names: Vec<&'a str>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        defaults: &'static [&'static str],
        columns: &'a [String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<&str> = if columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
            }
            defaults[..values.len()].to_vec()
        } else {
            if values.len() != columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
                return Err(SqlError::UnknownColumn {
                    table,
                    column: unknown.clone(),
                });
            }
            columns.iter().map(String::as_str).collect()
        };
        Ok(Self { names, values })
    }

    fn optional(&self, name: &str) -> Option<&'a Expr> {
        let pos = self.names.iter().position(|n| *n == name)?;
        self.values.get(pos)
    }

    fn required(&self, name: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(name).ok_or(SqlError::MissingColumn(name))
    }
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
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

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
