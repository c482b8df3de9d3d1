use std::collections::HashMap;

use sqlparser::ast::{
    self, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;

/// Which bookings a `SELECT ... FROM bookings` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    User(UserId),
    Slot(SlotId),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        email: String,
        name: String,
    },
    InsertSlot {
        gym_id: GymId,
        start: Ms,
        end: Ms,
        capacity: u32,
    },
    InsertSubscription {
        user_id: UserId,
        gym_id: Option<GymId>,
        visits_limit: Option<u32>,
        price: Cents,
        valid_from: Ms,
        valid_until: Ms,
    },
    InsertTopUp {
        user_id: UserId,
        amount: Cents,
    },
    InsertBooking {
        user_id: UserId,
        slot_id: SlotId,
    },
    DeleteBooking {
        id: BookingId,
        user_id: UserId,
    },
    SelectUser {
        id: UserId,
    },
    SelectSlot {
        id: SlotId,
    },
    SelectWallet {
        user_id: UserId,
    },
    SelectTransactions {
        user_id: UserId,
        limit: Option<i64>,
        offset: Option<i64>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectSubscriptions {
        user_id: UserId,
    },
    /// Bookings at every slot of a gym, with slot and user details.
    SelectGymBookings {
        gym_id: GymId,
    },
    SelectStats {
        grouping: StatsGrouping,
        created: CreatedRange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsGrouping {
    Day,
    Gym,
}

/// Inclusive bounds on `created_at`. Unbounded sides are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreatedRange {
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

impl CreatedRange {
    pub fn bounds(self) -> (Ms, Ms) {
        (self.from.unwrap_or(Ms::MIN), self.to.unwrap_or(Ms::MAX))
    }
}

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
    #[error("{0}: missing value for column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = InsertRow::from_insert(insert)?;

    match table.as_str() {
        "users" => Ok(Command::InsertUser {
            email: parse_string(row.required("users", "email", 0)?)?,
            name: parse_string(row.required("users", "name", 1)?)?,
        }),
        "slots" => Ok(Command::InsertSlot {
            gym_id: parse_i64(row.required("slots", "gym_id", 0)?)?,
            start: parse_i64(row.required("slots", "start", 1)?)?,
            end: parse_i64(row.required("slots", "end", 2)?)?,
            capacity: parse_u32(row.required("slots", "capacity", 3)?)?,
        }),
        "subscriptions" => Ok(Command::InsertSubscription {
            user_id: parse_i64(row.required("subscriptions", "user_id", 0)?)?,
            gym_id: row.optional("gym_id", 1).map(parse_i64_or_null).transpose()?.flatten(),
            visits_limit: row
                .optional("visits_limit", 2)
                .map(parse_u32_or_null)
                .transpose()?
                .flatten(),
            price: parse_i64(row.required("subscriptions", "price", 3)?)?,
            valid_from: parse_i64(row.required("subscriptions", "valid_from", 4)?)?,
            valid_until: parse_i64(row.required("subscriptions", "valid_until", 5)?)?,
        }),
        "topups" => Ok(Command::InsertTopUp {
            user_id: parse_i64(row.required("topups", "user_id", 0)?)?,
            amount: parse_i64(row.required("topups", "amount", 1)?)?,
        }),
        "bookings" => Ok(Command::InsertBooking {
            user_id: parse_i64(row.required("bookings", "user_id", 0)?)?,
            slot_id: parse_i64(row.required("bookings", "slot_id", 1)?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.required("id")?,
            user_id: filters.required("user_id")?,
        }),
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
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "users" => Ok(Command::SelectUser {
            id: filters.required("id")?,
        }),
        "slots" => Ok(Command::SelectSlot {
            id: filters.required("id")?,
        }),
        "wallets" => Ok(Command::SelectWallet {
            user_id: filters.required("user_id")?,
        }),
        "wallet_transactions" => {
            let (limit, offset) = limit_offset(query)?;
            Ok(Command::SelectTransactions {
                user_id: filters.required("user_id")?,
                limit,
                offset,
            })
        }
        "bookings" => {
            let eq = |column: &str| filters.eq.get(column).copied();
            let filter = match (eq("user_id"), eq("slot_id"), eq("gym_id")) {
                (Some(user_id), _, _) => BookingFilter::User(user_id),
                (None, Some(slot_id), _) => BookingFilter::Slot(slot_id),
                (None, None, Some(gym_id)) => return Ok(Command::SelectGymBookings { gym_id }),
                (None, None, None) => {
                    return Err(SqlError::MissingFilter("user_id, slot_id or gym_id"));
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        "subscriptions" => Ok(Command::SelectSubscriptions {
            user_id: filters.required("user_id")?,
        }),
        "booking_stats_by_day" => Ok(Command::SelectStats {
            grouping: StatsGrouping::Day,
            created: filters.created_range()?,
        }),
        "booking_stats_by_gym" => Ok(Command::SelectStats {
            grouping: StatsGrouping::Gym,
            created: filters.created_range()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// The single VALUES row of an INSERT, addressable by column name when a
/// column list was given and by position otherwise.
struct InsertRow {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn from_insert(insert: &ast::Insert) -> Result<Self, SqlError> {
        let body = insert
            .source
            .as_ref()
            .ok_or(SqlError::Parse("no VALUES".into()))?;
        let rows = match body.body.as_ref() {
            SetExpr::Values(values) => &values.rows,
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        let values = match rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row.clone(),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        };
        let columns: Vec<String> = insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .collect();
        if !columns.is_empty() && columns.len() != values.len() {
            return Err(SqlError::Parse(format!(
                "{} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self { columns, values })
    }

    fn optional(&self, column: &str, position: usize) -> Option<&Expr> {
        if self.columns.is_empty() {
            return self.values.get(position);
        }
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    fn required(
        &self,
        table: &'static str,
        column: &'static str,
        position: usize,
    ) -> Result<&Expr, SqlError> {
        self.optional(column, position)
            .ok_or(SqlError::MissingColumn(table, column))
    }
}

/// `AND`-joined conjuncts of a WHERE clause: `column = value` plus inclusive
/// `>=` / `<=` / `BETWEEN` bounds.
#[derive(Debug, Default)]
struct Filters {
    eq: HashMap<String, i64>,
    lower: HashMap<String, i64>,
    upper: HashMap<String, i64>,
}

impl Filters {
    fn required(&self, column: &'static str) -> Result<i64, SqlError> {
        self.eq
            .get(column)
            .copied()
            .ok_or(SqlError::MissingFilter(column))
    }

    /// Only `created_at` may be bounded. Equality pins both ends.
    fn created_range(&self) -> Result<CreatedRange, SqlError> {
        let stray = self
            .eq
            .keys()
            .chain(self.lower.keys())
            .chain(self.upper.keys())
            .find(|c| c.as_str() != "created_at");
        if let Some(column) = stray {
            return Err(SqlError::Unsupported(format!("filter on {column}")));
        }
        let pinned = self.eq.get("created_at").copied();
        Ok(CreatedRange {
            from: self.lower.get("created_at").copied().or(pinned),
            to: self.upper.get("created_at").copied().or(pinned),
        })
    }
}

fn where_filters(selection: Option<&Expr>) -> Result<Filters, SqlError> {
    let mut filters = Filters::default();
    if let Some(expr) = selection {
        collect_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn filter_column(expr: &Expr) -> Result<String, SqlError> {
    expr_column_name(expr).ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))
}

fn collect_filters(expr: &Expr, out: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                out.eq.insert(filter_column(left)?, parse_i64(right)?);
                Ok(())
            }
            ast::BinaryOperator::GtEq => {
                out.lower.insert(filter_column(left)?, parse_i64(right)?);
                Ok(())
            }
            ast::BinaryOperator::LtEq => {
                out.upper.insert(filter_column(left)?, parse_i64(right)?);
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => {
            let column = filter_column(expr)?;
            out.lower.insert(column.clone(), parse_i64(low)?);
            out.upper.insert(column, parse_i64(high)?);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn limit_offset(query: &ast::Query) -> Result<(Option<i64>, Option<i64>), SqlError> {
    match &query.limit_clause {
        None => Ok((None, None)),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            let limit = limit.as_ref().map(parse_i64).transpose()?;
            let offset = offset.as_ref().map(|o| parse_i64(&o.value)).transpose()?;
            Ok((limit, offset))
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            Ok((Some(parse_i64(limit)?), Some(parse_i64(offset)?)))
        }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64(expr).map(Some)
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_u32(expr).map(Some)
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_insert_user() {
        let sql = "INSERT INTO users (email, name) VALUES ('ann@example.com', 'Ann O''Neil')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertUser {
                email: "ann@example.com".into(),
                name: "Ann O'Neil".into(),
            }
        );
    }

    #[test]
    fn parse_insert_slot_with_quoted_end() {
        let sql = r#"INSERT INTO slots (gym_id, start, "end", capacity) VALUES (3, 1000, 2000, 12)"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertSlot {
                gym_id: 3,
                start: 1000,
                end: 2000,
                capacity: 12,
            }
        );
    }

    #[test]
    fn insert_columns_are_matched_by_name() {
        let sql = "INSERT INTO bookings (slot_id, user_id) VALUES (9, 4)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertBooking {
                user_id: 4,
                slot_id: 9,
            }
        );
    }

    #[test]
    fn insert_without_column_list_is_positional() {
        let sql = "INSERT INTO topups VALUES (4, 5000)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertTopUp {
                user_id: 4,
                amount: 5000,
            }
        );
    }

    #[test]
    fn parse_insert_subscription_with_nulls() {
        let sql = "INSERT INTO subscriptions (user_id, gym_id, visits_limit, price, valid_from, valid_until) \
                   VALUES (1, NULL, NULL, 15000, 0, 86400000)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertSubscription {
                user_id: 1,
                gym_id: None,
                visits_limit: None,
                price: 15000,
                valid_from: 0,
                valid_until: 86_400_000,
            }
        );
    }

    #[test]
    fn subscription_optional_columns_may_be_omitted() {
        let sql = "INSERT INTO subscriptions (user_id, price, valid_from, valid_until, visits_limit) \
                   VALUES (1, 0, 0, 10, 8)";
        match parse_sql(sql).unwrap() {
            Command::InsertSubscription {
                gym_id,
                visits_limit,
                ..
            } => {
                assert_eq!(gym_id, None);
                assert_eq!(visits_limit, Some(8));
            }
            other => panic!("expected InsertSubscription, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_column() {
        let sql = "INSERT INTO bookings (user_id) VALUES (1)";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::MissingColumn("bookings", "slot_id"))
        ));
    }

    #[test]
    fn parse_delete_booking_needs_owner() {
        let sql = "DELETE FROM bookings WHERE id = 5 AND user_id = 2";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::DeleteBooking { id: 5, user_id: 2 }
        );
        assert!(matches!(
            parse_sql("DELETE FROM bookings WHERE id = 5"),
            Err(SqlError::MissingFilter("user_id"))
        ));
    }

    #[test]
    fn parse_select_transactions_with_paging() {
        let sql = "SELECT * FROM wallet_transactions WHERE user_id = 7 LIMIT 10 OFFSET 20";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectTransactions {
                user_id: 7,
                limit: Some(10),
                offset: Some(20),
            }
        );
        let sql = "SELECT * FROM wallet_transactions WHERE user_id = 7";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectTransactions {
                user_id: 7,
                limit: None,
                offset: None,
            }
        );
    }

    #[test]
    fn parse_select_bookings_by_user_or_slot() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings WHERE user_id = 3").unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::User(3)
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM bookings WHERE slot_id = '8'").unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Slot(8)
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_select_bookings_by_gym() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings WHERE gym_id = 4").unwrap(),
            Command::SelectGymBookings { gym_id: 4 }
        );
        // A narrower filter wins.
        assert_eq!(
            parse_sql("SELECT * FROM bookings WHERE gym_id = 4 AND slot_id = 2").unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Slot(2)
            }
        );
    }

    #[test]
    fn parse_booking_stats() {
        assert_eq!(
            parse_sql("SELECT * FROM booking_stats_by_day").unwrap(),
            Command::SelectStats {
                grouping: StatsGrouping::Day,
                created: CreatedRange::default(),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM booking_stats_by_gym WHERE created_at BETWEEN 100 AND 200")
                .unwrap(),
            Command::SelectStats {
                grouping: StatsGrouping::Gym,
                created: CreatedRange {
                    from: Some(100),
                    to: Some(200),
                },
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM booking_stats_by_day WHERE created_at >= 5").unwrap(),
            Command::SelectStats {
                grouping: StatsGrouping::Day,
                created: CreatedRange {
                    from: Some(5),
                    to: None,
                },
            }
        );
        assert_eq!(
            CreatedRange {
                from: None,
                to: Some(9)
            }
            .bounds(),
            (Ms::MIN, 9)
        );
        assert!(matches!(
            parse_sql("SELECT * FROM booking_stats_by_gym WHERE gym_id = 1"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM booking_stats_by_day WHERE created_at NOT BETWEEN 1 AND 2"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_simple_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM wallets WHERE user_id = 1;").unwrap(),
            Command::SelectWallet { user_id: 1 }
        );
        assert_eq!(
            parse_sql("SELECT id, capacity FROM slots WHERE id = 2").unwrap(),
            Command::SelectSlot { id: 2 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM users WHERE id = 3").unwrap(),
            Command::SelectUser { id: 3 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM subscriptions WHERE user_id = 4").unwrap(),
            Command::SelectSubscriptions { user_id: 4 }
        );
    }

    #[test]
    fn negative_numbers_parse() {
        let sql = "INSERT INTO topups (user_id, amount) VALUES (1, -50)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertTopUp {
                user_id: 1,
                amount: -50,
            }
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(
            parse_sql("INSERT INTO gyms (name) VALUES ('x')"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE user_id > 3"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO topups (user_id, amount) VALUES (1, 2), (3, 4)"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(parse_sql("SELEKT 1"), Err(SqlError::Parse(_))));
    }
}
