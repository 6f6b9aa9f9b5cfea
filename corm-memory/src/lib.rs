//! A reference [`Provider`] for `corm-core`'s own test suite: it applies
//! the engine's statement AST directly to `HashMap`-backed tables rather
//! than generating SQL text, standing in for a real dialect driver the way
//! the workspace's in-memory test backends stand in for a network database.
//! Not intended for production use — no SQL generation, no durability,
//! no real transaction isolation.

use anyhow::{anyhow, bail};
use corm_core::ast::{Aggregate, SortDirection, SqlExpr, SqlStatement};
use corm_core::provider::{Connection, ParamStyle, Provider};
use corm_core::{RowLabeled, RowsAffected, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

type Row = HashMap<&'static str, Value>;

#[derive(Default)]
struct Table {
    rows: Vec<Row>,
    next_id: i64,
}

/// Shared backing store. A [`MemoryConnection`] is a cheap handle into it;
/// every session using the same `MemoryProvider` sees the same tables,
/// matching how a real connection pool shares one database.
#[derive(Default)]
pub struct MemoryProvider {
    tables: Mutex<HashMap<&'static str, Table>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

/// No per-connection state: all storage lives in [`MemoryProvider`] behind
/// a mutex, so this is a marker rather than a real handle.
pub struct MemoryConnection;

impl Connection for MemoryConnection {}

impl Provider for MemoryProvider {
    type Connection = MemoryConnection;

    fn paramstyle(&self) -> ParamStyle {
        ParamStyle::Qmark
    }

    fn connect(&self) -> impl std::future::Future<Output = anyhow::Result<Self::Connection>> + Send {
        async { Ok(MemoryConnection) }
    }

    fn commit(&self, _conn: &mut Self::Connection) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        // Writes land in `tables` as each statement runs; there is no
        // separate uncommitted staging area to flush here.
        async { Ok(()) }
    }

    fn rollback(&self, _conn: &mut Self::Connection) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    fn execute(
        &self,
        _conn: &mut Self::Connection,
        stmt: &SqlStatement,
        _params: &[Value],
    ) -> impl std::future::Future<Output = anyhow::Result<RowsAffected>> + Send {
        let result = self.run_mutation(stmt);
        async move { result }
    }

    fn execute_returning_id(
        &self,
        _conn: &mut Self::Connection,
        stmt: &SqlStatement,
        _params: &[Value],
    ) -> impl std::future::Future<Output = anyhow::Result<Value>> + Send {
        let result = self.run_insert_returning_id(stmt);
        async move { result }
    }

    fn fetch(
        &self,
        _conn: &mut Self::Connection,
        stmt: &SqlStatement,
        _params: &[Value],
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<RowLabeled>>> + Send {
        let result = self.run_select(stmt);
        async move { result }
    }

    fn validate_table(
        &self,
        _conn: &mut Self::Connection,
        table: &'static str,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        self.tables.lock().expect("memory provider poisoned").entry(table).or_default();
        async { Ok(()) }
    }
}

impl MemoryProvider {
    fn run_mutation(&self, stmt: &SqlStatement) -> anyhow::Result<RowsAffected> {
        let mut tables = self.tables.lock().expect("memory provider poisoned");
        match stmt {
            SqlStatement::Insert { table, columns, values } => {
                let t = tables.entry(*table).or_default();
                let mut row = Row::new();
                for (col, expr) in columns.iter().zip(values.iter()) {
                    row.insert(*col, literal(expr)?);
                }
                t.rows.push(row);
                Ok(RowsAffected { rows_affected: Some(1), last_inserted_id: None })
            }
            SqlStatement::Update { table, assignments, where_ } => {
                let t = tables.entry(*table).or_default();
                let mut affected = 0u64;
                for row in t.rows.iter_mut() {
                    if matches(where_.as_ref(), row)? {
                        for (col, expr) in assignments {
                            row.insert(*col, literal(expr)?);
                        }
                        affected += 1;
                    }
                }
                Ok(RowsAffected { rows_affected: Some(affected), last_inserted_id: None })
            }
            SqlStatement::Delete { table, where_ } => {
                let t = tables.entry(*table).or_default();
                let before = t.rows.len();
                let mut kept = Vec::with_capacity(before);
                for row in std::mem::take(&mut t.rows) {
                    if matches(where_.as_ref(), &row)? {
                        continue;
                    }
                    kept.push(row);
                }
                let affected = before - kept.len();
                t.rows = kept;
                Ok(RowsAffected { rows_affected: Some(affected as u64), last_inserted_id: None })
            }
            SqlStatement::Select { .. } => bail!("execute() called with a Select statement"),
        }
    }

    fn run_insert_returning_id(&self, stmt: &SqlStatement) -> anyhow::Result<Value> {
        let SqlStatement::Insert { table, columns, values } = stmt else {
            bail!("execute_returning_id() called with a non-Insert statement");
        };
        let mut tables = self.tables.lock().expect("memory provider poisoned");
        let t = tables.entry(*table).or_default();
        t.next_id += 1;
        let id = t.next_id;
        let mut row = Row::new();
        row.insert("id", Value::Int64(Some(id)));
        for (col, expr) in columns.iter().zip(values.iter()) {
            row.insert(*col, literal(expr)?);
        }
        t.rows.push(row);
        Ok(Value::Int64(Some(id)))
    }

    fn run_select(&self, stmt: &SqlStatement) -> anyhow::Result<Vec<RowLabeled>> {
        let SqlStatement::Select { distinct: _, columns, from, alias: _, joins, where_, order_by, limit, offset } = stmt else {
            bail!("fetch() called with a non-Select statement");
        };
        if !joins.is_empty() {
            bail!("MemoryProvider does not support joins");
        }
        let tables = self.tables.lock().expect("memory provider poisoned");
        let empty = Table::default();
        let t = tables.get(from).unwrap_or(&empty);

        let mut matched: Vec<&Row> = t.rows.iter().filter(|row| matches(where_.as_ref(), row).unwrap_or(false)).collect();

        if !order_by.is_empty() {
            matched.sort_by(|a, b| {
                for (expr, dir) in order_by {
                    let av = eval(expr, Some(a)).unwrap_or(Value::Null);
                    let bv = eval(expr, Some(b)).unwrap_or(Value::Null);
                    let ord = compare(&av, &bv).unwrap_or(Ordering::Equal);
                    let ord = if *dir == SortDirection::Desc { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let offset = offset.unwrap_or(0) as usize;
        let matched: Vec<&Row> = matched.into_iter().skip(offset).collect();
        let matched: Vec<&Row> = match limit {
            Some(n) => matched.into_iter().take(*n as usize).collect(),
            None => matched,
        };

        // One aggregate call per row-set, the only shape the query
        // facility ever asks for (see `corm_core::query::Query`).
        if let [SqlExpr::Aggregate(agg, inner)] = columns.as_slice() {
            let value = aggregate(agg.clone(), inner, &matched)?;
            return Ok(vec![RowLabeled::new(std::sync::Arc::from(vec!["agg"]), Box::from([value]))]);
        }

        let labels: Vec<&'static str> = columns
            .iter()
            .map(|c| match c {
                SqlExpr::Column { name, .. } => *name,
                _ => "?",
            })
            .collect();
        let labels: std::sync::Arc<[&'static str]> = std::sync::Arc::from(labels);

        let mut out = Vec::with_capacity(matched.len());
        for row in matched {
            let values: Vec<Value> = columns.iter().map(|c| eval(c, Some(row)).unwrap_or(Value::Null)).collect();
            out.push(RowLabeled::new(labels.clone(), values.into_boxed_slice()));
        }
        Ok(out)
    }
}

fn literal(expr: &SqlExpr) -> anyhow::Result<Value> {
    match expr {
        SqlExpr::Value(v) => Ok(v.clone()),
        other => Err(anyhow!("expected a literal value, found {other:?}")),
    }
}

fn matches(where_: Option<&SqlExpr>, row: &Row) -> anyhow::Result<bool> {
    match where_ {
        None => Ok(true),
        Some(expr) => Ok(matches!(eval(expr, Some(row))?, Value::Boolean(Some(true)))),
    }
}

fn eval(expr: &SqlExpr, row: Option<&Row>) -> anyhow::Result<Value> {
    Ok(match expr {
        SqlExpr::Column { name, .. } => row.and_then(|r| r.get(name)).cloned().unwrap_or(Value::Null),
        SqlExpr::Value(v) => v.clone(),
        SqlExpr::Param(_) => bail!("MemoryProvider does not bind Param placeholders, pass literal Values"),
        SqlExpr::Eq(a, b) => bool_value(compare(&eval(a, row)?, &eval(b, row)?) == Some(Ordering::Equal)),
        SqlExpr::NotEq(a, b) => bool_value(compare(&eval(a, row)?, &eval(b, row)?) != Some(Ordering::Equal)),
        SqlExpr::Lt(a, b) => bool_value(compare(&eval(a, row)?, &eval(b, row)?) == Some(Ordering::Less)),
        SqlExpr::Lte(a, b) => bool_value(matches!(compare(&eval(a, row)?, &eval(b, row)?), Some(Ordering::Less | Ordering::Equal))),
        SqlExpr::Gt(a, b) => bool_value(compare(&eval(a, row)?, &eval(b, row)?) == Some(Ordering::Greater)),
        SqlExpr::Gte(a, b) => bool_value(matches!(compare(&eval(a, row)?, &eval(b, row)?), Some(Ordering::Greater | Ordering::Equal))),
        SqlExpr::IsNull(a) => bool_value(eval(a, row)?.is_null()),
        SqlExpr::IsNotNull(a) => bool_value(!eval(a, row)?.is_null()),
        SqlExpr::In(a, list) => {
            let v = eval(a, row)?;
            let mut found = false;
            for item in list {
                if compare(&v, &eval(item, row)?) == Some(Ordering::Equal) {
                    found = true;
                    break;
                }
            }
            bool_value(found)
        }
        SqlExpr::And(list) => {
            for item in list {
                if !matches!(eval(item, row)?, Value::Boolean(Some(true))) {
                    return Ok(bool_value(false));
                }
            }
            bool_value(true)
        }
        SqlExpr::Or(list) => {
            for item in list {
                if matches!(eval(item, row)?, Value::Boolean(Some(true))) {
                    return Ok(bool_value(true));
                }
            }
            bool_value(false)
        }
        SqlExpr::Not(a) => bool_value(!matches!(eval(a, row)?, Value::Boolean(Some(true)))),
        SqlExpr::Coalesce(list) => {
            let mut result = Value::Null;
            for item in list {
                let v = eval(item, row)?;
                if !v.is_null() {
                    result = v;
                    break;
                }
            }
            result
        }
        SqlExpr::Exists(_) => bail!("MemoryProvider does not support correlated subqueries"),
        SqlExpr::Aggregate(..) => bail!("aggregate expressions only appear as a lone select column"),
        SqlExpr::Row(_) => bail!("MemoryProvider does not support row-tuple expressions"),
    })
}

fn bool_value(b: bool) -> Value {
    Value::Boolean(Some(b))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Boolean(x), Value::Boolean(y)) => x.zip(*y).map(|(x, y)| x.cmp(&y)),
        (Value::Int64(x), Value::Int64(y)) => x.zip(*y).map(|(x, y)| x.cmp(&y)),
        (Value::Float64(x), Value::Float64(y)) => x.zip(*y).and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::Int64(x), Value::Float64(y)) => x.zip(*y).and_then(|(x, y)| (x as f64).partial_cmp(&y)),
        (Value::Float64(x), Value::Int64(y)) => x.zip(*y).and_then(|(x, y)| x.partial_cmp(&(y as f64))),
        (Value::Text(x), Value::Text(y)) => x.as_ref().zip(y.as_ref()).map(|(x, y)| x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => x.as_ref().zip(y.as_ref()).map(|(x, y)| x.cmp(y)),
        _ => None,
    }
}

fn aggregate(agg: Aggregate, on: &SqlExpr, rows: &[&Row]) -> anyhow::Result<Value> {
    if agg == Aggregate::Count {
        return Ok(Value::Int64(Some(rows.len() as i64)));
    }
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|r| match eval(on, Some(r)).ok()? {
            Value::Int64(Some(v)) => Some(v as f64),
            Value::Float64(Some(v)) => Some(v),
            _ => None,
        })
        .collect();
    Ok(match agg {
        Aggregate::Count => unreachable!(),
        Aggregate::Sum => Value::Float64(Some(values.iter().sum())),
        Aggregate::Avg => {
            if values.is_empty() {
                Value::Null
            } else {
                Value::Float64(Some(values.iter().sum::<f64>() / values.len() as f64))
            }
        }
        Aggregate::Min => values.into_iter().fold(None, |m, v| Some(m.map_or(v, |m: f64| m.min(v)))).map(|v| Value::Float64(Some(v))).unwrap_or(Value::Null),
        Aggregate::Max => values.into_iter().fold(None, |m, v| Some(m.map_or(v, |m: f64| m.max(v)))).map(|v| Value::Float64(Some(v))).unwrap_or(Value::Null),
    })
}
