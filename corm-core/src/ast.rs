//! The abstract SQL tree handed to a [`crate::Provider`] (spec §6): the
//! engine builds one of these per statement, a provider turns it into
//! dialect text plus a parameter adapter. Kept a plain data tree, not a
//! trait hierarchy, the same shallow `[OP, arg...]` shape the original uses
//! so providers can pattern-match instead of implementing a visitor.

use crate::Value;

/// A bound parameter slot. `Positional` numbers params left to right for
/// providers using `qmark`/`format`/`numeric` styles; `Named` is for
/// `named`/`pyformat` providers that bind by key.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Positional(usize),
    Named(String),
}

/// Ascending/descending for an `OrderBy` term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// An aggregate call over a row set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// A scalar expression: a column reference, a literal/parameter, or a
/// predicate combinator built by the query facility (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column { table: &'static str, name: &'static str },
    Value(Value),
    Param(Param),
    Eq(Box<SqlExpr>, Box<SqlExpr>),
    NotEq(Box<SqlExpr>, Box<SqlExpr>),
    Lt(Box<SqlExpr>, Box<SqlExpr>),
    Lte(Box<SqlExpr>, Box<SqlExpr>),
    Gt(Box<SqlExpr>, Box<SqlExpr>),
    Gte(Box<SqlExpr>, Box<SqlExpr>),
    IsNull(Box<SqlExpr>),
    IsNotNull(Box<SqlExpr>),
    In(Box<SqlExpr>, Vec<SqlExpr>),
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    Not(Box<SqlExpr>),
    Coalesce(Vec<SqlExpr>),
    Exists(Box<SqlStatement>),
    Aggregate(Aggregate, Box<SqlExpr>),
    /// `Row(cols)`: a tuple expression, used for composite-key `IN`/`EQ`.
    Row(Vec<SqlExpr>),
}

/// A complete statement the engine asks a provider to run.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlStatement {
    Select {
        distinct: bool,
        columns: Vec<SqlExpr>,
        from: &'static str,
        alias: Option<&'static str>,
        joins: Vec<Join>,
        where_: Option<SqlExpr>,
        order_by: Vec<(SqlExpr, SortDirection)>,
        limit: Option<u64>,
        offset: Option<u64>,
    },
    Insert {
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<SqlExpr>,
    },
    Update {
        table: &'static str,
        assignments: Vec<(&'static str, SqlExpr)>,
        where_: Option<SqlExpr>,
    },
    Delete {
        table: &'static str,
        where_: Option<SqlExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: &'static str,
    pub alias: Option<&'static str>,
    pub on: SqlExpr,
}

impl SqlExpr {
    pub fn col(table: &'static str, name: &'static str) -> Self {
        SqlExpr::Column { table, name }
    }

    pub fn and(exprs: Vec<SqlExpr>) -> SqlExpr {
        let flat: Vec<SqlExpr> = exprs
            .into_iter()
            .flat_map(|e| match e {
                SqlExpr::And(inner) => inner,
                other => vec![other],
            })
            .collect();
        match flat.len() {
            1 => flat.into_iter().next().unwrap(),
            _ => SqlExpr::And(flat),
        }
    }
}
