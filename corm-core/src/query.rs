//! Predicate combinator API (spec §4.4, adjusted per the design note in
//! SPEC_FULL.md §7): instead of decompiling a lambda's bytecode into a
//! predicate tree, callers build the same [`SqlExpr`] tree directly with
//! `col(...).eq(...)`/`.and(...)`. [`QueryCache`] gives repeated calls with
//! the same predicate *shape* (ignoring the literal values bound into it)
//! one compiled [`SqlStatement`], the same "plan once, bind many" guarantee
//! the original's compiled-query cache provides.

use crate::ast::{Aggregate, Join, SortDirection, SqlExpr, SqlStatement};
use crate::instance::InstanceId;
use crate::provider::Provider;
use crate::schema::EntityDef;
use crate::session::Session;
use crate::{OrmError, Result, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// A bare column reference, the entry point into the combinator API:
/// `col("User", "email").eq(Value::from("a@b.com"))`.
#[derive(Debug, Clone, Copy)]
pub struct Col {
    entity: &'static str,
    name: &'static str,
}

pub fn col(entity: &'static str, name: &'static str) -> Col {
    Col { entity, name }
}

macro_rules! cmp_op {
    ($method:ident, $variant:ident) => {
        pub fn $method(self, value: impl Into<Value>) -> SqlExpr {
            SqlExpr::$variant(Box::new(self.expr()), Box::new(SqlExpr::Value(value.into())))
        }
    };
}

impl Col {
    fn expr(self) -> SqlExpr {
        SqlExpr::col(self.entity, self.name)
    }

    cmp_op!(eq, Eq);
    cmp_op!(not_eq, NotEq);
    cmp_op!(lt, Lt);
    cmp_op!(lte, Lte);
    cmp_op!(gt, Gt);
    cmp_op!(gte, Gte);

    pub fn is_null(self) -> SqlExpr {
        SqlExpr::IsNull(Box::new(self.expr()))
    }

    pub fn is_not_null(self) -> SqlExpr {
        SqlExpr::IsNotNull(Box::new(self.expr()))
    }

    pub fn in_(self, values: impl IntoIterator<Item = Value>) -> SqlExpr {
        SqlExpr::In(Box::new(self.expr()), values.into_iter().map(SqlExpr::Value).collect())
    }

    pub fn asc(self) -> (SqlExpr, SortDirection) {
        (self.expr(), SortDirection::Asc)
    }

    pub fn desc(self) -> (SqlExpr, SortDirection) {
        (self.expr(), SortDirection::Desc)
    }
}

pub fn and(exprs: impl IntoIterator<Item = SqlExpr>) -> SqlExpr {
    SqlExpr::and(exprs.into_iter().collect())
}

pub fn or(exprs: impl IntoIterator<Item = SqlExpr>) -> SqlExpr {
    SqlExpr::Or(exprs.into_iter().collect())
}

pub fn not(expr: SqlExpr) -> SqlExpr {
    SqlExpr::Not(Box::new(expr))
}

/// A `SELECT` against one entity, built incrementally and run through a
/// [`Session`]. Rows come back hydrated into the identity map, same as
/// `Session::hydrate` for a single fetch.
pub struct Query<'a, P: Provider> {
    session: &'a mut Session<P>,
    entity: &'static str,
    where_: Option<SqlExpr>,
    order_by: Vec<(SqlExpr, SortDirection)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl<'a, P: Provider> Query<'a, P> {
    pub fn new(session: &'a mut Session<P>, entity: &'static str) -> Self {
        Self { session, entity, where_: None, order_by: Vec::new(), limit: None, offset: None }
    }

    pub fn filter(mut self, expr: SqlExpr) -> Self {
        self.where_ = Some(match self.where_ {
            Some(existing) => SqlExpr::and(vec![existing, expr]),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, term: (SqlExpr, SortDirection)) -> Self {
        self.order_by.push(term);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    fn def(&self) -> Result<&EntityDef> {
        self.session
            .schema()
            .entity(self.entity)
            .ok_or_else(|| OrmError::Mapping(format!("unknown entity {}", self.entity)))
    }

    fn select_stmt(&self, columns: Vec<SqlExpr>, joins: Vec<Join>) -> Result<SqlStatement> {
        let def = self.def()?;
        Ok(SqlStatement::Select {
            distinct: false,
            columns,
            from: def.table,
            alias: None,
            joins,
            where_: self.where_.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        })
    }

    fn column_list(&self) -> Result<Vec<SqlExpr>> {
        let def = self.def()?;
        Ok(def.attributes.iter().filter(|a| a.target == crate::schema::AttributeTarget::Scalar).map(|a| SqlExpr::col(def.table, a.column)).collect())
    }

    /// Runs the query and hydrates every returned row into the session's
    /// identity map, returning the resulting `InstanceId`s in row order.
    ///
    /// Querying a discriminated root with more than one registered subclass
    /// (the original's `select(e for e in Root)` over a table with a
    /// `classtype` column) is polymorphic: every family member's columns are
    /// selected and each row materializes under the concrete entity its own
    /// discriminator value names, not under `Root`. Querying a subclass
    /// directly instead adds a `classtype = <value>` filter, so a table
    /// shared with its siblings doesn't leak their rows into the result.
    pub async fn fetch(self) -> Result<Vec<InstanceId>> {
        let def = self.def()?;
        let root = def.root;
        let entity_name = def.name;
        let discriminator_column = def.discriminator_column;
        let discriminator_value = def.discriminator_value;
        let is_root_query = entity_name == root;

        if is_root_query && discriminator_column.is_some() && self.session.schema().family(root).len() > 1 {
            return self.fetch_polymorphic(root, discriminator_column.unwrap()).await;
        }

        let def_table = self.def()?.table;
        let columns = self.column_list()?;
        let column_names: Vec<&'static str> = self
            .def()?
            .attributes
            .iter()
            .filter(|a| a.target == crate::schema::AttributeTarget::Scalar)
            .map(|a| a.name)
            .collect();
        let pk_names: Vec<&'static str> = self.def()?.primary_key.clone();

        let disc_filter = match (discriminator_column, discriminator_value) {
            (Some(col_name), Some(tag)) if !is_root_query => {
                Some(SqlExpr::Eq(Box::new(SqlExpr::col(def_table, col_name)), Box::new(SqlExpr::Value(Value::Text(Some(tag.to_string()))))))
            }
            _ => None,
        };
        let where_ = match (self.where_.clone(), disc_filter) {
            (Some(w), Some(d)) => Some(SqlExpr::and(vec![w, d])),
            (Some(w), None) => Some(w),
            (None, Some(d)) => Some(d),
            (None, None) => None,
        };
        let stmt = SqlStatement::Select {
            distinct: false,
            columns,
            from: def_table,
            alias: None,
            joins: Vec::new(),
            where_,
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        };
        let rows = self
            .session
            .provider_fetch(&stmt, &[])
            .await
            .map_err(|e| OrmError::TransactionIntegrity(format!("select from {def_table} failed"), Some(e)))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values: HashMap<&'static str, Value> = HashMap::new();
            for name in &column_names {
                if let Some(v) = row.get_column(name) {
                    values.insert(name, v.clone());
                }
            }
            let pk: Vec<Value> = pk_names.iter().map(|n| values.get(n).cloned().unwrap_or(Value::Null)).collect();
            ids.push(self.session.hydrate(entity_name, pk, values)?);
        }
        Ok(ids)
    }

    async fn fetch_polymorphic(self, root: &'static str, discriminator_column: &'static str) -> Result<Vec<InstanceId>> {
        let family = self.session.schema().family(root);
        let table = family.iter().find(|e| e.name == root).expect("root must be in its own family").table;
        let mut columns_by_name: HashMap<&'static str, &'static str> = HashMap::new();
        let mut disc_attr_name = discriminator_column;
        for def in &family {
            for attr in &def.attributes {
                if attr.target == crate::schema::AttributeTarget::Scalar {
                    columns_by_name.entry(attr.name).or_insert(attr.column);
                }
                if attr.kind == crate::schema::AttributeKind::Discriminator {
                    disc_attr_name = attr.name;
                }
            }
        }
        let column_names: Vec<&'static str> = columns_by_name.keys().copied().collect();
        let columns: Vec<SqlExpr> = column_names.iter().map(|n| SqlExpr::col(table, columns_by_name[n])).collect();
        let pk_names: Vec<&'static str> = family.iter().find(|e| e.name == root).map(|e| e.primary_key.clone()).unwrap_or_default();

        let stmt = SqlStatement::Select {
            distinct: false,
            columns,
            from: table,
            alias: None,
            joins: Vec::new(),
            where_: self.where_.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        };
        let rows = self
            .session
            .provider_fetch(&stmt, &[])
            .await
            .map_err(|e| OrmError::TransactionIntegrity(format!("select from {table} failed"), Some(e)))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values: HashMap<&'static str, Value> = HashMap::new();
            for name in &column_names {
                if let Some(v) = row.get_column(name) {
                    values.insert(name, v.clone());
                }
            }
            let pk: Vec<Value> = pk_names.iter().map(|n| values.get(n).cloned().unwrap_or(Value::Null)).collect();
            let tag = values.get(disc_attr_name).and_then(|v| match v {
                Value::Text(Some(s)) => Some(s.as_str()),
                _ => None,
            });
            let entity_name = tag
                .and_then(|t| self.session.schema().entity_by_discriminator(root, t))
                .map(|e| e.name)
                .unwrap_or(root);
            ids.push(self.session.hydrate(entity_name, pk, values)?);
        }
        Ok(ids)
    }

    /// Fetches no more than `cap` rows, erroring instead of silently
    /// truncating if there were more (spec §4.4, mirroring the original's
    /// `fetchmany(max_fetch_count + 1)` probe): `cap == 1` is the shape
    /// `fetch_one` needs and raises `MultipleObjectsFound`; any other cap
    /// raises `TooManyObjectsFound` carrying the cap that was exceeded.
    pub async fn fetch_capped(self, cap: usize) -> Result<Vec<InstanceId>> {
        let entity = self.entity;
        let mut ids = self.limit(cap as u64 + 1).fetch().await?;
        if ids.len() > cap {
            return if cap == 1 {
                Err(OrmError::MultipleObjectsFound(entity))
            } else {
                Err(OrmError::TooManyObjectsFound { entity, cap })
            };
        }
        ids.truncate(cap);
        Ok(ids)
    }

    /// A single-row lookup (the original's `Entity.get(**kwargs)`): exactly
    /// one row must match this query's filter, else `ObjectNotFound` (no
    /// rows) or `MultipleObjectsFound` (more than one).
    pub async fn fetch_one(self) -> Result<InstanceId> {
        let entity = self.entity;
        let mut ids = self.fetch_capped(1).await?;
        ids.pop().ok_or_else(|| OrmError::ObjectNotFound { entity, pk: crate::PkDisplay("<filter>".into()) })
    }

    async fn aggregate_scalar(self, agg: Aggregate, on: SqlExpr) -> Result<Value> {
        let def_table = self.def()?.table;
        let stmt = self.select_stmt(vec![SqlExpr::Aggregate(agg, Box::new(on))], Vec::new())?;
        let rows = self
            .session
            .provider_fetch(&stmt, &[])
            .await
            .map_err(|e| OrmError::TransactionIntegrity(format!("aggregate on {def_table} failed"), Some(e)))?;
        Ok(rows.first().and_then(|r| r.values.first()).cloned().unwrap_or(Value::Null))
    }

    pub async fn count(self) -> Result<i64> {
        let entity = self.entity;
        let value = self.aggregate_scalar(Aggregate::Count, SqlExpr::col(entity, "*")).await?;
        Ok(match value {
            Value::Int64(Some(n)) => n,
            _ => 0,
        })
    }

    pub async fn exists(self) -> Result<bool> {
        Ok(self.limit(1).count().await? > 0)
    }

    pub async fn sum(self, column: Col) -> Result<Value> {
        self.aggregate_scalar(Aggregate::Sum, column.expr()).await
    }

    pub async fn avg(self, column: Col) -> Result<Value> {
        self.aggregate_scalar(Aggregate::Avg, column.expr()).await
    }

    pub async fn min(self, column: Col) -> Result<Value> {
        self.aggregate_scalar(Aggregate::Min, column.expr()).await
    }

    pub async fn max(self, column: Col) -> Result<Value> {
        self.aggregate_scalar(Aggregate::Max, column.expr()).await
    }
}

/// Structural hash of a [`SqlExpr`]/[`SqlStatement`] that ignores bound
/// literal values, so two predicates differing only in the constants plugged
/// into them hash identically. This is the "shape" a cached plan is keyed
/// on; `Param` positions are kept distinct from `Value` literals since a
/// query built with different parameter types needs a different plan.
struct ShapeHash<'a>(&'a SqlExpr);

impl Hash for ShapeHash<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fn walk<H: Hasher>(e: &SqlExpr, state: &mut H) {
            std::mem::discriminant(e).hash(state);
            match e {
                SqlExpr::Column { table, name } => {
                    table.hash(state);
                    name.hash(state);
                }
                SqlExpr::Value(v) => std::mem::discriminant(v).hash(state),
                SqlExpr::Param(p) => std::mem::discriminant(p).hash(state),
                SqlExpr::Eq(a, b)
                | SqlExpr::NotEq(a, b)
                | SqlExpr::Lt(a, b)
                | SqlExpr::Lte(a, b)
                | SqlExpr::Gt(a, b)
                | SqlExpr::Gte(a, b) => {
                    walk(a, state);
                    walk(b, state);
                }
                SqlExpr::IsNull(a) | SqlExpr::IsNotNull(a) | SqlExpr::Not(a) => walk(a, state),
                SqlExpr::In(a, list) => {
                    walk(a, state);
                    list.len().hash(state);
                    for item in list {
                        walk(item, state);
                    }
                }
                SqlExpr::And(list) | SqlExpr::Or(list) | SqlExpr::Coalesce(list) | SqlExpr::Row(list) => {
                    list.len().hash(state);
                    for item in list {
                        walk(item, state);
                    }
                }
                SqlExpr::Exists(_) => {}
                SqlExpr::Aggregate(agg, inner) => {
                    std::mem::discriminant(agg).hash(state);
                    walk(inner, state);
                }
            }
        }
        walk(self.0, state);
    }
}

/// Caches a compiled [`SqlStatement`] by `(entity type, predicate shape)`
/// (SPEC_FULL.md §7): identical predicate shapes across calls, regardless of
/// the literal values bound into them, reuse one plan.
#[derive(Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<(TypeId, u64), SqlStatement>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached statement for `(E, predicate)` if present, else
    /// compiles `build` and caches the result.
    pub fn get_or_compile<E: Any>(&self, predicate: &SqlExpr, build: impl FnOnce() -> SqlStatement) -> SqlStatement {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        ShapeHash(predicate).hash(&mut hasher);
        let key = (TypeId::of::<E>(), hasher.finish());
        let mut entries = self.entries.lock().expect("query cache poisoned");
        entries.entry(key).or_insert_with(build).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("query cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
