//! The provider boundary (spec §6): the engine knows nothing about any
//! concrete database. A [`Provider`] owns connections and turns a
//! [`crate::ast::SqlStatement`] into rows or an affected-row count.
//!
//! Async methods are return-position `impl Future`s rather than
//! `#[async_trait]`, the same shape the workspace's reference data layer
//! uses for its driver trait, so a provider can be implemented without
//! boxing every call.

use crate::ast::SqlStatement;
use crate::row::{RowLabeled, RowsAffected};
use crate::schema::Attribute;
use crate::{AnyResult, Value};
use std::future::Future;

/// Placeholder convention a provider's driver expects bound parameters in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `?`
    Qmark,
    /// `%s`
    Format,
    /// `:1`, `:2`, ...
    Numeric,
    /// `:name`
    Named,
    /// `%(name)s`
    PyFormat,
}

/// A database connection or equivalent session handle, owned exclusively by
/// one [`crate::Session`] for its lifetime.
pub trait Connection: Send {}

/// External collaborator the engine is driven by (spec §1, out of scope to
/// implement beyond the in-process reference provider in `corm-memory`).
pub trait Provider: Send + Sync + Sized + 'static {
    type Connection: Connection;

    fn paramstyle(&self) -> ParamStyle;

    /// Upper bound on bound parameters per statement; the query facility
    /// chunks `IN (...)` lists that would exceed it.
    fn max_params_count(&self) -> usize {
        999
    }

    fn connect(&self) -> impl Future<Output = AnyResult<Self::Connection>> + Send;

    fn release(&self, conn: Self::Connection) -> impl Future<Output = AnyResult<()>> + Send {
        async move {
            drop(conn);
            Ok(())
        }
    }

    fn commit(&self, conn: &mut Self::Connection) -> impl Future<Output = AnyResult<()>> + Send;

    fn rollback(&self, conn: &mut Self::Connection) -> impl Future<Output = AnyResult<()>> + Send;

    /// Runs an `INSERT`/`UPDATE`/`DELETE`, returning the affected row count.
    fn execute(
        &self,
        conn: &mut Self::Connection,
        stmt: &SqlStatement,
        params: &[Value],
    ) -> impl Future<Output = AnyResult<RowsAffected>> + Send;

    /// Runs the same statement once per row in `params_batches`.
    fn execute_many(
        &self,
        conn: &mut Self::Connection,
        stmt: &SqlStatement,
        params_batches: &[Vec<Value>],
    ) -> impl Future<Output = AnyResult<RowsAffected>> + Send {
        async move {
            let mut total = RowsAffected::default();
            for params in params_batches {
                total.extend([self.execute(conn, stmt, params).await?]);
            }
            Ok(total)
        }
    }

    /// Runs an `INSERT` and returns the generated primary key value, for
    /// entities whose pk attribute is database-assigned.
    fn execute_returning_id(
        &self,
        conn: &mut Self::Connection,
        stmt: &SqlStatement,
        params: &[Value],
    ) -> impl Future<Output = AnyResult<Value>> + Send;

    /// Runs a `SELECT`, returning every row.
    fn fetch(
        &self,
        conn: &mut Self::Connection,
        stmt: &SqlStatement,
        params: &[Value],
    ) -> impl Future<Output = AnyResult<Vec<RowLabeled>>> + Send;

    /// `generate_mapping(check_tables=true)`'s validation step (spec §9,
    /// open question i): must succeed for every mapped table, nothing about
    /// the result is inspected beyond that.
    fn validate_table(
        &self,
        conn: &mut Self::Connection,
        table: &'static str,
    ) -> impl Future<Output = AnyResult<()>> + Send;

    fn default_column_name(&self, attr: &Attribute) -> String {
        attr.name.to_string()
    }

    fn default_entity_table_name(&self, entity: &'static str) -> String {
        entity.to_ascii_lowercase()
    }

    fn default_m2m_table_name(&self, left: &'static str, right: &'static str) -> String {
        let mut names = [left.to_ascii_lowercase(), right.to_ascii_lowercase()];
        names.sort();
        format!("{}_{}", names[0], names[1])
    }

    fn default_m2m_column_names(&self, left_entity: &'static str, right_entity: &'static str) -> (String, String) {
        (
            format!("{}_id", left_entity.to_ascii_lowercase()),
            format!("{}_id", right_entity.to_ascii_lowercase()),
        )
    }
}
