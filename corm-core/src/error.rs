use std::fmt;

/// `anyhow`-flavored error used for provider/driver failure context chains,
/// the way the workspace's reference data layer wraps low-level failures
/// with `.context(...)` before logging them at the error site.
pub type Error = anyhow::Error;
pub type AnyResult<T> = anyhow::Result<T>;
/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OrmError>;

/// Primary key of an entity, for error reporting. Composite keys are
/// rendered `(a, b, ...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PkDisplay(pub String);

impl fmt::Display for PkDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The engine's closed error taxonomy (spec §7). Provider/driver failures
/// cross this boundary wrapped in [`OrmError::Unexpected`] or
/// [`OrmError::TransactionIntegrity`], carrying the original `anyhow::Error`
/// as source so `{:#}` still prints the full context chain.
#[derive(thiserror::Error, Debug)]
pub enum OrmError {
    /// Bad schema declaration: duplicate entity, unresolved/ambiguous
    /// reverse attribute, inconsistent inheritance, redefined primary key.
    #[error("ER-diagram error: {0}")]
    ErDiagram(String),

    /// Column/table conflict between a declaration and the generated schema.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Required attribute set to null, `check` type mismatch, or an attempt
    /// to mutate a primary-key attribute after creation.
    #[error("constraint error: {0}")]
    Constraint(String),

    /// Creating/updating a value would collide with a unique key already
    /// held in the session's in-memory indexes.
    #[error("cache index error: {0}")]
    CacheIndex(String),

    /// An instance from one session was used with another session.
    #[error("object {0} belongs to a different session")]
    CrossSessionObject(String),

    /// An operation was attempted on a session whose rollback already ran.
    #[error("session is no longer alive (was rolled back or released)")]
    SessionNotAlive,

    /// An operation was attempted on an object in `Deleted`/`Cancelled` status.
    #[error("operation on deleted object {0}")]
    OperationWithDeletedObject(String),

    /// Saving `created` objects could not be ordered: a reference cycle
    /// among not-yet-inserted rows has no valid insert order.
    #[error("cannot resolve insert order, cyclic dependency: {0}")]
    UnresolvableCyclicDependency(String),

    /// A value read earlier in the transaction no longer matches the
    /// database at flush/commit time.
    #[error("unrepeatable read: {0}")]
    UnrepeatableRead(String),

    /// A provider-level integrity violation (e.g. a UNIQUE violation the
    /// session's own indexes did not already catch).
    #[error("transaction integrity error: {0}")]
    TransactionIntegrity(String, #[source] Option<Error>),

    /// A provider call failed for a reason outside the taxonomy above.
    #[error("unexpected error: {0}")]
    Unexpected(String, #[source] Option<Error>),

    /// Bundles the sub-errors from a multi-database commit where the
    /// primary database failed; secondaries were rolled back.
    #[error("commit failed across {} database(s)", .0.len())]
    Commit(Vec<OrmError>),

    /// The primary database committed but at least one secondary database
    /// failed to commit afterwards; its state is now inconsistent with the
    /// primary and requires manual recovery (spec §9, open question iii).
    #[error("partial commit: {} secondary database(s) failed after the primary committed", .0.len())]
    PartialCommit(Vec<OrmError>),

    /// Bundles sub-errors from a multi-database rollback.
    #[error("rollback failed across {} database(s)", .0.len())]
    Rollback(Vec<OrmError>),

    /// An unsupported predicate shape, unknown column name, or a type
    /// mismatch between a bound parameter and the column it targets.
    #[error("query translation error: {0}")]
    Translation(String),

    /// A single-row lookup (`get`/`fetch_one`) returned zero rows.
    #[error("{entity}[{pk}] not found")]
    ObjectNotFound { entity: &'static str, pk: PkDisplay },

    /// A single-row lookup returned more than one row.
    #[error("expected a single {0}, found multiple")]
    MultipleObjectsFound(&'static str),

    /// A fetch exceeded the configured maximum row cap.
    #[error("fetch of {entity} exceeded the cap of {cap} rows")]
    TooManyObjectsFound { entity: &'static str, cap: usize },
}

impl OrmError {
    pub fn context(msg: impl Into<String>) -> impl FnOnce(Error) -> OrmError {
        let msg = msg.into();
        move |e| OrmError::Unexpected(msg, Some(e))
    }
}
