//! Session registry & transaction decorator (spec §4.5): each `Session`
//! registers itself against a task-local slot keyed by database id, and
//! [`with_transaction`] drives flush/commit/rollback across every session a
//! task touched, in `(priority desc, registration order)`, the same fan-out
//! order the original's `Database._register_` / `commit` module functions
//! use. A Tokio task is this engine's unit of concurrency, so a
//! `tokio::task_local!` plays the role the original's thread-local `Local`
//! object does per OS thread.

use crate::{OrmError, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;

pub type DatabaseId = &'static str;

/// Object-safe view of a `Session<P>`, erasing its `Provider` type so
/// sessions against different providers can share one registry.
pub trait ManagedSession: Send {
    fn flush(&mut self) -> BoxFuture<'_, Result<()>>;
    fn commit(&mut self) -> BoxFuture<'_, Result<()>>;
    fn rollback(&mut self) -> BoxFuture<'_, Result<()>>;
}

struct Registration {
    priority: i32,
    seq: u64,
    session: Box<dyn ManagedSession>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<DatabaseId, Registration>,
    next_seq: u64,
}

tokio::task_local! {
    static REGISTRY: std::cell::RefCell<Registry>;
}

/// Registers `session` under `id` for the current task's transaction.
/// Calling this outside a `with_transaction` scope panics: a session always
/// has an active transaction context once it does any work, the same
/// invariant the original's `Database` object relies on.
pub fn register(id: DatabaseId, priority: i32, session: Box<dyn ManagedSession>) {
    REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        let seq = r.next_seq;
        r.next_seq += 1;
        r.sessions.insert(id, Registration { priority, seq, session });
    });
}

/// A multi-database commit failure (spec §4.5/§7). `partial` distinguishes
/// "nothing committed" (safe to retry the whole transaction) from "the
/// priority-highest database committed but at least one other failed
/// afterwards" (requires manual recovery, spec §9 open question iii).
#[derive(Debug)]
pub struct CommitError {
    pub errors: Vec<OrmError>,
    pub partial: bool,
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.partial {
            write!(f, "partial commit: primary database committed, {} secondary database(s) failed", self.errors.len())
        } else {
            write!(f, "commit failed across {} database(s)", self.errors.len())
        }
    }
}

impl std::error::Error for CommitError {}

async fn commit_all(mut regs: Vec<Registration>) -> std::result::Result<(), CommitError> {
    regs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    let mut iter = regs.into_iter();

    let Some(mut primary) = iter.next() else { return Ok(()) };
    if let Err(e) = primary.session.commit().await {
        let mut errors = vec![e];
        for mut reg in iter {
            if let Err(e) = reg.session.rollback().await {
                errors.push(e);
            }
        }
        return Err(CommitError { errors, partial: false });
    }

    let mut secondary_errors = Vec::new();
    for mut reg in iter {
        if let Err(e) = reg.session.commit().await {
            secondary_errors.push(e);
        }
    }
    if secondary_errors.is_empty() {
        Ok(())
    } else {
        Err(CommitError { errors: secondary_errors, partial: true })
    }
}

async fn rollback_all(regs: Vec<Registration>) {
    for mut reg in regs {
        let _ = reg.session.rollback().await;
    }
}

/// Runs `body` inside a fresh registry scope, retrying up to `retries`
/// times when it fails with an error `is_retryable` accepts — the
/// original's `with_transaction(retry=N, retry_exceptions=(...))` — and
/// commits or rolls back every session `body` registered.
///
/// `allowed_exceptions` names errors that still commit the sessions `body`
/// registered rather than rolling them back, even though `body` failed —
/// the original's `allowed_exceptions=[...]` (e.g. a redirect raised
/// mid-request that should not undo the work already done). The original
/// error is always what's returned (and what `is_retryable` sees); a
/// failure while committing on this path is swallowed, matching the
/// original's `finally: raise exc_info` discarding whatever `commit()`
/// itself raised.
pub async fn with_transaction<F, Fut, T>(
    retries: u32,
    is_retryable: impl Fn(&OrmError) -> bool,
    allowed_exceptions: impl Fn(&OrmError) -> bool,
    body: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let (outcome, regs) = REGISTRY
            .scope(std::cell::RefCell::new(Registry::default()), async {
                let outcome = body().await;
                let regs: Vec<Registration> = REGISTRY.with(|r| r.borrow_mut().sessions.drain().map(|(_, v)| v).collect());
                (outcome, regs)
            })
            .await;

        match outcome {
            Ok(value) => match commit_all(regs).await {
                Ok(()) => return Ok(value),
                Err(e) if e.partial => return Err(OrmError::PartialCommit(e.errors)),
                Err(e) => return Err(OrmError::Commit(e.errors)),
            },
            Err(e) => {
                if allowed_exceptions(&e) {
                    let _ = commit_all(regs).await;
                } else {
                    rollback_all(regs).await;
                }
                if attempt < retries && is_retryable(&e) {
                    attempt += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}
