mod error;
pub mod schema;
mod row;
mod value;

pub mod ast;
pub mod collection;
pub mod instance;
pub mod provider;
pub mod query;
mod session;
pub mod transaction;
mod typed;

pub use error::*;
pub use row::*;
pub use value::*;

pub use instance::{AttrValue, InstanceId, InstanceState, Status};
pub use provider::{Connection, ParamStyle, Provider};
pub use query::{and, col, not, or, Col, Query, QueryCache};
pub use schema::{Attribute, AttributeDecl, AttributeKind, AttributeTarget, Entity, EntityDecl, EntityDef, Registry};
pub use session::Session;
pub use transaction::{with_transaction, CommitError, DatabaseId};

pub mod stream {
    pub use ::futures::stream::*;
}
pub use ::futures::future;

pub use ::indoc;
