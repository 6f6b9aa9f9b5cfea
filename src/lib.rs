//! corm: an embeddable unit-of-work ORM core.
//!
//! This crate is a thin facade: [`corm-core`](corm_core) holds the identity
//! map, dirty tracking and commit engine, and [`corm-macros`](corm_macros)
//! supplies the `#[derive(Entity)]` that turns a plain struct into something
//! the engine can hydrate and flush. Depend on `corm` alone; the two inner
//! crates are not meant to be used directly.

pub use corm_core::*;
pub use corm_macros::Entity;
