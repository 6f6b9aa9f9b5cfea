//! Bridges the typed `Entity` trait `#[derive(Entity)]` implements onto the
//! erased [`Session`] primitives, so a struct annotated with the derive can
//! actually be inserted and read back rather than the trait going unused by
//! anything in this crate. Kept thin: both directions just walk the scalar
//! attributes of `E::decl()`, the same attribute list `Session::create`
//! and `Session::get_attr` already operate on.

use crate::instance::{AttrValue, InstanceId};
use crate::provider::Provider;
use crate::schema::{AttributeTarget, Entity};
use crate::session::Session;
use crate::Result;
use std::collections::HashMap;

impl<P: Provider> Session<P> {
    /// `Entity(**kwargs)` for a typed struct: extracts `value`'s scalar
    /// attributes with [`Entity::initial_values`] and hands them to
    /// [`Session::create`]. Relational attributes still go through
    /// `set_reference`/`collection_add` afterward, same as an untyped create.
    pub fn insert<E: Entity>(&mut self, value: &E) -> Result<InstanceId> {
        let scalars: HashMap<&'static str, crate::Value> = value.initial_values().into_iter().collect();
        self.create(E::decl().name, scalars)
    }

    /// Materializes `E` back from every scalar attribute currently loaded
    /// for `id`, marking each one read ([`Session::get_attr`]'s usual
    /// dirty-tracking side effect).
    pub fn get<E: Entity>(&mut self, id: InstanceId) -> Result<E> {
        let mut values = HashMap::new();
        for attr in E::decl().attributes.iter().filter(|a| a.target == AttributeTarget::Scalar) {
            if let Ok(AttrValue::Scalar(v)) = self.get_attr(id, attr.name) {
                values.insert(attr.name, v);
            }
        }
        E::from_values(&values)
    }
}
