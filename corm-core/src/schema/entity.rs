use crate::schema::attribute::{Attribute, AttributeDecl};
use crate::{OrmError, Result, Value};
use std::collections::HashMap;

/// Static declaration of one entity, emitted by `#[derive(Entity)]`.
///
/// Registered into a [`crate::schema::Registry`] with
/// `Registry::register::<E>()`, where `E: Entity`. Direct bases express
/// single-table inheritance (spec §4.1): every entity in one chain shares
/// the root's table and primary key.
#[derive(Debug, Clone, Copy)]
pub struct EntityDecl {
    pub name: &'static str,
    pub table: &'static str,
    pub direct_bases: &'static [&'static str],
    pub attributes: &'static [AttributeDecl],
    /// Value this entity's row carries in the root's discriminator column,
    /// `None` if the entity declares no discriminator participation.
    pub discriminator_value: Option<&'static str>,
}

/// Trait implemented by `#[derive(Entity)]` for every mapped struct.
///
/// Kept deliberately thin: the engine never stores `Self` inside the
/// session (state lives in the erased [`crate::instance::InstanceState`]),
/// this trait only bridges the typed struct to that erased form at the
/// edges — construction and row materialization.
pub trait Entity: Sized + 'static {
    fn decl() -> &'static EntityDecl;

    /// Column-ordered scalar values for every non-relational, non-pk-auto
    /// attribute, as `(attribute name, value)`, used to build the initial
    /// `vals` map when constructing a new instance from typed field values.
    fn initial_values(&self) -> Vec<(&'static str, Value)>;

    /// Materializes `Self` back from the session's resolved attribute map.
    /// Errors if a required column is absent or of the wrong dynamic type.
    fn from_values(values: &HashMap<&'static str, Value>) -> Result<Self>;
}

/// Fully resolved entity, produced once by the registry at `generate_mapping` time.
#[derive(Debug)]
pub struct EntityDef {
    pub name: &'static str,
    pub table: &'static str,
    pub root: &'static str,
    pub direct_bases: Vec<&'static str>,
    /// All attributes visible on this entity: inherited (from the root down
    /// to this entity's direct bases) followed by this entity's own.
    pub attributes: Vec<Attribute>,
    pub primary_key: Vec<&'static str>,
    /// Secondary (non-pk) unique keys, simple or composite, by attribute name.
    pub secondary_keys: Vec<Vec<&'static str>>,
    pub discriminator_column: Option<&'static str>,
    pub discriminator_value: Option<&'static str>,
    pub all_bits: u64,
}

impl EntityDef {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.name == name)
    }

    pub fn pk_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.primary_key
            .iter()
            .map(move |n| self.attribute(n).expect("pk attribute must exist"))
    }

    pub fn require_pk(&self) -> Result<()> {
        if self.primary_key.is_empty() {
            return Err(OrmError::Mapping(format!(
                "entity {} has no primary key",
                self.name
            )));
        }
        Ok(())
    }
}
