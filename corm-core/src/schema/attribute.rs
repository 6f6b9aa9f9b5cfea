use crate::Value;

/// One of the six closed attribute variants from the data model (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Optional,
    Required,
    Unique,
    PrimaryKey,
    Discriminator,
    Set,
}

impl AttributeKind {
    pub fn is_required(self) -> bool {
        matches!(
            self,
            AttributeKind::Required | AttributeKind::Unique | AttributeKind::PrimaryKey | AttributeKind::Discriminator
        )
    }
    pub fn is_unique(self) -> bool {
        matches!(self, AttributeKind::Unique | AttributeKind::PrimaryKey)
    }
    pub fn is_pk(self) -> bool {
        matches!(self, AttributeKind::PrimaryKey)
    }
    pub fn is_collection(self) -> bool {
        matches!(self, AttributeKind::Set)
    }
}

/// What an attribute's declared type resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeTarget {
    /// A `Value`-backed column (`bool`, `i64`, `String`, ...).
    Scalar,
    /// A to-one reference to another entity, named by its registered name.
    Reference(&'static str),
    /// A to-many `Set<Other>` reference.
    Collection(&'static str),
}

/// Link-table metadata for a many-to-many `Set`↔`Set` pair (spec §4.1's
/// m2m case). Assigned to exactly one side of the pair — the side the
/// registry picked as canonical — so `Session::flush` only emits the link
/// table's `INSERT`/`DELETE` statements once per logical change, not once
/// per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTable {
    pub table: &'static str,
    /// Column holding this side's own id.
    pub own_column: &'static str,
    /// Column holding the other side's id.
    pub other_column: &'static str,
}

impl AttributeTarget {
    pub fn target_entity(self) -> Option<&'static str> {
        match self {
            AttributeTarget::Scalar => None,
            AttributeTarget::Reference(e) | AttributeTarget::Collection(e) => Some(e),
        }
    }
    pub fn is_relational(self) -> bool {
        !matches!(self, AttributeTarget::Scalar)
    }
}

/// Static declaration of one attribute, emitted by `#[derive(Entity)]`.
///
/// This is the macro's sole output per field: everything position-dependent
/// (bit assignment, reverse resolution, pk offset, default column name) is
/// computed later by the [`crate::schema::Registry`], the same two-phase
/// split the original draws between "declare an attribute" and
/// "`_link_reverse_attrs_`/`_get_pk_columns_` at mapping time".
#[derive(Debug, Clone, Copy)]
pub struct AttributeDecl {
    pub name: &'static str,
    pub kind: AttributeKind,
    pub target: AttributeTarget,
    /// Explicit reverse attribute name, if the declaration named one.
    pub reverse: Option<&'static str>,
    /// Explicit column name override, or `None` to default to `name`.
    pub column: Option<&'static str>,
    /// Groups several `Unique` attributes into one composite unique key.
    /// Attributes sharing a group name, in declaration order, form the key
    /// tuple; a lone `Unique` attribute with no group is a simple key.
    pub unique_group: Option<&'static str>,
    /// Produces a typed NULL `Value` of this attribute's scalar type.
    /// Unused (returns `Value::Null`) for relational attributes.
    pub empty_value: fn() -> Value,
}

/// Fully resolved attribute, produced by the registry from an
/// [`AttributeDecl`] plus its position within the owning entity.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: &'static str,
    pub declaring_entity: &'static str,
    pub kind: AttributeKind,
    pub target: AttributeTarget,
    pub column: &'static str,
    pub empty_value: fn() -> Value,
    /// Bit assigned within the declaring entity's `rbits`/`wbits` masks.
    pub bit: u64,
    /// `Some(i)` when this attribute occupies position `i` of the primary key.
    pub pk_offset: Option<usize>,
    /// Composite unique keys this attribute participates in, as
    /// `(key id, position within the key)`.
    pub composite_keys: Vec<(usize, usize)>,
    /// Resolved reverse attribute name, once linked.
    pub reverse: Option<&'static str>,
    /// Link-table metadata, set only on the canonical side of a resolved
    /// `Set`↔`Set` pair. `None` for every other attribute, including the
    /// non-canonical side of an m2m pair (which still carries `reverse`).
    pub link: Option<LinkTable>,
}

impl Attribute {
    pub fn is_indexed(&self) -> bool {
        self.kind.is_unique() || !self.composite_keys.is_empty()
    }
}
