//! Per-row runtime state (spec §3's lifecycle table), the erased form every
//! [`crate::Session`] instance is stored as. Kept free of session-wide
//! concerns (identity-map indexes, the undo log) the way the original keeps
//! `Cache`'s bookkeeping out of `Entity.__slots__`.

use crate::schema::Attribute;
use crate::Value;
use std::collections::HashMap;

/// Identity of an instance within its owning [`crate::Session`]'s slab,
/// tagged with the session that allocated it. A `Session` only ever
/// indexes ids carrying its own `session` tag; passing an id minted by a
/// different session is rejected with `OrmError::CrossSessionObject`
/// instead of silently indexing into (or panicking against) the wrong
/// slab, the failure mode a bare `usize` index would otherwise allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId {
    pub(crate) session: u64,
    pub(crate) slot: usize,
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.session, self.slot)
    }
}

/// One row's lifecycle stage, advanced by `Session::save`/`flush`/`commit`
/// and by writes through `Session::set_attr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Constructed this transaction, not yet inserted.
    Created,
    /// Loaded from the database, unmodified since.
    Loaded,
    /// Flushed (its `INSERT`/`UPDATE` ran) but the transaction has not committed.
    Saved,
    /// Loaded or saved, then modified again since the last flush.
    Updated,
    /// Flushed with no column changes, present only to assert a version check.
    Locked,
    /// Removed, flush has run its `DELETE`.
    Deleted,
    /// Removed before ever being flushed; never existed in the database.
    Cancelled,
}

impl Status {
    pub fn is_alive(self) -> bool {
        !matches!(self, Status::Deleted | Status::Cancelled)
    }

    pub fn is_persisted(self) -> bool {
        matches!(self, Status::Loaded | Status::Saved | Status::Updated | Status::Locked)
    }
}

/// The value held for one attribute slot. Scalar attributes hold a
/// [`Value`]; to-one relational attributes hold the target's identity-map
/// slot directly rather than round-tripping through `Value`, since the
/// target is itself a live session-owned instance, not data.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Scalar(Value),
    Reference(Option<InstanceId>),
}

impl AttrValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            AttrValue::Scalar(v) => Some(v),
            AttrValue::Reference(_) => None,
        }
    }

    pub fn as_reference(&self) -> Option<Option<InstanceId>> {
        match self {
            AttrValue::Reference(r) => Some(*r),
            AttrValue::Scalar(_) => None,
        }
    }
}

/// The erased state of one mapped row. `Set` attributes are not stored
/// here: their membership lives in `Session`'s collection table, keyed by
/// `(InstanceId, attribute name)`, since a collection has no single value
/// to hold.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub entity: &'static str,
    pub status: Status,
    /// Current (possibly unsaved) attribute values, by attribute name.
    pub vals: HashMap<&'static str, AttrValue>,
    /// Last value known to match the database, by attribute name. Used to
    /// detect `UnrepeatableRead` and to build `UPDATE ... WHERE` guards.
    pub dbvals: HashMap<&'static str, AttrValue>,
    /// Bit set for every attribute read since the last write to it.
    pub rbits: u64,
    /// Bit set for every attribute written since the last flush.
    pub wbits: u64,
    /// Primary key values, set once at construction (or once the database
    /// assigns them on insert) and never mutated after.
    pub pk: Vec<Value>,
}

impl InstanceState {
    pub fn new_created(entity: &'static str, pk: Vec<Value>, vals: HashMap<&'static str, AttrValue>) -> Self {
        Self {
            entity,
            status: Status::Created,
            vals,
            dbvals: HashMap::new(),
            rbits: 0,
            wbits: 0,
            pk,
        }
    }

    pub fn new_loaded(entity: &'static str, pk: Vec<Value>, dbvals: HashMap<&'static str, AttrValue>) -> Self {
        Self {
            entity,
            status: Status::Loaded,
            vals: dbvals.clone(),
            dbvals,
            rbits: 0,
            wbits: 0,
            pk,
        }
    }

    pub fn get(&self, attr: &Attribute) -> Option<&AttrValue> {
        self.vals.get(attr.name)
    }

    pub fn is_loaded(&self, attr: &Attribute) -> bool {
        self.vals.contains_key(attr.name)
    }

    /// Records that `attr` was read: marks it read-dependent unless it is
    /// already pending a write this transaction (a pending write makes the
    /// prior database value irrelevant to repeatability).
    pub fn mark_read(&mut self, attr: &Attribute) {
        if self.wbits & attr.bit == 0 {
            self.rbits |= attr.bit;
        }
    }

    pub fn attrs_with_bit<'a>(&self, attrs: &'a [Attribute], bits: u64) -> impl Iterator<Item = &'a Attribute> {
        attrs.iter().filter(move |a| bits & a.bit != 0)
    }
}
