//! The unit-of-work session (spec §3/§4.3), the equivalent of the
//! original's `Cache`: an identity map keyed by primary key, secondary
//! unique-key indexes, pending create/update/delete sets, and the
//! `flush`/`commit`/`rollback` state machine that turns them into
//! `INSERT`/`UPDATE`/`DELETE` statements.

use crate::ast::{SqlExpr, SqlStatement};
use crate::collection::SetData;
use crate::instance::{AttrValue, InstanceId, InstanceState, Status};
use crate::provider::Provider;
use crate::schema::{Attribute, AttributeKind, AttributeTarget, EntityDef, Registry};
use crate::{OrmError, PkDisplay, Result, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Reverts one unique-key index change made mid-write, replayed in reverse
/// order if the write is aborted partway through.
struct IndexUndo {
    id: InstanceId,
    root: &'static str,
    key_idx: usize,
    old_tuple: Vec<Value>,
    old_existed: bool,
    new_tuple: Vec<Value>,
}

/// Bound to exactly one [`Provider`] connection for its lifetime (spec §5):
/// not `Send` across an await point shared with another session, one
/// session per thread per database.
pub struct Session<P: Provider> {
    session_id: u64,
    provider: Arc<P>,
    conn: P::Connection,
    schema: Arc<Registry>,
    instances: Vec<Option<InstanceState>>,
    pk_index: HashMap<(&'static str, Vec<Value>), InstanceId>,
    secondary_index: HashMap<(&'static str, usize, Vec<Value>), InstanceId>,
    collections: HashMap<(InstanceId, &'static str), SetData>,
    created: Vec<InstanceId>,
    updated: Vec<InstanceId>,
    deleted: Vec<InstanceId>,
    to_be_checked: Vec<InstanceId>,
    /// `(instance, column, target)` triples an insert left `NULL` because
    /// the optional reference's target had no primary key yet; patched
    /// once every pending insert has run.
    deferred_fk_patches: Vec<(InstanceId, &'static str, InstanceId)>,
    alive: bool,
}

impl<P: Provider> Session<P> {
    pub fn new(provider: Arc<P>, conn: P::Connection, schema: Arc<Registry>) -> Self {
        Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            provider,
            conn,
            schema,
            instances: Vec::new(),
            pk_index: HashMap::new(),
            secondary_index: HashMap::new(),
            collections: HashMap::new(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            to_be_checked: Vec::new(),
            deferred_fk_patches: Vec::new(),
            alive: true,
        }
    }

    fn require_alive(&self) -> Result<()> {
        if !self.alive {
            return Err(OrmError::SessionNotAlive);
        }
        Ok(())
    }

    fn def(&self, entity: &'static str) -> Result<&EntityDef> {
        self.schema
            .entity(entity)
            .ok_or_else(|| OrmError::Mapping(format!("unknown entity {entity}")))
    }

    fn instance(&self, id: InstanceId) -> &InstanceState {
        self.instances[id.slot].as_ref().expect("instance id never reused")
    }

    fn instance_mut(&mut self, id: InstanceId) -> &mut InstanceState {
        self.instances[id.slot].as_mut().expect("instance id never reused")
    }

    fn next_id(&self) -> InstanceId {
        InstanceId { session: self.session_id, slot: self.instances.len() }
    }

    /// Rejects an id minted by a different session before it ever reaches
    /// `self.instances[id.slot]`, where it would either index into an
    /// unrelated instance or panic outright.
    fn check_owner(&self, id: InstanceId) -> Result<()> {
        if id.session != self.session_id {
            return Err(OrmError::CrossSessionObject(format!("instance#{}", id.slot)));
        }
        Ok(())
    }

    pub fn status(&self, id: InstanceId) -> Result<Status> {
        self.check_owner(id)?;
        Ok(self.instance(id).status)
    }

    pub fn entity_of(&self, id: InstanceId) -> Result<&'static str> {
        self.check_owner(id)?;
        Ok(self.instance(id).entity)
    }

    pub fn pk_of(&self, id: InstanceId) -> Result<&[Value]> {
        self.check_owner(id)?;
        Ok(&self.instance(id).pk)
    }

    pub fn schema(&self) -> &Registry {
        &self.schema
    }

    /// `generate_mapping(check_tables=true)`'s validation pass (spec §9,
    /// open question i): asks the provider to confirm every mapped table
    /// exists and is queryable. No column-by-column comparison follows —
    /// a successful `Provider::validate_table` call is all this checks.
    pub async fn validate_schema(&mut self) -> Result<()> {
        let tables: Vec<&'static str> = self.schema.entities().map(|def| def.table).collect();
        for table in tables {
            self.provider
                .validate_table(&mut self.conn, table)
                .await
                .map_err(|e| OrmError::ErDiagram(format!("table validation failed for {table}: {e}")))?;
        }
        Ok(())
    }

    /// Runs a `SELECT` through this session's connection without going
    /// through the identity map, for the query facility to hydrate rows
    /// from itself.
    pub(crate) async fn provider_fetch(&mut self, stmt: &SqlStatement, params: &[Value]) -> crate::AnyResult<Vec<crate::row::RowLabeled>> {
        self.provider.fetch(&mut self.conn, stmt, params).await
    }

    /// Identity-map lookup: `get(entity, pk)` returns the session's single
    /// live instance for that key, if one is already known.
    pub fn by_pk(&self, entity: &'static str, pk: &[Value]) -> Result<Option<InstanceId>> {
        let def = self.def(entity)?;
        Ok(self.pk_index.get(&(def.root, pk.to_vec())).copied())
    }

    /// Primary-key lookup (the original's `Entity[pk]`): returns the
    /// session's existing instance for `pk` if one is already live, else
    /// fetches it, erring `ObjectNotFound` if no such row exists.
    pub async fn get_by_pk(&mut self, entity: &'static str, pk: &[Value]) -> Result<InstanceId> {
        if let Some(id) = self.by_pk(entity, pk)? {
            return Ok(id);
        }
        let def = self.def(entity)?.clone_shallow();
        def.require_pk()?;
        let mut predicate = None;
        for (attr, value) in def.pk_attributes().zip(pk.iter()) {
            let term = crate::query::col(entity, attr.column).eq(value.clone());
            predicate = Some(match predicate {
                Some(existing) => SqlExpr::and(vec![existing, term]),
                None => term,
            });
        }
        let mut query = crate::query::Query::new(self, entity);
        if let Some(predicate) = predicate {
            query = query.filter(predicate);
        }
        let mut ids = query.fetch_capped(1).await?;
        ids.pop()
            .ok_or_else(|| OrmError::ObjectNotFound { entity, pk: PkDisplay(format!("{pk:?}")) })
    }

    /// Registers a newly fetched row as a loaded instance, or returns the
    /// existing one if this pk is already in the identity map (spec
    /// testable property: a second fetch of the same pk returns the same
    /// instance).
    pub fn hydrate(&mut self, entity: &'static str, pk: Vec<Value>, dbvals: HashMap<&'static str, Value>) -> Result<InstanceId> {
        let def = self.def(entity)?.clone_shallow();
        if let Some(&id) = self.pk_index.get(&(def.root, pk.clone())) {
            return Ok(id);
        }
        let vals = dbvals
            .into_iter()
            .map(|(k, v)| (k, AttrValue::Scalar(v)))
            .collect();
        let id = self.next_id();
        self.instances.push(Some(InstanceState::new_loaded(entity, pk.clone(), vals)));
        self.pk_index.insert((def.root, pk), id);
        Ok(id)
    }

    /// `Entity(**kwargs)`: allocates a new instance in `Created` status.
    /// `scalars` must already contain every required scalar attribute;
    /// relational attributes are set afterwards with `set_reference`/
    /// `collection_add`, mirroring how the generated constructor drives it.
    pub fn create(&mut self, entity: &'static str, mut scalars: HashMap<&'static str, Value>) -> Result<InstanceId> {
        self.require_alive()?;
        let def = self.def(entity)?.clone_shallow();

        for attr in &def.attributes {
            if attr.target != AttributeTarget::Scalar {
                continue;
            }
            if attr.kind == AttributeKind::Discriminator {
                if let Some(tag) = def.discriminator_value {
                    scalars.entry(attr.name).or_insert_with(|| Value::Text(Some(tag.to_string())));
                }
                continue;
            }
            if !scalars.contains_key(attr.name) {
                if attr.kind.is_required() && attr.kind != AttributeKind::PrimaryKey {
                    return Err(OrmError::Constraint(format!("{entity}.{} is required", attr.name)));
                }
                scalars.insert(attr.name, (attr.empty_value)());
            }
        }

        let mut pk = Vec::with_capacity(def.primary_key.len());
        let mut pk_known = !def.primary_key.is_empty();
        for name in &def.primary_key {
            match scalars.get(*name) {
                Some(v) if !v.is_null() => pk.push(v.clone()),
                _ => {
                    pk_known = false;
                    pk.push(Value::Null);
                }
            }
        }

        let id = self.next_id();
        let vals = scalars.into_iter().map(|(k, v)| (k, AttrValue::Scalar(v))).collect();
        self.instances.push(Some(InstanceState::new_created(entity, pk.clone(), vals)));

        if pk_known {
            let key = (def.root, pk.clone());
            if self.pk_index.contains_key(&key) {
                self.instances.pop();
                return Err(OrmError::CacheIndex(format!(
                    "{entity}[{}] already exists in this session",
                    PkDisplay(format!("{:?}", key.1))
                )));
            }
            self.pk_index.insert(key, id);
        }

        if let Err(e) = self.index_unique_on_create(id, &def) {
            if pk_known {
                self.pk_index.remove(&(def.root, pk));
            }
            self.instances.pop();
            return Err(e);
        }

        self.created.push(id);
        Ok(id)
    }

    /// Populates secondary unique-key indexes for a freshly created
    /// instance's initial scalar values, rolling back any keys this same
    /// call already inserted if a later one collides.
    fn index_unique_on_create(&mut self, id: InstanceId, def: &EntityDef) -> Result<()> {
        let mut inserted = Vec::new();
        for key_idx in 0..def.secondary_keys.len() {
            let tuple: Vec<Value> = def.secondary_keys[key_idx]
                .iter()
                .map(|n| self.instance(id).vals.get(n).and_then(|v| v.as_scalar().cloned()).unwrap_or(Value::Null))
                .collect();
            let map_key = (def.root, key_idx, tuple);
            if let Some(&existing) = self.secondary_index.get(&map_key) {
                if existing != id {
                    for k in inserted {
                        self.secondary_index.remove(&k);
                    }
                    return Err(OrmError::CacheIndex(format!("{} has a duplicate unique value", def.name)));
                }
            } else {
                self.secondary_index.insert(map_key.clone(), id);
                inserted.push(map_key);
            }
        }
        Ok(())
    }

    fn key_tuple(&self, id: InstanceId, def: &EntityDef, key_idx: usize, override_attr: &str, override_val: &Value) -> Vec<Value> {
        let names = &def.secondary_keys[key_idx];
        let inst = self.instance(id);
        names
            .iter()
            .map(|n| {
                if *n == override_attr {
                    override_val.clone()
                } else {
                    inst.vals.get(n).and_then(|v| v.as_scalar().cloned()).unwrap_or(Value::Null)
                }
            })
            .collect()
    }

    fn reindex_for_write(
        &mut self,
        id: InstanceId,
        attr: &Attribute,
        def: &EntityDef,
        new_scalar: &Value,
        undo: &mut Vec<IndexUndo>,
    ) -> Result<()> {
        if attr.target != AttributeTarget::Scalar || attr.composite_keys.is_empty() {
            return Ok(());
        }
        let current_scalar = self
            .instance(id)
            .vals
            .get(attr.name)
            .and_then(|v| v.as_scalar().cloned())
            .unwrap_or(Value::Null);
        for &(key_idx, _pos) in &attr.composite_keys {
            let old_tuple = self.key_tuple(id, def, key_idx, attr.name, &current_scalar);
            let new_tuple = self.key_tuple(id, def, key_idx, attr.name, new_scalar);
            if old_tuple == new_tuple {
                continue;
            }
            let new_key = (def.root, key_idx, new_tuple.clone());
            if let Some(&existing) = self.secondary_index.get(&new_key) {
                if existing != id {
                    return Err(OrmError::CacheIndex(format!(
                        "value for {}.{} duplicates an existing unique key",
                        def.name, attr.name
                    )));
                }
            }
            let old_key = (def.root, key_idx, old_tuple.clone());
            let old_existed = self.secondary_index.get(&old_key) == Some(&id);
            self.secondary_index.remove(&old_key);
            self.secondary_index.insert(new_key, id);
            undo.push(IndexUndo { id, root: def.root, key_idx, old_tuple, old_existed, new_tuple });
        }
        Ok(())
    }

    fn undo_reindex(&mut self, undo: Vec<IndexUndo>) {
        for step in undo.into_iter().rev() {
            self.secondary_index.remove(&(step.root, step.key_idx, step.new_tuple));
            if step.old_existed {
                self.secondary_index.insert((step.root, step.key_idx, step.old_tuple), step.id);
            }
        }
    }

    fn bump_status_for_write(&mut self, id: InstanceId, attr: &Attribute) -> (Status, u64) {
        let (prev_status, prev_wbits) = {
            let inst = self.instance_mut(id);
            let prev_status = inst.status;
            let prev_wbits = inst.wbits;
            inst.wbits |= attr.bit;
            (prev_status, prev_wbits)
        };
        if prev_status != Status::Updated {
            if matches!(prev_status, Status::Loaded | Status::Saved) {
                self.to_be_checked.push(id);
            }
            self.instance_mut(id).status = Status::Updated;
            if prev_status != Status::Created {
                self.updated.push(id);
            }
        }
        (prev_status, prev_wbits)
    }

    fn revert_status(&mut self, id: InstanceId, prev_status: Status, prev_wbits: u64) {
        let inst = self.instance_mut(id);
        inst.status = prev_status;
        inst.wbits = prev_wbits;
        if matches!(prev_status, Status::Loaded | Status::Saved) && self.to_be_checked.last() == Some(&id) {
            self.to_be_checked.pop();
        }
        if prev_status != Status::Updated {
            self.updated.retain(|&x| x != id);
        }
    }

    /// The core write primitive (the original's `Attribute.__set__`/
    /// `db_set` pair collapsed into one path): flips dirty bits, maintains
    /// unique-key indexes, and on failure restores exactly the state this
    /// call observed before it started — it never attempts to unwind a
    /// chain of several attribute writes, only itself.
    pub fn write_attr(&mut self, id: InstanceId, attr_name: &'static str, new: AttrValue, is_reverse_call: bool) -> Result<()> {
        self.require_alive()?;
        self.check_owner(id)?;
        if !self.instance(id).status.is_alive() {
            return Err(OrmError::OperationWithDeletedObject(format!(
                "{}#{id}",
                self.instance(id).entity
            )));
        }
        let schema = Arc::clone(&self.schema);
        let entity = self.instance(id).entity;
        let def = schema.entity(entity).ok_or_else(|| OrmError::Mapping(format!("unknown entity {entity}")))?;
        let attr = def
            .attribute(attr_name)
            .cloned()
            .ok_or_else(|| OrmError::Mapping(format!("{entity} has no attribute {attr_name}")))?;

        if let Some(offset) = attr.pk_offset {
            let current = self.instance(id).pk.get(offset).cloned().unwrap_or(Value::Null);
            if !current.is_null() {
                let new_scalar = new.as_scalar().cloned().unwrap_or(Value::Null);
                if new_scalar == current {
                    return Ok(());
                }
                return Err(OrmError::Constraint(format!("cannot change primary key {entity}.{attr_name}")));
            }
        }

        let old = self.instance(id).vals.get(attr_name).cloned();
        let (prev_status, prev_wbits) = self.bump_status_for_write(id, &attr);

        if old.as_ref() == Some(&new) {
            return Ok(());
        }

        let mut index_undo = Vec::new();
        let new_scalar = new.as_scalar().cloned().unwrap_or(Value::Null);
        if let Err(e) = self.reindex_for_write(id, &attr, def, &new_scalar, &mut index_undo) {
            self.undo_reindex(index_undo);
            self.revert_status(id, prev_status, prev_wbits);
            return Err(e);
        }

        self.instance_mut(id).vals.insert(attr_name, new.clone());

        if !is_reverse_call {
            if let (AttributeTarget::Reference(_), Some(reverse_name)) = (attr.target, attr.reverse) {
                let old_ref = old.as_ref().and_then(|v| v.as_reference()).flatten();
                let new_ref = new.as_reference().flatten();
                if let Err(e) = self.update_reverse_for_reference(id, reverse_name, old_ref, new_ref) {
                    self.instance_mut(id).vals.insert(attr_name, old.clone().unwrap_or(AttrValue::Scalar(Value::Null)));
                    self.undo_reindex(index_undo);
                    self.revert_status(id, prev_status, prev_wbits);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn update_reverse_for_reference(
        &mut self,
        owner: InstanceId,
        reverse_name: &'static str,
        old_target: Option<InstanceId>,
        new_target: Option<InstanceId>,
    ) -> Result<()> {
        if old_target == new_target {
            return Ok(());
        }
        if let Some(old_id) = old_target {
            let reverse_attr = self.reverse_attribute(old_id, reverse_name)?;
            if reverse_attr.kind == AttributeKind::Set {
                self.collections.entry((old_id, reverse_name)).or_insert_with(SetData::new).remove(owner);
            } else {
                self.write_attr(old_id, reverse_name, AttrValue::Reference(None), true)?;
            }
        }
        if let Some(new_id) = new_target {
            let reverse_attr = self.reverse_attribute(new_id, reverse_name)?;
            if reverse_attr.kind == AttributeKind::Set {
                self.collections.entry((new_id, reverse_name)).or_insert_with(SetData::new).add(owner);
            } else {
                self.write_attr(new_id, reverse_name, AttrValue::Reference(Some(owner)), true)?;
            }
        }
        Ok(())
    }

    fn reverse_attribute(&self, id: InstanceId, attr_name: &str) -> Result<Attribute> {
        let entity = self.instance(id).entity;
        self.def(entity)?
            .attribute(attr_name)
            .cloned()
            .ok_or_else(|| OrmError::Mapping(format!("{entity} has no attribute {attr_name}")))
    }

    pub fn set_scalar(&mut self, id: InstanceId, attr_name: &'static str, value: Value) -> Result<()> {
        self.write_attr(id, attr_name, AttrValue::Scalar(value), false)
    }

    pub fn set_reference(&mut self, id: InstanceId, attr_name: &'static str, target: Option<InstanceId>) -> Result<()> {
        self.write_attr(id, attr_name, AttrValue::Reference(target), false)
    }

    pub fn get_attr(&mut self, id: InstanceId, attr_name: &str) -> Result<AttrValue> {
        self.require_alive()?;
        self.check_owner(id)?;
        let entity = self.instance(id).entity;
        let schema = Arc::clone(&self.schema);
        let attr = schema
            .entity(entity)
            .and_then(|d| d.attribute(attr_name))
            .cloned()
            .ok_or_else(|| OrmError::Mapping(format!("{entity} has no attribute {attr_name}")))?;
        if !self.instance(id).status.is_alive() {
            return Err(OrmError::OperationWithDeletedObject(format!("{entity}#{id}")));
        }
        self.instance_mut(id).mark_read(&attr);
        self.instance(id)
            .vals
            .get(attr_name)
            .cloned()
            .ok_or_else(|| OrmError::Mapping(format!("{entity}.{attr_name} is not loaded")))
    }

    pub fn collection(&self, owner: InstanceId, attr_name: &'static str) -> Option<&SetData> {
        self.collections.get(&(owner, attr_name))
    }

    pub fn collection_add(&mut self, owner: InstanceId, attr_name: &'static str, target: InstanceId) -> Result<()> {
        self.require_alive()?;
        self.check_owner(owner)?;
        self.check_owner(target)?;
        let added = self.collections.entry((owner, attr_name)).or_insert_with(SetData::new).add(target);
        if !added {
            return Ok(());
        }
        let reverse_name = self.reverse_attribute(owner, attr_name)?.reverse;
        if let Some(reverse_name) = reverse_name {
            // A `Set`-kind reverse means this is a true many-to-many pair:
            // mirror into the other side's own collection instead of
            // writing a to-one reference that doesn't exist there.
            if self.reverse_attribute(target, reverse_name)?.kind == AttributeKind::Set {
                self.collections.entry((target, reverse_name)).or_insert_with(SetData::new).add(owner);
            } else {
                self.write_attr(target, reverse_name, AttrValue::Reference(Some(owner)), true)?;
            }
        }
        Ok(())
    }

    pub fn collection_remove(&mut self, owner: InstanceId, attr_name: &'static str, target: InstanceId) -> Result<()> {
        self.require_alive()?;
        self.check_owner(owner)?;
        self.check_owner(target)?;
        let removed = self.collections.entry((owner, attr_name)).or_insert_with(SetData::new).remove(target);
        if !removed {
            return Ok(());
        }
        let reverse_name = self.reverse_attribute(owner, attr_name)?.reverse;
        if let Some(reverse_name) = reverse_name {
            if self.reverse_attribute(target, reverse_name)?.kind == AttributeKind::Set {
                self.collections.entry((target, reverse_name)).or_insert_with(SetData::new).remove(owner);
            } else {
                self.write_attr(target, reverse_name, AttrValue::Reference(None), true)?;
            }
        }
        Ok(())
    }

    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        self.require_alive()?;
        self.check_owner(id)?;
        let inst = self.instance(id);
        if !inst.status.is_alive() {
            return Ok(());
        }
        let entity = inst.entity;
        let def = self.def(entity)?.clone_shallow();
        let was_created = inst.status == Status::Created;

        for attr in def.attributes.clone() {
            let Some(reverse_name) = attr.reverse else { continue };
            match attr.target {
                AttributeTarget::Reference(_) => {
                    if let Some(AttrValue::Reference(Some(target))) = self.instance(id).vals.get(attr.name).cloned() {
                        let _ = self.update_reverse_for_reference(id, reverse_name, Some(target), None);
                    }
                }
                AttributeTarget::Collection(_) => {
                    if let Some(members) = self.collections.remove(&(id, attr.name)) {
                        for member in members.iter() {
                            let reverse_is_set = self.reverse_attribute(member, reverse_name).map(|a| a.kind == AttributeKind::Set).unwrap_or(false);
                            if reverse_is_set {
                                if let Some(set) = self.collections.get_mut(&(member, reverse_name)) {
                                    set.remove(id);
                                }
                            } else {
                                let _ = self.write_attr(member, reverse_name, AttrValue::Reference(None), true);
                            }
                        }
                    }
                }
                AttributeTarget::Scalar => {}
            }
        }

        {
            let inst = self.instance_mut(id);
            inst.status = if was_created { Status::Cancelled } else { Status::Deleted };
        }
        self.updated.retain(|&x| x != id);
        self.created.retain(|&x| x != id);
        if !was_created {
            self.deleted.push(id);
        }
        if !self.instance(id).pk.iter().any(Value::is_null) {
            let pk = self.instance(id).pk.clone();
            self.pk_index.remove(&(def.root, pk));
        }
        Ok(())
    }

    /// Orders pending inserts so that every row a `Required` to-one
    /// attribute of another pending insert points at is inserted first
    /// (spec §8, "insert ordering"). A reference through an `Optional`
    /// attribute does not force ordering: it is inserted `NULL` and patched
    /// with an `UPDATE` once its target has a primary key (see
    /// `flush_insert`), which is how a mutual one-to-one link (spec
    /// scenario 1) avoids being treated as a cycle. A cycle of `Required`
    /// references among not-yet-inserted rows has no valid order and is
    /// reported as `UnresolvableCyclicDependency`.
    fn order_inserts(&self) -> Result<Vec<InstanceId>> {
        let pending: HashSet<InstanceId> = self.created.iter().copied().collect();
        let mut order = Vec::with_capacity(pending.len());
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();

        fn visit<P: Provider>(
            session: &Session<P>,
            id: InstanceId,
            pending: &HashSet<InstanceId>,
            visiting: &mut HashSet<InstanceId>,
            done: &mut HashSet<InstanceId>,
            order: &mut Vec<InstanceId>,
        ) -> Result<()> {
            if done.contains(&id) {
                return Ok(());
            }
            if !visiting.insert(id) {
                return Err(OrmError::UnresolvableCyclicDependency(format!(
                    "{}#{id}",
                    session.instance(id).entity
                )));
            }
            let entity = session.instance(id).entity;
            if let Some(def) = session.schema.entity(entity) {
                for attr in &def.attributes {
                    if !attr.kind.is_required() || !matches!(attr.target, AttributeTarget::Reference(_)) {
                        continue;
                    }
                    if let Some(AttrValue::Reference(Some(dep))) = session.instance(id).vals.get(attr.name) {
                        if pending.contains(dep) {
                            visit(session, *dep, pending, visiting, done, order)?;
                        }
                    }
                }
            }
            visiting.remove(&id);
            done.insert(id);
            order.push(id);
            Ok(())
        }

        for &id in &self.created {
            visit(self, id, &pending, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    /// Runs every pending `INSERT`/`UPDATE`/`DELETE` against the provider.
    /// Does not commit the underlying transaction; `commit` calls this
    /// first, but `flush` alone is also valid mid-transaction.
    pub async fn flush(&mut self) -> Result<()> {
        self.require_alive()?;
        let order = self.order_inserts()?;

        for id in order {
            self.flush_insert(id).await?;
        }
        self.flush_deferred_fk_patches().await?;
        let updated: Vec<InstanceId> = self.updated.drain(..).collect();
        for id in updated {
            self.flush_update(id).await?;
        }
        let to_check: Vec<InstanceId> = self.to_be_checked.drain(..).collect();
        for id in to_check {
            if self.instance(id).status == Status::Locked {
                self.flush_update(id).await?;
            }
        }
        self.flush_collections().await?;
        let deleted: Vec<InstanceId> = self.deleted.drain(..).collect();
        for id in deleted {
            self.flush_delete(id).await?;
        }
        Ok(())
    }

    /// Flushes `Set`↔`Set` link-table deltas (spec §8, m2m scenario): one
    /// `INSERT` per newly added member, one `DELETE` per removed one, only
    /// for the canonical side of the pair (the side whose `Attribute.link`
    /// is `Some`) so a symmetric pair is not flushed twice.
    async fn flush_collections(&mut self) -> Result<()> {
        let keys: Vec<(InstanceId, &'static str)> = self.collections.keys().copied().collect();
        for (owner, attr_name) in keys {
            let entity = self.instance(owner).entity;
            let Some(link) = self.def(entity)?.attribute(attr_name).and_then(|a| a.link) else {
                continue;
            };
            let owner_pk = self.instance(owner).pk.first().cloned().unwrap_or(Value::Null);
            let added: Vec<InstanceId> = self.collections[&(owner, attr_name)].added().collect();
            let removed: Vec<InstanceId> = self.collections[&(owner, attr_name)].removed().collect();
            for member in added {
                let member_pk = self.instance(member).pk.first().cloned().unwrap_or(Value::Null);
                let stmt = SqlStatement::Insert {
                    table: link.table,
                    columns: vec![link.own_column, link.other_column],
                    values: vec![SqlExpr::Value(owner_pk.clone()), SqlExpr::Value(member_pk.clone())],
                };
                self.provider
                    .execute(&mut self.conn, &stmt, &[owner_pk.clone(), member_pk])
                    .await
                    .map_err(|e| OrmError::TransactionIntegrity(format!("insert into {} failed", link.table), Some(e)))?;
            }
            for member in removed {
                let member_pk = self.instance(member).pk.first().cloned().unwrap_or(Value::Null);
                let where_ = Some(SqlExpr::and(vec![
                    SqlExpr::Eq(Box::new(SqlExpr::col(link.table, link.own_column)), Box::new(SqlExpr::Value(owner_pk.clone()))),
                    SqlExpr::Eq(Box::new(SqlExpr::col(link.table, link.other_column)), Box::new(SqlExpr::Value(member_pk.clone()))),
                ]));
                let stmt = SqlStatement::Delete { table: link.table, where_ };
                self.provider
                    .execute(&mut self.conn, &stmt, &[])
                    .await
                    .map_err(|e| OrmError::TransactionIntegrity(format!("delete from {} failed", link.table), Some(e)))?;
            }
            self.collections.get_mut(&(owner, attr_name)).unwrap().reset_deltas();
        }
        Ok(())
    }

    async fn flush_insert(&mut self, id: InstanceId) -> Result<()> {
        let entity = self.instance(id).entity;
        let schema = Arc::clone(&self.schema);
        let def = schema.entity(entity).expect("entity must be registered").clone_shallow();
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for attr in &def.attributes {
            match attr.target {
                AttributeTarget::Scalar => {
                    if let Some(AttrValue::Scalar(v)) = self.instance(id).vals.get(attr.name) {
                        if !(attr.pk_offset.is_some() && v.is_null()) {
                            columns.push(attr.column);
                            values.push(SqlExpr::Value(v.clone()));
                        }
                    }
                }
                AttributeTarget::Reference(_) => {
                    let target = match self.instance(id).vals.get(attr.name) {
                        Some(AttrValue::Reference(Some(t))) => Some(*t),
                        _ => None,
                    };
                    if let Some(target) = target {
                        if self.instance(target).pk.first().is_some_and(Value::is_null) {
                            // Target not inserted yet: only possible for an
                            // optional attribute, `order_inserts` guarantees
                            // required targets already have a pk here.
                            self.deferred_fk_patches.push((id, attr.column, target));
                        } else {
                            let fk = self.instance(target).pk.clone();
                            columns.push(attr.column);
                            values.push(SqlExpr::Value(fk.into_iter().next().unwrap_or(Value::Null)));
                        }
                    }
                }
                AttributeTarget::Collection(_) => {}
            }
        }
        let stmt = SqlStatement::Insert { table: def.table, columns, values: values.clone() };
        let params: Vec<Value> = values
            .into_iter()
            .map(|e| match e {
                SqlExpr::Value(v) => v,
                _ => Value::Null,
            })
            .collect();

        let auto_pk = def.primary_key.len() == 1 && self.instance(id).pk.first().is_some_and(Value::is_null);
        let result = if auto_pk {
            self.provider.execute_returning_id(&mut self.conn, &stmt, &params).await
        } else {
            self.provider.execute(&mut self.conn, &stmt, &params).await.map(|_| Value::Null)
        };

        match result {
            Ok(generated) => {
                if auto_pk {
                    let root = def.root;
                    self.instance_mut(id).pk = vec![generated.clone()];
                    self.pk_index.insert((root, vec![generated]), id);
                }
                let inst = self.instance_mut(id);
                inst.dbvals = inst.vals.clone();
                inst.rbits = inst.wbits; // spec §3: saved rows carry write bits forward as read bits
                inst.wbits = 0;
                inst.status = Status::Saved;
                Ok(())
            }
            Err(e) => Err(OrmError::TransactionIntegrity(format!("insert into {} failed", def.table), Some(e))),
        }
    }

    /// Patches every `NULL` an insert left behind for an optional reference
    /// whose target had no primary key yet (see `order_inserts`). By now
    /// every pending insert has run, so every target has one.
    async fn flush_deferred_fk_patches(&mut self) -> Result<()> {
        let patches: Vec<(InstanceId, &'static str, InstanceId)> = self.deferred_fk_patches.drain(..).collect();
        for (id, column, target) in patches {
            let entity = self.instance(id).entity;
            let schema = Arc::clone(&self.schema);
            let def = schema.entity(entity).expect("entity must be registered").clone_shallow();
            let fk = self.instance(target).pk.first().cloned().unwrap_or(Value::Null);
            let where_ = Some(self.pk_predicate(id, &def));
            let stmt = SqlStatement::Update {
                table: def.table,
                assignments: vec![(column, SqlExpr::Value(fk.clone()))],
                where_,
            };
            self.provider
                .execute(&mut self.conn, &stmt, &[fk])
                .await
                .map_err(|e| OrmError::TransactionIntegrity(format!("deferred fk patch on {} failed", def.table), Some(e)))?;
        }
        Ok(())
    }

    async fn flush_update(&mut self, id: InstanceId) -> Result<()> {
        let entity = self.instance(id).entity;
        let schema = Arc::clone(&self.schema);
        let def = schema.entity(entity).expect("entity must be registered").clone_shallow();
        let inst = self.instance(id);
        let wbits = inst.wbits;
        let rbits = inst.rbits;
        let locked = inst.status == Status::Locked;
        if !locked && wbits == 0 && rbits == 0 {
            return Ok(());
        }

        let mut assignments = Vec::new();
        for attr in def.attributes.iter().filter(|a| wbits & a.bit != 0) {
            let value = match (attr.target, self.instance(id).vals.get(attr.name)) {
                (AttributeTarget::Scalar, Some(AttrValue::Scalar(v))) => v.clone(),
                (AttributeTarget::Reference(_), Some(AttrValue::Reference(Some(target)))) => {
                    self.instance(*target).pk.first().cloned().unwrap_or(Value::Null)
                }
                (AttributeTarget::Reference(_), Some(AttrValue::Reference(None))) => Value::Null,
                _ => continue,
            };
            assignments.push((attr.column, SqlExpr::Value(value)));
        }

        let mut checks = Vec::new();
        let pk_expr = self.pk_predicate(id, &def);
        checks.push(pk_expr);
        for attr in def.attributes.iter().filter(|a| rbits & a.bit != 0) {
            if let Some(AttrValue::Scalar(v)) = self.instance(id).dbvals.get(attr.name) {
                checks.push(SqlExpr::Eq(Box::new(SqlExpr::col(def.table, attr.column)), Box::new(SqlExpr::Value(v.clone()))));
            }
        }
        let where_ = Some(SqlExpr::and(checks));

        if assignments.is_empty() {
            let stmt = SqlStatement::Select {
                distinct: false,
                columns: vec![SqlExpr::col(def.table, "1")],
                from: def.table,
                alias: None,
                joins: Vec::new(),
                where_,
                order_by: Vec::new(),
                limit: Some(1),
                offset: None,
            };
            let rows = self
                .provider
                .fetch(&mut self.conn, &stmt, &[])
                .await
                .map_err(|e| OrmError::TransactionIntegrity(format!("lock check on {} failed", def.table), Some(e)))?;
            if rows.is_empty() {
                return Err(OrmError::UnrepeatableRead(format!("{}#{id} changed since it was read", def.name)));
            }
        } else {
            let params: Vec<Value> = assignments.iter().map(|(_, e)| value_of(e)).collect();
            let stmt = SqlStatement::Update { table: def.table, assignments, where_ };
            let affected = self
                .provider
                .execute(&mut self.conn, &stmt, &params)
                .await
                .map_err(|e| OrmError::TransactionIntegrity(format!("update of {} failed", def.table), Some(e)))?;
            if affected.rows_affected == Some(0) {
                return Err(OrmError::UnrepeatableRead(format!("{}#{id} changed since it was read", def.name)));
            }
        }

        let inst = self.instance_mut(id);
        inst.dbvals = inst.vals.clone();
        inst.rbits |= inst.wbits;
        inst.wbits = 0;
        inst.status = Status::Saved;
        Ok(())
    }

    async fn flush_delete(&mut self, id: InstanceId) -> Result<()> {
        let entity = self.instance(id).entity;
        let schema = Arc::clone(&self.schema);
        let def = schema.entity(entity).expect("entity must be registered").clone_shallow();
        let where_ = Some(self.pk_predicate(id, &def));
        let stmt = SqlStatement::Delete { table: def.table, where_ };
        self.provider
            .execute(&mut self.conn, &stmt, &[])
            .await
            .map_err(|e| OrmError::TransactionIntegrity(format!("delete from {} failed", def.table), Some(e)))?;
        Ok(())
    }

    fn pk_predicate(&self, id: InstanceId, def: &EntityDef) -> SqlExpr {
        let inst = self.instance(id);
        let terms: Vec<SqlExpr> = def
            .pk_attributes()
            .zip(inst.pk.iter())
            .map(|(attr, v)| SqlExpr::Eq(Box::new(SqlExpr::col(def.table, attr.column)), Box::new(SqlExpr::Value(v.clone()))))
            .collect();
        SqlExpr::and(terms)
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.flush().await?;
        self.provider
            .commit(&mut self.conn)
            .await
            .map_err(|e| OrmError::TransactionIntegrity("commit failed".into(), Some(e)))?;
        self.alive = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let result = self
            .provider
            .rollback(&mut self.conn)
            .await
            .map_err(|e| OrmError::TransactionIntegrity("rollback failed".into(), Some(e)));
        self.alive = false;
        result
    }

    pub async fn release(mut self) -> Result<()> {
        if self.alive {
            self.rollback().await?;
        }
        self.provider
            .release(self.conn)
            .await
            .map_err(OrmError::context("release failed"))
    }

    pub fn check_on_commit(&mut self, id: InstanceId) -> Result<()> {
        self.check_owner(id)?;
        let inst = self.instance_mut(id);
        if inst.status == Status::Saved {
            inst.status = Status::Locked;
            self.to_be_checked.push(id);
        } else if inst.status == Status::Loaded {
            inst.status = Status::Locked;
            self.to_be_checked.push(id);
        }
        Ok(())
    }
}

impl<P: Provider> crate::transaction::ManagedSession for Session<P> {
    fn flush(&mut self) -> futures::future::BoxFuture<'_, Result<()>> {
        Box::pin(Session::flush(self))
    }

    fn commit(&mut self) -> futures::future::BoxFuture<'_, Result<()>> {
        Box::pin(Session::commit(self))
    }

    fn rollback(&mut self) -> futures::future::BoxFuture<'_, Result<()>> {
        Box::pin(Session::rollback(self))
    }
}

fn value_of(expr: &SqlExpr) -> Value {
    match expr {
        SqlExpr::Value(v) => v.clone(),
        _ => Value::Null,
    }
}

impl EntityDef {
    /// A cheap clone used to escape a borrow of `Registry` before mutating
    /// `Session` fields; entity definitions are immutable after
    /// `generate_mapping`, so this never observes a half-built schema.
    pub(crate) fn clone_shallow(&self) -> EntityDef {
        EntityDef {
            name: self.name,
            table: self.table,
            root: self.root,
            direct_bases: self.direct_bases.clone(),
            attributes: self.attributes.clone(),
            primary_key: self.primary_key.clone(),
            secondary_keys: self.secondary_keys.clone(),
            discriminator_column: self.discriminator_column,
            discriminator_value: self.discriminator_value,
            all_bits: self.all_bits,
        }
    }
}
