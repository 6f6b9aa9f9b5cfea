use crate::schema::attribute::{Attribute, AttributeKind, AttributeTarget, LinkTable};
use crate::schema::entity::{Entity, EntityDecl, EntityDef};
use crate::{OrmError, Result, Value};
use std::collections::HashMap;

/// Column name the registry auto-creates on an entity's root the first
/// time a second entity joins its inheritance chain with no explicit
/// `#[discriminator]` attribute declared anywhere in it yet (mirrors the
/// original's `Discriminator.create_default_attr`).
const AUTO_DISCRIMINATOR_COLUMN: &str = "classtype";

/// A reverse attribute waiting on an entity that is not registered yet.
struct PendingReverse {
    owner: &'static str,
    attr: &'static str,
    explicit: Option<&'static str>,
}

/// Builds the linked schema from the declarations `#[derive(Entity)]`
/// produces, the equivalent of the original's `generate_mapping`:
/// entities may be registered in any order, reverse attributes are resolved
/// (or queued until their target entity shows up), and bits/keys are
/// assigned once, the first and only time each entity is registered.
#[derive(Default)]
pub struct Registry {
    entities: HashMap<&'static str, EntityDef>,
    pending_reverse: HashMap<&'static str, Vec<PendingReverse>>,
    generated: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    /// Every entity sharing `root`'s table and discriminator column,
    /// `root` included. Used to decide whether a query against `root` is
    /// polymorphic (more than one member) and, if so, which columns the
    /// `SELECT` needs to cover every member's own attributes.
    pub fn family(&self, root: &'static str) -> Vec<&EntityDef> {
        self.entities.values().filter(|e| e.root == root).collect()
    }

    /// The concrete entity whose `discriminator_value` is `value` within
    /// `root`'s family (the original's `Discriminator.value2entity`),
    /// used to pick which subclass a freshly fetched row materializes as.
    pub fn entity_by_discriminator(&self, root: &'static str, value: &str) -> Option<&EntityDef> {
        self.entities
            .values()
            .find(|e| e.root == root && e.discriminator_value == Some(value))
    }

    pub fn register<E: Entity>(&mut self) -> Result<()> {
        self.register_decl(E::decl())
    }

    fn register_decl(&mut self, decl: &'static EntityDecl) -> Result<()> {
        if self.generated {
            return Err(OrmError::Mapping(
                "cannot register an entity after generate_mapping has run".into(),
            ));
        }
        if self.entities.contains_key(decl.name) {
            return Err(OrmError::ErDiagram(format!(
                "entity {} registered twice",
                decl.name
            )));
        }

        if let [base] = decl.direct_bases {
            if let Some(base_def) = self.entities.get(base) {
                let root = base_def.root;
                let root_has_discriminator = self
                    .entities
                    .get(root)
                    .map(|r| r.discriminator_column.is_some())
                    .unwrap_or(false);
                if !root_has_discriminator {
                    self.auto_create_discriminator(root)?;
                }
            }
        }

        let base_def = match decl.direct_bases {
            [] => None,
            [base] => Some(self.entities.get(base).ok_or_else(|| {
                OrmError::ErDiagram(format!(
                    "entity {} bases on {}, which must be registered first",
                    decl.name, base
                ))
            })?),
            _ => {
                return Err(OrmError::ErDiagram(format!(
                    "entity {} declares {} direct bases; multiple inheritance is not supported",
                    decl.name,
                    decl.direct_bases.len()
                )));
            }
        };

        if let Some(base) = base_def {
            if base.table != decl.table {
                return Err(OrmError::Mapping(format!(
                    "entity {} must share table {} with its base {}, found {}",
                    decl.name, base.table, base.name, decl.table
                )));
            }
        }

        let root = base_def.map(|b| b.root).unwrap_or(decl.name);
        let mut attributes: Vec<Attribute> = base_def.map(|b| b.attributes.clone()).unwrap_or_default();
        let mut next_bit = attributes.len() as u64;
        let mut pk_from_base = base_def.map(|b| b.primary_key.clone()).unwrap_or_default();
        let mut secondary_keys: Vec<Vec<&'static str>> =
            base_def.map(|b| b.secondary_keys.clone()).unwrap_or_default();
        let mut discriminator_column = base_def.and_then(|b| b.discriminator_column);

        let mut own_pk = Vec::new();
        let mut own_unique_groups: Vec<(&'static str, Vec<&'static str>)> = Vec::new();
        let mut pending_links = Vec::new();

        for decl_attr in decl.attributes {
            if attributes.iter().any(|a| a.name == decl_attr.name) {
                return Err(OrmError::ErDiagram(format!(
                    "entity {} redeclares attribute {}",
                    decl.name, decl_attr.name
                )));
            }
            if decl_attr.kind == AttributeKind::PrimaryKey && base_def.is_some() {
                return Err(OrmError::ErDiagram(format!(
                    "entity {} cannot declare a new primary key attribute {}, it inherits one from {}",
                    decl.name, decl_attr.name, root
                )));
            }
            if decl_attr.kind == AttributeKind::Discriminator && decl_attr.target != AttributeTarget::Scalar {
                return Err(OrmError::ErDiagram(format!(
                    "discriminator attribute {} on {} must be scalar",
                    decl_attr.name, decl.name
                )));
            }

            let bit = next_bit;
            next_bit += 1;
            if next_bit > 64 {
                return Err(OrmError::Mapping(format!(
                    "entity {} has more than 64 attributes in its inheritance chain",
                    root
                )));
            }

            attributes.push(Attribute {
                name: decl_attr.name,
                declaring_entity: decl.name,
                kind: decl_attr.kind,
                target: decl_attr.target,
                column: decl_attr.column.unwrap_or(decl_attr.name),
                empty_value: decl_attr.empty_value,
                bit,
                pk_offset: None,
                composite_keys: Vec::new(),
                reverse: None,
                link: None,
            });

            match decl_attr.kind {
                AttributeKind::PrimaryKey => own_pk.push(decl_attr.name),
                AttributeKind::Unique => {
                    let group_key = decl_attr.unique_group.unwrap_or(decl_attr.name);
                    match own_unique_groups.iter_mut().find(|(k, _)| *k == group_key) {
                        Some((_, names)) => names.push(decl_attr.name),
                        None => own_unique_groups.push((group_key, vec![decl_attr.name])),
                    }
                }
                AttributeKind::Discriminator => {
                    discriminator_column = Some(decl_attr.column.unwrap_or(decl_attr.name));
                }
                _ => {}
            }

            if decl_attr.target.is_relational() {
                pending_links.push((decl_attr.name, decl_attr.reverse));
            }
        }

        if base_def.is_none() {
            pk_from_base = own_pk;
        } else if !own_pk.is_empty() {
            unreachable!("primary key redeclaration is rejected above");
        }

        for (offset, name) in pk_from_base.iter().enumerate() {
            let a = attributes
                .iter_mut()
                .find(|a| a.name == *name)
                .expect("pk attribute must exist");
            a.pk_offset = Some(offset);
        }

        let base_secondary_count = secondary_keys.len();
        for (group_key, names) in &own_unique_groups {
            secondary_keys.push(names.clone());
            let _ = group_key;
        }
        for (idx, names) in secondary_keys.iter().enumerate().skip(base_secondary_count) {
            for (pos, name) in names.iter().enumerate() {
                let a = attributes
                    .iter_mut()
                    .find(|a| a.name == *name)
                    .expect("unique attribute must exist");
                a.composite_keys.push((idx, pos));
            }
        }

        let all_bits = if next_bit == 64 { u64::MAX } else { (1u64 << next_bit) - 1 };

        // Mirrors the original's `process_entity_inheritance`: any entity
        // that ends up with a discriminator column defaults its own
        // discriminator value to its class name if it didn't set one.
        let discriminator_value = if discriminator_column.is_some() {
            Some(decl.discriminator_value.unwrap_or(decl.name))
        } else {
            decl.discriminator_value
        };

        let entity_def = EntityDef {
            name: decl.name,
            table: decl.table,
            root,
            direct_bases: decl.direct_bases.to_vec(),
            attributes,
            primary_key: pk_from_base,
            secondary_keys,
            discriminator_column,
            discriminator_value,
            all_bits,
        };
        self.entities.insert(decl.name, entity_def);

        if let Some(waiters) = self.pending_reverse.remove(decl.name) {
            for w in waiters {
                self.link_or_queue(w.owner, w.attr, w.explicit)?;
            }
        }
        for (attr, explicit) in pending_links {
            self.link_or_queue(decl.name, attr, explicit)?;
        }

        Ok(())
    }

    /// Retroactively gives `root` a `classtype` discriminator column the
    /// first time a second entity joins its inheritance chain. Runs before
    /// the joining entity copies `root`'s (by-then-updated) attribute list,
    /// so every entity sharing this root from now on inherits the column
    /// for free through the ordinary base-attribute-copy path; `root`
    /// itself is patched in place since it is already registered.
    fn auto_create_discriminator(&mut self, root: &'static str) -> Result<()> {
        let root_def = self.entities.get_mut(root).expect("root must be registered");
        if root_def.attribute(AUTO_DISCRIMINATOR_COLUMN).is_some() {
            return Err(OrmError::ErDiagram(format!(
                "cannot auto-create a discriminator column for {root}: '{AUTO_DISCRIMINATOR_COLUMN}' is already in use"
            )));
        }
        let bit = root_def.attributes.len() as u64;
        if bit >= 64 {
            return Err(OrmError::Mapping(format!(
                "entity {root} has more than 64 attributes in its inheritance chain"
            )));
        }
        root_def.attributes.push(Attribute {
            name: AUTO_DISCRIMINATOR_COLUMN,
            declaring_entity: root,
            kind: AttributeKind::Discriminator,
            target: AttributeTarget::Scalar,
            column: AUTO_DISCRIMINATOR_COLUMN,
            empty_value: Value::default,
            bit,
            pk_offset: None,
            composite_keys: Vec::new(),
            reverse: None,
            link: None,
        });
        root_def.discriminator_column = Some(AUTO_DISCRIMINATOR_COLUMN);
        root_def.all_bits |= 1u64 << bit;
        if root_def.discriminator_value.is_none() {
            root_def.discriminator_value = Some(root_def.name);
        }
        Ok(())
    }

    fn link_or_queue(&mut self, owner: &'static str, attr: &'static str, explicit: Option<&'static str>) -> Result<()> {
        if self.link_pair(owner, attr, explicit)? {
            return Ok(());
        }
        let target = match self.entities[owner].attribute(attr).expect("attribute must exist").target {
            AttributeTarget::Reference(t) | AttributeTarget::Collection(t) => t,
            AttributeTarget::Scalar => unreachable!("only relational attributes are queued"),
        };
        self.pending_reverse
            .entry(target)
            .or_default()
            .push(PendingReverse { owner, attr, explicit });
        Ok(())
    }

    /// Attempts to resolve `owner.attr`'s reverse side. Returns `Ok(false)`
    /// when the target entity is not registered yet (caller should queue it),
    /// `Ok(true)` once linked (or already linked).
    fn link_pair(&mut self, owner: &'static str, attr: &'static str, explicit: Option<&'static str>) -> Result<bool> {
        let target = {
            let owner_def = self.entities.get(owner).expect("owner must be registered");
            let a = owner_def.attribute(attr).expect("attribute must exist");
            if a.reverse.is_some() {
                return Ok(true);
            }
            match a.target {
                AttributeTarget::Reference(t) | AttributeTarget::Collection(t) => t,
                AttributeTarget::Scalar => return Ok(true),
            }
        };
        if !self.entities.contains_key(target) {
            return Ok(false);
        }

        if target == owner {
            let def = self.entities.get_mut(owner).unwrap();
            let reverse_name = Self::find_reverse(def, attr, owner, explicit)?;
            def.attribute_mut(attr).unwrap().reverse = Some(reverse_name);
            def.attribute_mut(reverse_name).unwrap().reverse = Some(attr);
            self.maybe_assign_link_table(owner, attr, target, reverse_name);
            return Ok(true);
        }

        let mut target_def = self.entities.remove(target).unwrap();
        let reverse_name = match Self::find_reverse(&target_def, attr, owner, explicit) {
            Ok(n) => n,
            Err(e) => {
                self.entities.insert(target, target_def);
                return Err(e);
            }
        };
        target_def.attribute_mut(reverse_name).unwrap().reverse = Some(attr);
        self.entities.insert(target, target_def);
        self.entities
            .get_mut(owner)
            .unwrap()
            .attribute_mut(attr)
            .unwrap()
            .reverse = Some(reverse_name);
        self.maybe_assign_link_table(owner, attr, target, reverse_name);
        Ok(true)
    }

    /// When both sides of a just-linked pair are `Set` attributes (a true
    /// many-to-many relationship, not a to-many/to-one pair), assigns
    /// link-table metadata to exactly one side — the lexicographically
    /// smaller of `(owner, attr)`/`(target, reverse_name)` — so
    /// `Session::flush` emits each added/removed link row once, not once
    /// per side.
    fn maybe_assign_link_table(&mut self, owner: &'static str, attr: &'static str, target: &'static str, reverse_name: &'static str) {
        let owner_is_set = matches!(self.entities[owner].attribute(attr).unwrap().target, AttributeTarget::Collection(_));
        let target_is_set = matches!(self.entities[target].attribute(reverse_name).unwrap().target, AttributeTarget::Collection(_));
        if !owner_is_set || !target_is_set {
            return;
        }
        let (canon_entity, canon_attr, other_entity, other_attr) = if (owner, attr) <= (target, reverse_name) {
            (owner, attr, target, reverse_name)
        } else {
            (target, reverse_name, owner, attr)
        };
        let link = Self::build_link_table(canon_entity, other_entity, canon_attr, other_attr);
        self.entities.get_mut(canon_entity).unwrap().attribute_mut(canon_attr).unwrap().link = Some(link);
    }

    /// Names the join table and its two columns for an m2m pair the same
    /// way the original's `Relation._get_link_table_` does: entity names
    /// sorted and joined for a regular pair, or the two attribute names
    /// joined under the shared entity for a self-referential one (since
    /// the entity name alone can't distinguish the two columns there).
    fn build_link_table(owner: &'static str, target: &'static str, owner_attr: &'static str, other_attr: &'static str) -> LinkTable {
        let own_column = format!("{}_id", owner_attr.to_ascii_lowercase());
        let other_column = format!("{}_id", other_attr.to_ascii_lowercase());
        let table = if owner == target {
            let (first, second) = if owner_attr <= other_attr { (owner_attr, other_attr) } else { (other_attr, owner_attr) };
            format!("{}_{}_{}", owner.to_ascii_lowercase(), first.to_ascii_lowercase(), second.to_ascii_lowercase())
        } else {
            let mut names = [owner.to_ascii_lowercase(), target.to_ascii_lowercase()];
            names.sort();
            format!("{}_{}", names[0], names[1])
        };
        LinkTable {
            table: Box::leak(table.into_boxed_str()),
            own_column: Box::leak(own_column.into_boxed_str()),
            other_column: Box::leak(other_column.into_boxed_str()),
        }
    }

    /// The original's `_link_reverse_attrs_`: an explicit reverse name is
    /// validated and used as-is; otherwise the unique unlinked relational
    /// attribute on `target_def` pointing back at `owner` is found, erroring
    /// if there is none or more than one.
    fn find_reverse(
        target_def: &EntityDef,
        attr: &'static str,
        owner: &'static str,
        explicit: Option<&'static str>,
    ) -> Result<&'static str> {
        if let Some(name) = explicit {
            let a = target_def.attribute(name).ok_or_else(|| {
                OrmError::ErDiagram(format!(
                    "reverse attribute {} not found on {}",
                    name, target_def.name
                ))
            })?;
            let points_back = matches!(
                a.target,
                AttributeTarget::Reference(t) | AttributeTarget::Collection(t) if t == owner
            );
            if !points_back {
                return Err(OrmError::ErDiagram(format!(
                    "{}.{} does not point back to {}",
                    target_def.name, name, owner
                )));
            }
            if let Some(existing) = a.reverse {
                if existing != attr {
                    return Err(OrmError::ErDiagram(format!(
                        "{}.{} is already linked to {}.{}",
                        target_def.name, name, target_def.name, existing
                    )));
                }
            }
            return Ok(name);
        }

        let candidates: Vec<&'static str> = target_def
            .attributes
            .iter()
            .filter(|a| a.reverse.is_none())
            .filter(|a| {
                matches!(
                    a.target,
                    AttributeTarget::Reference(t) | AttributeTarget::Collection(t) if t == owner
                )
            })
            .map(|a| a.name)
            .collect();

        match candidates.len() {
            0 => Err(OrmError::ErDiagram(format!(
                "no reverse attribute found on {} for {}.{}",
                target_def.name, owner, attr
            ))),
            1 => Ok(candidates[0]),
            _ => Err(OrmError::ErDiagram(format!(
                "ambiguous reverse attribute for {}.{}: {} candidates on {}, specify one explicitly",
                owner,
                attr,
                candidates.len(),
                target_def.name
            ))),
        }
    }

    /// Finalizes the mapping: errors if any reverse attribute still targets
    /// an entity that was never registered. After this call `register`
    /// refuses further entities.
    pub fn generate_mapping(&mut self) -> Result<()> {
        if let Some((missing, _)) = self.pending_reverse.iter().next() {
            return Err(OrmError::ErDiagram(format!(
                "entity {} is referenced but was never registered",
                missing
            )));
        }
        self.generated = true;
        Ok(())
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }
}
