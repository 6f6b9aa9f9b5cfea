//! Parses the `#[entity(...)]`/`#[relation(...)]`/field attributes
//! `#[derive(Entity)]` reads off a struct, the macro crate's side of the
//! two-phase split `corm_core::schema` documents: this phase only produces
//! literal tokens, the registry does all the linking.

use syn::{Attribute, Expr, Lit, Meta, Result};

/// `#[entity(table = "users", base = "Person", discriminator_value = "user")]`
#[derive(Default)]
pub struct EntityArgs {
    pub table: Option<String>,
    pub base: Option<String>,
    pub discriminator_value: Option<String>,
}

/// One `#[relation(...)]` struct attribute: a relational attribute with no
/// backing field, since a to-one/to-many link is session state, not data
/// the typed struct carries.
pub struct RelationArgs {
    pub attr: String,
    pub kind: RelationKind,
    pub target: String,
    pub required: bool,
    pub reverse: Option<String>,
    pub column: Option<String>,
}

#[derive(PartialEq, Eq)]
pub enum RelationKind {
    Reference,
    Collection,
}

#[derive(Default)]
pub struct FieldArgs {
    pub pk: bool,
    pub required: bool,
    pub optional: bool,
    pub unique: bool,
    pub unique_group: Option<String>,
    pub discriminator: bool,
    pub column: Option<String>,
}

fn name_value_str(meta: &syn::meta::ParseNestedMeta) -> Result<String> {
    let value = meta.value()?;
    let expr: Expr = value.parse()?;
    if let Expr::Lit(lit) = &expr {
        if let Lit::Str(s) = &lit.lit {
            return Ok(s.value());
        }
    }
    Err(meta.error("expected a string literal"))
}

pub fn parse_entity_args(attrs: &[Attribute]) -> Result<EntityArgs> {
    let mut args = EntityArgs::default();
    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                args.table = Some(name_value_str(&meta)?);
            } else if meta.path.is_ident("base") {
                args.base = Some(name_value_str(&meta)?);
            } else if meta.path.is_ident("discriminator_value") {
                args.discriminator_value = Some(name_value_str(&meta)?);
            } else {
                return Err(meta.error("unknown `entity` key"));
            }
            Ok(())
        })?;
    }
    Ok(args)
}

pub fn parse_relation_args(attrs: &[Attribute]) -> Result<Vec<RelationArgs>> {
    let mut out = Vec::new();
    for attr in attrs {
        if !attr.path().is_ident("relation") {
            continue;
        }
        let mut rel_attr = None;
        let mut kind = None;
        let mut target = None;
        let mut required = false;
        let mut reverse = None;
        let mut column = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("attr") {
                rel_attr = Some(name_value_str(&meta)?);
            } else if meta.path.is_ident("kind") {
                kind = Some(match name_value_str(&meta)?.as_str() {
                    "reference" => RelationKind::Reference,
                    "collection" => RelationKind::Collection,
                    other => return Err(meta.error(format!("unknown relation kind `{other}`"))),
                });
            } else if meta.path.is_ident("target") {
                target = Some(name_value_str(&meta)?);
            } else if meta.path.is_ident("required") {
                required = true;
            } else if meta.path.is_ident("reverse") {
                reverse = Some(name_value_str(&meta)?);
            } else if meta.path.is_ident("column") {
                column = Some(name_value_str(&meta)?);
            } else {
                return Err(meta.error("unknown `relation` key"));
            }
            Ok(())
        })?;
        out.push(RelationArgs {
            attr: rel_attr.ok_or_else(|| syn::Error::new_spanned(attr, "`relation` requires `attr = \"...\"`"))?,
            kind: kind.ok_or_else(|| syn::Error::new_spanned(attr, "`relation` requires `kind = \"...\"`"))?,
            target: target.ok_or_else(|| syn::Error::new_spanned(attr, "`relation` requires `target = \"...\"`"))?,
            required,
            reverse,
            column,
        });
    }
    Ok(out)
}

pub fn parse_field_args(attrs: &[Attribute]) -> Result<FieldArgs> {
    let mut args = FieldArgs::default();
    for attr in attrs {
        if attr.path().is_ident("pk") {
            args.pk = true;
        } else if attr.path().is_ident("required") {
            args.required = true;
        } else if attr.path().is_ident("optional") {
            args.optional = true;
        } else if attr.path().is_ident("discriminator") {
            args.discriminator = true;
        } else if attr.path().is_ident("unique") {
            args.unique = true;
            if let Meta::List(_) = &attr.meta {
                attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("group") {
                        args.unique_group = Some(name_value_str(&meta)?);
                    } else {
                        return Err(meta.error("unknown `unique` key"));
                    }
                    Ok(())
                })?;
            }
        } else if attr.path().is_ident("column") {
            if let Meta::NameValue(nv) = &attr.meta {
                if let Expr::Lit(lit) = &nv.value {
                    if let Lit::Str(s) = &lit.lit {
                        args.column = Some(s.value());
                    }
                }
            }
        }
    }
    Ok(args)
}

/// Reads `T` out of an `Option<T>` type path, if `ty` is literally that shape.
pub fn option_inner(ty: &syn::Type) -> Option<&syn::Type> {
    let syn::Type::Path(p) = ty else { return None };
    let seg = p.path.segments.last()?;
    if seg.ident != "Option" {
        return None;
    }
    let syn::PathArguments::AngleBracketed(args) = &seg.arguments else { return None };
    args.args.iter().find_map(|a| match a {
        syn::GenericArgument::Type(t) => Some(t),
        _ => None,
    })
}
