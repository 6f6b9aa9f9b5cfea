//! Builds the `EntityDecl`/`Entity` impl a struct expands to.

use crate::attrs::{option_inner, parse_entity_args, parse_field_args, parse_relation_args, RelationKind};
use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Result};

pub fn expand(input: DeriveInput) -> Result<TokenStream> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(&input, "Entity can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(&input, "Entity requires named fields"));
    };

    let struct_name = &input.ident;
    let entity_name = struct_name.to_string();
    let entity_args = parse_entity_args(&input.attrs)?;
    let relations = parse_relation_args(&input.attrs)?;

    let table = entity_args
        .table
        .clone()
        .unwrap_or_else(|| entity_name.to_case(Case::Snake));
    let direct_bases: Vec<&String> = entity_args.base.iter().collect();
    let discriminator_value = entity_args.discriminator_value.as_ref();

    let mut attr_decls = Vec::new();
    let mut field_to_value = Vec::new();
    let mut value_to_field = Vec::new();

    for field in &fields.named {
        let field_ident = field.ident.as_ref().expect("named field");
        let field_name = field_ident.to_string();
        let field_args = parse_field_args(&field.attrs)?;
        let ty = &field.ty;

        let kind = if field_args.pk {
            quote!(::corm::AttributeKind::PrimaryKey)
        } else if field_args.discriminator {
            quote!(::corm::AttributeKind::Discriminator)
        } else if field_args.unique {
            quote!(::corm::AttributeKind::Unique)
        } else if field_args.required {
            quote!(::corm::AttributeKind::Required)
        } else if field_args.optional || option_inner(ty).is_some() {
            quote!(::corm::AttributeKind::Optional)
        } else {
            quote!(::corm::AttributeKind::Required)
        };

        let column = match &field_args.column {
            Some(c) => quote!(Some(#c)),
            None => quote!(None),
        };
        let unique_group = match &field_args.unique_group {
            Some(g) => quote!(Some(#g)),
            None => quote!(None),
        };

        attr_decls.push(quote! {
            ::corm::AttributeDecl {
                name: #field_name,
                kind: #kind,
                target: ::corm::AttributeTarget::Scalar,
                reverse: None,
                column: #column,
                unique_group: #unique_group,
                empty_value: <#ty as ::corm::AsValue>::empty_value,
            }
        });

        field_to_value.push(quote! {
            (#field_name, ::corm::AsValue::into_value(self.#field_ident.clone()))
        });
        value_to_field.push(quote! {
            #field_ident: ::corm::AsValue::try_from_value(
                values.get(#field_name).cloned().unwrap_or(::corm::Value::Null)
            ).map_err(|e| ::corm::OrmError::Mapping(format!("{}.{}: {e}", #entity_name, #field_name)))?
        });
    }

    for rel in &relations {
        let attr_name = &rel.attr;
        let target = &rel.target;
        let target_kind = if rel.kind == RelationKind::Reference {
            quote!(::corm::AttributeTarget::Reference(#target))
        } else {
            quote!(::corm::AttributeTarget::Collection(#target))
        };
        let kind = if rel.kind == RelationKind::Collection {
            quote!(::corm::AttributeKind::Set)
        } else if rel.required {
            quote!(::corm::AttributeKind::Required)
        } else {
            quote!(::corm::AttributeKind::Optional)
        };
        let reverse = match &rel.reverse {
            Some(r) => quote!(Some(#r)),
            None => quote!(None),
        };
        let column = match &rel.column {
            Some(c) => quote!(Some(#c)),
            None => quote!(None),
        };
        attr_decls.push(quote! {
            ::corm::AttributeDecl {
                name: #attr_name,
                kind: #kind,
                target: #target_kind,
                reverse: #reverse,
                column: #column,
                unique_group: None,
                empty_value: ::corm::Value::default,
            }
        });
    }

    let discriminator_value_tok = match discriminator_value {
        Some(v) => quote!(Some(#v)),
        None => quote!(None),
    };

    let expanded = quote! {
        impl ::corm::Entity for #struct_name {
            fn decl() -> &'static ::corm::EntityDecl {
                static ATTRS: &[::corm::AttributeDecl] = &[#(#attr_decls),*];
                static BASES: &[&str] = &[#(#direct_bases),*];
                static DECL: ::corm::EntityDecl = ::corm::EntityDecl {
                    name: #entity_name,
                    table: #table,
                    direct_bases: BASES,
                    attributes: ATTRS,
                    discriminator_value: #discriminator_value_tok,
                };
                &DECL
            }

            fn initial_values(&self) -> Vec<(&'static str, ::corm::Value)> {
                vec![#(#field_to_value),*]
            }

            fn from_values(values: &::std::collections::HashMap<&'static str, ::corm::Value>) -> ::corm::Result<Self> {
                Ok(Self { #(#value_to_field),* })
            }
        }
    };

    Ok(expanded)
}
