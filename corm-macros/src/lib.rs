//! Procedural macros for corm: `#[derive(Entity)]` turns a struct's scalar
//! fields, plus the relational attributes it declares with `#[relation(..)]`,
//! into the `EntityDecl` the schema registry links (spec §4.1). Generated
//! code is addressed through the `corm` facade crate (`::corm::...`), the
//! same indirection the data-layer this crate is modeled on uses for its
//! own derive output, so callers only ever need one dependency.

mod attrs;
mod entity;

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

#[proc_macro_derive(
    Entity,
    attributes(entity, relation, pk, required, optional, unique, discriminator, column)
)]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    entity::expand(input).unwrap_or_else(syn::Error::into_compile_error).into()
}
