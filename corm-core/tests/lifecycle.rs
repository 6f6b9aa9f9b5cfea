//! Create/commit/fetch round trip, identity-map reuse, and the typed
//! `Session::insert`/`Session::get` bridge over the erased engine.

mod common;

use common::Author;
use corm_core::{col, Provider, Query, Session, Value};
use corm_memory::MemoryProvider;
use std::sync::Arc;

#[tokio::test]
async fn create_commit_and_fetch_round_trip() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let id = session.insert(&Author { id: None, name: "Isaac Asimov".into() }).expect("insert");
    session.commit().await.expect("commit");
    let _ = id;

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let ids = Query::new(&mut session, "Author").filter(col("Author", "name").eq("Isaac Asimov")).fetch().await.expect("fetch");
    assert_eq!(ids.len(), 1);

    let author: Author = session.get(ids[0]).expect("materialize");
    assert_eq!(author.name, "Isaac Asimov");
    assert!(author.id.is_some());
}

#[tokio::test]
async fn second_fetch_of_same_pk_returns_the_same_instance() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    session.insert(&Author { id: None, name: "Ursula K. Le Guin".into() }).expect("insert");
    session.commit().await.expect("commit");

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let first = Query::new(&mut session, "Author").fetch().await.expect("fetch");
    let second = Query::new(&mut session, "Author").fetch().await.expect("fetch");
    assert_eq!(first, second);

    let pk = session.pk_of(first[0]).expect("pk_of").to_vec();
    let looked_up = session.by_pk("Author", &pk).expect("by_pk");
    assert_eq!(looked_up, Some(first[0]));
}

#[tokio::test]
async fn validate_schema_succeeds_against_every_mapped_table() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    session.validate_schema().await.expect("every mapped table validates");
}

#[tokio::test]
async fn required_scalar_defaults_to_constraint_error_when_missing() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let mut scalars = std::collections::HashMap::new();
    scalars.insert("id", Value::Null);
    let err = session.create("Author", scalars).expect_err("missing required name");
    assert!(matches!(err, corm_core::OrmError::Constraint(_)));
}
