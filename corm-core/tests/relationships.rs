//! Bidirectional relationship integrity: required to-one/to-many reverse
//! sync, cascade nullify on delete, and the deferred FK patch that lets a
//! mutual optional one-to-one commit without being treated as an insert
//! cycle.

mod common;

use common::{Author, Book, Course, Husband, Student, Wife};
use corm_core::ast::{SqlExpr, SqlStatement};
use corm_core::{Provider, Session};
use corm_memory::MemoryProvider;
use std::sync::Arc;

#[tokio::test]
async fn required_reference_orders_inserts_and_syncs_the_reverse_collection() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let author = session.insert(&Author { id: None, name: "Frank Herbert".into() }).expect("insert author");
    let book = session.insert(&Book { id: None, title: "Dune".into() }).expect("insert book");
    session.set_reference(book, "author", Some(author)).expect("link book to author");

    assert!(session.collection(author, "books").is_some_and(|s| s.contains(book)));

    session.commit().await.expect("commit survives Required insert ordering");
}

#[tokio::test]
async fn deleting_the_owner_nullifies_the_required_reverse_reference() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let author = session.insert(&Author { id: None, name: "Ray Bradbury".into() }).expect("insert author");
    let book = session.insert(&Book { id: None, title: "Fahrenheit 451".into() }).expect("insert book");
    session.set_reference(book, "author", Some(author)).expect("link");
    session.flush().await.expect("flush inserts and the link");

    session.delete(author).expect("delete author");
    let reverse = session.get_attr(book, "author").expect("read back");
    assert_eq!(reverse, corm_core::AttrValue::Reference(None));

    session.commit().await.expect("commit the nullify + delete");
}

#[tokio::test]
async fn mutual_optional_one_to_one_commits_via_deferred_fk_patch() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let husband = session.insert(&Husband { id: None }).expect("insert husband");
    let wife = session.insert(&Wife { id: None }).expect("insert wife");
    session.set_reference(husband, "spouse", Some(wife)).expect("husband -> wife");
    session.set_reference(wife, "spouse", Some(husband)).expect("wife -> husband");

    // Neither row has a primary key yet and each references the other, but
    // both sides are Optional: this must not be reported as
    // `UnresolvableCyclicDependency`, and the NULL an insert leaves behind
    // for its not-yet-assigned partner must be patched once both exist.
    session.commit().await.expect("commit resolves the mutual reference");

    let mut conn = provider.connect().await.expect("connect");
    let rows = provider
        .fetch(
            &mut conn,
            &SqlStatement::Select {
                distinct: false,
                columns: vec![SqlExpr::col("husband", "spouse_id")],
                from: "husband",
                alias: None,
                joins: Vec::new(),
                where_: None,
                order_by: Vec::new(),
                limit: None,
                offset: None,
            },
            &[],
        )
        .await
        .expect("raw select");
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].get_column("spouse_id").expect("column").is_null());
}

/// Spec §8's m2m scenario: a `Set`↔`Set` pair is backed by a shared link
/// table rather than a foreign-key column, and only its canonical side
/// (`Course.students`, the registry's choice between the two) ever flushes
/// it, so an enrollment produces exactly one row, not two.
#[tokio::test]
async fn many_to_many_collection_flushes_a_shared_link_table() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let alice = session.insert(&Student { id: None, name: "Alice".into() }).expect("insert student");
    let orbital = session.insert(&Course { id: None, title: "Orbital Mechanics".into() }).expect("insert course");
    session.collection_add(alice, "courses", orbital).expect("enroll");
    assert!(session.collection(orbital, "students").is_some_and(|s| s.contains(alice)), "the reverse side must mirror the add");
    session.flush().await.expect("flush the inserts and the link row");

    let link_rows = fetch_link_rows(&provider).await;
    assert_eq!(link_rows.len(), 1, "one link row for the one enrollment");

    // Re-adding an already-current member is a no-op: no second delta,
    // so no second INSERT when flushed.
    session.collection_add(alice, "courses", orbital).expect("re-add is a no-op");
    session.flush().await.expect("flush again");
    let link_rows = fetch_link_rows(&provider).await;
    assert_eq!(link_rows.len(), 1, "re-adding an unchanged member must not insert a duplicate link row");

    session.collection_remove(alice, "courses", orbital).expect("unenroll");
    session.flush().await.expect("flush the delete");
    let link_rows = fetch_link_rows(&provider).await;
    assert!(link_rows.is_empty(), "removing the last member must delete the link row");
}

async fn fetch_link_rows(provider: &Arc<MemoryProvider>) -> Vec<corm_core::RowLabeled> {
    let mut conn = provider.connect().await.expect("connect");
    provider
        .fetch(
            &mut conn,
            &SqlStatement::Select {
                distinct: false,
                columns: vec![SqlExpr::col("course_student", "students_id"), SqlExpr::col("course_student", "courses_id")],
                from: "course_student",
                alias: None,
                joins: Vec::new(),
                where_: None,
                order_by: Vec::new(),
                limit: None,
                offset: None,
            },
            &[],
        )
        .await
        .expect("raw select")
}
