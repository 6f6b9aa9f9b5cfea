//! `Query` combinator coverage (order/limit/offset/aggregates), `QueryCache`
//! shape reuse, and the session-registry transaction decorator.

mod common;

use common::{Account, Author};
use corm_core::ast::SqlExpr;
use corm_core::{col, OrmError, Provider, Query, QueryCache, Session};
use corm_memory::MemoryProvider;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

async fn seed_authors(session: &mut Session<MemoryProvider>, names: &[&str]) {
    for name in names {
        session.insert(&Author { id: None, name: (*name).to_string() }).expect("insert author");
    }
    session.flush().await.expect("flush seed authors");
}

#[tokio::test]
async fn order_by_limit_and_offset_page_through_results() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    seed_authors(&mut session, &["Octavia Butler", "Ann Leckie", "N. K. Jemisin"]).await;

    let page = Query::new(&mut session, "Author").order_by(col("Author", "name").asc()).limit(2).offset(1).fetch().await.expect("page");
    assert_eq!(page.len(), 2);

    let all_sorted = Query::new(&mut session, "Author").order_by(col("Author", "name").asc()).fetch().await.expect("all sorted");
    assert_eq!(&page[..], &all_sorted[1..3]);
}

#[tokio::test]
async fn count_and_exists_reflect_a_filtered_predicate() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    seed_authors(&mut session, &["Octavia Butler", "Ann Leckie"]).await;

    let total = Query::new(&mut session, "Author").count().await.expect("count");
    assert_eq!(total, 2);

    let found = Query::new(&mut session, "Author").filter(col("Author", "name").eq("Ann Leckie")).exists().await.expect("exists");
    assert!(found);

    let missing = Query::new(&mut session, "Author").filter(col("Author", "name").eq("Nobody")).exists().await.expect("exists");
    assert!(!missing);
}

#[tokio::test]
async fn query_cache_reuses_one_plan_across_different_literal_values() {
    let cache = QueryCache::new();
    let shape_a = col("Author", "name").eq("Ann Leckie");
    let shape_b = col("Author", "name").eq("Octavia Butler");

    let built_count = AtomicU32::new(0);
    let build = |predicate: &SqlExpr| {
        built_count.fetch_add(1, Ordering::SeqCst);
        corm_core::ast::SqlStatement::Select {
            distinct: false,
            columns: Vec::new(),
            from: "author",
            alias: None,
            joins: Vec::new(),
            where_: Some(predicate.clone()),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    };

    cache.get_or_compile::<Author>(&shape_a, || build(&shape_a));
    cache.get_or_compile::<Author>(&shape_b, || build(&shape_b));
    assert_eq!(built_count.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn with_transaction_commits_every_registered_session() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());

    corm_core::with_transaction(0, |_: &OrmError| false, |_: &OrmError| false, || {
        let provider = Arc::clone(&provider);
        let schema = Arc::clone(&schema);
        async move {
            let conn = provider.connect().await.expect("connect");
            let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
            session.insert(&Author { id: None, name: "Margaret Atwood".into() }).expect("insert");
            corm_core::transaction::register("primary", 0, Box::new(session));
            Ok(())
        }
    })
    .await
    .expect("transaction commits");

    let conn = provider.connect().await.expect("connect");
    let mut verify = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let found = Query::new(&mut verify, "Author").filter(col("Author", "name").eq("Margaret Atwood")).exists().await.expect("exists");
    assert!(found);
}

#[tokio::test]
async fn with_transaction_retries_once_on_a_retryable_failure() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let attempts = AtomicU32::new(0);

    let result = corm_core::with_transaction(1, |e: &OrmError| matches!(e, OrmError::UnrepeatableRead(_)), |_: &OrmError| false, || async {
        let conn = provider.connect().await.expect("connect");
        let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
        session.insert(&Account { id: None, email: "retry@example.com".into() }).expect("insert");
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        corm_core::transaction::register("primary", 0, Box::new(session));
        if attempt == 0 { Err(OrmError::UnrepeatableRead("simulated race".into())) } else { Ok(()) }
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let conn = provider.connect().await.expect("connect");
    let mut verify = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let total = Query::new(&mut verify, "Account").count().await.expect("count");
    assert_eq!(total, 1, "the failed first attempt's session must have been rolled back, not double-committed");
}

#[tokio::test]
async fn with_transaction_commits_despite_an_allowed_exception() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());

    let result = corm_core::with_transaction(
        0,
        |_: &OrmError| false,
        |e: &OrmError| matches!(e, OrmError::Translation(_)),
        || async {
            let conn = provider.connect().await.expect("connect");
            let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
            session.insert(&Account { id: None, email: "redirect@example.com".into() }).expect("insert");
            corm_core::transaction::register("primary", 0, Box::new(session));
            Err::<(), _>(OrmError::Translation("simulated redirect".into()))
        },
    )
    .await;

    assert!(matches!(result, Err(OrmError::Translation(_))), "the original error must still be returned");

    let conn = provider.connect().await.expect("connect");
    let mut verify = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let found = Query::new(&mut verify, "Account").filter(col("Account", "email").eq("redirect@example.com")).exists().await.expect("exists");
    assert!(found, "an allowed exception must still commit the sessions body registered, not roll them back");
}

#[tokio::test]
async fn fetch_one_returns_the_sole_match() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    seed_authors(&mut session, &["Ursula K. Le Guin"]).await;

    let found = Query::new(&mut session, "Author").filter(col("Author", "name").eq("Ursula K. Le Guin")).fetch_one().await.expect("fetch_one");
    let name = session.get_attr(found, "name").expect("read back");
    assert_eq!(name, corm_core::AttrValue::Scalar(corm_core::Value::Text(Some("Ursula K. Le Guin".into()))));
}

#[tokio::test]
async fn fetch_one_errors_object_not_found_on_zero_rows() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let err = Query::new(&mut session, "Author").filter(col("Author", "name").eq("Nobody")).fetch_one().await.expect_err("no such author");
    assert!(matches!(err, OrmError::ObjectNotFound { .. }));
}

#[tokio::test]
async fn fetch_one_errors_multiple_objects_found_on_more_than_one_row() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    seed_authors(&mut session, &["Octavia Butler", "Octavia Butler"]).await;

    let err = Query::new(&mut session, "Author").filter(col("Author", "name").eq("Octavia Butler")).fetch_one().await.expect_err("two rows match");
    assert!(matches!(err, OrmError::MultipleObjectsFound("Author")));
}

#[tokio::test]
async fn fetch_capped_errors_too_many_objects_found_past_a_cap_above_one() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    seed_authors(&mut session, &["Ann Leckie", "N. K. Jemisin", "Ted Chiang"]).await;

    let err = Query::new(&mut session, "Author").fetch_capped(2).await.expect_err("three rows exceed the cap of two");
    assert!(matches!(err, OrmError::TooManyObjectsFound { entity: "Author", cap: 2 }));
}

#[tokio::test]
async fn get_by_pk_finds_an_existing_row_and_reuses_the_identity_map() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut seed = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let author = seed.insert(&Author { id: None, name: "Kim Stanley Robinson".into() }).expect("insert");
    seed.commit().await.expect("commit");
    let pk = seed.pk_of(author).expect("pk_of").to_vec();

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let found = session.get_by_pk("Author", &pk).await.expect("get_by_pk finds the seeded row");
    let again = session.get_by_pk("Author", &pk).await.expect("get_by_pk again");
    assert_eq!(found, again, "a second lookup by the same pk must return the same identity-mapped instance");
}

#[tokio::test]
async fn get_by_pk_errors_object_not_found_for_a_missing_key() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    let err = session.get_by_pk("Author", &[corm_core::Value::Int64(Some(404))]).await.expect_err("no such author");
    assert!(matches!(err, OrmError::ObjectNotFound { entity: "Author", .. }));
}
