//! Single-table inheritance (spec §4.1): a root with no explicit
//! `#[discriminator]` attribute gets one auto-created the moment a second
//! entity joins its chain, and a query against the root materializes each
//! row under the concrete subclass its own discriminator value names.

mod common;

use common::{Car, Truck, Vehicle};
use corm_core::{Provider, Query, Session};
use corm_memory::MemoryProvider;
use std::sync::Arc;

#[tokio::test]
async fn querying_the_root_dispatches_each_row_to_its_concrete_subclass() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    session.insert(&Car { id: None, plate: "CAR-001".into(), doors: 4 }).expect("insert car");
    session.insert(&Truck { id: None, plate: "TRK-001".into(), payload_tons: 12 }).expect("insert truck");
    session.commit().await.expect("commit both rows");

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let ids = Query::new(&mut session, "Vehicle").fetch().await.expect("polymorphic fetch");
    assert_eq!(ids.len(), 2);

    let entities: Vec<&str> = ids.iter().map(|id| session.entity_of(*id).expect("entity_of")).collect();
    assert!(entities.contains(&"Car"), "a Car row must materialize as Car, not Vehicle");
    assert!(entities.contains(&"Truck"), "a Truck row must materialize as Truck, not Vehicle");
}

#[tokio::test]
async fn querying_a_subclass_directly_excludes_its_siblings() {
    let schema = common::schema();
    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));

    session.insert(&Car { id: None, plate: "CAR-002".into(), doors: 2 }).expect("insert car");
    session.insert(&Truck { id: None, plate: "TRK-002".into(), payload_tons: 8 }).expect("insert truck");
    session.commit().await.expect("commit both rows");

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let ids = Query::new(&mut session, "Car").fetch().await.expect("fetch Car only");
    assert_eq!(ids.len(), 1, "the shared vehicle table must not leak the Truck row into a Car query");
    assert_eq!(session.entity_of(ids[0]).expect("entity_of"), "Car");
}

#[tokio::test]
async fn the_root_still_fetches_normally_when_no_subclass_has_registered() {
    let mut registry = corm_core::Registry::new();
    registry.register::<Vehicle>().expect("register Vehicle alone");
    registry.generate_mapping().expect("generate_mapping");
    let schema = Arc::new(registry);

    let provider = Arc::new(MemoryProvider::new());
    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    session.insert(&Vehicle { id: None, plate: "AAA-111".into() }).expect("insert vehicle");
    session.commit().await.expect("commit");

    let conn = provider.connect().await.expect("connect");
    let mut session = Session::new(Arc::clone(&provider), conn, Arc::clone(&schema));
    let ids = Query::new(&mut session, "Vehicle").fetch().await.expect("plain fetch, no discriminator column exists yet");
    assert_eq!(ids.len(), 1);
    assert_eq!(session.entity_of(ids[0]).expect("entity_of"), "Vehicle");
}
