use std::cell::RefCell;
use std::rc::Rc;

use trinity_core::{Cardinality, DataType, RelationDef, Schema, Triple, Value};
use trinity_engine::{EngineError, FetchOptions, Operator, OrderDirection, Query, QueryResults};
use trinity_harness::{TestNetwork, TestPeer, init_tracing};

type Emitted = Rc<RefCell<Vec<Vec<String>>>>;

/// Subscribe and record every emitted id list.
fn watch(peer: &mut TestPeer, query: &Query) -> Result<Emitted, EngineError> {
    let emitted: Emitted = Rc::default();
    let sink = emitted.clone();
    peer.db.subscribe(
        query,
        FetchOptions::default(),
        move |results: &QueryResults, _: &[Triple]| {
            sink.borrow_mut().push(results.local_ids());
            Ok(())
        },
        |err: &EngineError| panic!("subscription failed: {err}"),
    )?;
    Ok(emitted)
}

fn last(emitted: &Emitted) -> Vec<String> {
    emitted.borrow().last().cloned().unwrap_or_default()
}

fn scores(peer: &mut TestPeer) -> Result<(), EngineError> {
    for (id, score) in [("0", 100), ("1", 80), ("2", 95), ("3", 85), ("4", 90)] {
        peer.create_record("scores", id, vec![("score", Value::from(score))])?;
    }
    Ok(())
}

#[test]
fn deleting_rank_one_backfills_rank_two() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut peer = TestPeer::new("alice")?;
    scores(&mut peer)?;
    let query = Query::new("scores").order("score", OrderDirection::Desc).limit(2);
    let emitted = watch(&mut peer, &query)?;
    assert_eq!(last(&emitted), vec!["0", "2"]);

    peer.delete_record("scores", "0")?;
    assert_eq!(emitted.borrow().len(), 2);
    assert_eq!(last(&emitted), vec!["2", "4"]);
    Ok(())
}

#[test]
fn backfill_stops_when_the_collection_runs_dry() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("alice")?;
    peer.create_record("scores", "a", vec![("score", Value::from(1))])?;
    peer.create_record("scores", "b", vec![("score", Value::from(2))])?;
    let query = Query::new("scores").order("score", OrderDirection::Asc).limit(2);
    let emitted = watch(&mut peer, &query)?;

    peer.delete_record("scores", "a")?;
    assert_eq!(last(&emitted), vec!["b"]);
    peer.delete_record("scores", "b")?;
    assert!(last(&emitted).is_empty());
    Ok(())
}

#[test]
fn live_results_track_fresh_fetches() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("alice")?;
    let query = Query::new("scores")
        .filter("score", Operator::Gte, 50)
        .order("score", OrderDirection::Asc)
        .limit(3);
    let emitted = watch(&mut peer, &query)?;

    let steps: Vec<Box<dyn Fn(&mut TestPeer) -> Result<(), EngineError>>> = vec![
        Box::new(|p: &mut TestPeer| p.create_record("scores", "a", vec![("score", Value::from(70))]).map(drop)),
        Box::new(|p: &mut TestPeer| p.create_record("scores", "b", vec![("score", Value::from(55))]).map(drop)),
        Box::new(|p: &mut TestPeer| p.create_record("scores", "c", vec![("score", Value::from(90))]).map(drop)),
        Box::new(|p: &mut TestPeer| p.create_record("scores", "d", vec![("score", Value::from(60))]).map(drop)),
        Box::new(|p: &mut TestPeer| p.set_field("scores", "b", "score", 40)),
        Box::new(|p: &mut TestPeer| p.delete_record("scores", "d")),
        Box::new(|p: &mut TestPeer| p.set_field("scores", "b", "score", 95)),
        Box::new(|p: &mut TestPeer| p.create_record("scores", "e", vec![("score", Value::from(80))]).map(drop)),
        Box::new(|p: &mut TestPeer| p.set_field("scores", "c", "score", 99)),
    ];
    for step in steps {
        step(&mut peer)?;
        assert_eq!(last(&emitted), peer.ids(&query)?);
    }
    assert_eq!(last(&emitted), vec!["a", "e", "b"]);
    Ok(())
}

#[test]
fn relational_subscription_reruns_on_related_writes() -> Result<(), Box<dyn std::error::Error>> {
    let schema = Schema::new()
        .collection("users", [("id", DataType::String), ("name", DataType::String)])
        .collection(
            "posts",
            [
                ("id", DataType::String),
                ("author_id", DataType::String),
                (
                    "author",
                    DataType::Query(RelationDef::new("users", Cardinality::One).link("id", "=", "author_id")),
                ),
            ],
        );
    let mut peer = TestPeer::with_schema("alice", schema)?;
    peer.create_record("users", "u1", vec![("name", Value::from("ada"))])?;
    peer.create_record("posts", "p1", vec![("author_id", Value::from("u1"))])?;

    let query = Query::new("posts").filter("author.name", Operator::Eq, "ada");
    let emitted = watch(&mut peer, &query)?;
    assert_eq!(last(&emitted), vec!["p1"]);

    peer.set_field("users", "u1", "name", "grace")?;
    assert!(last(&emitted).is_empty());

    peer.create_record("users", "u2", vec![("name", Value::from("ada"))])?;
    assert_eq!(emitted.borrow().len(), 2);

    peer.create_record("posts", "p2", vec![("author_id", Value::from("u2"))])?;
    assert_eq!(last(&emitted), vec!["p2"]);
    Ok(())
}

#[test]
fn entity_subscriptions_refuse_relations() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("alice")?;
    let err = peer
        .db
        .subscribe_entities(
            &Query::new("posts").include("author"),
            FetchOptions::default(),
            |_: &QueryResults, _: &[Triple]| Ok(()),
            |_: &EngineError| {},
        )
        .unwrap_err();
    assert_eq!(err.status(), 400);
    Ok(())
}

#[test]
fn remote_writes_reach_local_subscribers() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new();
    let a = net.add_peer("alice")?;
    let b = net.add_peer("bob")?;
    let query = Query::new("scores").filter("score", Operator::Gt, 10);
    let emitted = watch(net.peer_mut(b), &query)?;

    net.peer_mut(a).create_record("scores", "x", vec![("score", Value::from(11))])?;
    assert!(last(&emitted).is_empty());
    net.sync(a, b)?;
    assert_eq!(last(&emitted), vec!["x"]);
    Ok(())
}

#[test]
fn triple_subscription_catches_up_then_streams() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("alice")?;
    scores(&mut peer)?;
    let checkpoint = peer.db.state_vector()?;
    peer.set_field("scores", "1", "score", 99)?;

    let batches: Rc<RefCell<Vec<Vec<Triple>>>> = Rc::default();
    let sink = batches.clone();
    peer.db.subscribe_triples(
        &Query::new("scores").filter("score", Operator::Gt, 90),
        FetchOptions::default().at(checkpoint),
        move |triples: &[Triple]| {
            sink.borrow_mut().push(triples.to_vec());
            Ok(())
        },
        |err: &EngineError| panic!("subscription failed: {err}"),
    )?;
    {
        let batches = batches.borrow();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id.local_id(), "1");
        assert_eq!(batches[0][0].value, Value::from(99));
    }

    peer.set_field("scores", "3", "score", 10)?;
    assert_eq!(batches.borrow().len(), 1);
    peer.set_field("scores", "2", "score", 91)?;
    assert_eq!(batches.borrow().len(), 2);
    Ok(())
}
