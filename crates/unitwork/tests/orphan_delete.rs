mod common;

use common::*;
use unitwork::prelude::*;
use unitwork::{Action, ProxyId};

fn lines_of(session: &Session, order: InstanceId) -> CollectionId {
    match prop(session, order, ORDER_LINES) {
        PropertyValue::Collection(collection) => collection,
        other => panic!("expected a collection, got {:?}", other),
    }
}

fn deletes(batcher: &RecordingBatcher) -> Vec<(String, bool)> {
    batcher
        .actions()
        .into_iter()
        .filter_map(|action| match action {
            Action::Delete(delete) => Some((format!("{}#{}", delete.entity_name, delete.id), delete.orphan)),
            _ => None,
        })
        .collect()
}

#[test]
fn element_removed_from_collection_is_deleted_as_orphan() {
    let shop = shop();
    shop.seed_order(100, 500, &[101, 102]);
    let (mut session, batcher) = shop.open();

    let order = session.get("Order", 100_i64).unwrap().unwrap();
    let lines = lines_of(&session, order);
    session.initialize_collection(lines).unwrap();
    let line = session.get("OrderLine", 101_i64).unwrap().unwrap();
    let removed = session
        .persistence_context_mut()
        .collection_mut(lines)
        .unwrap()
        .remove(&PropertyValue::Entity(line));
    assert!(removed);

    session.flush().unwrap();

    assert_eq!(deletes(&batcher), vec![("OrderLine#101".to_string(), true)]);
    assert_eq!(
        batcher.labels(),
        vec![
            "update Order#100",
            "collection-update Order.lines#100",
            "delete OrderLine#101"
        ]
    );
    assert!(!session.contains(line));
}

#[test]
fn removal_queued_on_lazy_collection_deletes_orphan() {
    let shop = shop();
    shop.seed_order(100, 500, &[101, 102]);
    let (mut session, batcher) = shop.open();

    let line = session.get("OrderLine", 101_i64).unwrap().unwrap();
    let PropertyValue::Entity(order) = prop(&session, line, LINE_ORDER) else {
        panic!("line refers to its order");
    };
    let lines = lines_of(&session, order);
    {
        let wrapper = session.persistence_context_mut().collection_mut(lines).unwrap();
        assert!(!wrapper.was_initialized());
        wrapper.remove(&PropertyValue::Entity(line));
    }

    session.flush().unwrap();

    assert_eq!(deletes(&batcher), vec![("OrderLine#101".to_string(), true)]);
    assert!(!session.contains(line));
    assert_eq!(shop.order_lines.load_calls(), 0);
}

#[test]
fn element_kept_in_collection_is_not_an_orphan() {
    let shop = shop();
    shop.seed_order(100, 500, &[101]);
    let (mut session, batcher) = shop.open();

    let order = session.get("Order", 100_i64).unwrap().unwrap();
    let lines = lines_of(&session, order);
    session.initialize_collection(lines).unwrap();
    let line = session.get("OrderLine", 101_i64).unwrap().unwrap();
    set(&mut session, line, LINE_PRODUCT, text("renamed"));

    session.flush().unwrap();
    assert_eq!(batcher.labels(), vec!["update OrderLine#101"]);
    assert!(session.contains(line));
}

#[test]
fn dereferenced_orphan_delete_collection_is_rejected() {
    let shop = shop();
    shop.seed_order(100, 500, &[101]);
    let (mut session, batcher) = shop.open();

    let order = session.get("Order", 100_i64).unwrap().unwrap();
    set(&mut session, order, ORDER_LINES, PropertyValue::Null);

    let err = session.flush().unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
    assert!(
        err.to_string()
            .contains("A collection with cascade=all-delete-orphan was no longer referenced")
    );
    assert!(batcher.actions().is_empty());
}

#[test]
fn deleting_the_owner_deletes_loaded_elements() {
    let shop = shop();
    shop.seed_order(100, 500, &[101, 102]);
    let (mut session, batcher) = shop.open();

    let order = session.get("Order", 100_i64).unwrap().unwrap();
    let lines = lines_of(&session, order);
    session.initialize_collection(lines).unwrap();
    session.delete("Order", order).unwrap();
    session.flush().unwrap();

    let labels = batcher.labels();
    assert_eq!(labels[0], "collection-remove Order.lines#100");
    let mut removed: Vec<(String, bool)> = deletes(&batcher);
    removed.sort();
    assert_eq!(
        removed,
        vec![
            ("Order#100".to_string(), false),
            ("OrderLine#101".to_string(), false),
            ("OrderLine#102".to_string(), false),
        ]
    );
    assert!(session.persistence_context().is_empty());
}

/// Order 100 with lines 101 and 102, whose elements load as proxies.
fn proxied_lines(shop: &Shop) -> (Session, RecordingBatcher, CollectionId, ProxyId) {
    shop.seed_order(100, 500, &[101, 102]);
    let (mut session, batcher) = shop.open();
    let order = session.get("Order", 100_i64).unwrap().unwrap();
    let lines = lines_of(&session, order);
    session.initialize_collection(lines).unwrap();
    let PropertyValue::Proxy(first) = session.persistence_context().collection(lines).unwrap().elements()[0].clone() else {
        panic!("proxied lines load as proxies");
    };
    (session, batcher, lines, first)
}

#[test]
fn proxy_replaced_by_its_instance_is_not_an_orphan() {
    let shop = proxied_lines_shop();
    let (mut session, batcher, lines, first) = proxied_lines(&shop);

    let line = session.get("OrderLine", 101_i64).unwrap().unwrap();
    {
        let wrapper = session.persistence_context_mut().collection_mut(lines).unwrap();
        assert!(wrapper.remove(&PropertyValue::Proxy(first)));
        wrapper.add(PropertyValue::Entity(line));
    }
    session.flush().unwrap();

    assert!(deletes(&batcher).is_empty());
    assert!(session.contains(line));
}

#[test]
fn removed_proxy_element_is_deleted_as_orphan() {
    let shop = proxied_lines_shop();
    let (mut session, batcher, lines, first) = proxied_lines(&shop);

    session
        .persistence_context_mut()
        .collection_mut(lines)
        .unwrap()
        .remove(&PropertyValue::Proxy(first));
    session.flush().unwrap();

    assert_eq!(deletes(&batcher), vec![("OrderLine#101".to_string(), true)]);
}
