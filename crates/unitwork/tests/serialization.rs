mod common;

use common::*;
use proptest::prelude::*;
use unitwork::prelude::*;
use unitwork::{PersistenceContext, MAGIC};

fn round_trip(session: &Session, shop: &Shop) -> PersistenceContext {
    let mut buf = Vec::new();
    session.persistence_context().serialize(&mut buf).unwrap();
    assert_eq!(&buf[..4], MAGIC);
    PersistenceContext::deserialize(&mut buf.as_slice(), shop.factory.registry()).unwrap()
}

/// Order 100 with both lines loaded and its customer still a proxy.
fn loaded_graph(shop: &Shop) -> (Session, RecordingBatcher, InstanceId) {
    shop.seed_order(100, 500, &[101, 102]);
    let (mut session, batcher) = shop.open();
    let order = session.get("Order", 100_i64).unwrap().unwrap();
    let PropertyValue::Collection(lines) = prop(&session, order, ORDER_LINES) else {
        panic!("lines resolve to a collection wrapper");
    };
    session.initialize_collection(lines).unwrap();
    (session, batcher, order)
}

#[test]
fn restored_context_keeps_entries_and_collections() {
    let shop = shop();
    let (session, _, order) = loaded_graph(&shop);
    let original = session.persistence_context();
    let restored = round_trip(&session, &shop);

    assert_eq!(restored.entry_count(), original.entry_count());
    assert_eq!(
        restored.collection_entries().count(),
        original.collection_entries().count()
    );
    for (instance, entry) in original.entries() {
        let copy = restored.get_entry(instance).expect("entry survives");
        assert_eq!(copy.entity_key(), entry.entity_key());
        assert_eq!(copy.loaded_state(), entry.loaded_state());
        assert_eq!(copy.version(), entry.version());
        assert_eq!(
            restored.instance(instance).unwrap().property_values(),
            original.instance(instance).unwrap().property_values()
        );
    }
    assert!(matches!(
        restored.instance(order).unwrap().property(ORDER_CUSTOMER),
        PropertyValue::Proxy(_)
    ));
}

#[test]
fn restored_session_resolves_without_loading() {
    let shop = shop();
    let (session, _, order) = loaded_graph(&shop);
    let restored = round_trip(&session, &shop);
    let calls = shop.orders.load_calls();

    let (mut resumed, batcher) = shop.open();
    *resumed.persistence_context_mut() = restored;
    assert_eq!(resumed.get("Order", 100_i64).unwrap(), Some(order));
    assert_eq!(shop.orders.load_calls(), calls);

    set(&mut resumed, order, ORDER_NUMBER, text("A-100-resumed"));
    resumed.flush().unwrap();
    assert_eq!(batcher.labels(), vec!["update Order#100"]);
}

#[test]
fn restored_proxy_can_be_initialized() {
    let shop = shop();
    let (session, _, order) = loaded_graph(&shop);
    let restored = round_trip(&session, &shop);

    let (mut resumed, _) = shop.open();
    *resumed.persistence_context_mut() = restored;
    let PropertyValue::Proxy(proxy) = prop(&resumed, order, ORDER_CUSTOMER) else {
        panic!("customer stays a proxy");
    };
    let customer = resumed.initialize_proxy(proxy).unwrap();
    assert_eq!(prop(&resumed, customer, CUSTOMER_NAME), text("customer-500"));
}

#[test]
fn transient_reference_is_restored_as_null() {
    let shop = shop();
    let (mut session, _, order) = loaded_graph(&shop);
    let stranger = new_customer(&mut session, "Ada");
    set(&mut session, order, ORDER_CUSTOMER, stranger);
    let restored = round_trip(&session, &shop);
    assert!(restored.instance(stranger).is_none());

    let (mut resumed, batcher) = shop.open();
    *resumed.persistence_context_mut() = restored;
    assert_eq!(prop(&resumed, order, ORDER_CUSTOMER), PropertyValue::Null);
    resumed.flush().unwrap();
    assert_eq!(batcher.labels(), vec!["update Order#100"]);
}

#[test]
fn transient_collection_element_is_dropped_on_restore() {
    let shop = shop();
    let (mut session, _, order) = loaded_graph(&shop);
    let PropertyValue::Collection(lines) = prop(&session, order, ORDER_LINES) else {
        panic!("lines resolve to a collection wrapper");
    };
    let extra = new_line(&mut session, "ink");
    session
        .persistence_context_mut()
        .collection_mut(lines)
        .unwrap()
        .add(PropertyValue::Entity(extra));
    let restored = round_trip(&session, &shop);

    let elements = restored.collection(lines).unwrap().elements();
    assert_eq!(elements.len(), 2);
    assert!(!elements.contains(&PropertyValue::Entity(extra)));
}

#[test]
fn truncated_layout_is_rejected() {
    let shop = shop();
    let (session, _, _) = loaded_graph(&shop);
    let mut buf = Vec::new();
    session.persistence_context().serialize(&mut buf).unwrap();
    buf.truncate(buf.len() / 2);

    let err = PersistenceContext::deserialize(&mut buf.as_slice(), shop.factory.registry()).unwrap_err();
    assert!(matches!(err, Error::Io(_) | Error::Serde(_)));
}

proptest! {
    #[test]
    fn prop_node_chain_survives_round_trip(names in prop::collection::vec("[a-z]{0,8}", 1..16)) {
        let shop = shop();
        let (mut session, _) = shop.open();
        let rows = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = i as i64 + 1;
                let parent = if i == 0 { PropertyValue::Null } else { reference("Node", id - 1) };
                (Value::BigInt(id), vec![text(name), parent])
            })
            .collect();
        let nodes = session.load_result_set("Node", rows).unwrap();
        let restored = round_trip(&session, &shop);

        prop_assert_eq!(restored.entry_count(), names.len());
        for (i, &node) in nodes.iter().enumerate() {
            let copy = restored.instance(node).unwrap();
            prop_assert_eq!(copy.property(NODE_NAME), text(&names[i]));
            let parent = if i == 0 { PropertyValue::Null } else { PropertyValue::Entity(nodes[i - 1]) };
            prop_assert_eq!(copy.property(NODE_PARENT), parent);
        }
    }
}
