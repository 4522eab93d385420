mod common;

use common::*;
use unitwork::prelude::*;

#[test]
fn get_returns_one_instance_per_row() {
    let shop = shop();
    shop.seed_order(100, 500, &[101]);
    let (mut session, _) = shop.open();

    let first = session.get("Order", 100_i64).unwrap().unwrap();
    let second = session.get("Order", 100_i64).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(shop.orders.load_calls(), 1);
    assert_eq!(session.entity_state("Order", first).unwrap(), EntityState::Persistent);
}

#[test]
fn get_missing_row_is_none() {
    let shop = shop();
    let (mut session, _) = shop.open();
    assert!(session.get("Order", 42_i64).unwrap().is_none());
}

#[test]
fn load_hands_out_a_proxy_until_initialized() {
    let shop = shop();
    shop.seed_order(100, 500, &[]);
    let (mut session, _) = shop.open();

    let EntityRef::Proxy(proxy) = session.load("Customer", 500_i64).unwrap() else {
        panic!("Customer is proxied");
    };
    assert_eq!(shop.customers.load_calls(), 0);
    assert_eq!(session.load("Customer", 500_i64).unwrap(), EntityRef::Proxy(proxy));

    let customer = session.initialize_proxy(proxy).unwrap();
    assert_eq!(shop.customers.load_calls(), 1);
    assert_eq!(session.get("Customer", 500_i64).unwrap(), Some(customer));
    assert_eq!(prop(&session, customer, CUSTOMER_NAME), text("customer-500"));
}

#[test]
fn association_resolves_to_the_registered_proxy() {
    let shop = shop();
    shop.seed_order(100, 500, &[]);
    let (mut session, _) = shop.open();

    let order = session.get("Order", 100_i64).unwrap().unwrap();
    let PropertyValue::Proxy(from_order) = prop(&session, order, ORDER_CUSTOMER) else {
        panic!("many-to-one to a proxied entity resolves to a proxy");
    };
    assert_eq!(session.load("Customer", 500_i64).unwrap(), EntityRef::Proxy(from_order));
}

#[test]
fn initializing_a_proxy_for_a_missing_row_fails() {
    let shop = shop();
    let (mut session, _) = shop.open();

    let EntityRef::Proxy(proxy) = session.load("Customer", 9_i64).unwrap() else {
        panic!("Customer is proxied");
    };
    assert!(matches!(
        session.initialize_proxy(proxy),
        Err(Error::ObjectNotFound { .. })
    ));
}

#[test]
fn second_instance_for_a_bound_key_is_rejected() {
    let shop = shop();
    shop.seed_order(100, 500, &[]);
    let (mut session, _) = shop.open();

    let managed = session.get("Customer", 500_i64).unwrap().unwrap();
    let copy = session.instantiate("Customer", Some(Value::BigInt(500))).unwrap();
    set(&mut session, copy, CUSTOMER_NAME, text("other"));

    let err = session.save_or_update("Customer", copy).unwrap_err();
    assert!(matches!(err, Error::NonUniqueObject { .. }));
    assert!(err.is_data_integrity());
    assert!(session.contains(managed));
    assert!(!session.contains(copy));
}

#[test]
fn evicted_instance_is_reloaded_as_a_new_instance() {
    let shop = shop();
    shop.seed_order(100, 500, &[]);
    let (mut session, _) = shop.open();

    let first = session.get("Customer", 500_i64).unwrap().unwrap();
    session.evict(first).unwrap();
    assert!(!session.contains(first));

    let second = session.get("Customer", 500_i64).unwrap().unwrap();
    assert_ne!(first, second);
    assert_eq!(shop.customers.load_calls(), 2);
    assert_eq!(session.entity_state("Customer", first).unwrap(), EntityState::Detached);
}

#[test]
fn deleted_instance_is_not_returned_by_get() {
    let shop = shop();
    shop.nodes.insert_row(1_i64, vec![text("root"), PropertyValue::Null]);
    let (mut session, _) = shop.open();

    let node = session.get("Node", 1_i64).unwrap().unwrap();
    session.delete("Node", node).unwrap();
    assert_eq!(session.entity_state("Node", node).unwrap(), EntityState::Deleted);
    assert!(session.get("Node", 1_i64).unwrap().is_none());
    assert!(!session.contains(node));
}

#[test]
fn clear_detaches_everything() {
    let shop = shop();
    shop.seed_order(100, 500, &[101, 102]);
    let (mut session, _) = shop.open();

    let order = session.get("Order", 100_i64).unwrap().unwrap();
    assert!(!session.persistence_context().is_empty());
    session.clear();
    assert!(session.persistence_context().is_empty());
    assert!(!session.contains(order));
}

#[test]
fn cleared_proxy_is_reattached_with_its_owner() {
    let shop = shop();
    shop.seed_order(100, 500, &[]);
    let (mut session, batcher) = shop.open();

    let order = session.get("Order", 100_i64).unwrap().unwrap();
    let PropertyValue::Proxy(customer) = prop(&session, order, ORDER_CUSTOMER) else {
        panic!("customer is loaded lazily");
    };
    session.clear();
    assert!(!session.persistence_context().proxy(customer).unwrap().is_attached());
    assert!(matches!(session.initialize_proxy(customer), Err(Error::IllegalState(_))));

    set(&mut session, order, ORDER_NUMBER, text("A-100-edited"));
    session.save_or_update("Order", order).unwrap();
    assert!(session.contains(customer));
    session.flush().unwrap();
    assert_eq!(batcher.labels(), vec!["update Order#100"]);

    let loaded = session.initialize_proxy(customer).unwrap();
    assert_eq!(prop(&session, loaded, CUSTOMER_NAME), text("customer-500"));
}
