mod common;

use std::collections::HashMap;

use common::*;
use proptest::prelude::*;
use unitwork::prelude::*;
use unitwork::{Action, EntityInsertAction};

fn ordered_shop() -> Shop {
    shop_with(SessionConfig::default().with_order_inserts(true))
}

/// An order with no customer and no lines.
fn bare_order(session: &mut Session, number: &str) -> InstanceId {
    let order = session.instantiate("Order", None).unwrap();
    set(session, order, ORDER_NUMBER, text(number));
    order
}

fn inserts(batcher: &RecordingBatcher) -> Vec<EntityInsertAction> {
    batcher
        .actions()
        .into_iter()
        .filter_map(|action| match action {
            Action::Insert(insert) => Some(insert),
            _ => None,
        })
        .collect()
}

#[test]
fn reference_to_an_earlier_insert_keeps_the_order() {
    let shop = ordered_shop();
    let (mut session, batcher) = shop.open();

    let order = bare_order(&mut session, "A-1");
    session.persist("Order", order).unwrap();
    let line = new_line(&mut session, "pen");
    set(&mut session, line, LINE_ORDER, order);
    session.persist("OrderLine", line).unwrap();
    session.flush().unwrap();

    assert_eq!(batcher.labels(), vec!["insert Order#1", "insert OrderLine#1"]);
}

#[test]
fn late_reference_opens_a_second_segment() {
    let shop = ordered_shop();
    let (mut session, batcher) = shop.open();

    let first = new_line(&mut session, "pen");
    session.persist("OrderLine", first).unwrap();
    let order = bare_order(&mut session, "A-1");
    session.persist("Order", order).unwrap();
    let second = new_line(&mut session, "ink");
    set(&mut session, second, LINE_ORDER, order);
    session.persist("OrderLine", second).unwrap();
    session.flush().unwrap();

    assert_eq!(
        batcher.labels(),
        vec!["insert OrderLine#1", "insert Order#1", "insert OrderLine#2"]
    );
}

#[test]
fn unrelated_inserts_are_grouped_by_entity() {
    let shop = ordered_shop();
    let (mut session, batcher) = shop.open();

    for number in ["A-1", "A-2"] {
        let order = bare_order(&mut session, number);
        session.persist("Order", order).unwrap();
    }
    let customer = new_customer(&mut session, "Ada");
    session.persist("Customer", customer).unwrap();
    let order = bare_order(&mut session, "A-3");
    session.persist("Order", order).unwrap();
    session.flush().unwrap();

    assert_eq!(
        batcher.labels(),
        vec!["insert Order#1", "insert Order#2", "insert Order#3", "insert Customer#1"]
    );
    assert_eq!(batcher.batches().len(), 1);
}

#[test]
fn inserts_keep_arrival_order_when_not_ordering() {
    let shop = shop();
    let (mut session, batcher) = shop.open();

    for number in ["A-1", "A-2"] {
        let order = bare_order(&mut session, number);
        session.persist("Order", order).unwrap();
    }
    let customer = new_customer(&mut session, "Ada");
    session.persist("Customer", customer).unwrap();
    let order = bare_order(&mut session, "A-3");
    session.persist("Order", order).unwrap();
    session.flush().unwrap();

    assert_eq!(
        batcher.labels(),
        vec!["insert Order#1", "insert Order#2", "insert Customer#1", "insert Order#3"]
    );
}

#[test]
fn cascaded_graphs_are_regrouped_parents_first() {
    let shop = ordered_shop();
    let (mut session, batcher) = shop.open();

    for (number, name) in [("A-1", "Ada"), ("A-2", "Grace")] {
        let customer = new_customer(&mut session, name);
        let line = new_line(&mut session, "pen");
        let order = new_order(&mut session, number, customer, &[line]);
        session.persist("Order", order).unwrap();
    }
    session.flush().unwrap();

    assert_eq!(
        batcher.labels(),
        vec![
            "insert Customer#1",
            "insert Customer#2",
            "insert Order#1",
            "insert Order#2",
            "insert OrderLine#1",
            "insert OrderLine#2",
            "collection-recreate Order.lines#1",
            "collection-recreate Order.lines#2",
        ]
    );
}

/// `true` persists a customer; `false` persists an order, referencing the
/// customer picked by the second field if there is one.
fn persist_all(session: &mut Session, ops: &[(bool, Option<u8>)]) {
    let mut customers = Vec::new();
    for (i, &(is_customer, pick)) in ops.iter().enumerate() {
        if is_customer {
            let customer = new_customer(session, &format!("c{}", i));
            session.persist("Customer", customer).unwrap();
            customers.push(customer);
        } else {
            let order = bare_order(session, &format!("o{}", i));
            if let (Some(pick), false) = (pick, customers.is_empty()) {
                let customer = customers[usize::from(pick) % customers.len()];
                set(session, order, ORDER_CUSTOMER, customer);
            }
            session.persist("Order", order).unwrap();
        }
    }
}

proptest! {
    #[test]
    fn prop_reordering_respects_references(ops in prop::collection::vec((any::<bool>(), any::<Option<u8>>()), 1..32)) {
        let shop = ordered_shop();
        let (mut session, batcher) = shop.open();
        persist_all(&mut session, &ops);
        session.flush().unwrap();

        let inserts = inserts(&batcher);
        prop_assert_eq!(inserts.len(), ops.len());
        let position: HashMap<InstanceId, usize> =
            inserts.iter().enumerate().map(|(i, insert)| (insert.instance, i)).collect();
        for (i, insert) in inserts.iter().enumerate() {
            for value in &insert.state {
                if let PropertyValue::Entity(referenced) = value {
                    prop_assert!(position[referenced] < i, "{} precedes its reference", insert.entity_name);
                }
            }
        }
    }

    #[test]
    fn prop_unrelated_inserts_form_one_run_per_entity(kinds in prop::collection::vec(any::<bool>(), 1..32)) {
        let shop = ordered_shop();
        let (mut session, batcher) = shop.open();
        let ops: Vec<(bool, Option<u8>)> = kinds.iter().map(|&is_customer| (is_customer, None)).collect();
        persist_all(&mut session, &ops);
        session.flush().unwrap();

        let names: Vec<String> = inserts(&batcher).into_iter().map(|insert| insert.entity_name).collect();
        let mut runs = names.clone();
        runs.dedup();
        let mut distinct = runs.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(names.len(), kinds.len());
        prop_assert_eq!(runs.len(), distinct.len());
    }
}
