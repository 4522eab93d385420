//! Shared mappings and helpers for the integration tests.

#![allow(dead_code)] // not every test file uses every fixture

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use unitwork::prelude::*;
use unitwork::CascadeKind;

pub const CUSTOMER_NAME: usize = 0;

pub const ORDER_NUMBER: usize = 0;
pub const ORDER_VERSION: usize = 1;
pub const ORDER_CUSTOMER: usize = 2;
pub const ORDER_LINES: usize = 3;

pub const LINE_PRODUCT: usize = 0;
pub const LINE_ORDER: usize = 1;

pub const NODE_NAME: usize = 0;
pub const NODE_PARENT: usize = 1;

/// Customer -> Order -> OrderLine, plus a self-referencing Node.
pub struct Shop {
    pub factory: SessionFactory,
    pub customers: Arc<MemoryEntityPersister>,
    pub orders: Arc<MemoryEntityPersister>,
    pub lines: Arc<MemoryEntityPersister>,
    pub nodes: Arc<MemoryEntityPersister>,
    pub order_lines: Arc<MemoryCollectionPersister>,
}

pub fn customer_metadata() -> EntityMetadata {
    EntityMetadata::new("Customer")
        .property(PropertyInfo::scalar("name").not_null())
        .with_proxy()
}

pub fn order_metadata() -> EntityMetadata {
    EntityMetadata::new("Order")
        .property(PropertyInfo::scalar("number").not_null())
        .property(PropertyInfo::scalar("version"))
        .property(PropertyInfo::many_to_one("customer", "Customer").cascade(CascadeStyle::of(CascadeKind::Persist)))
        .property(PropertyInfo::collection("lines", "Order.lines").cascade(CascadeStyle::ALL_DELETE_ORPHAN))
        .versioned_by("version")
}

pub fn line_metadata() -> EntityMetadata {
    EntityMetadata::new("OrderLine")
        .property(PropertyInfo::scalar("product"))
        .property(PropertyInfo::many_to_one("order", "Order"))
}

pub fn node_metadata() -> EntityMetadata {
    EntityMetadata::new("Node")
        .property(PropertyInfo::scalar("name"))
        .property(PropertyInfo::many_to_one("parent", "Node").cascade(CascadeStyle::ALL))
}

pub fn shop() -> Shop {
    shop_with(SessionConfig::default())
}

pub fn shop_with(config: SessionConfig) -> Shop {
    build_shop(config, line_metadata())
}

/// The shop with order lines referenced through proxies.
pub fn proxied_lines_shop() -> Shop {
    build_shop(SessionConfig::default(), line_metadata().with_proxy())
}

fn build_shop(config: SessionConfig, lines: EntityMetadata) -> Shop {
    let customers = Arc::new(MemoryEntityPersister::new(customer_metadata()));
    let orders = Arc::new(MemoryEntityPersister::new(order_metadata()));
    let lines = Arc::new(MemoryEntityPersister::new(lines));
    let nodes = Arc::new(MemoryEntityPersister::new(node_metadata()));
    let order_lines = Arc::new(MemoryCollectionPersister::new(
        CollectionMetadata::new("Order.lines", "Order").of_entities("OrderLine"),
    ));
    let factory = SessionFactory::builder()
        .entity(customers.clone())
        .entity(orders.clone())
        .entity(lines.clone())
        .entity(nodes.clone())
        .collection(order_lines.clone())
        .config(config)
        .build()
        .expect("shop mapping is valid");
    Shop {
        factory,
        customers,
        orders,
        lines,
        nodes,
        order_lines,
    }
}

impl Shop {
    pub fn open(&self) -> (Session, RecordingBatcher) {
        let batcher = RecordingBatcher::new();
        (self.factory.open_session(batcher.clone()), batcher)
    }

    /// Store customer `customer_id`, order `order_id` at version 1 and one
    /// line per entry of `line_ids`.
    pub fn seed_order(&self, order_id: i64, customer_id: i64, line_ids: &[i64]) {
        self.customers
            .insert_row(customer_id, vec![text(&format!("customer-{}", customer_id))]);
        self.orders.insert_row(
            order_id,
            vec![
                text(&format!("A-{}", order_id)),
                PropertyValue::Scalar(Value::Int(1)),
                reference("Customer", customer_id),
                PropertyValue::Null,
            ],
        );
        for &line_id in line_ids {
            self.lines.insert_row(
                line_id,
                vec![text(&format!("product-{}", line_id)), reference("Order", order_id)],
            );
        }
        self.order_lines.set_elements(
            order_id,
            line_ids.iter().map(|&id| reference("OrderLine", id)).collect(),
        );
    }
}

pub fn text(s: &str) -> PropertyValue {
    PropertyValue::Scalar(Value::from(s))
}

/// A row's foreign key, as hydrated.
pub fn reference(entity_name: &str, id: i64) -> PropertyValue {
    PropertyValue::Unresolved {
        entity_name: entity_name.to_string(),
        id: Value::BigInt(id),
    }
}

pub fn set(session: &mut Session, instance: InstanceId, index: usize, value: impl Into<PropertyValue>) {
    session
        .persistence_context_mut()
        .instance_mut(instance)
        .expect("instance is registered")
        .set_property(index, value.into());
}

pub fn prop(session: &Session, instance: InstanceId, index: usize) -> PropertyValue {
    session
        .persistence_context()
        .instance(instance)
        .expect("instance is registered")
        .property(index)
}

/// A transient customer with a name.
pub fn new_customer(session: &mut Session, name: &str) -> InstanceId {
    let customer = session.instantiate("Customer", None).unwrap();
    set(session, customer, CUSTOMER_NAME, text(name));
    customer
}

/// A transient order for `customer` holding `lines`.
pub fn new_order(session: &mut Session, number: &str, customer: InstanceId, lines: &[InstanceId]) -> InstanceId {
    let order = session.instantiate("Order", None).unwrap();
    set(session, order, ORDER_NUMBER, text(number));
    set(session, order, ORDER_CUSTOMER, customer);
    let elements = lines.iter().map(|&line| PropertyValue::Entity(line)).collect();
    let collection = session.new_collection(CollectionKind::Bag, elements);
    set(session, order, ORDER_LINES, collection);
    for &line in lines {
        set(session, line, LINE_ORDER, order);
    }
    order
}

pub fn new_line(session: &mut Session, product: &str) -> InstanceId {
    let line = session.instantiate("OrderLine", None).unwrap();
    set(session, line, LINE_PRODUCT, text(product));
    line
}

/// Entity kinds of the executed actions, in order.
pub fn kinds(batcher: &RecordingBatcher) -> Vec<&'static str> {
    batcher.actions().iter().map(unitwork::Action::kind).collect()
}

// ============================================================================
// Property-read counting
// ============================================================================

/// Instance that counts every property read.
#[derive(Debug)]
pub struct CountingEntity {
    inner: DynamicEntity,
    reads: Arc<AtomicUsize>,
}

impl PropertyAccess for CountingEntity {
    fn entity_name(&self) -> &str {
        self.inner.entity_name()
    }

    fn identifier(&self) -> Option<Value> {
        self.inner.identifier()
    }

    fn set_identifier(&mut self, id: Value) {
        self.inner.set_identifier(id);
    }

    fn property_count(&self) -> usize {
        self.inner.property_count()
    }

    fn property(&self, index: usize) -> PropertyValue {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.property(index)
    }

    fn set_property(&mut self, index: usize, value: PropertyValue) {
        self.inner.set_property(index, value);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Persister handing out [`CountingEntity`] instances that share one
/// read counter.
#[derive(Debug)]
pub struct CountingPersister {
    pub rows: MemoryEntityPersister,
    pub reads: Arc<AtomicUsize>,
}

impl CountingPersister {
    pub fn new(metadata: EntityMetadata) -> Self {
        Self {
            rows: MemoryEntityPersister::new(metadata),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
    }
}

impl EntityPersister for CountingPersister {
    fn metadata(&self) -> &EntityMetadata {
        self.rows.metadata()
    }

    fn instantiate(&self, id: Option<&Value>) -> Box<dyn PropertyAccess> {
        let mut inner = DynamicEntity::new(&self.metadata().entity_name, self.metadata().properties.len());
        if let Some(id) = id {
            inner.set_identifier(id.clone());
        }
        Box::new(CountingEntity {
            inner,
            reads: Arc::clone(&self.reads),
        })
    }

    fn load_state(&self, id: &Value) -> Result<Option<Vec<PropertyValue>>> {
        self.rows.load_state(id)
    }

    fn generate_identifier(&self) -> Result<Value> {
        self.rows.generate_identifier()
    }
}

/// A factory mapping only `Note(text, author)` through a [`CountingPersister`].
pub fn notes() -> (SessionFactory, Arc<CountingPersister>) {
    let persister = Arc::new(CountingPersister::new(
        EntityMetadata::new("Note")
            .property(PropertyInfo::scalar("text"))
            .property(PropertyInfo::scalar("author")),
    ));
    let factory = SessionFactory::builder()
        .entity(persister.clone())
        .build()
        .expect("note mapping is valid");
    (factory, persister)
}
