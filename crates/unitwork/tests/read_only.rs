mod common;

use common::*;
use unitwork::prelude::*;

const NOTE_TEXT: usize = 0;

fn note_row(text_value: &str) -> Vec<PropertyValue> {
    vec![text(text_value), text("ada")]
}

#[test]
fn read_only_entity_drops_its_snapshot() {
    let (factory, notes) = notes();
    notes.rows.insert_row(100_i64, note_row("hello"));
    let mut session = factory.open_session(RecordingBatcher::new());

    let note = session.get("Note", 100_i64).unwrap().unwrap();
    assert!(session.persistence_context().get_entry(note).unwrap().loaded_state().is_some());

    session.set_read_only(note, true).unwrap();
    assert!(session.is_read_only(note).unwrap());
    assert!(session.persistence_context().get_entry(note).unwrap().loaded_state().is_none());
}

#[test]
fn dirty_check_skips_read_only_entities_without_reading_them() {
    let (factory, notes) = notes();
    notes.rows.insert_row(100_i64, note_row("hello"));
    let mut session = factory.open_session(RecordingBatcher::new());

    let note = session.get("Note", 100_i64).unwrap().unwrap();
    session.set_read_only(note, true).unwrap();
    set(&mut session, note, NOTE_TEXT, text("changed"));

    notes.reset();
    assert!(!session.is_dirty(note).unwrap());
    assert_eq!(notes.reads(), 0);
}

#[test]
fn modified_read_only_entity_is_not_updated() {
    let (factory, notes) = notes();
    notes.rows.insert_row(100_i64, note_row("hello"));
    let batcher = RecordingBatcher::new();
    let mut session = factory.open_session(batcher.clone());

    let note = session.get("Note", 100_i64).unwrap().unwrap();
    session.set_read_only(note, true).unwrap();
    set(&mut session, note, NOTE_TEXT, text("changed"));
    session.flush().unwrap();
    assert!(batcher.actions().is_empty());
}

#[test]
fn making_modifiable_again_takes_a_fresh_snapshot() {
    let (factory, notes) = notes();
    notes.rows.insert_row(100_i64, note_row("hello"));
    let batcher = RecordingBatcher::new();
    let mut session = factory.open_session(batcher.clone());

    let note = session.get("Note", 100_i64).unwrap().unwrap();
    session.set_read_only(note, true).unwrap();
    set(&mut session, note, NOTE_TEXT, text("changed while read-only"));

    session.set_read_only(note, false).unwrap();
    assert!(!session.is_dirty(note).unwrap());
    session.flush().unwrap();
    assert!(batcher.actions().is_empty());

    set(&mut session, note, NOTE_TEXT, text("changed again"));
    assert!(session.is_dirty(note).unwrap());
    session.flush().unwrap();
    assert_eq!(batcher.labels(), vec!["update Note#100"]);
}

#[test]
fn default_read_only_applies_to_loaded_entities() {
    let (factory, notes) = notes();
    notes.rows.insert_row(100_i64, note_row("hello"));
    notes.rows.insert_row(200_i64, note_row("world"));
    let mut session = factory.open_session_with(
        RecordingBatcher::new(),
        SessionConfig::default().with_default_read_only(true),
    );

    let first = session.get("Note", 100_i64).unwrap().unwrap();
    assert!(session.is_read_only(first).unwrap());

    session.set_default_read_only(false);
    let second = session.get("Note", 200_i64).unwrap().unwrap();
    assert!(!session.is_read_only(second).unwrap());
    assert!(session.is_read_only(first).unwrap());
}

#[test]
fn proxy_read_only_follows_the_entity() {
    let shop = shop();
    shop.seed_order(100, 500, &[]);
    let (mut session, _) = shop.open();

    let EntityRef::Proxy(proxy) = session.load("Customer", 500_i64).unwrap() else {
        panic!("Customer is proxied");
    };
    let customer = session.initialize_proxy(proxy).unwrap();
    session.set_read_only(customer, true).unwrap();
    assert!(session.is_read_only(EntityRef::Proxy(proxy)).unwrap());

    session.set_read_only(EntityRef::Proxy(proxy), false).unwrap();
    assert!(!session.is_read_only(customer).unwrap());
}

#[test]
fn immutable_entity_cannot_be_made_modifiable() {
    let countries = Arc::new(MemoryEntityPersister::new(
        EntityMetadata::new("Country")
            .property(PropertyInfo::scalar("name"))
            .immutable(),
    ));
    let factory = SessionFactory::builder().entity(countries.clone()).build().unwrap();
    countries.insert_row(1_i64, vec![text("Norway")]);
    let mut session = factory.open_session(RecordingBatcher::new());

    let country = session.get("Country", 1_i64).unwrap().unwrap();
    assert!(session.is_read_only(country).unwrap());
    let err = session.set_read_only(country, false).unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
}
