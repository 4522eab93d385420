//! Queue of pending writes for one unit of work.
//!
//! Actions are kept in one list per category and always drained in the
//! same order:
//!
//! 1. entity inserts
//! 2. entity updates
//! 3. collection removals
//! 4. collection updates
//! 5. collection (re)creations
//! 6. entity deletes
//!
//! Each category is executed completely, followed by a batch flush, before
//! the next one starts. Within a category the order can be tuned for
//! statement batching: inserts are regrouped by entity type without
//! breaking foreign-key order, and updates and collection actions can be
//! sorted by entity name and key.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use unitwork_core::{Error, InstanceId, MetadataRegistry, PropertyValue, Result, UpdateTimestampsCache};

use crate::action::{Action, Batcher, BulkCleanupAction, CollectionAction, EntityDeleteAction, EntityInsertAction, EntityUpdateAction};
use crate::persistence_context::PersistenceContext;

/// Callback run once the transaction has completed. Receives whether it
/// committed.
pub type AfterCompletionFn = Box<dyn FnMut(bool) + Send>;

/// Pending writes, grouped by category.
#[derive(Default)]
pub struct ActionQueue {
    insertions: Vec<EntityInsertAction>,
    updates: Vec<EntityUpdateAction>,
    deletions: Vec<EntityDeleteAction>,
    collection_creations: Vec<CollectionAction>,
    collection_updates: Vec<CollectionAction>,
    collection_removals: Vec<CollectionAction>,

    /// Executed actions waiting for transaction completion.
    executions: Vec<Action>,
    after_completion_processes: Vec<AfterCompletionFn>,
    query_spaces_to_invalidate: BTreeSet<String>,

    order_inserts: bool,
    order_updates: bool,
    query_cache_enabled: bool,
}

impl ActionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Regroup inserts by entity type before execution.
    #[must_use]
    pub const fn order_inserts(mut self, enabled: bool) -> Self {
        self.order_inserts = enabled;
        self
    }

    /// Sort updates and collection actions by entity name and key.
    #[must_use]
    pub const fn order_updates(mut self, enabled: bool) -> Self {
        self.order_updates = enabled;
        self
    }

    /// Keep executed actions for query-cache invalidation.
    #[must_use]
    pub const fn query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Queue an action in its category.
    ///
    /// Bulk cleanup actions are not queued: they are registered for
    /// completion straight away (see [`ActionQueue::add_cleanup_action`]).
    pub fn add_action(&mut self, action: Action, timestamps: Option<&dyn UpdateTimestampsCache>) -> Result<()> {
        tracing::trace!(action = %action, "scheduling action");
        match action {
            Action::Insert(a) => self.insertions.push(a),
            Action::Update(a) => self.updates.push(a),
            Action::Delete(a) => self.deletions.push(a),
            Action::CollectionRecreate(a) => self.collection_creations.push(a),
            Action::CollectionRemove(a) => self.collection_removals.push(a),
            Action::CollectionUpdate(a) => self.collection_updates.push(a),
            Action::CleanupBatch(a) => self.add_cleanup_action(a, timestamps)?,
        }
        Ok(())
    }

    /// Register cache cleanup for a bulk statement over `spaces`.
    pub fn add_cleanup_action(
        &mut self,
        action: BulkCleanupAction,
        timestamps: Option<&dyn UpdateTimestampsCache>,
    ) -> Result<()> {
        if self.query_cache_enabled {
            if let Some(timestamps) = timestamps {
                timestamps.pre_invalidate(&action.spaces)?;
            }
            self.query_spaces_to_invalidate.extend(action.spaces.iter().cloned());
        }
        self.executions.push(Action::CleanupBatch(action));
        Ok(())
    }

    /// Run `process` once the transaction completes.
    pub fn register_process(&mut self, process: impl FnMut(bool) + Send + 'static) {
        self.after_completion_processes.push(Box::new(process));
    }

    /// Drop the queued deletion of `instance`, returning it.
    pub fn un_schedule_deletion(&mut self, instance: InstanceId) -> Result<EntityDeleteAction> {
        let position = self
            .deletions
            .iter()
            .position(|a| a.instance == instance)
            .ok_or_else(|| Error::assertion("Unable to find deleted entity to un-schedule"))?;
        Ok(self.deletions.remove(position))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Apply the configured intra-category ordering.
    pub fn sort_actions(&mut self) {
        if self.order_inserts && self.insertions.len() > 1 {
            InsertActionSorter::sort(&mut self.insertions);
        }
        if self.order_updates {
            self.updates
                .sort_by(|a, b| a.entity_name.cmp(&b.entity_name).then_with(|| a.id.sort_cmp(&b.id)));
            let by_role_and_key =
                |a: &CollectionAction, b: &CollectionAction| a.role.cmp(&b.role).then_with(|| a.key.sort_cmp(&b.key));
            self.collection_removals.sort_by(by_role_and_key);
            self.collection_updates.sort_by(by_role_and_key);
            self.collection_creations.sort_by(by_role_and_key);
        }
    }

    /// Execute every queued action in category order.
    #[tracing::instrument(level = "debug", skip_all, fields(pending = self.len()))]
    pub fn execute_actions(
        &mut self,
        context: &mut PersistenceContext,
        batcher: &mut dyn Batcher,
        timestamps: Option<&dyn UpdateTimestampsCache>,
    ) -> Result<()> {
        let insertions = std::mem::take(&mut self.insertions);
        self.execute_category(insertions.into_iter().map(Action::Insert), context, batcher, timestamps)?;

        let updates = std::mem::take(&mut self.updates);
        self.execute_category(updates.into_iter().map(Action::Update), context, batcher, timestamps)?;

        let removals = std::mem::take(&mut self.collection_removals);
        self.execute_category(removals.into_iter().map(Action::CollectionRemove), context, batcher, timestamps)?;

        let updates = std::mem::take(&mut self.collection_updates);
        self.execute_category(updates.into_iter().map(Action::CollectionUpdate), context, batcher, timestamps)?;

        let creations = std::mem::take(&mut self.collection_creations);
        self.execute_category(creations.into_iter().map(Action::CollectionRecreate), context, batcher, timestamps)?;

        let deletions = std::mem::take(&mut self.deletions);
        self.execute_category(deletions.into_iter().map(Action::Delete), context, batcher, timestamps)?;

        Ok(())
    }

    fn execute_category(
        &mut self,
        actions: impl Iterator<Item = Action>,
        context: &mut PersistenceContext,
        batcher: &mut dyn Batcher,
        timestamps: Option<&dyn UpdateTimestampsCache>,
    ) -> Result<()> {
        let mut count = 0usize;
        for action in actions {
            self.execute(action, context, batcher, timestamps)?;
            count += 1;
        }
        batcher.execute_batch()?;
        if count > 0 {
            tracing::trace!(count, "executed action category");
        }
        Ok(())
    }

    fn execute(
        &mut self,
        action: Action,
        context: &mut PersistenceContext,
        batcher: &mut dyn Batcher,
        timestamps: Option<&dyn UpdateTimestampsCache>,
    ) -> Result<()> {
        if self.query_cache_enabled {
            if let Some(timestamps) = timestamps {
                timestamps.pre_invalidate(action.property_spaces())?;
            }
        }
        action.execute(context, batcher)?;
        if self.query_cache_enabled {
            self.query_spaces_to_invalidate
                .extend(action.property_spaces().iter().cloned());
        }
        if action.needs_after_transaction_completion() || self.query_cache_enabled {
            self.executions.push(action);
        }
        Ok(())
    }

    /// Release cache locks and run completion callbacks.
    ///
    /// Every retained action gets its completion hook even if an earlier
    /// one fails with a cache error. Any other failure means locks were
    /// left behind and is fatal.
    #[tracing::instrument(level = "debug", skip(self, registry, timestamps))]
    pub fn after_transaction_completion(
        &mut self,
        success: bool,
        registry: &MetadataRegistry,
        timestamps: Option<&dyn UpdateTimestampsCache>,
    ) -> Result<()> {
        let executions = std::mem::take(&mut self.executions);
        for action in &executions {
            if let Err(err) = action.after_transaction_completion(success, registry) {
                if err.is_cache_error() {
                    tracing::warn!(action = %action, error = %err, "could not release a cache lock");
                    continue;
                }
                return Err(Error::assertion(format!("Exception releasing cache locks: {}", err)));
            }
        }

        for mut process in std::mem::take(&mut self.after_completion_processes) {
            process(success);
        }

        if self.query_cache_enabled && !self.query_spaces_to_invalidate.is_empty() {
            let spaces: Vec<String> = std::mem::take(&mut self.query_spaces_to_invalidate)
                .into_iter()
                .collect();
            if let Some(timestamps) = timestamps {
                timestamps.invalidate(&spaces)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Would executing the queue write to any of `spaces`?
    pub fn are_tables_to_be_updated(&self, spaces: &[String]) -> bool {
        let touches = |own: &[String]| own.iter().any(|s| spaces.contains(s));
        self.insertions.iter().any(|a| touches(&a.property_spaces))
            || self.updates.iter().any(|a| touches(&a.property_spaces))
            || self.deletions.iter().any(|a| touches(&a.property_spaces))
            || self.collection_creations.iter().any(|a| touches(&a.property_spaces))
            || self.collection_updates.iter().any(|a| touches(&a.property_spaces))
            || self.collection_removals.iter().any(|a| touches(&a.property_spaces))
    }

    pub fn has_any_queued_actions(&self) -> bool {
        self.len() > 0
    }

    pub fn are_insertions_or_deletions_queued(&self) -> bool {
        !self.insertions.is_empty() || !self.deletions.is_empty()
    }

    /// Is a delete queued for `instance`?
    pub fn is_deletion_scheduled(&self, instance: InstanceId) -> bool {
        self.deletions.iter().any(|a| a.instance == instance)
    }

    pub fn number_of_insertions(&self) -> usize {
        self.insertions.len()
    }

    pub fn number_of_updates(&self) -> usize {
        self.updates.len()
    }

    pub fn number_of_deletions(&self) -> usize {
        self.deletions.len()
    }

    pub fn number_of_collection_creations(&self) -> usize {
        self.collection_creations.len()
    }

    pub fn number_of_collection_updates(&self) -> usize {
        self.collection_updates.len()
    }

    pub fn number_of_collection_removals(&self) -> usize {
        self.collection_removals.len()
    }

    /// Number of executed actions waiting for transaction completion.
    pub fn number_of_executions(&self) -> usize {
        self.executions.len()
    }

    /// Total number of queued actions.
    pub fn len(&self) -> usize {
        self.insertions.len()
            + self.updates.len()
            + self.deletions.len()
            + self.collection_creations.len()
            + self.collection_updates.len()
            + self.collection_removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insertions(&self) -> &[EntityInsertAction] {
        &self.insertions
    }

    pub fn deletions(&self) -> &[EntityDeleteAction] {
        &self.deletions
    }

    // ========================================================================
    // Clearing
    // ========================================================================

    /// Drop the actions a flush-needed check scheduled.
    ///
    /// Collection removals queued before the check (up to
    /// `previous_collection_removal_count`) are kept.
    pub fn clear_from_flush_needed_check(&mut self, previous_collection_removal_count: usize) {
        self.collection_creations.clear();
        self.collection_updates.clear();
        self.updates.clear();
        self.collection_removals.truncate(previous_collection_removal_count);
    }

    /// Drop every queued action. Executed actions still get their
    /// completion hooks.
    pub fn clear(&mut self) {
        self.insertions.clear();
        self.updates.clear();
        self.deletions.clear();
        self.collection_creations.clear();
        self.collection_updates.clear();
        self.collection_removals.clear();
    }
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("insertions", &self.insertions.len())
            .field("updates", &self.updates.len())
            .field("deletions", &self.deletions.len())
            .field("collection_creations", &self.collection_creations.len())
            .field("collection_updates", &self.collection_updates.len())
            .field("collection_removals", &self.collection_removals.len())
            .field("executions", &self.executions.len())
            .field("after_completion_processes", &self.after_completion_processes.len())
            .finish()
    }
}

impl fmt::Display for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T>(f: &mut fmt::Formatter<'_>, name: &str, items: &[T], show: impl Fn(&T) -> String) -> fmt::Result {
            write!(f, "{}=[", name)?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", show(item))?;
            }
            write!(f, "]")
        }
        let entity = |name: &str, id: &unitwork_core::Value| format!("{}#{}", name, id);
        write!(f, "ActionQueue[")?;
        list(f, "insertions", &self.insertions, |a| entity(&a.entity_name, &a.id))?;
        list(f, " updates", &self.updates, |a| entity(&a.entity_name, &a.id))?;
        list(f, " deletions", &self.deletions, |a| entity(&a.entity_name, &a.id))?;
        list(f, " collectionCreations", &self.collection_creations, |a| entity(&a.role, &a.key))?;
        list(f, " collectionRemovals", &self.collection_removals, |a| entity(&a.role, &a.key))?;
        list(f, " collectionUpdates", &self.collection_updates, |a| entity(&a.role, &a.key))?;
        write!(f, "]")
    }
}

/// Regroups inserts into runs of one entity type.
///
/// Inserts arrive in an order that is already safe for foreign keys but
/// interleaves entity types. Each entity type gets a batch; an insert joins
/// the latest batch of its type unless its row references an instance
/// inserted in a later batch, in which case a new batch is opened for the
/// type at the end. The output is the concatenation of all batches.
///
/// Only direct entity references in the row state are examined, so a
/// dependency carried only by the other side of a one-to-one association is
/// not seen.
#[derive(Debug, Default)]
struct InsertActionSorter {
    /// Entity name to the number of its latest batch.
    latest_batches: HashMap<String, usize>,
    /// Instance to the batch it was placed in.
    entity_batch_number: HashMap<InstanceId, usize>,
    action_batches: Vec<Vec<EntityInsertAction>>,
}

impl InsertActionSorter {
    fn sort(insertions: &mut Vec<EntityInsertAction>) {
        let mut sorter = Self {
            entity_batch_number: HashMap::with_capacity(insertions.len() + 1),
            ..Self::default()
        };

        for action in insertions.drain(..) {
            let batch_number = match sorter.latest_batches.get(&action.entity_name).copied() {
                Some(latest) => sorter.find_batch_number(&action, latest),
                None => {
                    let batch_number = sorter.action_batches.len();
                    sorter
                        .latest_batches
                        .insert(action.entity_name.clone(), batch_number);
                    batch_number
                }
            };
            sorter.entity_batch_number.insert(action.instance, batch_number);
            sorter.add_to_batch(batch_number, action);
        }

        tracing::debug!(batches = sorter.action_batches.len(), "reordered inserts");
        insertions.extend(sorter.action_batches.into_iter().flatten());
    }

    /// Latest batch of the action's type, or a new one if the row refers to
    /// an instance placed after it.
    fn find_batch_number(&mut self, action: &EntityInsertAction, latest: usize) -> usize {
        for value in &action.state {
            let PropertyValue::Entity(referenced) = value else {
                continue;
            };
            if let Some(&association_batch) = self.entity_batch_number.get(referenced) {
                if association_batch > latest {
                    let batch_number = self.action_batches.len();
                    self.latest_batches
                        .insert(action.entity_name.clone(), batch_number);
                    return batch_number;
                }
            }
        }
        latest
    }

    fn add_to_batch(&mut self, batch_number: usize, action: EntityInsertAction) {
        if batch_number == self.action_batches.len() {
            self.action_batches.push(Vec::new());
        }
        if let Some(batch) = self.action_batches.get_mut(batch_number) {
            batch.push(action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use unitwork_core::{Arena, CacheError, CollectionId, Handle, RawHandle, Value};

    use crate::action::RecordingBatcher;

    struct Fixture {
        arena: Arena<InstanceId, ()>,
    }

    impl Fixture {
        fn new() -> Self {
            Self { arena: Arena::new() }
        }

        fn instance(&mut self) -> InstanceId {
            self.arena.insert(())
        }
    }

    fn insert(entity_name: &str, instance: InstanceId, id: i64, refs: &[InstanceId]) -> EntityInsertAction {
        EntityInsertAction {
            instance,
            entity_name: entity_name.to_string(),
            id: Value::BigInt(id),
            state: refs.iter().map(|r| PropertyValue::Entity(*r)).collect(),
            version: None,
            property_spaces: vec![entity_name.to_lowercase()],
            cached: false,
        }
    }

    fn names(actions: &[EntityInsertAction]) -> Vec<String> {
        actions.iter().map(|a| format!("{}{}", a.entity_name, a.id)).collect()
    }

    fn collection_action(role: &str, key: i64) -> CollectionAction {
        CollectionAction {
            collection: CollectionId::from_raw(RawHandle { index: 0, generation: 0 }),
            role: role.to_string(),
            key: Value::BigInt(key),
            property_spaces: vec![role.to_lowercase()],
        }
    }

    #[test]
    fn test_sorter_keeps_dependency_order() {
        let mut fx = Fixture::new();
        let (b1, a1) = (fx.instance(), fx.instance());
        let mut actions = vec![insert("B", b1, 1, &[]), insert("A", a1, 1, &[b1])];
        InsertActionSorter::sort(&mut actions);
        assert_eq!(names(&actions), vec!["B1", "A1"]);
    }

    #[test]
    fn test_sorter_opens_new_segment_for_late_dependency() {
        let mut fx = Fixture::new();
        let (a1, b1, a2) = (fx.instance(), fx.instance(), fx.instance());
        let mut actions = vec![
            insert("A", a1, 1, &[]),
            insert("B", b1, 1, &[]),
            insert("A", a2, 2, &[b1]),
        ];
        InsertActionSorter::sort(&mut actions);
        assert_eq!(names(&actions), vec!["A1", "B1", "A2"]);
    }

    #[test]
    fn test_sorter_groups_independent_runs() {
        let mut fx = Fixture::new();
        let (o1, o2, c1, o3) = (fx.instance(), fx.instance(), fx.instance(), fx.instance());
        let mut actions = vec![
            insert("Order", o1, 1, &[]),
            insert("Order", o2, 2, &[]),
            insert("Customer", c1, 1, &[]),
            insert("Order", o3, 3, &[]),
        ];
        InsertActionSorter::sort(&mut actions);
        assert_eq!(names(&actions), vec!["Order1", "Order2", "Order3", "Customer1"]);
    }

    #[test]
    fn test_sorter_reference_to_earlier_batch_merges() {
        let mut fx = Fixture::new();
        let (c1, o1, c2, o2) = (fx.instance(), fx.instance(), fx.instance(), fx.instance());
        // o2 refers to c1, whose batch precedes Order's latest batch
        let mut actions = vec![
            insert("Customer", c1, 1, &[]),
            insert("Order", o1, 1, &[c1]),
            insert("Customer", c2, 2, &[]),
            insert("Order", o2, 2, &[c1]),
        ];
        InsertActionSorter::sort(&mut actions);
        assert_eq!(names(&actions), vec!["Customer1", "Customer2", "Order1", "Order2"]);
    }

    #[test]
    fn test_execute_actions_category_order() {
        let mut context = PersistenceContext::default();
        let mut queue = ActionQueue::new();
        let mut batcher = RecordingBatcher::new();

        queue
            .add_action(Action::CollectionRecreate(collection_action("Order.lines", 1)), None)
            .unwrap();
        queue
            .add_action(Action::CollectionUpdate(collection_action("Order.lines", 2)), None)
            .unwrap();
        queue
            .add_action(Action::CollectionRemove(collection_action("Order.lines", 3)), None)
            .unwrap();
        assert_eq!(queue.len(), 3);

        queue.execute_actions(&mut context, &mut batcher, None).unwrap();
        assert_eq!(
            batcher.labels(),
            vec![
                "collection-remove Order.lines#3",
                "collection-update Order.lines#2",
                "collection-recreate Order.lines#1",
            ]
        );
        assert_eq!(batcher.batches().len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.number_of_executions(), 0);
    }

    #[test]
    fn test_order_updates_sorts_within_category() {
        let mut queue = ActionQueue::new().order_updates(true);
        for key in [3, 1, 2] {
            queue
                .add_action(Action::CollectionUpdate(collection_action("Order.lines", key)), None)
                .unwrap();
        }
        queue
            .add_action(Action::CollectionUpdate(collection_action("Customer.orders", 9)), None)
            .unwrap();
        queue.sort_actions();
        let keys: Vec<String> = queue
            .collection_updates
            .iter()
            .map(|a| format!("{}#{}", a.role, a.key))
            .collect();
        assert_eq!(
            keys,
            vec!["Customer.orders#9", "Order.lines#1", "Order.lines#2", "Order.lines#3"]
        );
    }

    #[test]
    fn test_un_schedule_deletion() {
        let mut fx = Fixture::new();
        let instance = fx.instance();
        let mut queue = ActionQueue::new();
        let delete = EntityDeleteAction {
            instance,
            entity_name: "Order".to_string(),
            id: Value::BigInt(1),
            version: None,
            state: Vec::new(),
            orphan: false,
            property_spaces: vec!["order".to_string()],
            cached: false,
        };
        queue.add_action(Action::Delete(delete), None).unwrap();
        assert!(queue.are_insertions_or_deletions_queued());
        assert!(queue.is_deletion_scheduled(instance));
        assert!(queue.are_tables_to_be_updated(&["order".to_string()]));
        assert!(!queue.are_tables_to_be_updated(&["customer".to_string()]));

        assert_eq!(queue.un_schedule_deletion(instance).unwrap().instance, instance);
        assert!(queue.un_schedule_deletion(instance).unwrap_err().is_fatal());
    }

    #[test]
    fn test_clear_from_flush_needed_check_keeps_earlier_removals() {
        let mut queue = ActionQueue::new();
        queue
            .add_action(Action::CollectionRemove(collection_action("Order.lines", 1)), None)
            .unwrap();
        let before = queue.number_of_collection_removals();
        queue
            .add_action(Action::CollectionRemove(collection_action("Order.lines", 2)), None)
            .unwrap();
        queue
            .add_action(Action::CollectionUpdate(collection_action("Order.lines", 3)), None)
            .unwrap();
        queue.clear_from_flush_needed_check(before);
        assert_eq!(queue.number_of_collection_removals(), 1);
        assert_eq!(queue.number_of_collection_updates(), 0);
    }

    #[derive(Debug, Default)]
    struct RecordingTimestamps {
        pre_invalidated: Mutex<Vec<String>>,
        invalidated: Mutex<Vec<String>>,
    }

    impl UpdateTimestampsCache for RecordingTimestamps {
        fn pre_invalidate(&self, spaces: &[String]) -> std::result::Result<(), CacheError> {
            self.pre_invalidated.lock().unwrap().extend(spaces.iter().cloned());
            Ok(())
        }

        fn invalidate(&self, spaces: &[String]) -> std::result::Result<(), CacheError> {
            self.invalidated.lock().unwrap().extend(spaces.iter().cloned());
            Ok(())
        }
    }

    #[test]
    fn test_query_cache_invalidation_and_processes() {
        let registry = MetadataRegistry::new();
        let timestamps = RecordingTimestamps::default();
        let mut context = PersistenceContext::default();
        let mut batcher = RecordingBatcher::new();
        let mut queue = ActionQueue::new().query_cache(true);
        queue
            .add_action(Action::CollectionUpdate(collection_action("Order.lines", 1)), Some(&timestamps))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        queue.register_process(move |success| {
            assert!(success);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        queue
            .execute_actions(&mut context, &mut batcher, Some(&timestamps))
            .unwrap();
        assert_eq!(*timestamps.pre_invalidated.lock().unwrap(), vec!["order.lines"]);
        assert_eq!(queue.number_of_executions(), 1);

        queue
            .after_transaction_completion(true, &registry, Some(&timestamps))
            .unwrap();
        assert_eq!(*timestamps.invalidated.lock().unwrap(), vec!["order.lines"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.number_of_executions(), 0);
    }

    #[test]
    fn test_display() {
        let mut queue = ActionQueue::new();
        queue
            .add_action(Action::CollectionRemove(collection_action("Order.lines", 4)), None)
            .unwrap();
        assert_eq!(
            queue.to_string(),
            "ActionQueue[insertions=[] updates=[] deletions=[] collectionCreations=[] \
             collectionRemovals=[Order.lines#4] collectionUpdates=[]]"
        );
    }
}
