//! Per-document subscriber sets, CRDT deep-observer attachment, and the
//! fan-out algorithm that turns CRDT events into typed callbacks (§4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;
use yrs::types::{EntryChange, Event, Events, PathSegment};

use crate::model::{DocumentMetadata, InternalDoc, RecordId};
use crate::refs::{DocumentRef, RecordRef};
use crate::schema::SchemaMapper;

/// An opaque, idempotent unsubscribe token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// A registry of boxed callbacks with stable registration order, used for
/// every subscriber set in [`SubscriptionGraph`]. Snapshotting before
/// iterating keeps unsubscribe-during-fan-out safe (§5 Cancellation).
struct CallbackRegistry<F: ?Sized> {
    next_id: AtomicU64,
    slots: RwLock<Vec<(u64, Arc<F>)>>,
}

impl<F: ?Sized> CallbackRegistry<F> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, callback: Arc<F>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.slots
            .write()
            .expect("callback registry lock poisoned")
            .push((id, callback));
        SubscriptionId(id)
    }

    fn remove(&self, id: SubscriptionId) {
        self.slots
            .write()
            .expect("callback registry lock poisoned")
            .retain(|(slot_id, _)| *slot_id != id.0);
    }

    fn snapshot(&self) -> Vec<Arc<F>> {
        self.slots
            .read()
            .expect("callback registry lock poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.slots.read().expect("callback registry lock poisoned").is_empty()
    }
}

type MetadataCb = dyn Fn(&DocumentMetadata) + Send + Sync;
type StateCb = dyn Fn(&DocumentRef) + Send + Sync;
type RecordSetCb = dyn Fn(&[RecordRef]) + Send + Sync;
type RecordChangedCb = dyn Fn(&Value) + Send + Sync;
type RecordDeletedCb = dyn Fn() + Send + Sync;

/// Per-model collection-level subscriber sets.
#[derive(Default)]
struct CollectionSubscribers {
    added: Option<CallbackRegistry<RecordSetCb>>,
    changed: Option<CallbackRegistry<RecordSetCb>>,
    deleted: Option<CallbackRegistry<RecordSetCb>>,
    observer: RwLock<Option<yrs::Subscription>>,
}

impl CollectionSubscribers {
    fn new() -> Self {
        Self {
            added: Some(CallbackRegistry::new()),
            changed: Some(CallbackRegistry::new()),
            deleted: Some(CallbackRegistry::new()),
            observer: RwLock::new(None),
        }
    }

    fn total_subscriber_count(&self) -> usize {
        [&self.added, &self.changed, &self.deleted]
            .into_iter()
            .flatten()
            .map(|r| if r.is_empty() { 0 } else { 1 })
            .sum()
    }
}

/// Per-record subscriber sets.
struct RecordSubscribers {
    changed: CallbackRegistry<RecordChangedCb>,
    deleted: CallbackRegistry<RecordDeletedCb>,
}

impl RecordSubscribers {
    fn new() -> Self {
        Self {
            changed: CallbackRegistry::new(),
            deleted: CallbackRegistry::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Subscriber bookkeeping and CRDT observer lifecycle for one document.
pub struct SubscriptionGraph {
    metadata: CallbackRegistry<MetadataCb>,
    state: CallbackRegistry<StateCb>,
    collections: RwLock<HashMap<String, CollectionSubscribers>>,
    records: RwLock<HashMap<(String, String), RecordSubscribers>>,
}

impl SubscriptionGraph {
    /// A fresh graph with no subscribers.
    pub fn new() -> Self {
        Self {
            metadata: CallbackRegistry::new(),
            state: CallbackRegistry::new(),
            collections: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Whether at least one metadata subscriber is currently installed.
    pub fn has_metadata_subscribers(&self) -> bool {
        !self.metadata.is_empty()
    }

    /// Total count across every subscriber kind (metadata excluded — it
    /// drives only the metadata status machine, never the data one).
    pub fn data_subscriber_count(&self) -> usize {
        let state = if self.state.is_empty() { 0 } else { 1 };
        let collections: usize = self
            .collections
            .read()
            .expect("collections lock poisoned")
            .values()
            .map(CollectionSubscribers::total_subscriber_count)
            .sum();
        let records: usize = self
            .records
            .read()
            .expect("records lock poisoned")
            .values()
            .filter(|r| !r.is_empty())
            .count();
        state + collections + records
    }

    /// Subscribe to metadata; replays immediately with `metadata` if
    /// already available.
    pub fn on_metadata(
        &self,
        callback: Arc<MetadataCb>,
        current: Option<&DocumentMetadata>,
    ) -> SubscriptionId {
        if let Some(metadata) = current {
            callback(metadata);
        }
        self.metadata.add(callback)
    }

    /// Unsubscribe a metadata callback.
    pub fn off_metadata(&self, id: SubscriptionId) {
        self.metadata.remove(id);
    }

    /// Notify every current metadata subscriber, e.g. once an async
    /// `fetchMetadata` resolves after they were already registered.
    pub fn notify_metadata(&self, metadata: &DocumentMetadata) {
        for cb in self.metadata.snapshot() {
            cb(metadata);
        }
    }

    /// Subscribe to document state; replayed once synchronously.
    pub fn on_state(&self, callback: Arc<StateCb>, doc_ref: &DocumentRef) -> SubscriptionId {
        callback(doc_ref);
        self.state.add(callback)
    }

    /// Unsubscribe a state callback.
    pub fn off_state(&self, id: SubscriptionId) {
        self.state.remove(id);
    }

    fn collections_entry<'a>(
        map: &'a mut HashMap<String, CollectionSubscribers>,
        model: &str,
    ) -> &'a mut CollectionSubscribers {
        map.entry(model.to_string()).or_insert_with(CollectionSubscribers::new)
    }

    /// Subscribe to `added` events for a model's collection.
    pub fn on_items_added(&self, model: &str, callback: Arc<RecordSetCb>) -> SubscriptionId {
        let mut map = self.collections.write().expect("collections lock poisoned");
        Self::collections_entry(&mut map, model).added.as_ref().unwrap().add(callback)
    }

    /// Subscribe to `changed` events for a model's collection.
    pub fn on_items_changed(&self, model: &str, callback: Arc<RecordSetCb>) -> SubscriptionId {
        let mut map = self.collections.write().expect("collections lock poisoned");
        Self::collections_entry(&mut map, model).changed.as_ref().unwrap().add(callback)
    }

    /// Subscribe to `deleted` events for a model's collection.
    pub fn on_items_deleted(&self, model: &str, callback: Arc<RecordSetCb>) -> SubscriptionId {
        let mut map = self.collections.write().expect("collections lock poisoned");
        Self::collections_entry(&mut map, model).deleted.as_ref().unwrap().add(callback)
    }

    /// Unsubscribe any of the three collection callback kinds.
    pub fn off_collection(&self, model: &str, kind: CollectionKind, id: SubscriptionId) {
        let map = self.collections.read().expect("collections lock poisoned");
        if let Some(subs) = map.get(model) {
            match kind {
                CollectionKind::Added => subs.added.as_ref().unwrap().remove(id),
                CollectionKind::Changed => subs.changed.as_ref().unwrap().remove(id),
                CollectionKind::Deleted => subs.deleted.as_ref().unwrap().remove(id),
            }
        }
    }

    /// Subscribe to a record's `changed` events; replayed once
    /// immediately iff the record currently exists.
    pub fn on_record_changed(
        &self,
        model: &str,
        id: &RecordId,
        callback: Arc<RecordChangedCb>,
        current: Option<&Value>,
    ) -> SubscriptionId {
        if let Some(value) = current {
            callback(value);
        }
        let mut map = self.records.write().expect("records lock poisoned");
        let key = (model.to_string(), id.as_str().to_string());
        map.entry(key).or_insert_with(RecordSubscribers::new).changed.add(callback)
    }

    /// Subscribe to a record's `deleted` event. Never replayed.
    pub fn on_record_deleted(
        &self,
        model: &str,
        id: &RecordId,
        callback: Arc<RecordDeletedCb>,
    ) -> SubscriptionId {
        let mut map = self.records.write().expect("records lock poisoned");
        let key = (model.to_string(), id.as_str().to_string());
        map.entry(key).or_insert_with(RecordSubscribers::new).deleted.add(callback)
    }

    /// Unsubscribe a record-level callback.
    pub fn off_record(&self, model: &str, id: &RecordId, kind: RecordKind, sub_id: SubscriptionId) {
        let map = self.records.read().expect("records lock poisoned");
        if let Some(subs) = map.get(&(model.to_string(), id.as_str().to_string())) {
            match kind {
                RecordKind::Changed => subs.changed.remove(sub_id),
                RecordKind::Deleted => subs.deleted.remove(sub_id),
            }
        }
    }

    /// Ensure a deep-observer is attached to `model`'s top-level map,
    /// installing one via `install` iff none is currently attached. The
    /// caller supplies the closure factory so it can capture a weak
    /// handle back to the owning `InternalDoc` without this module
    /// depending on engine wiring details.
    pub fn ensure_model_observer(
        &self,
        model: &str,
        install: impl FnOnce() -> yrs::Subscription,
    ) {
        let mut map = self.collections.write().expect("collections lock poisoned");
        let subs = Self::collections_entry(&mut map, model);
        let mut slot = subs.observer.write().expect("observer lock poisoned");
        if slot.is_none() {
            *slot = Some(install());
        }
    }

    /// Remove a model's deep-observer once it has no collection or record
    /// subscribers left.
    pub fn maybe_remove_model_observer(&self, model: &str) {
        let map = self.collections.read().expect("collections lock poisoned");
        let has_collection_subs = map
            .get(model)
            .map(|s| s.total_subscriber_count() > 0)
            .unwrap_or(false);
        let has_record_subs = self
            .records
            .read()
            .expect("records lock poisoned")
            .iter()
            .any(|((m, _), subs)| m == model && !subs.is_empty());
        if !has_collection_subs && !has_record_subs {
            if let Some(subs) = map.get(model) {
                *subs.observer.write().expect("observer lock poisoned") = None;
            }
        }
    }
}

impl Default for SubscriptionGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Which collection-level callback kind an unsubscribe targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// `added` callbacks.
    Added,
    /// `changed` callbacks.
    Changed,
    /// `deleted` callbacks.
    Deleted,
}

/// Which record-level callback kind an unsubscribe targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `changed` callbacks.
    Changed,
    /// `deleted` callbacks.
    Deleted,
}

/// Runs the fan-out algorithm (§4.3 steps 1-4) for one batch of CRDT
/// events on model `model_name`, belonging to `doc`. Invoked from the
/// deep-observer closure installed by `ensure_model_observer`.
///
/// `events` covers the whole subtree rooted at the model's top-level map:
/// an event whose path (relative to that root) is empty is a direct
/// insert/remove/update of a record's key, handled as before; an event
/// whose path starts with `Key(record_id)` is a mutation nested inside
/// that record's own map (a field write), reported as the whole record
/// having changed.
pub fn fan_out(doc: &InternalDoc, model_name: &str, txn: &yrs::TransactionMut, events: &Events) {
    let mut added = Vec::new();
    let mut changed = Vec::new();
    let mut deleted = Vec::new();

    for event in events.iter() {
        let Event::Map(map_event) = event else {
            continue;
        };
        let mut path = map_event.path(txn).into_iter();
        match path.next() {
            None => {
                for (key, change) in map_event.keys(txn).iter() {
                    let id = key.to_string();
                    match change {
                        EntryChange::Inserted(_) => added.push(id),
                        EntryChange::Updated(_, _) => changed.push(id),
                        EntryChange::Removed(_) => deleted.push(id),
                    }
                }
            }
            Some(PathSegment::Key(record_id)) => {
                changed.push(record_id.to_string());
            }
            Some(PathSegment::Index(_)) => {}
        }
    }
    // A single id in both added and changed within one batch is reported
    // only as added (§4.5 tie-break rule b). A record can also appear more
    // than once in `changed` itself when several of its fields were
    // written in the same batch, each its own nested-map event.
    changed.retain(|id| !added.contains(id));
    let mut seen = std::collections::HashSet::new();
    changed.retain(|id| seen.insert(id.clone()));

    let doc_ref = doc.refs.doc_ref(&doc.id, &doc.schema);

    let to_refs = |ids: &[String]| -> Vec<RecordRef> {
        ids.iter()
            .map(|id| doc.refs.record_ref(&doc_ref, model_name, &RecordId::new(id.clone())))
            .collect()
    };

    let added_refs = to_refs(&added);
    let changed_refs = to_refs(&changed);
    let deleted_refs = to_refs(&deleted);

    let collections = doc.subscriptions.collections.read().expect("collections lock poisoned");
    if let Some(subs) = collections.get(model_name) {
        if !added_refs.is_empty() {
            for cb in subs.added.as_ref().unwrap().snapshot() {
                cb(&added_refs);
            }
        }
        if !changed_refs.is_empty() {
            for cb in subs.changed.as_ref().unwrap().snapshot() {
                cb(&changed_refs);
            }
        }
        if !deleted_refs.is_empty() {
            for cb in subs.deleted.as_ref().unwrap().snapshot() {
                cb(&deleted_refs);
            }
        }
    }
    drop(collections);

    for id in changed.iter().chain(added.iter()) {
        let key = (model_name.to_string(), id.clone());
        let snapshot_value = SchemaMapper::get_record(&doc.replica, model_name, &RecordId::new(id.clone()));
        if let Some(value) = snapshot_value {
            let records = doc.subscriptions.records.read().expect("records lock poisoned");
            if let Some(subs) = records.get(&key) {
                for cb in subs.changed.snapshot() {
                    cb(&value);
                }
            }
        }
    }
    for id in &deleted {
        let key = (model_name.to_string(), id.clone());
        let records = doc.subscriptions.records.read().expect("records lock poisoned");
        if let Some(subs) = records.get(&key) {
            for cb in subs.deleted.snapshot() {
                cb();
            }
        }
    }
}

/// Convenience used by the engine to install the deep observer for a
/// model the first time a collection or record subscriber appears.
pub fn install_model_observer(doc: &Weak<InternalDoc>, model_name: String) -> yrs::Subscription {
    let doc_for_replica = doc.upgrade().expect("document dropped while installing observer");
    let model_for_closure = model_name.clone();
    let doc_weak = doc.clone();
    doc_for_replica
        .replica
        .observe_model(&model_name, move |txn, events| {
            if let Some(doc) = doc_weak.upgrade() {
                fan_out(&doc, &model_for_closure, txn, events);
            }
        })
}
