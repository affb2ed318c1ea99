//! Owns `docId → InternalDoc`; exposes create/search/snapshot/edit/
//! transaction; wires SchemaMapper, RefRegistry, SubscriptionGraph and
//! StatusMachine together, abstracted over the transport (§4.5).

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;

use crate::config::EngineConfig;
use crate::crdt::EditOrigin;
use crate::error::StateCoreError;
use crate::model::{DocumentId, DocumentMetadata, EditDescription, InternalDoc, Schema};
use crate::refs::{self, DocumentRef, RecordCollectionRef, RecordRef};
use crate::schema::SchemaMapper;
use crate::subscription::{install_model_observer, CollectionKind, RecordKind, SubscriptionId};
use crate::sync::transport::SearchQuery;
use crate::sync::SyncDriver;

/// `{data:[{id, ...metadata}], nextPageToken?}`.
pub struct SearchPage {
    /// Matching document ids and metadata.
    pub data: Vec<(DocumentId, DocumentMetadata)>,
    /// Continuation token, if more pages remain.
    pub next_page_token: Option<String>,
}

/// The central orchestrator. Single-threaded cooperative per document
/// (§5): callers are expected to drive one engine from one task.
pub struct DocumentEngine {
    config: EngineConfig,
    docs: RwLock<HashMap<DocumentId, Arc<InternalDoc>>>,
    sync_drivers: RwLock<HashMap<DocumentId, Arc<SyncDriver>>>,
    client_id: String,
}

impl DocumentEngine {
    /// Construct an engine from `config`.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            docs: RwLock::new(HashMap::new()),
            sync_drivers: RwLock::new(HashMap::new()),
            client_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Look up (or create) the document for `id`, checking on every call
    /// that `schema` structurally matches the one the document was opened
    /// with — a `docRef` reused with a differently-shaped schema is a
    /// caller bug, not a silent no-op.
    fn doc_entry(&self, id: &DocumentId, schema: &Schema) -> Result<Arc<InternalDoc>, StateCoreError> {
        if let Some(doc) = self.docs.read().expect("docs lock poisoned").get(id) {
            if &doc.schema != schema {
                return Err(StateCoreError::SchemaMismatch { doc_id: id.to_string() });
            }
            return Ok(doc.clone());
        }
        let mut docs = self.docs.write().expect("docs lock poisoned");
        if let Some(doc) = docs.get(id) {
            if &doc.schema != schema {
                return Err(StateCoreError::SchemaMismatch { doc_id: id.to_string() });
            }
            return Ok(doc.clone());
        }
        let doc = Arc::new(InternalDoc::new(id.clone(), schema.clone()));
        SchemaMapper::initialize_document(&doc.replica, &doc.schema);
        docs.insert(id.clone(), doc.clone());
        Ok(doc)
    }

    fn driver_for(&self, doc: &Arc<InternalDoc>) -> Arc<SyncDriver> {
        if let Some(driver) = self.sync_drivers.read().expect("drivers lock poisoned").get(&doc.id) {
            return driver.clone();
        }
        let mut drivers = self.sync_drivers.write().expect("drivers lock poisoned");
        drivers
            .entry(doc.id.clone())
            .or_insert_with(|| {
                let transport = self.config.transport_factory.open(&doc.id);
                SyncDriver::new(
                    transport,
                    Arc::downgrade(doc),
                    self.client_id.clone(),
                    self.config.ignore_self_presence,
                )
            })
            .clone()
    }

    /// Returns the stable `DocumentRef` for `id`. Does not load anything.
    /// Fails with `SchemaMismatch` if `id` is already open under a
    /// structurally different schema.
    pub fn create_doc_ref(&self, id: DocumentId, schema: Schema) -> Result<DocumentRef, StateCoreError> {
        let doc = self.doc_entry(&id, &schema)?;
        Ok(doc.refs.doc_ref(&doc.id, &doc.schema))
    }

    /// Allocate a fresh id, seed the CRDT, and return a `DocumentRef` with
    /// metadata already LOADED.
    pub async fn create_document(
        &self,
        metadata: DocumentMetadata,
        schema: Schema,
    ) -> Result<DocumentRef, StateCoreError> {
        let id = self
            .config
            .transport_factory
            .create_document(metadata.clone(), &schema)
            .await
            .map_err(|e| StateCoreError::CreateFailed(e.to_string()))?;

        let doc = self.doc_entry(&id, &schema)?;
        *doc.metadata.write().expect("metadata lock poisoned") = Some(metadata);
        doc.metadata_status.set_load(crate::model::LoadState::Loaded, None);
        Ok(doc.refs.doc_ref(&doc.id, &doc.schema))
    }

    /// Search existing documents of `type_name`.
    pub async fn search_documents(
        &self,
        type_name: &str,
        schema: &Schema,
        query: SearchQuery,
    ) -> Result<SearchPage, StateCoreError> {
        let result = self
            .config
            .transport_factory
            .search_documents(type_name, schema, query)
            .await
            .map_err(|e| StateCoreError::SearchFailed(e.to_string()))?;
        Ok(SearchPage { data: result.data, next_page_token: result.next_page_token })
    }

    fn doc_for_ref(&self, doc_ref: &DocumentRef) -> Result<Arc<InternalDoc>, StateCoreError> {
        if refs::is_invalid_doc_ref(doc_ref) {
            return Err(StateCoreError::InvalidRef);
        }
        self.docs
            .read()
            .expect("docs lock poisoned")
            .get(doc_ref.id())
            .cloned()
            .ok_or_else(|| StateCoreError::DocumentMissing(doc_ref.id().to_string()))
    }

    /// The current logical document state as a plain tree, reflecting the
    /// local replica only — never blocks on remote state.
    pub fn get_document_snapshot(&self, doc_ref: &DocumentRef) -> Result<Value, StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let mut models = serde_json::Map::new();
        for model_name in doc.schema.record_model_names() {
            let mut records = serde_json::Map::new();
            for id in SchemaMapper::list_record_ids(&doc.replica, model_name) {
                if let Some(value) = SchemaMapper::get_record(&doc.replica, model_name, &id) {
                    records.insert(id.0, value);
                }
            }
            models.insert(model_name.to_string(), Value::Object(records));
        }
        Ok(Value::Object(models))
    }

    /// The stable collection ref for `model`.
    pub fn get_records(&self, doc_ref: &DocumentRef, model: &str) -> Result<RecordCollectionRef, StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        Ok(doc.refs.collection_ref(doc_ref, model))
    }

    /// The stable record ref and current value for `id`, if it exists.
    pub fn get_record(&self, collection: &RecordCollectionRef, id: &crate::model::RecordId) -> Option<Value> {
        let doc = self.docs.read().expect("docs lock poisoned").get(collection.doc_ref().id()).cloned()?;
        SchemaMapper::get_record(&doc.replica, collection.model(), id)
    }

    /// O(1) existence check over the schema mapper.
    pub fn has_record(&self, collection: &RecordCollectionRef, id: &crate::model::RecordId) -> bool {
        match self.docs.read().expect("docs lock poisoned").get(collection.doc_ref().id()) {
            Some(doc) => SchemaMapper::has_record(&doc.replica, collection.model(), id),
            None => false,
        }
    }

    /// Mint (or reuse) the stable `RecordRef` for `id` within `collection`.
    pub fn create_record_ref(&self, collection: &RecordCollectionRef, id: &crate::model::RecordId) -> RecordRef {
        let doc = self.docs.read().expect("docs lock poisoned").get(collection.doc_ref().id()).cloned();
        match doc {
            Some(doc) => doc.refs.record_ref(collection.doc_ref(), collection.model(), id),
            None => refs::invalid_record_ref(),
        }
    }

    /// The `EditOrigin` a mutation should carry: the active
    /// `withTransaction` description if one is open, else a plain local
    /// edit.
    fn current_origin(doc: &InternalDoc) -> EditOrigin {
        match doc.active_transaction.read().expect("txn lock poisoned").description.clone() {
            Some(EditDescription { model, data }) => EditOrigin::LocalDescribed { model, data },
            None => EditOrigin::Local,
        }
    }

    /// Full-replacement write.
    pub fn set_record(
        &self,
        doc_ref: &DocumentRef,
        model: &str,
        id: &crate::model::RecordId,
        value: &Value,
    ) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let origin = Self::current_origin(&doc);
        SchemaMapper::set_record_with_origin(&doc.replica, model, id, value, origin);
        Ok(())
    }

    /// Merge write; no-change on a missing record.
    pub fn update_record(
        &self,
        doc_ref: &DocumentRef,
        model: &str,
        id: &crate::model::RecordId,
        partial: &Value,
    ) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let origin = Self::current_origin(&doc);
        if !SchemaMapper::update_record_with_origin(&doc.replica, model, id, partial, origin) {
            return Err(StateCoreError::RecordMissing { model: model.to_string(), id: id.to_string() });
        }
        Ok(())
    }

    /// Idempotent delete.
    pub fn delete_record(&self, doc_ref: &DocumentRef, model: &str, id: &crate::model::RecordId) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let origin = Self::current_origin(&doc);
        SchemaMapper::delete_record_with_origin(&doc.replica, model, id, origin);
        Ok(())
    }

    /// Run `f` as one atomic transaction, optionally labelled with
    /// `description` for the activity feed. Nested calls on the same
    /// document reuse the outer label; mutations inside `f` still each
    /// commit through the schema mapper's per-operation transaction, but
    /// share one CRDT transaction origin so the sync driver emits a
    /// single activity annotation for the whole edit.
    pub fn with_transaction<R>(
        &self,
        doc_ref: &DocumentRef,
        description: Option<EditDescription>,
        f: impl FnOnce() -> R,
    ) -> Result<R, StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        {
            let mut state = doc.active_transaction.write().expect("txn lock poisoned");
            if state.depth == 0 {
                state.description = description;
            }
            state.depth += 1;
        }
        let result = f();
        {
            let mut state = doc.active_transaction.write().expect("txn lock poisoned");
            state.depth -= 1;
            if state.depth == 0 {
                state.description = None;
            }
        }
        Ok(result)
    }

    /// Broadcast an ephemeral custom presence event; not persisted.
    pub async fn update_custom_presence(&self, doc_ref: &DocumentRef, user_id: String, model: &str, data: Value) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let driver = self.driver_for(&doc);
        driver.update_custom_presence(user_id, model.to_string(), data).await;
        Ok(())
    }

    /// Subscribe to metadata; replayed immediately if already available.
    pub fn on_metadata(&self, doc_ref: &DocumentRef, callback: Arc<dyn Fn(&DocumentMetadata) + Send + Sync>) -> Result<SubscriptionId, StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let current = doc.metadata.read().expect("metadata lock poisoned").clone();
        let was_empty = !doc.subscriptions.has_metadata_subscribers();
        let id = doc.subscriptions.on_metadata(callback, current.as_ref());
        if was_empty {
            self.open_metadata(&doc);
        }
        Ok(id)
    }

    /// Unsubscribe a metadata callback.
    pub fn off_metadata(&self, doc_ref: &DocumentRef, id: SubscriptionId) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        doc.subscriptions.off_metadata(id);
        if !doc.subscriptions.has_metadata_subscribers() {
            self.close_metadata(&doc);
        }
        Ok(())
    }

    /// Subscribe to document state; replayed once synchronously.
    pub fn on_state(&self, doc_ref: &DocumentRef, callback: Arc<dyn Fn(&DocumentRef) + Send + Sync>) -> Result<SubscriptionId, StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let before = doc.subscriptions.data_subscriber_count();
        let id = doc.subscriptions.on_state(callback, doc_ref);
        if before == 0 {
            self.open_data(&doc);
        }
        Ok(id)
    }

    /// Unsubscribe a state callback.
    pub fn off_state(&self, doc_ref: &DocumentRef, id: SubscriptionId) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        doc.subscriptions.off_state(id);
        if doc.subscriptions.data_subscriber_count() == 0 {
            self.close_data(&doc);
        }
        Ok(())
    }

    /// Subscribe to `added` events for `collection`'s model, installing
    /// the CRDT deep-observer if this is the first subscriber.
    pub fn on_items_added(&self, collection: &RecordCollectionRef, callback: Arc<dyn Fn(&[RecordRef]) + Send + Sync>) -> Result<SubscriptionId, StateCoreError> {
        self.with_collection_subscription(collection, |doc| {
            doc.subscriptions.on_items_added(collection.model(), callback)
        })
    }

    /// Subscribe to `changed` events for `collection`'s model.
    pub fn on_items_changed(&self, collection: &RecordCollectionRef, callback: Arc<dyn Fn(&[RecordRef]) + Send + Sync>) -> Result<SubscriptionId, StateCoreError> {
        self.with_collection_subscription(collection, |doc| {
            doc.subscriptions.on_items_changed(collection.model(), callback)
        })
    }

    /// Subscribe to `deleted` events for `collection`'s model.
    pub fn on_items_deleted(&self, collection: &RecordCollectionRef, callback: Arc<dyn Fn(&[RecordRef]) + Send + Sync>) -> Result<SubscriptionId, StateCoreError> {
        self.with_collection_subscription(collection, |doc| {
            doc.subscriptions.on_items_deleted(collection.model(), callback)
        })
    }

    fn with_collection_subscription(
        &self,
        collection: &RecordCollectionRef,
        install: impl FnOnce(&Arc<InternalDoc>) -> SubscriptionId,
    ) -> Result<SubscriptionId, StateCoreError> {
        let doc = self
            .docs
            .read()
            .expect("docs lock poisoned")
            .get(collection.doc_ref().id())
            .cloned()
            .ok_or_else(|| StateCoreError::DocumentMissing(collection.doc_ref().id().to_string()))?;
        let before = doc.subscriptions.data_subscriber_count();
        let id = install(&doc);
        self.ensure_model_observer(&doc, collection.model());
        if before == 0 {
            self.open_data(&doc);
        }
        Ok(id)
    }

    /// Unsubscribe a collection-level callback, detaching the model's
    /// deep-observer if it was the last subscriber for that model.
    pub fn off_collection(&self, collection: &RecordCollectionRef, kind: CollectionKind, id: SubscriptionId) -> Result<(), StateCoreError> {
        let doc = self
            .docs
            .read()
            .expect("docs lock poisoned")
            .get(collection.doc_ref().id())
            .cloned()
            .ok_or_else(|| StateCoreError::DocumentMissing(collection.doc_ref().id().to_string()))?;
        doc.subscriptions.off_collection(collection.model(), kind, id);
        doc.subscriptions.maybe_remove_model_observer(collection.model());
        if doc.subscriptions.data_subscriber_count() == 0 {
            self.close_data(&doc);
        }
        Ok(())
    }

    /// Subscribe to a record's `changed` events; replayed once iff the
    /// record currently exists.
    pub fn on_record_changed(&self, record: &RecordRef, callback: Arc<dyn Fn(&Value) + Send + Sync>) -> Result<SubscriptionId, StateCoreError> {
        let doc = self.doc_for_record(record)?;
        let before = doc.subscriptions.data_subscriber_count();
        let current = SchemaMapper::get_record(&doc.replica, record.model(), record.id());
        let id = doc.subscriptions.on_record_changed(record.model(), record.id(), callback, current.as_ref());
        self.ensure_model_observer(&doc, record.model());
        if before == 0 {
            self.open_data(&doc);
        }
        Ok(id)
    }

    /// Subscribe to a record's `deleted` event. Never replayed.
    pub fn on_record_deleted(&self, record: &RecordRef, callback: Arc<dyn Fn() + Send + Sync>) -> Result<SubscriptionId, StateCoreError> {
        let doc = self.doc_for_record(record)?;
        let before = doc.subscriptions.data_subscriber_count();
        let id = doc.subscriptions.on_record_deleted(record.model(), record.id(), callback);
        self.ensure_model_observer(&doc, record.model());
        if before == 0 {
            self.open_data(&doc);
        }
        Ok(id)
    }

    /// Unsubscribe a record-level callback.
    pub fn off_record(&self, record: &RecordRef, kind: RecordKind, id: SubscriptionId) -> Result<(), StateCoreError> {
        let doc = self.doc_for_record(record)?;
        doc.subscriptions.off_record(record.model(), record.id(), kind, id);
        doc.subscriptions.maybe_remove_model_observer(record.model());
        if doc.subscriptions.data_subscriber_count() == 0 {
            self.close_data(&doc);
        }
        Ok(())
    }

    /// Subscribe to every status transition across both metadata and data
    /// halves; pass `metadata = true` to watch the metadata machine,
    /// `false` for the data machine.
    pub fn on_status_change(&self, doc_ref: &DocumentRef, metadata: bool, callback: Arc<dyn Fn(&crate::model::SyncStatus) + Send + Sync>) -> Result<u64, StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let machine = if metadata { &doc.metadata_status } else { &doc.data_status };
        Ok(machine.on_status_change(callback))
    }

    /// Unsubscribe a status callback.
    pub fn off_status_change(&self, doc_ref: &DocumentRef, metadata: bool, id: u64) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        let machine = if metadata { &doc.metadata_status } else { &doc.data_status };
        machine.off_status_change(id);
        Ok(())
    }

    /// Resolves immediately if metadata is already LOADED, rejects
    /// immediately on ERROR, else waits for the first terminal
    /// transition.
    pub async fn wait_for_metadata_load(&self, doc_ref: &DocumentRef) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        doc.metadata_status.wait_for_load().await
    }

    /// Data-half equivalent of [`Self::wait_for_metadata_load`].
    pub async fn wait_for_data_load(&self, doc_ref: &DocumentRef) -> Result<(), StateCoreError> {
        let doc = self.doc_for_ref(doc_ref)?;
        doc.data_status.wait_for_load().await
    }

    fn doc_for_record(&self, record: &RecordRef) -> Result<Arc<InternalDoc>, StateCoreError> {
        self.docs
            .read()
            .expect("docs lock poisoned")
            .get(record.doc_ref().id())
            .cloned()
            .ok_or_else(|| StateCoreError::DocumentMissing(record.doc_ref().id().to_string()))
    }

    fn ensure_model_observer(&self, doc: &Arc<InternalDoc>, model: &str) {
        let weak: Weak<InternalDoc> = Arc::downgrade(doc);
        let model = model.to_string();
        doc.subscriptions.ensure_model_observer(&model, move || install_model_observer(&weak, model.clone()));
    }

    fn open_metadata(&self, doc: &Arc<InternalDoc>) {
        let driver = self.driver_for(doc);
        tokio::spawn(async move { driver.on_metadata_subscription_opened().await });
    }

    fn close_metadata(&self, doc: &Arc<InternalDoc>) {
        let driver = self.driver_for(doc);
        tokio::spawn(async move { driver.on_metadata_subscription_closed().await });
    }

    fn open_data(&self, doc: &Arc<InternalDoc>) {
        let driver = self.driver_for(doc);
        tokio::spawn(async move { driver.on_data_subscription_opened().await });
    }

    fn close_data(&self, doc: &Arc<InternalDoc>) {
        let driver = self.driver_for(doc);
        tokio::spawn(async move { driver.on_data_subscription_closed().await });
    }
}
