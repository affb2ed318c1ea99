//! End-to-end scenarios driving `DocumentEngine` against an in-memory
//! transport fake: record CRUD, ref dedup, collection/record fan-out,
//! transaction descriptions, and sync load/publish behavior.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use state_core::config::EngineConfig;
use state_core::engine::DocumentEngine;
use state_core::model::{DocumentId, DocumentMetadata, EditDescription, Model, RecordId, RecordModel, Schema};
use state_core::schema::SchemaRegistry;
use state_core::subscription::{CollectionKind, RecordKind};
use state_core::sync::transport::{
    ActivityDescription, DocumentPublish, EncodedUpdate, PresenceEvent, PresencePublish, SearchQuery,
    SearchResult, SubscriptionExt, SubscriptionHandle, Transport, TransportError, TransportFactory,
    UpdateMessage,
};
use tokio::sync::{mpsc, watch};

fn user_schema() -> Schema {
    let mut models = HashMap::new();
    models.insert(
        "User".to_string(),
        Model::Record(RecordModel {
            name: "User".into(),
            fields: vec!["id".into(), "name".into(), "age".into()],
            external_ref_field_types: vec![],
        }),
    );
    Schema { version: 1, models }
}

struct FakeTransport {
    updates_tx: Mutex<Option<mpsc::Sender<UpdateMessage>>>,
    publish_log: Mutex<Vec<DocumentPublish>>,
    handshake_tx: watch::Sender<u64>,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            updates_tx: Mutex::new(None),
            publish_log: Mutex::new(Vec::new()),
            handshake_tx: watch::channel(0).0,
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn subscribe_updates(
        &self,
        _ext: SubscriptionExt,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<UpdateMessage>), TransportError> {
        let (tx, rx) = mpsc::channel(16);
        *self.updates_tx.lock().unwrap() = Some(tx);
        Ok((SubscriptionHandle("updates".into()), rx))
    }

    async fn publish_update(&self, payload: DocumentPublish) -> Result<(), TransportError> {
        self.publish_log.lock().unwrap().push(payload);
        Ok(())
    }

    async fn subscribe_activity(
        &self,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<ActivityDescription>), TransportError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok((SubscriptionHandle("activity".into()), rx))
    }

    async fn subscribe_presence(
        &self,
        _ignore_self_updates: bool,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<PresenceEvent>), TransportError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok((SubscriptionHandle("presence".into()), rx))
    }

    async fn publish_presence(&self, _payload: PresencePublish) -> Result<(), TransportError> {
        Ok(())
    }

    async fn resubscribe_batch(
        &self,
        _requests: Vec<(SubscriptionHandle, SubscriptionExt)>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn fetch_metadata(&self) -> Result<DocumentMetadata, TransportError> {
        Ok(DocumentMetadata {
            name: "doc".into(),
            type_name: "Test".into(),
            ontology_id: None,
            security: None,
        })
    }

    fn handshake_events(&self) -> watch::Receiver<u64> {
        self.handshake_tx.subscribe()
    }
}

struct FakeTransportFactory(Arc<FakeTransport>);

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    fn open(&self, _doc_id: &DocumentId) -> Arc<dyn Transport> {
        self.0.clone()
    }

    async fn create_document(
        &self,
        _metadata: DocumentMetadata,
        _schema: &Schema,
    ) -> Result<DocumentId, TransportError> {
        Ok(DocumentId::new("new-doc"))
    }

    async fn search_documents(
        &self,
        _type_name: &str,
        _schema: &Schema,
        _query: SearchQuery,
    ) -> Result<SearchResult, TransportError> {
        Ok(SearchResult { data: Vec::new(), next_page_token: None })
    }
}

fn test_engine() -> (Arc<DocumentEngine>, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::new());
    let factory = Arc::new(FakeTransportFactory(transport.clone()));
    let mut schema_registry = SchemaRegistry::new();
    schema_registry.register("pkg", user_schema());
    let config = EngineConfig::builder()
        .transport_factory(factory)
        .schema_registry(schema_registry)
        .build()
        .unwrap();
    (DocumentEngine::new(config), transport)
}

#[test]
fn doc_ref_is_deduplicated_across_calls() {
    let (engine, _transport) = test_engine();
    let id = DocumentId::new("d1");
    let a = engine.create_doc_ref(id.clone(), user_schema()).unwrap();
    let b = engine.create_doc_ref(id, user_schema()).unwrap();
    assert!(a.is_same_handle(&b));
}

#[test]
fn reusing_a_doc_id_with_a_different_schema_is_rejected() {
    let (engine, _transport) = test_engine();
    let id = DocumentId::new("d1");
    engine.create_doc_ref(id.clone(), user_schema()).unwrap();

    let mut other_models = HashMap::new();
    other_models.insert(
        "Project".to_string(),
        Model::Record(RecordModel {
            name: "Project".into(),
            fields: vec!["id".into()],
            external_ref_field_types: vec![],
        }),
    );
    let other_schema = Schema { version: 1, models: other_models };

    let err = engine.create_doc_ref(id, other_schema).unwrap_err();
    assert!(matches!(err, state_core::error::StateCoreError::SchemaMismatch { .. }));
}

#[test]
fn set_get_update_delete_round_trip() {
    let (engine, _transport) = test_engine();
    let doc_ref = engine.create_doc_ref(DocumentId::new("d1"), user_schema()).unwrap();
    let id = RecordId::new("u1");

    engine
        .set_record(&doc_ref, "User", &id, &json!({"id": "u1", "name": "Ada", "age": 30}))
        .unwrap();
    let collection = engine.get_records(&doc_ref, "User").unwrap();
    assert!(engine.has_record(&collection, &id));
    let snapshot = engine.get_record(&collection, &id).unwrap();
    assert_eq!(snapshot["name"], json!("Ada"));

    engine.update_record(&doc_ref, "User", &id, &json!({"age": 31})).unwrap();
    let snapshot = engine.get_record(&collection, &id).unwrap();
    assert_eq!(snapshot["age"], json!(31));
    assert_eq!(snapshot["name"], json!("Ada"));

    engine.delete_record(&doc_ref, "User", &id).unwrap();
    assert!(!engine.has_record(&collection, &id));

    let err = engine.update_record(&doc_ref, "User", &id, &json!({"age": 40})).unwrap_err();
    assert!(matches!(err, state_core::error::StateCoreError::RecordMissing { .. }));
}

#[test]
fn collection_subscribers_see_added_changed_deleted_partitioned_per_batch() {
    let (engine, _transport) = test_engine();
    let doc_ref = engine.create_doc_ref(DocumentId::new("d1"), user_schema()).unwrap();
    let collection = engine.get_records(&doc_ref, "User").unwrap();

    let added = Arc::new(Mutex::new(Vec::new()));
    let added_clone = added.clone();
    let deleted = Arc::new(Mutex::new(0u32));
    let deleted_clone = deleted.clone();

    let added_sub = engine
        .on_items_added(&collection, Arc::new(move |refs| {
            added_clone.lock().unwrap().extend(refs.iter().map(|r| r.id().to_string()));
        }))
        .unwrap();
    let deleted_sub = engine
        .on_items_deleted(&collection, Arc::new(move |_refs| {
            *deleted_clone.lock().unwrap() += 1;
        }))
        .unwrap();

    let id = RecordId::new("u1");
    engine.set_record(&doc_ref, "User", &id, &json!({"id": "u1", "name": "Ada"})).unwrap();
    assert_eq!(*added.lock().unwrap(), vec!["u1".to_string()]);

    engine.delete_record(&doc_ref, "User", &id).unwrap();
    assert_eq!(*deleted.lock().unwrap(), 1);

    engine.off_collection(&collection, CollectionKind::Added, added_sub).unwrap();
    engine.off_collection(&collection, CollectionKind::Deleted, deleted_sub).unwrap();
}

#[test]
fn record_level_subscription_replays_current_value_then_fires_on_change() {
    let (engine, _transport) = test_engine();
    let doc_ref = engine.create_doc_ref(DocumentId::new("d1"), user_schema()).unwrap();
    let id = RecordId::new("u1");
    engine.set_record(&doc_ref, "User", &id, &json!({"id": "u1", "name": "Ada"})).unwrap();

    let collection = engine.get_records(&doc_ref, "User").unwrap();
    let record_ref = engine.create_record_ref(&collection, &id);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let sub = engine
        .on_record_changed(&record_ref, Arc::new(move |value| {
            seen_clone.lock().unwrap().push(value.clone());
        }))
        .unwrap();
    // Replayed immediately because the record already exists.
    assert_eq!(seen.lock().unwrap().len(), 1);

    engine.update_record(&doc_ref, "User", &id, &json!({"name": "Grace"})).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(seen.lock().unwrap()[1]["name"], json!("Grace"));

    let deleted = Arc::new(Mutex::new(false));
    let deleted_clone = deleted.clone();
    engine
        .on_record_deleted(&record_ref, Arc::new(move || {
            *deleted_clone.lock().unwrap() = true;
        }))
        .unwrap();
    engine.delete_record(&doc_ref, "User", &id).unwrap();
    assert!(*deleted.lock().unwrap());

    engine.off_record(&record_ref, RecordKind::Changed, sub).unwrap();
}

#[test]
fn with_transaction_labels_every_mutation_with_one_description() {
    let (engine, _transport) = test_engine();
    let doc_ref = engine.create_doc_ref(DocumentId::new("d1"), user_schema()).unwrap();
    let id_a = RecordId::new("u1");
    let id_b = RecordId::new("u2");

    let description = EditDescription { model: "User".into(), data: json!({"batch": "signup"}) };
    engine
        .with_transaction(&doc_ref, Some(description), || {
            engine.set_record(&doc_ref, "User", &id_a, &json!({"id": "u1"})).unwrap();
            engine.set_record(&doc_ref, "User", &id_b, &json!({"id": "u2"})).unwrap();
        })
        .unwrap();

    let collection = engine.get_records(&doc_ref, "User").unwrap();
    assert!(engine.has_record(&collection, &id_a));
    assert!(engine.has_record(&collection, &id_b));
}

#[tokio::test]
async fn data_subscription_opens_transport_and_loads_on_first_subscriber() {
    let (engine, transport) = test_engine();
    let doc_ref = engine.create_doc_ref(DocumentId::new("d1"), user_schema()).unwrap();

    let sub = engine.on_state(&doc_ref, Arc::new(|_doc_ref| {})).unwrap();
    engine.wait_for_data_load(&doc_ref).await.unwrap();
    assert!(transport.updates_tx.lock().unwrap().is_some());

    engine.off_state(&doc_ref, sub).unwrap();
}

#[tokio::test]
async fn metadata_subscription_fetches_and_replays() {
    let (engine, _transport) = test_engine();
    let doc_ref = engine.create_doc_ref(DocumentId::new("d1"), user_schema()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let sub = engine
        .on_metadata(&doc_ref, Arc::new(move |meta: &DocumentMetadata| {
            seen_clone.lock().unwrap().push(meta.name.clone());
        }))
        .unwrap();
    engine.wait_for_metadata_load(&doc_ref).await.unwrap();

    // `waitForMetadataLoad` resolving means the fetch completed, which
    // notifies already-registered subscribers before this point.
    assert_eq!(seen.lock().unwrap().as_slice(), ["doc".to_string()]);
    engine.off_metadata(&doc_ref, sub).unwrap();
}
