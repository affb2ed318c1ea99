//! Concrete transport-facing half of the engine: publishes local CRDT
//! updates with revision tracking, applies remote updates, manages
//! activity/presence subscriptions, and resubscribes on reconnect (§4.6).

pub mod transport;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use base64::Engine as _;
use tokio::sync::Mutex;

use crate::crdt::EditOrigin;
use crate::error::StateCoreError;
use crate::model::{InternalDoc, LiveState, LoadState, SyncSession};
use crate::sync::transport::{
    ActivityDescription, DocumentPublish, EncodedUpdate, PresenceEvent, PresencePublish,
    SubscriptionExt, SubscriptionHandle, Transport, UpdateMessage,
};

const BASE64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// Read-only counters exposed off a `SyncDriver`, carried as ambient
/// observability (the spec is silent on metrics, this does not touch a
/// declared non-goal).
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    /// Local updates queued because the initial load had not completed.
    pub pending: u64,
    /// Remote updates successfully applied.
    pub applied: u64,
    /// Remote updates dropped for a base-revision mismatch.
    pub dropped: u64,
}

struct PendingEdit {
    edit_id: String,
    update: Vec<u8>,
    description: Option<ActivityDescription>,
    queued_at: chrono::DateTime<chrono::Utc>,
}

/// One document's sync session.
pub struct SyncDriver {
    transport: Arc<dyn Transport>,
    doc: Weak<InternalDoc>,
    client_id: String,
    ignore_self_presence: bool,
    update_subscription: Mutex<Option<yrs::Subscription>>,
    updates_handle: Mutex<Option<SubscriptionHandle>>,
    activity_handle: Mutex<Option<SubscriptionHandle>>,
    presence_handle: Mutex<Option<SubscriptionHandle>>,
    // Edits made before `lastRevisionId` is known. Per the open-question
    // resolution in the design notes: queued, not rejected, and flushed in
    // order once the initial load completes.
    pending_pre_load: Mutex<VecDeque<PendingEdit>>,
    metrics: Mutex<SyncMetrics>,
}

impl SyncDriver {
    /// Build a driver for `doc`, not yet started.
    pub fn new(transport: Arc<dyn Transport>, doc: Weak<InternalDoc>, client_id: String, ignore_self_presence: bool) -> Arc<Self> {
        let driver = Arc::new(Self {
            transport,
            doc,
            client_id,
            ignore_self_presence,
            update_subscription: Mutex::new(None),
            updates_handle: Mutex::new(None),
            activity_handle: Mutex::new(None),
            presence_handle: Mutex::new(None),
            pending_pre_load: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(SyncMetrics::default()),
        });
        driver.clone().spawn_reconnect_watcher();
        driver
    }

    /// Watches the transport's handshake signal for the lifetime of the
    /// driver and replays every live subscription on each reconnect. The
    /// first tick observed reflects the initial handshake, not a
    /// reconnect, and is skipped.
    fn spawn_reconnect_watcher(self: Arc<Self>) {
        let mut handshake = self.transport.handshake_events();
        tokio::spawn(async move {
            if handshake.changed().await.is_err() {
                return;
            }
            while handshake.changed().await.is_ok() {
                self.resubscribe_all().await;
            }
        });
    }

    /// Current metrics snapshot.
    pub async fn metrics(&self) -> SyncMetrics {
        self.metrics.lock().await.clone()
    }

    fn doc(&self) -> Arc<InternalDoc> {
        self.doc.upgrade().expect("sync driver outlived its document")
    }

    /// Transport's handshake fired for the first time, or the data half
    /// gained its first subscriber (§4.4 subscription-count hooks).
    pub async fn on_data_subscription_opened(self: &Arc<Self>) {
        let doc = self.doc();
        doc.data_status.set_live(LiveState::Connecting);
        doc.data_status.set_load(LoadState::Loading, None);

        self.install_update_observer();

        let ext = self.current_ext().await;
        match self.transport.subscribe_updates(ext).await {
            Ok((handle, rx)) => {
                *self.updates_handle.lock().await = Some(handle.clone());
                {
                    let mut session = doc.session.write().expect("session lock poisoned");
                    *session = Some(SyncSession { id: handle.0.clone(), last_revision_id: None });
                }
                doc.data_status.set_live(LiveState::Connected);
                doc.data_status.set_load(LoadState::Loaded, None);
                self.spawn_incoming_loop(rx);
            }
            Err(err) => {
                doc.data_status.set_load(LoadState::Error, Some(err.to_string()));
                tracing::warn!(error = %err, "subscribe_updates failed");
            }
        }
    }

    /// Data half lost its last subscriber.
    pub async fn on_data_subscription_closed(&self) {
        *self.update_subscription.lock().await = None;
        *self.updates_handle.lock().await = None;
        let doc = self.doc();
        doc.data_status.set_live(LiveState::Disconnected);
        *doc.session.write().expect("session lock poisoned") = None;
    }

    /// First metadata subscriber arrived; fetches metadata via the
    /// transport.
    pub async fn on_metadata_subscription_opened(&self) {
        let doc = self.doc();
        doc.metadata_status.set_load(LoadState::Loading, None);
        match self.transport.fetch_metadata().await {
            Ok(metadata) => {
                *doc.metadata.write().expect("metadata lock poisoned") = Some(metadata.clone());
                doc.metadata_status.set_load(LoadState::Loaded, None);
                doc.subscriptions.notify_metadata(&metadata);
            }
            Err(err) => {
                doc.metadata_status.set_load(LoadState::Error, Some(err.to_string()));
            }
        }
    }

    /// Last metadata subscriber gone.
    pub async fn on_metadata_subscription_closed(&self) {
        self.doc().metadata_status.set_live(LiveState::Disconnected);
    }

    async fn current_ext(&self) -> SubscriptionExt {
        let last_revision_id = self
            .doc()
            .session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .and_then(|s| s.last_revision_id);
        SubscriptionExt { client_id: self.client_id.clone(), last_revision_id }
    }

    fn install_update_observer(self: &Arc<Self>) {
        let doc = self.doc();
        let driver = self.clone();
        let subscription = doc.replica.observe_updates(move |txn, event| {
            let origin = EditOrigin::from_txn(txn);
            if matches!(origin, Some(EditOrigin::Remote)) {
                return;
            }
            let description = match origin {
                Some(EditOrigin::LocalDescribed { model, data }) => Some(ActivityDescription {
                    event_type: model,
                    event_data: serde_json::json!({ "data": data, "version": 1 }),
                }),
                _ => None,
            };
            let update = event.update.clone();
            let driver = driver.clone();
            tokio::spawn(async move {
                driver.handle_local_update(update, description).await;
            });
        });
        // Stored synchronously via try_lock: this runs during
        // `on_data_subscription_opened`, before any concurrent access.
        if let Ok(mut slot) = self.update_subscription.try_lock() {
            *slot = Some(subscription);
        }
    }

    async fn handle_local_update(&self, update: Vec<u8>, description: Option<ActivityDescription>) {
        let doc = self.doc();
        let last_revision_id = doc
            .session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .and_then(|s| s.last_revision_id);

        if last_revision_id.is_none() {
            let edit_id = uuid::Uuid::new_v4().to_string();
            self.pending_pre_load.lock().await.push_back(PendingEdit {
                edit_id,
                update,
                description,
                queued_at: chrono::Utc::now(),
            });
            self.metrics.lock().await.pending += 1;
            tracing::debug!("queued local update: initial load not complete");
            return;
        }

        self.publish_one(update, description).await;
    }

    async fn publish_one(&self, update: Vec<u8>, description: Option<ActivityDescription>) {
        let edit_id = uuid::Uuid::new_v4().to_string();
        let payload = DocumentPublish {
            client_id: self.client_id.clone(),
            edit_id,
            yjs_update: EncodedUpdate { data: BASE64.encode(update) },
            description,
        };
        if let Err(err) = self.transport.publish_update(payload).await {
            tracing::warn!(error = %err, "publish_update failed");
        }
    }

    /// Flush edits queued while `lastRevisionId` was unknown, in the order
    /// they were made, once the initial load completes.
    async fn flush_pending_pre_load(&self) {
        let mut queue = self.pending_pre_load.lock().await;
        while let Some(edit) = queue.pop_front() {
            let queued_for = chrono::Utc::now().signed_duration_since(edit.queued_at);
            tracing::debug!(edit_id = %edit.edit_id, queued_ms = queued_for.num_milliseconds(), "flushing pre-load edit");
            self.publish_one(edit.update, edit.description).await;
        }
    }

    fn spawn_incoming_loop(self: &Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<UpdateMessage>) {
        let driver = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                driver.handle_incoming(message).await;
            }
        });
    }

    async fn handle_incoming(&self, message: UpdateMessage) {
        let doc = self.doc();
        match message {
            UpdateMessage::Update { base_revision_id, revision_id, update, .. } => {
                let expected = doc
                    .session
                    .read()
                    .expect("session lock poisoned")
                    .as_ref()
                    .and_then(|s| s.last_revision_id);

                if let (Some(expected), Some(base)) = (expected, base_revision_id) {
                    if expected != base {
                        self.metrics.lock().await.dropped += 1;
                        tracing::warn!(
                            expected,
                            got = base,
                            "dropping remote update: base revision mismatch"
                        );
                        return;
                    }
                }

                match BASE64.decode(&update.data) {
                    Ok(bytes) => {
                        if let Err(err) = doc.replica.apply_update(&bytes, EditOrigin::Remote) {
                            tracing::warn!(error = %err, "failed to apply remote update");
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to decode remote update");
                        return;
                    }
                }

                let was_first_load = expected.is_none();
                {
                    let mut session = doc.session.write().expect("session lock poisoned");
                    if let Some(session) = session.as_mut() {
                        session.last_revision_id = Some(revision_id);
                    }
                }
                self.metrics.lock().await.applied += 1;
                doc.data_status.set_load(LoadState::Loaded, None);
                if was_first_load {
                    self.flush_pending_pre_load().await;
                }
            }
            UpdateMessage::Error { error_instance_id } => {
                doc.data_status.set_load(LoadState::Error, Some(error_instance_id));
            }
            UpdateMessage::Unknown(kind) => {
                tracing::warn!(kind, "unknown message type on updates channel");
            }
        }
    }

    /// Subscribe to `/document/{id}/activity`.
    pub async fn subscribe_activity(&self) -> Result<tokio::sync::mpsc::Receiver<ActivityDescription>, StateCoreError> {
        let (handle, rx) = self
            .transport
            .subscribe_activity()
            .await
            .map_err(|e| StateCoreError::SubscriptionFailed(e.to_string()))?;
        *self.activity_handle.lock().await = Some(handle);
        Ok(rx)
    }

    /// Subscribe to `/document/{id}/presence`, defaulting
    /// `ignoreSelfUpdates` to the engine config value.
    pub async fn subscribe_presence(&self) -> Result<tokio::sync::mpsc::Receiver<PresenceEvent>, StateCoreError> {
        let (handle, rx) = self
            .transport
            .subscribe_presence(self.ignore_self_presence)
            .await
            .map_err(|e| StateCoreError::SubscriptionFailed(e.to_string()))?;
        *self.presence_handle.lock().await = Some(handle);
        Ok(rx)
    }

    /// Broadcast an ephemeral custom presence event. Best-effort: errors
    /// are logged, not propagated.
    pub async fn update_custom_presence(&self, user_id: String, event_type: String, event_data: serde_json::Value) {
        let payload = PresencePublish { user_id, client_id: self.client_id.clone(), event_type, event_data };
        if let Err(err) = self.transport.publish_presence(payload).await {
            tracing::warn!(error = %err, "publish_presence failed");
        }
    }

    /// Replay every still-live subscription after a reconnect handshake,
    /// batched into a single transport call, with a freshly computed
    /// `ext` per subscription (P11). Subscriptions cancelled between
    /// disconnect and reconnect are simply absent from `live_handles` and
    /// so are never included.
    pub async fn resubscribe_all(&self) {
        let mut requests = Vec::new();
        if let Some(handle) = self.updates_handle.lock().await.clone() {
            requests.push((handle, self.current_ext().await));
        }
        if requests.is_empty() {
            return;
        }
        if let Err(err) = self.transport.resubscribe_batch(requests).await {
            tracing::warn!(error = %err, "resubscribe_batch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentId, Schema};
    use crate::sync::transport::{SearchQuery, SearchResult, TransportError, TransportFactory};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::{mpsc, watch};

    struct FakeTransport {
        updates_tx: Mutex<Option<mpsc::Sender<UpdateMessage>>>,
        publish_log: Mutex<Vec<DocumentPublish>>,
        handshake_tx: watch::Sender<u64>,
        resubscribe_calls: AtomicU64,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                updates_tx: Mutex::new(None),
                publish_log: Mutex::new(Vec::new()),
                handshake_tx: watch::channel(0).0,
                resubscribe_calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn subscribe_updates(
            &self,
            _ext: SubscriptionExt,
        ) -> Result<(SubscriptionHandle, mpsc::Receiver<UpdateMessage>), TransportError> {
            let (tx, rx) = mpsc::channel(16);
            *self.updates_tx.lock().await = Some(tx);
            Ok((SubscriptionHandle("updates".into()), rx))
        }

        async fn publish_update(&self, payload: DocumentPublish) -> Result<(), TransportError> {
            self.publish_log.lock().await.push(payload);
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
            self.resubscribe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_metadata(&self) -> Result<crate::model::DocumentMetadata, TransportError> {
            Ok(crate::model::DocumentMetadata {
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

    #[async_trait::async_trait]
    impl TransportFactory for FakeTransportFactory {
        fn open(&self, _doc_id: &DocumentId) -> Arc<dyn Transport> {
            self.0.clone()
        }

        async fn create_document(
            &self,
            _metadata: crate::model::DocumentMetadata,
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

    fn test_doc() -> Arc<InternalDoc> {
        Arc::new(InternalDoc::new(
            DocumentId::new("d1"),
            Schema { version: 1, models: HashMap::new() },
        ))
    }

    #[tokio::test]
    async fn pre_load_edits_are_queued_then_flushed_in_order() {
        let transport = Arc::new(FakeTransport::new());
        let doc = test_doc();
        let driver = SyncDriver::new(transport.clone(), Arc::downgrade(&doc), "client-1".into(), false);

        driver.handle_local_update(vec![1], None).await;
        driver.handle_local_update(vec![2], None).await;
        assert_eq!(driver.metrics().await.pending, 2);
        assert!(transport.publish_log.lock().await.is_empty());

        {
            let mut session = doc.session.write().unwrap();
            *session = Some(SyncSession { id: "s1".into(), last_revision_id: Some(0) });
        }
        driver.flush_pending_pre_load().await;

        let log = transport.publish_log.lock().await;
        assert_eq!(log.len(), 2);
        assert_eq!(BASE64.decode(&log[0].yjs_update.data).unwrap(), vec![1]);
        assert_eq!(BASE64.decode(&log[1].yjs_update.data).unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn base_revision_mismatch_drops_update_without_mutating_state() {
        let transport = Arc::new(FakeTransport::new());
        let doc = test_doc();
        {
            let mut session = doc.session.write().unwrap();
            *session = Some(SyncSession { id: "s1".into(), last_revision_id: Some(5) });
        }
        let driver = SyncDriver::new(transport, Arc::downgrade(&doc), "client-1".into(), false);

        driver
            .handle_incoming(UpdateMessage::Update {
                base_revision_id: Some(4),
                client_id: "other".into(),
                revision_id: 6,
                update: EncodedUpdate { data: BASE64.encode(doc.replica.encode_state()) },
            })
            .await;

        assert_eq!(driver.metrics().await.dropped, 1);
        assert_eq!(doc.session.read().unwrap().as_ref().unwrap().last_revision_id, Some(5));
    }

    #[tokio::test]
    async fn matching_base_revision_applies_and_advances() {
        let transport = Arc::new(FakeTransport::new());
        let remote_doc = test_doc();
        remote_doc.replica.set_record("User", "u1", &serde_json::json!({"id": "u1"}));
        let encoded = remote_doc.replica.encode_state();

        let doc = test_doc();
        {
            let mut session = doc.session.write().unwrap();
            *session = Some(SyncSession { id: "s1".into(), last_revision_id: Some(5) });
        }
        let driver = SyncDriver::new(transport, Arc::downgrade(&doc), "client-1".into(), false);

        driver
            .handle_incoming(UpdateMessage::Update {
                base_revision_id: Some(5),
                client_id: "other".into(),
                revision_id: 6,
                update: EncodedUpdate { data: BASE64.encode(encoded) },
            })
            .await;

        assert_eq!(driver.metrics().await.applied, 1);
        assert_eq!(doc.session.read().unwrap().as_ref().unwrap().last_revision_id, Some(6));
        assert!(doc.replica.has_record("User", "u1"));
    }

    #[tokio::test]
    async fn reconnect_handshake_resubscribes_but_initial_handshake_does_not() {
        let transport = Arc::new(FakeTransport::new());
        let doc = test_doc();
        let driver = SyncDriver::new(transport.clone(), Arc::downgrade(&doc), "client-1".into(), false);
        *driver.updates_handle.lock().await = Some(SubscriptionHandle("updates".into()));

        transport.handshake_tx.send(1).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(transport.resubscribe_calls.load(Ordering::SeqCst), 0);

        transport.handshake_tx.send(2).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(transport.resubscribe_calls.load(Ordering::SeqCst), 1);

        transport.handshake_tx.send(3).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(transport.resubscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn local_described_edit_wraps_data_in_a_versioned_envelope() {
        let transport = Arc::new(FakeTransport::new());
        let doc = test_doc();
        {
            let mut session = doc.session.write().unwrap();
            *session = Some(SyncSession { id: "s1".into(), last_revision_id: Some(0) });
        }
        let driver = SyncDriver::new(transport.clone(), Arc::downgrade(&doc), "client-1".into(), false);

        let description = ActivityDescription {
            event_type: "User".into(),
            event_data: serde_json::json!({ "data": serde_json::json!({"batch": "signup"}), "version": 1 }),
        };
        driver.publish_one(vec![9], Some(description.clone())).await;

        let log = transport.publish_log.lock().await;
        let published = log[0].description.as_ref().unwrap();
        assert_eq!(published.event_data["version"], serde_json::json!(1));
        assert_eq!(published.event_data["data"]["batch"], serde_json::json!("signup"));
    }
}
