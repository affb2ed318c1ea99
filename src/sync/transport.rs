//! The transport boundary (§6). Concrete wire transport is out of scope;
//! this module only defines the trait surface `SyncDriver` drives and a
//! deterministic in-memory fake used by the test suite.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::model::{DocumentId, DocumentMetadata, Schema};

/// `{clientId, lastRevisionId?}` sent as the `ext` field of every
/// subscribe and resubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionExt {
    /// This session's client id.
    pub client_id: String,
    /// Last revision id this client has applied, if any.
    pub last_revision_id: Option<u64>,
}

/// Opaque handle a transport hands back for a channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub String);

/// Base64-encoded CRDT binary update.
#[derive(Debug, Clone)]
pub struct EncodedUpdate {
    /// Base64 (standard alphabet) payload.
    pub data: String,
}

/// `{eventType, eventData}` activity/presence label, serialised from an
/// `EditDescription`.
#[derive(Debug, Clone)]
pub struct ActivityDescription {
    /// The described model's name.
    pub event_type: String,
    /// The description payload.
    pub event_data: Value,
}

/// Message kinds on `/document/{id}/updates`.
#[derive(Debug, Clone)]
pub enum UpdateMessage {
    /// A remote CRDT update to apply.
    Update {
        /// Revision this update was based on, if the server sent one.
        base_revision_id: Option<u64>,
        /// Originating client id.
        client_id: String,
        /// The revision id this update advances the document to.
        revision_id: u64,
        /// The encoded binary update.
        update: EncodedUpdate,
    },
    /// The session entered an error state server-side.
    Error {
        /// Opaque error instance id for correlation.
        error_instance_id: String,
    },
    /// A message of an unrecognised type.
    Unknown(String),
}

/// `{clientId, editId, yjsUpdate:{data}, description?}` published on
/// `/document/{id}/publish`.
#[derive(Debug, Clone)]
pub struct DocumentPublish {
    /// Publishing client's id.
    pub client_id: String,
    /// Fresh id for this edit.
    pub edit_id: String,
    /// The encoded update.
    pub yjs_update: EncodedUpdate,
    /// Present iff the originating transaction carried a recognised
    /// `EditDescription`.
    pub description: Option<ActivityDescription>,
}

/// A presence event on `/document/{id}/presence`.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    /// The user the event originated from.
    pub user_id: String,
    /// The described model's name.
    pub event_type: String,
    /// The payload.
    pub event_data: Value,
}

/// `{type:"custom", custom:{userId, clientId, eventData}}` published on
/// `/document/{id}/presence-publish`.
#[derive(Debug, Clone)]
pub struct PresencePublish {
    /// Local user id.
    pub user_id: String,
    /// Local client id.
    pub client_id: String,
    /// The described model's name.
    pub event_type: String,
    /// The payload.
    pub event_data: Value,
}

/// Pagination/filter parameters for `searchDocuments`.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Optional name filter.
    pub name: Option<String>,
    /// Optional page size limit.
    pub limit: Option<u32>,
    /// Opaque continuation token.
    pub page_token: Option<String>,
}

/// One page of `searchDocuments` results.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Matching documents with their metadata.
    pub data: Vec<(DocumentId, DocumentMetadata)>,
    /// Continuation token, if more pages remain.
    pub next_page_token: Option<String>,
}

/// Transport errors. All are surfaced as `SubscriptionFailed`,
/// `CreateFailed`, or `SearchFailed` at the call site.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The transport rejected the request outright.
    #[error("transport rejected request: {0}")]
    Rejected(String),
    /// The transport connection was not available.
    #[error("transport unavailable")]
    Unavailable,
}

/// Per-document transport session. One instance per open document sync
/// session, created by a [`TransportFactory`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to `/document/{id}/updates`.
    async fn subscribe_updates(
        &self,
        ext: SubscriptionExt,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<UpdateMessage>), TransportError>;

    /// Publish on `/document/{id}/publish`.
    async fn publish_update(&self, payload: DocumentPublish) -> Result<(), TransportError>;

    /// Subscribe to `/document/{id}/activity`.
    async fn subscribe_activity(
        &self,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<ActivityDescription>), TransportError>;

    /// Subscribe to `/document/{id}/presence`.
    async fn subscribe_presence(
        &self,
        ignore_self_updates: bool,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<PresenceEvent>), TransportError>;

    /// Publish on `/document/{id}/presence-publish`.
    async fn publish_presence(&self, payload: PresencePublish) -> Result<(), TransportError>;

    /// Batch-resubscribe every still-live handle after a reconnect
    /// handshake, each with a freshly computed `ext`.
    async fn resubscribe_batch(
        &self,
        requests: Vec<(SubscriptionHandle, SubscriptionExt)>,
    ) -> Result<(), TransportError>;

    /// Fetch document metadata.
    async fn fetch_metadata(&self) -> Result<DocumentMetadata, TransportError>;

    /// A counter incremented on every (re)handshake; the first value
    /// observed after subscribing is not itself a reconnect.
    fn handshake_events(&self) -> watch::Receiver<u64>;
}

/// Produces one [`Transport`] session per document, plus the
/// document-agnostic create/search operations.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport session scoped to `doc_id`.
    fn open(&self, doc_id: &DocumentId) -> Arc<dyn Transport>;

    /// Create a new document server-side.
    async fn create_document(
        &self,
        metadata: DocumentMetadata,
        schema: &Schema,
    ) -> Result<DocumentId, TransportError>;

    /// Search existing documents.
    async fn search_documents(
        &self,
        type_name: &str,
        schema: &Schema,
        query: SearchQuery,
    ) -> Result<SearchResult, TransportError>;
}

/// Produces opaque bearer tokens plus a token-change notification,
/// attached by the transport as an `ext` field on the handshake message
/// (§6 Auth boundary).
pub trait TokenProvider: Send + Sync {
    /// The current token value.
    fn token(&self) -> String;

    /// Fires whenever the token changes so the transport can rebind.
    fn subscribe_changes(&self) -> watch::Receiver<String>;
}
