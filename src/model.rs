//! Core data-model types: document/record identity, schema shape, and the
//! engine-private [`InternalDoc`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::CrdtReplica;
use crate::refs::RefRegistry;
use crate::status::StatusMachine;
use crate::subscription::SubscriptionGraph;

/// Opaque document identity. Transport-assigned; not necessarily a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Wrap a raw id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque record identity, unique within `(DocumentId, modelName)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    /// Wrap a raw id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A model kind: a record (field map) or a union (discriminated variants).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Model {
    /// A plain record model.
    Record(RecordModel),
    /// A discriminated-union model.
    Union(UnionModel),
}

impl Model {
    /// The model's name, regardless of kind.
    pub fn name(&self) -> &str {
        match self {
            Model::Record(m) => &m.name,
            Model::Union(m) => &m.name,
        }
    }
}

/// A record model: a named field list plus which fields hold external refs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordModel {
    /// Model name; model identity is value-based on this field.
    pub name: String,
    /// Declared field names.
    pub fields: Vec<String>,
    /// Fields whose values are themselves references to other documents.
    pub external_ref_field_types: Vec<String>,
}

/// A union model: a discriminant field and its named variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionModel {
    /// Model name.
    pub name: String,
    /// Name of the discriminant field.
    pub discriminant: String,
    /// Variant names.
    pub variants: Vec<String>,
}

/// A schema: named models plus a version, attached to a document at
/// creation or reference time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version. Used for `SchemaMismatch` structural comparison.
    pub version: u32,
    /// `modelName -> Model` mapping.
    pub models: HashMap<String, Model>,
}

impl Schema {
    /// Record model names only (unions have no CRDT-backed storage).
    pub fn record_model_names(&self) -> Vec<&str> {
        self.models
            .values()
            .filter_map(|m| match m {
                Model::Record(r) => Some(r.name.as_str()),
                Model::Union(_) => None,
            })
            .collect()
    }
}

/// Opaque metadata attached to a document: name, type name, ontology id,
/// security. The core never inspects these fields; it only stores and
/// returns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document display name.
    pub name: String,
    /// Declared document type name.
    pub type_name: String,
    /// Ontology identifier, opaque to the core.
    pub ontology_id: Option<String>,
    /// Security descriptor, opaque to the core.
    pub security: Option<Value>,
}

/// `{model, data}` label attached to a transaction; becomes the CRDT
/// transaction's origin and is propagated to the publish layer as an
/// activity annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditDescription {
    /// Model the edit is described against.
    pub model: String,
    /// Description payload.
    pub data: Value,
}

/// Combined load/live status for either the metadata or data half of a
/// document, per §4.4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Load phase.
    pub load: LoadState,
    /// Live/connection phase.
    pub live: LiveState,
    /// Present only when `load == ERROR`.
    pub error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            load: LoadState::Unloaded,
            live: LiveState::Disconnected,
            error: None,
        }
    }
}

/// Load phase of a [`SyncStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    /// No load attempt has been made yet.
    Unloaded,
    /// A load is in flight.
    Loading,
    /// Load completed successfully.
    Loaded,
    /// Load failed; see `SyncStatus::error`.
    Error,
}

/// Live/connection phase of a [`SyncStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveState {
    /// No transport session is open.
    Disconnected,
    /// A transport session is being established.
    Connecting,
    /// A transport session is open.
    Connected,
}

/// An opaque session token handed back by the transport on subscribe,
/// reused to recompute resubscription requests on reconnect.
#[derive(Debug, Clone)]
pub struct SyncSession {
    /// Transport-assigned session identifier.
    pub id: String,
    /// Last revision id applied to this document's replica, if any.
    pub last_revision_id: Option<u64>,
}

/// Engine-private per-document state: the CRDT replica, ref caches,
/// subscriber sets, attached observer handles, and the two status
/// machines. Never exposed directly to applications — they interact with
/// it only through [`crate::refs`] handles routed via `DocumentEngine`.
pub struct InternalDoc {
    /// Document id.
    pub id: DocumentId,
    /// Schema this document was opened/created with.
    pub schema: Schema,
    /// Opaque document metadata, once loaded.
    pub metadata: RwLock<Option<DocumentMetadata>>,
    /// The CRDT replica.
    pub replica: Arc<CrdtReplica>,
    /// Weak-valued ref caches.
    pub refs: RefRegistry,
    /// Subscriber sets and deep-observer handles.
    pub subscriptions: SubscriptionGraph,
    /// Metadata status machine.
    pub metadata_status: StatusMachine,
    /// Data status machine.
    pub data_status: StatusMachine,
    /// Active transport session, once `onDataSubscriptionOpened` resolves.
    pub session: RwLock<Option<SyncSession>>,
    /// Tracks an in-progress `withTransaction` span, so nested calls
    /// collapse into the outer one instead of nesting CRDT transactions.
    pub active_transaction: RwLock<TransactionState>,
}

/// Re-entrancy state for `withTransaction`. `depth` distinguishes "no
/// transaction open" (`0`) from "transaction open with no description"
/// (`> 0`, `description: None`) — a plain `Option<EditDescription>` cannot
/// tell those apart, which is what let a nested, undescribed
/// `withTransaction` call wrongly treat itself as the outer span.
#[derive(Debug, Clone, Default)]
pub struct TransactionState {
    /// Nesting depth of the currently-open `withTransaction` span.
    pub depth: u32,
    /// The description governing the whole span, set once by the
    /// outermost call.
    pub description: Option<EditDescription>,
}

impl InternalDoc {
    /// Create a fresh, unloaded internal document.
    pub fn new(id: DocumentId, schema: Schema) -> Self {
        Self {
            id,
            schema,
            metadata: RwLock::new(None),
            replica: Arc::new(CrdtReplica::new()),
            refs: RefRegistry::new(),
            subscriptions: SubscriptionGraph::new(),
            metadata_status: StatusMachine::new(),
            data_status: StatusMachine::new(),
            session: RwLock::new(None),
            active_transaction: RwLock::new(TransactionState::default()),
        }
    }
}
