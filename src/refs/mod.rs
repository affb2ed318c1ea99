//! Weak-valued caches that deduplicate [`DocumentRef`],
//! [`RecordCollectionRef`], and [`RecordRef`] per `(docId, modelName,
//! recordId)` (§4.2).
//!
//! Rust gives us native weak values via [`std::sync::Weak`] over `Arc`
//! inner state, so — per the design note's explicitly sanctioned
//! substitution — refcounted weak caching is used directly rather than
//! falling back to an unsubscribe-lifecycle-tied scheme.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use crate::model::{DocumentId, RecordId, Schema};

/// Shared identity for a document reference. Equality and the dedup
/// invariant (P1) are both expressed in terms of `Arc` pointer identity,
/// not structural equality.
struct DocumentRefInner {
    id: DocumentId,
    schema: Schema,
}

/// A stable, deduplicated handle to a document. Applications retain these
/// and use them as cache keys; within one engine, re-requesting the same
/// `(docId, schema)` yields the same `DocumentRef` until every strong
/// reference is dropped.
#[derive(Clone)]
pub struct DocumentRef(Arc<DocumentRefInner>);

impl DocumentRef {
    /// The document id this ref points to.
    pub fn id(&self) -> &DocumentId {
        &self.0.id
    }

    /// The schema this ref was created with.
    pub fn schema(&self) -> &Schema {
        &self.0.schema
    }

    /// Whether two refs point at the same underlying handle (not just an
    /// equal id/schema pair).
    pub fn is_same_handle(&self, other: &DocumentRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn invalid() -> Self {
        Self(Arc::new(DocumentRefInner {
            id: DocumentId::new(""),
            schema: Schema {
                version: 0,
                models: HashMap::new(),
            },
        }))
    }
}

struct RecordCollectionRefInner {
    doc_ref: DocumentRef,
    model: String,
}

/// A stable handle to a model's record collection within one document.
#[derive(Clone)]
pub struct RecordCollectionRef {
    inner: Arc<RecordCollectionRefInner>,
}

impl RecordCollectionRef {
    /// The owning document ref.
    pub fn doc_ref(&self) -> &DocumentRef {
        &self.inner.doc_ref
    }

    /// The model name this collection projects.
    pub fn model(&self) -> &str {
        &self.inner.model
    }

    /// Whether two refs point at the same underlying handle.
    pub fn is_same_handle(&self, other: &RecordCollectionRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn invalid() -> Self {
        Self {
            inner: Arc::new(RecordCollectionRefInner {
                doc_ref: DocumentRef::invalid(),
                model: String::new(),
            }),
        }
    }
}

struct RecordRefInner {
    id: RecordId,
    model: String,
    doc_ref: DocumentRef,
}

/// A stable handle to one record.
#[derive(Clone)]
pub struct RecordRef {
    inner: Arc<RecordRefInner>,
}

impl RecordRef {
    /// The record id.
    pub fn id(&self) -> &RecordId {
        &self.inner.id
    }

    /// The model name the record belongs to.
    pub fn model(&self) -> &str {
        &self.inner.model
    }

    /// The owning document ref.
    pub fn doc_ref(&self) -> &DocumentRef {
        &self.inner.doc_ref
    }

    /// Whether two refs point at the same underlying handle.
    pub fn is_same_handle(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn invalid() -> Self {
        Self {
            inner: Arc::new(RecordRefInner {
                id: RecordId::new(""),
                model: String::new(),
                doc_ref: DocumentRef::invalid(),
            }),
        }
    }
}

/// Per-InternalDoc weak-valued ref cache, plus the frozen process-wide
/// sentinel "invalid" refs used for uninitialised use cases (§4.2, §9).
pub struct RefRegistry {
    doc_ref: RwLock<Option<Weak<DocumentRefInner>>>,
    collections: RwLock<HashMap<String, Weak<RecordCollectionRefInner>>>,
    records: RwLock<HashMap<(String, String), Weak<RecordRefInner>>>,
}

impl RefRegistry {
    /// A fresh, empty registry.
    pub fn new() -> Self {
        Self {
            doc_ref: RwLock::new(None),
            collections: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached `DocumentRef` for `id`/`schema` if one is still
    /// live, otherwise mint and cache a new one (P1).
    pub fn doc_ref(&self, id: &DocumentId, schema: &Schema) -> DocumentRef {
        let mut slot = self.doc_ref.write().expect("doc ref lock poisoned");
        if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
            return DocumentRef(existing);
        }
        let fresh = Arc::new(DocumentRefInner {
            id: id.clone(),
            schema: schema.clone(),
        });
        *slot = Some(Arc::downgrade(&fresh));
        DocumentRef(fresh)
    }

    /// Return the cached `RecordCollectionRef` for `model`, minting one if
    /// none is live (P2).
    pub fn collection_ref(&self, doc_ref: &DocumentRef, model: &str) -> RecordCollectionRef {
        let mut map = self.collections.write().expect("collection ref lock poisoned");
        if let Some(existing) = map.get(model).and_then(Weak::upgrade) {
            return RecordCollectionRef { inner: existing };
        }
        let fresh = Arc::new(RecordCollectionRefInner {
            doc_ref: doc_ref.clone(),
            model: model.to_string(),
        });
        map.insert(model.to_string(), Arc::downgrade(&fresh));
        RecordCollectionRef { inner: fresh }
    }

    /// Return the cached `RecordRef` for `(model, id)`, minting one if none
    /// is live (P3). Does not check whether the record itself exists in
    /// the CRDT — a ref can be minted for a not-yet-written record.
    pub fn record_ref(&self, doc_ref: &DocumentRef, model: &str, id: &RecordId) -> RecordRef {
        let key = (model.to_string(), id.0.clone());
        let mut map = self.records.write().expect("record ref lock poisoned");
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return RecordRef { inner: existing };
        }
        let fresh = Arc::new(RecordRefInner {
            id: id.clone(),
            model: model.to_string(),
            doc_ref: doc_ref.clone(),
        });
        map.insert(key, Arc::downgrade(&fresh));
        RecordRef { inner: fresh }
    }
}

impl Default for RefRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A frozen, process-wide invalid `DocumentRef` sentinel. Reads on it
/// return empty values; mutating operations against it fail with
/// `InvalidRef`.
pub fn invalid_doc_ref() -> DocumentRef {
    static SENTINEL: OnceLock<DocumentRef> = OnceLock::new();
    SENTINEL.get_or_init(DocumentRef::invalid).clone()
}

/// The invalid `RecordCollectionRef` sentinel.
pub fn invalid_record_collection_ref() -> RecordCollectionRef {
    static SENTINEL: OnceLock<RecordCollectionRef> = OnceLock::new();
    SENTINEL.get_or_init(RecordCollectionRef::invalid).clone()
}

/// The invalid `RecordRef` sentinel.
pub fn invalid_record_ref() -> RecordRef {
    static SENTINEL: OnceLock<RecordRef> = OnceLock::new();
    SENTINEL.get_or_init(RecordRef::invalid).clone()
}

/// Whether a `DocumentRef` is the frozen invalid sentinel.
pub fn is_invalid_doc_ref(doc_ref: &DocumentRef) -> bool {
    doc_ref.is_same_handle(&invalid_doc_ref())
}
