//! Error taxonomy for the state core.
//!
//! Mutating operations surface these synchronously; subscription-delivery
//! and transport problems are instead routed through [`crate::status`] and
//! logged, per the propagation policy in the component design.

use thiserror::Error;

/// Errors returned by document engine operations.
#[derive(Debug, Error, Clone)]
pub enum StateCoreError {
    /// Operation attempted on a sentinel/invalid ref.
    #[error("invalid ref")]
    InvalidRef,

    /// Mutation targeting an unknown document id.
    #[error("document missing: {0}")]
    DocumentMissing(String),

    /// `updateRecord` on an absent record, or a snapshot read of one.
    #[error("record missing: model={model} id={id}")]
    RecordMissing {
        /// Model name.
        model: String,
        /// Record id.
        id: String,
    },

    /// A `docRef` was reused with a differently-shaped schema.
    #[error("schema mismatch for document {doc_id}")]
    SchemaMismatch {
        /// Document id.
        doc_id: String,
    },

    /// Transport subscribe/publish returned non-success.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Remote update's `baseRevisionId` disagreed with the local
    /// `lastRevisionId`. Non-fatal: the update is dropped, not applied.
    #[error("sync base revision mismatch: expected {expected}, got {got}")]
    SyncBaseRevisionMismatch {
        /// The revision id the driver expected.
        expected: u64,
        /// The revision id the message actually carried.
        got: u64,
    },

    /// `waitForMetadataLoad`/`waitForDataLoad` exceeded their deadline.
    #[error("load timed out")]
    LoadTimeout,

    /// StatusMachine transitioned to ERROR for metadata or data.
    #[error("load failed: {0}")]
    LoadError(String),

    /// Transport returned a document creation rejection.
    #[error("create failed: {0}")]
    CreateFailed(String),

    /// Transport returned a search rejection.
    #[error("search failed: {0}")]
    SearchFailed(String),

    /// A message of an unrecognised type arrived on a transport channel.
    /// Non-fatal; warned once per type by the caller.
    #[error("unknown message type: {0}")]
    UnknownMessage(String),
}

impl StateCoreError {
    /// True for errors that the spec defines as non-fatal diagnostics
    /// rather than failures a caller must handle.
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            StateCoreError::SyncBaseRevisionMismatch { .. } | StateCoreError::UnknownMessage(_)
        )
    }
}
