//! Thin wrapper around the embedded CRDT library.
//!
//! The rest of the engine never touches `yrs` directly; it goes through
//! [`CrdtReplica`]. This is the component the glossary calls "the embedded
//! CRDT library... treated as an opaque dependency" — concretely `yrs`,
//! chosen because the data model here is map-valued records rather than
//! text.

use std::sync::Arc;

use serde_json::Value;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Map, MapPrelim, MapRef, Origin, ReadTxn, Subscription, Transact, TransactionMut, Update};

/// Tag carried as a CRDT transaction's origin so [`CrdtReplica`] can tell
/// local application edits apart from applied remote updates, and can
/// recover an [`crate::model::EditDescription`] label when one was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOrigin {
    /// A local edit with no activity label.
    Local,
    /// A local edit labelled for the activity feed.
    LocalDescribed {
        /// Model name the edit is described against.
        model: String,
        /// The description payload, JSON-encoded.
        data: Value,
    },
    /// An update applied from the transport, never re-published.
    Remote,
}

const REMOTE_MARKER: u8 = 0;
const LOCAL_MARKER: u8 = 1;
const LOCAL_DESCRIBED_MARKER: u8 = 2;

impl EditOrigin {
    fn encode(&self) -> Vec<u8> {
        match self {
            EditOrigin::Remote => vec![REMOTE_MARKER],
            EditOrigin::Local => vec![LOCAL_MARKER],
            EditOrigin::LocalDescribed { model, data } => {
                let mut out = vec![LOCAL_DESCRIBED_MARKER];
                let payload = serde_json::json!({ "model": model, "data": data });
                out.extend_from_slice(payload.to_string().as_bytes());
                out
            }
        }
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes.first().copied() {
            Some(REMOTE_MARKER) => Some(EditOrigin::Remote),
            Some(LOCAL_MARKER) => Some(EditOrigin::Local),
            Some(LOCAL_DESCRIBED_MARKER) => {
                let payload: Value = serde_json::from_slice(&bytes[1..]).ok()?;
                let model = payload.get("model")?.as_str()?.to_string();
                let data = payload.get("data").cloned().unwrap_or(Value::Null);
                Some(EditOrigin::LocalDescribed { model, data })
            }
            _ => None,
        }
    }

    fn into_yrs_origin(self) -> Origin {
        Origin::from(self.encode())
    }

    /// Recover the origin tag from a transaction, if one was set by this
    /// wrapper (transactions started elsewhere have no recoverable origin).
    pub fn from_txn(txn: &TransactionMut<'_>) -> Option<Self> {
        txn.origin().and_then(|o| Self::decode(o.as_ref()))
    }
}

/// Owns a single document's CRDT replica: a [`yrs::Doc`] plus one
/// top-level [`MapRef`] per record model, created on demand.
pub struct CrdtReplica {
    doc: yrs::Doc,
}

impl CrdtReplica {
    /// Start a fresh, empty replica.
    pub fn new() -> Self {
        Self { doc: yrs::Doc::new() }
    }

    /// Seed a replica by applying a previously-encoded update, e.g. when
    /// rehydrating from a snapshot.
    pub fn from_update(bytes: &[u8]) -> Result<Self, CrdtError> {
        let replica = Self::new();
        replica.apply_update(bytes, EditOrigin::Remote)?;
        Ok(replica)
    }

    /// Ensure a top-level shared map exists for `model_name`, returning it.
    pub fn model_map(&self, model_name: &str) -> MapRef {
        self.doc.get_or_insert_map(model_name)
    }

    /// Run `f` inside a transaction tagged with `origin`, returning its
    /// result. All mutation goes through here so that every CRDT write is
    /// inside an (explicit or implicit single-op) transaction, per the
    /// concurrency model.
    pub fn with_transaction<R>(
        &self,
        origin: EditOrigin,
        f: impl FnOnce(&mut TransactionMut) -> R,
    ) -> R {
        let mut txn = self.doc.transact_mut_with(origin.into_yrs_origin());
        f(&mut txn)
    }

    /// Apply a binary update received from the transport or from a
    /// snapshot, tagging the transaction so observers and the sync driver
    /// can recognise it as non-local.
    pub fn apply_update(&self, bytes: &[u8], origin: EditOrigin) -> Result<(), CrdtError> {
        let update = Update::decode_v1(bytes).map_err(|e| CrdtError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.into_yrs_origin());
        txn.apply_update(update).map_err(|e| CrdtError::Apply(e.to_string()))?;
        Ok(())
    }

    /// Encode the full current state as a single update, suitable for
    /// seeding a fresh replica elsewhere.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Register a deep observer on a model's top-level map: fires not only
    /// for direct insert/remove of a record's key, but for any mutation
    /// nested inside an existing record's own map, so field-level edits
    /// are visible to fan-out too. Returns the RAII subscription handle;
    /// dropping it detaches the observer.
    pub fn observe_model<F>(&self, model_name: &str, callback: F) -> Subscription
    where
        F: Fn(&TransactionMut, &yrs::types::Events) + 'static,
    {
        let map = self.model_map(model_name);
        map.observe_deep(callback)
    }

    /// Register a doc-level update observer, used by the sync driver to
    /// pick up every locally-applied change (including its origin) for
    /// outgoing publish. Distinct from `observe_model`, which only sees
    /// per-key changes within one model's map.
    pub fn observe_updates<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TransactionMut, &yrs::UpdateEvent) + 'static,
    {
        self.doc.observe_update_v1(callback).expect("update observer registration failed")
    }

    /// Read a record's full value as plain JSON, or `None` if absent.
    pub fn get_record(&self, model_name: &str, record_id: &str) -> Option<Value> {
        let map = self.model_map(model_name);
        let txn = self.doc.transact();
        let record = map.get(&txn, record_id)?;
        Some(yrs_value_to_json(&record, &txn))
    }

    /// List record ids for a model in CRDT insertion order.
    pub fn list_record_ids(&self, model_name: &str) -> Vec<String> {
        let map = self.model_map(model_name);
        let txn = self.doc.transact();
        map.iter(&txn).map(|(k, _)| k.to_string()).collect()
    }

    /// Full-replacement write: create or replace the nested map for
    /// `record_id`, deleting keys absent from `value`.
    pub fn set_record(&self, model_name: &str, record_id: &str, value: &Value) {
        self.set_record_with_origin(model_name, record_id, value, EditOrigin::Local);
    }

    /// [`Self::set_record`], tagging the transaction with `origin` instead
    /// of the default untagged local edit. Used by `withTransaction` to
    /// attach an [`crate::model::EditDescription`] to the resulting publish.
    pub fn set_record_with_origin(&self, model_name: &str, record_id: &str, value: &Value, origin: EditOrigin) {
        self.with_transaction(origin, |txn| {
            let map = self.model_map(model_name);
            if let Some(yrs::Value::YMap(existing)) = map.get(txn, record_id) {
                // A JSON `null` field means "absent", same as a field missing
                // entirely from `value` — it must not count as "kept" or the
                // stale key underneath it would never be removed.
                let keep: Vec<String> = value
                    .as_object()
                    .map(|o| o.iter().filter(|(_, v)| !v.is_null()).map(|(k, _)| k.clone()).collect())
                    .unwrap_or_default();
                let stale: Vec<String> = existing
                    .iter(txn)
                    .map(|(k, _)| k.to_string())
                    .filter(|k| !keep.contains(k))
                    .collect();
                for key in stale {
                    existing.remove(txn, &key);
                }
                write_fields(txn, &existing, value);
            } else {
                let new_map = map.insert(txn, record_id.to_string(), MapPrelim::default());
                write_fields(txn, &new_map, value);
            }
        });
    }

    /// Merge write: only touches fields present in `partial`. Returns
    /// `false` without mutating if the record does not exist.
    pub fn update_record(&self, model_name: &str, record_id: &str, partial: &Value) -> bool {
        self.update_record_with_origin(model_name, record_id, partial, EditOrigin::Local)
    }

    /// [`Self::update_record`], tagging the transaction with `origin`.
    pub fn update_record_with_origin(&self, model_name: &str, record_id: &str, partial: &Value, origin: EditOrigin) -> bool {
        self.with_transaction(origin, |txn| {
            let map = self.model_map(model_name);
            match map.get(txn, record_id) {
                Some(yrs::Value::YMap(existing)) => {
                    write_fields(txn, &existing, partial);
                    true
                }
                _ => false,
            }
        })
    }

    /// Tombstone-aware delete; no-op if the record is absent.
    pub fn delete_record(&self, model_name: &str, record_id: &str) {
        self.delete_record_with_origin(model_name, record_id, EditOrigin::Local);
    }

    /// [`Self::delete_record`], tagging the transaction with `origin`.
    pub fn delete_record_with_origin(&self, model_name: &str, record_id: &str, origin: EditOrigin) {
        self.with_transaction(origin, |txn| {
            let map = self.model_map(model_name);
            map.remove(txn, record_id);
        });
    }

    /// Whether a record currently exists.
    pub fn has_record(&self, model_name: &str, record_id: &str) -> bool {
        let map = self.model_map(model_name);
        let txn = self.doc.transact();
        map.get(&txn, record_id).is_some()
    }
}

impl Default for CrdtReplica {
    fn default() -> Self {
        Self::new()
    }
}

fn write_fields(txn: &mut TransactionMut, map: &MapRef, value: &Value) {
    if let Some(obj) = value.as_object() {
        for (key, field_value) in obj {
            if field_value.is_null() {
                continue;
            }
            map.insert(txn, key.clone(), json_to_any(field_value));
        }
    }
}

/// Convert a JSON value into the CRDT's primitive value representation.
/// Objects and arrays become `Any::Map`/`Any::Array` literals, not nested
/// observable shared maps — only the per-record map itself is a CRDT
/// collection type, matching the schema mapper's one-level nesting.
fn json_to_any(value: &Value) -> yrs::Any {
    match value {
        Value::Null => yrs::Any::Null,
        Value::Bool(b) => yrs::Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => yrs::Any::BigInt(i),
            None => yrs::Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => yrs::Any::String(s.as_str().into()),
        Value::Array(items) => {
            yrs::Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into())
        }
        Value::Object(fields) => yrs::Any::Map(Box::new(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect(),
        )),
    }
}

fn yrs_value_to_json(value: &yrs::Value, txn: &impl ReadTxn) -> Value {
    value.to_json(txn).into()
}

/// Errors from decoding or applying a binary CRDT update.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CrdtError {
    /// The bytes did not decode as a valid update.
    #[error("failed to decode update: {0}")]
    Decode(String),
    /// The update failed to apply to this replica.
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// Shared handle to a replica, used wherever multiple components need to
/// read/write the same document's CRDT state.
pub type SharedReplica = Arc<CrdtReplica>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_record_is_full_replacement() {
        let replica = CrdtReplica::new();
        replica.set_record(
            "User",
            "u1",
            &serde_json::json!({"id": "u1", "name": "A", "age": 25}),
        );
        assert_eq!(
            replica.get_record("User", "u1").unwrap()["name"],
            serde_json::json!("A")
        );
        replica.set_record("User", "u1", &serde_json::json!({"id": "u1", "name": "B"}));
        let snapshot = replica.get_record("User", "u1").unwrap();
        assert!(snapshot.get("age").is_none());
    }

    #[test]
    fn update_record_merges_and_reports_existence() {
        let replica = CrdtReplica::new();
        assert!(!replica.update_record("User", "u1", &serde_json::json!({"age": 1})));
        replica.set_record("User", "u1", &serde_json::json!({"id": "u1", "name": "A", "age": 25}));
        assert!(replica.update_record("User", "u1", &serde_json::json!({"age": 26})));
        let snapshot = replica.get_record("User", "u1").unwrap();
        assert!(snapshot.get("name").is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let replica = CrdtReplica::new();
        replica.set_record("User", "u1", &serde_json::json!({"id": "u1"}));
        assert!(replica.has_record("User", "u1"));
        replica.delete_record("User", "u1");
        assert!(!replica.has_record("User", "u1"));
        replica.delete_record("User", "u1");
        assert!(!replica.has_record("User", "u1"));
    }

    #[test]
    fn list_record_ids_matches_insertion_order() {
        let replica = CrdtReplica::new();
        replica.set_record("User", "u1", &serde_json::json!({"id": "u1"}));
        replica.set_record("User", "u2", &serde_json::json!({"id": "u2"}));
        assert_eq!(replica.list_record_ids("User"), vec!["u1", "u2"]);
    }

    #[test]
    fn origin_roundtrips_through_encode_decode() {
        let described = EditOrigin::LocalDescribed {
            model: "User".into(),
            data: serde_json::json!({"id": "u1"}),
        };
        let bytes = described.encode();
        assert_eq!(EditOrigin::decode(&bytes), Some(described));
        assert_eq!(EditOrigin::decode(&EditOrigin::Remote.encode()), Some(EditOrigin::Remote));
    }

    #[test]
    fn replica_round_trips_through_encoded_state() {
        let replica = CrdtReplica::new();
        replica.set_record("User", "u1", &serde_json::json!({"id": "u1"}));
        let encoded = replica.encode_state();
        let rehydrated = CrdtReplica::from_update(&encoded).unwrap();
        assert!(rehydrated.has_record("User", "u1"));
    }

    #[test]
    fn set_record_treats_null_fields_as_absent() {
        let replica = CrdtReplica::new();
        replica.set_record(
            "User",
            "u1",
            &serde_json::json!({"id": "u1", "name": "A", "age": 25}),
        );
        replica.set_record("User", "u1", &serde_json::json!({"id": "u1", "name": "B", "age": null}));
        let snapshot = replica.get_record("User", "u1").unwrap();
        assert!(snapshot.get("age").is_none());
    }

    proptest::proptest! {
        #[test]
        fn set_record_always_drops_null_fields(age in 0..120i32) {
            let replica = CrdtReplica::new();
            replica.set_record("User", "u1", &serde_json::json!({"id": "u1", "age": age}));
            replica.set_record("User", "u1", &serde_json::json!({"id": "u1", "age": null}));
            let snapshot = replica.get_record("User", "u1").unwrap();
            proptest::prop_assert!(snapshot.get("age").is_none());
        }
    }
}
