//! Projects typed Record models onto the CRDT's nested shared maps.
//!
//! Pure functions over [`crate::crdt::CrdtReplica`]; this is the single
//! place where CRDT-specific binary semantics meet the application's
//! record-level mental model (§4.1 rationale).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde_json::Value;

use crate::crdt::{CrdtReplica, EditOrigin};
use crate::model::{Model, RecordId, Schema};

/// Holder for one or more in-process copies of a schema package, keyed by
/// name. Multiple copies of the "same" schema can legitimately coexist
/// (hot reload, duplicate bundling); model identity is value-based on
/// name, never on object identity.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
}

/// Emits the one-shot, process-wide warning the spec requires when a
/// direct schema lookup misses and the fallback structural match is used.
static FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

impl SchemaRegistry {
    /// Start an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named schema package.
    pub fn register(&mut self, name: impl Into<String>, schema: Schema) {
        self.schemas.insert(name.into(), schema);
    }

    /// Look up a model by schema name and model name, falling back to a
    /// structural scan across all registered schemas (matching by model
    /// name alone) when the direct schema name is unknown. The fallback
    /// path warns exactly once per process, never again after that.
    pub fn resolve_model(&self, schema_name: &str, model_name: &str) -> Option<&Model> {
        if let Some(schema) = self.schemas.get(schema_name) {
            if let Some(model) = schema.models.get(model_name) {
                return Some(model);
            }
        }
        let fallback = self
            .schemas
            .values()
            .find_map(|schema| schema.models.get(model_name));
        if fallback.is_some() && !FALLBACK_WARNED.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                schema_name,
                model_name,
                "schema metadata fallback: matched model by structural name only"
            );
        }
        fallback
    }
}

/// Pure operations mapping typed records onto a document's CRDT replica.
pub struct SchemaMapper;

impl SchemaMapper {
    /// Ensure every record-model name in `schema` exists as a top-level
    /// shared map.
    pub fn initialize_document(replica: &CrdtReplica, schema: &Schema) {
        for model_name in schema.record_model_names() {
            replica.model_map(model_name);
        }
    }

    /// Full replacement: create or replace the nested map for `id`,
    /// deleting keys not present in `value`. Fields whose value is JSON
    /// `null` are treated as absent, matching the source's `undefined`
    /// handling.
    pub fn set_record(replica: &CrdtReplica, model: &str, id: &RecordId, value: &Value) {
        replica.set_record(model, id.as_str(), value);
    }

    /// [`Self::set_record`], tagging the write with `origin` so a
    /// `withTransaction` description reaches the sync driver's publish.
    pub fn set_record_with_origin(replica: &CrdtReplica, model: &str, id: &RecordId, value: &Value, origin: EditOrigin) {
        replica.set_record_with_origin(model, id.as_str(), value, origin);
    }

    /// Merge: returns `false` without mutating if the record is absent.
    /// Fields set to JSON `null` in `partial` are NOT deleted, which is
    /// what distinguishes merge from replace.
    pub fn update_record(replica: &CrdtReplica, model: &str, id: &RecordId, partial: &Value) -> bool {
        replica.update_record(model, id.as_str(), partial)
    }

    /// [`Self::update_record`], tagging the write with `origin`.
    pub fn update_record_with_origin(replica: &CrdtReplica, model: &str, id: &RecordId, partial: &Value, origin: EditOrigin) -> bool {
        replica.update_record_with_origin(model, id.as_str(), partial, origin)
    }

    /// Deep read of the current record value, or `None` if absent.
    pub fn get_record(replica: &CrdtReplica, model: &str, id: &RecordId) -> Option<Value> {
        replica.get_record(model, id.as_str())
    }

    /// Tombstone-aware delete; no-op if the record is absent.
    pub fn delete_record(replica: &CrdtReplica, model: &str, id: &RecordId) {
        replica.delete_record(model, id.as_str());
    }

    /// [`Self::delete_record`], tagging the write with `origin`.
    pub fn delete_record_with_origin(replica: &CrdtReplica, model: &str, id: &RecordId, origin: EditOrigin) {
        replica.delete_record_with_origin(model, id.as_str(), origin);
    }

    /// Record ids in CRDT insertion order.
    pub fn list_record_ids(replica: &CrdtReplica, model: &str) -> Vec<RecordId> {
        replica
            .list_record_ids(model)
            .into_iter()
            .map(RecordId::new)
            .collect()
    }

    /// Whether a record currently exists.
    pub fn has_record(replica: &CrdtReplica, model: &str, id: &RecordId) -> bool {
        replica.has_record(model, id.as_str())
    }
}

/// Records a one-shot diagnostic without relying on a static flag, for
/// call sites that need an independent per-registry warning budget (e.g.
/// tests constructing their own registries).
pub struct OneShotWarning(RwLock<bool>);

impl OneShotWarning {
    /// A fresh, unfired warning gate.
    pub fn new() -> Self {
        Self(RwLock::new(false))
    }

    /// Fire `message` via `tracing::warn!` the first time this is called;
    /// a no-op on every subsequent call.
    pub fn warn_once(&self, message: &str) {
        let mut fired = self.0.write().expect("warning lock poisoned");
        if !*fired {
            tracing::warn!("{message}");
            *fired = true;
        }
    }
}

impl Default for OneShotWarning {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, RecordModel};
    use std::collections::HashMap as StdHashMap;

    fn user_schema() -> Schema {
        let mut models = StdHashMap::new();
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

    #[test]
    fn initialize_document_creates_model_maps() {
        let replica = CrdtReplica::new();
        SchemaMapper::initialize_document(&replica, &user_schema());
        assert!(SchemaMapper::list_record_ids(&replica, "User").is_empty());
    }

    #[test]
    fn set_then_update_then_delete_record() {
        let replica = CrdtReplica::new();
        let id = RecordId::new("u1");
        SchemaMapper::set_record(
            &replica,
            "User",
            &id,
            &serde_json::json!({"id": "u1", "name": "A", "age": 25}),
        );
        assert!(SchemaMapper::update_record(
            &replica,
            "User",
            &id,
            &serde_json::json!({"age": 26})
        ));
        let snapshot = SchemaMapper::get_record(&replica, "User", &id).unwrap();
        assert_eq!(snapshot["name"], serde_json::json!("A"));
        assert_eq!(snapshot["age"], serde_json::json!(26));

        SchemaMapper::delete_record(&replica, "User", &id);
        assert!(!SchemaMapper::has_record(&replica, "User", &id));
    }

    #[test]
    fn resolve_model_falls_back_across_schemas() {
        let mut registry = SchemaRegistry::new();
        registry.register("pkg-a", user_schema());
        let model = registry.resolve_model("pkg-b-unknown", "User");
        assert!(model.is_some());
    }
}
