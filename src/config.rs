//! Engine configuration.
//!
//! Construction takes a single config value; there is no other global
//! state (§6 Configuration).

use std::sync::Arc;

use thiserror::Error;

use crate::schema::SchemaRegistry;
use crate::sync::transport::TransportFactory;

/// Configuration consumed by [`crate::engine::DocumentEngine::new`].
#[derive(Clone)]
pub struct EngineConfig {
    /// Produces a fresh transport session per document.
    pub transport_factory: Arc<dyn TransportFactory>,
    /// Schema package(s) the engine maps records against.
    pub schema_registry: SchemaRegistry,
    /// Whether `createDocRef` for an unknown id auto-creates the document.
    pub auto_create_documents: bool,
    /// Optional namespace prefix for document ids minted locally.
    pub db_prefix: Option<String>,
    /// Default for presence subscriptions' `ignoreSelfUpdates`.
    pub ignore_self_presence: bool,
}

impl EngineConfig {
    /// Start a builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    transport_factory: Option<Arc<dyn TransportFactory>>,
    schema_registry: Option<SchemaRegistry>,
    auto_create_documents: bool,
    db_prefix: Option<String>,
    ignore_self_presence: bool,
}

impl EngineConfigBuilder {
    /// Set the transport factory. Required.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Set the schema registry. Required.
    pub fn schema_registry(mut self, registry: SchemaRegistry) -> Self {
        self.schema_registry = Some(registry);
        self
    }

    /// Enable auto-creation of documents referenced but not yet known.
    pub fn auto_create_documents(mut self, value: bool) -> Self {
        self.auto_create_documents = value;
        self
    }

    /// Set a namespace prefix for locally-minted document ids.
    pub fn db_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.db_prefix = Some(prefix.into());
        self
    }

    /// Default for presence subscriptions' `ignoreSelfUpdates`.
    pub fn ignore_self_presence(mut self, value: bool) -> Self {
        self.ignore_self_presence = value;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            transport_factory: self
                .transport_factory
                .ok_or(ConfigError::MissingValue("transport_factory"))?,
            schema_registry: self
                .schema_registry
                .ok_or(ConfigError::MissingValue("schema_registry"))?,
            auto_create_documents: self.auto_create_documents,
            db_prefix: self.db_prefix,
            ignore_self_presence: self.ignore_self_presence,
        })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was never set.
    #[error("missing value: {0}")]
    MissingValue(&'static str),
}
