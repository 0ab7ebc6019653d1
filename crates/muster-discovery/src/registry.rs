//! Backend registry and discovery-URI resolution

use std::collections::HashMap;
use std::time::Duration;

use muster_common::{Error, Result};
use tracing::debug;

use crate::backend::Backend;
use crate::backend::consul::ConsulBackend;
use crate::backend::etcd::EtcdBackend;
use crate::backend::file::FileBackend;
use crate::backend::nodes::NodesBackend;
use crate::backend::token::TokenBackend;
use crate::backend::zookeeper::ZkBackend;

/// Builds one blank backend instance; the registry initializes it.
pub type BackendFactory = fn() -> Box<dyn Backend>;

/// Split a discovery URI into `(scheme, rest)` at the first `"://"`.
///
/// A URI without a scheme is a bare address list, handled by the `nodes`
/// backend.
pub fn resolve(uri: &str) -> (&str, &str) {
    match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("nodes", uri),
    }
}

/// Scheme-to-factory table, built once at startup and read-only afterwards.
///
/// There is deliberately no process-global registry: construct one (usually
/// via [`Registry::with_defaults`]) and pass it to whatever resolves
/// discovery URIs, so tests stay hermetic.
pub struct Registry {
    factories: HashMap<String, BackendFactory>,
}

impl Registry {
    /// An empty registry with no backends.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with all built-in backends registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .factories
            .insert("nodes".to_string(), || Box::new(NodesBackend::new()));
        registry
            .factories
            .insert("file".to_string(), || Box::new(FileBackend::new()));
        registry
            .factories
            .insert("token".to_string(), || Box::new(TokenBackend::new()));
        registry
            .factories
            .insert("consul".to_string(), || Box::new(ConsulBackend::new()));
        registry
            .factories
            .insert("etcd".to_string(), || Box::new(EtcdBackend::new()));
        registry
            .factories
            .insert("zk".to_string(), || Box::new(ZkBackend::new()));
        registry
    }

    /// Register a backend factory under a scheme name. Each scheme is
    /// write-once; a second registration is an error, never a replacement.
    pub fn register(&mut self, scheme: &str, factory: BackendFactory) -> Result<()> {
        if self.factories.contains_key(scheme) {
            return Err(Error::SchemeAlreadyRegistered(scheme.to_string()));
        }
        self.factories.insert(scheme.to_string(), factory);
        Ok(())
    }

    /// Resolve `uri`, build the matching backend, and initialize it with
    /// the caller's heartbeat. Misconfiguration fails fast here, before any
    /// watch loop exists.
    pub async fn create(&self, uri: &str, heartbeat: Duration) -> Result<Box<dyn Backend>> {
        let (scheme, rest) = resolve(uri);
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Error::UnsupportedScheme(scheme.to_string()))?;

        let mut backend = factory();
        debug!(scheme, rest, "initializing discovery backend");
        backend.initialize(rest, heartbeat).await?;
        Ok(backend)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
