//! Backend registry and handle resolution.

use std::sync::Arc;

use crate::{Backend, DbHandle, MemoryBackend, MongoBackend};

/// Table of known backends, consulted in registration order.
///
/// The table is filled when the application starts; resolution never
/// inspects anything but the registered probes.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// A registry with no backends.
    pub fn empty() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// Add a backend; it is tried after the ones already registered.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> &mut Self {
        tracing::debug!("Registered gridfs backend '{}'", backend.name());
        self.backends.push(backend);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    /// Find the backend able to drive `handle`.
    pub fn resolve(&self, handle: &DbHandle) -> Option<Arc<dyn Backend>> {
        let found = self
            .backends
            .iter()
            .find(|backend| backend.probe(handle))
            .cloned();
        match &found {
            Some(backend) => tracing::debug!(
                "Resolved handle {} to backend '{}'",
                handle.type_name(),
                backend.name()
            ),
            None => tracing::debug!("No backend accepts handle {}", handle.type_name()),
        }
        found
    }

    /// Find the backend dialing the scheme of `uri`.
    pub fn for_uri(&self, uri: &str) -> Option<Arc<dyn Backend>> {
        let (scheme, _) = uri.split_once("://")?;
        self.backends
            .iter()
            .find(|backend| backend.schemes().contains(&scheme))
            .cloned()
    }

    /// Registered backend names, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

impl Default for BackendRegistry {
    /// MongoDB GridFS first, then the in-memory store.
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(MongoBackend))
            .with(Arc::new(MemoryBackend))
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
