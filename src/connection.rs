//! Lazy database connection shared by every operation of a store.

use deferred::{Deferred, FailurePolicy};
use gridfs_backend::{Backend, BackendRegistry, ConnectOptions, DbHandle};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, mpsc};

use crate::config::{normalize_connection_string, StoreConfig, StoreOptions};
use crate::error::{Error, Operation, Result};

/// Buffered out-of-band errors per subscriber before it starts lagging.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Owns the store's connection handle.
///
/// The handle is produced at most once (per attempt, see
/// [`StoreOptions::retry_failed_connect`]) no matter how many operations ask
/// for it concurrently.
pub(crate) struct ConnectionManager {
    registry: Arc<BackendRegistry>,
    connection: Deferred<DbHandle, Error>,
    backend: OnceLock<Arc<dyn Backend>>,
    errors: broadcast::Sender<Error>,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: StoreConfig,
        registry: Arc<BackendRegistry>,
        options: &StoreOptions,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let policy = if options.retry_failed_connect {
            FailurePolicy::Retry
        } else {
            FailurePolicy::Cache
        };

        let connection = {
            let registry = Arc::clone(&registry);
            let errors = errors.clone();
            let connect_options = options.connect_options();
            Deferred::with_policy(
                move || {
                    establish(
                        config.clone(),
                        Arc::clone(&registry),
                        connect_options.clone(),
                        errors.clone(),
                    )
                },
                policy,
            )
        };

        Self {
            registry,
            connection,
            backend: OnceLock::new(),
            errors,
        }
    }

    /// The connection handle, connecting on first use.
    pub(crate) async fn handle(&self) -> Result<DbHandle> {
        self.connection.get().await
    }

    /// The connection handle and the backend that drives it.
    pub(crate) async fn ready(&self) -> Result<(DbHandle, Arc<dyn Backend>)> {
        let handle = self.handle().await?;
        if let Some(backend) = self.backend.get() {
            return Ok((handle, Arc::clone(backend)));
        }

        let backend = self
            .registry
            .resolve(&handle)
            .ok_or_else(|| Error::BackendNotFound(handle.type_name().to_string()))?;
        let backend = Arc::clone(self.backend.get_or_init(|| backend));
        Ok((handle, backend))
    }

    /// Whether a connection attempt was ever started.
    pub(crate) fn is_started(&self) -> bool {
        self.connection.attempts() > 0
    }

    pub(crate) fn subscribe_errors(&self) -> broadcast::Receiver<Error> {
        self.errors.subscribe()
    }
}

async fn establish(
    config: StoreConfig,
    registry: Arc<BackendRegistry>,
    connect_options: ConnectOptions,
    errors: broadcast::Sender<Error>,
) -> Result<DbHandle> {
    match config {
        StoreConfig::ConnectionString(raw) => {
            let uri = normalize_connection_string(&raw)?;
            let backend = registry.for_uri(&uri).ok_or_else(|| {
                Error::InvalidConfig(format!("no registered backend can dial '{uri}'"))
            })?;

            tracing::debug!("Connecting to {uri} with backend '{}'", backend.name());
            let connected = backend
                .connect(&uri, &connect_options)
                .await
                .map_err(|cause| Error::io(Operation::Connect, cause))?;
            if let Some(rx) = connected.errors {
                forward_errors(rx, errors);
            }
            Ok(connected.handle)
        }
        StoreConfig::Openable(source) => source
            .open()
            .await
            .map_err(|cause| Error::io(Operation::Connect, cause)),
        StoreConfig::Accessor(source) => source
            .current_handle()
            .await
            .map_err(|cause| Error::io(Operation::Connect, cause)),
        StoreConfig::Raw(handle) => {
            if registry.resolve(&handle).is_some() {
                Ok(handle)
            } else {
                Err(Error::UnknownConfig(handle.type_name().to_string()))
            }
        }
    }
}

/// Re-publish transport errors on the store's error channel from a task of
/// their own, so the transport never runs subscriber code.
fn forward_errors(mut rx: mpsc::UnboundedReceiver<anyhow::Error>, errors: broadcast::Sender<Error>) {
    tokio::spawn(async move {
        while let Some(err) = rx.recv().await {
            tracing::warn!("Connection error: {err:#}");
            // No subscribers is fine; the error is still logged.
            let _ = errors.send(Error::Connection(Arc::new(err)));
        }
        tracing::debug!("Connection error channel closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfs_backend::MemoryDb;

    fn manager(config: impl Into<StoreConfig>) -> ConnectionManager {
        ConnectionManager::new(
            config.into(),
            Arc::new(BackendRegistry::default()),
            &StoreOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_raw_handle_is_used_directly() {
        let db = MemoryDb::new();
        let manager = manager(DbHandle::new(db.clone()));
        let (handle, backend) = manager.ready().await.unwrap();
        assert_eq!(backend.name(), "memory");
        assert!(handle.is::<MemoryDb>());
        assert_eq!(db.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_unrecognised_raw_handle_is_config_error() {
        let manager = manager(DbHandle::new(String::from("nope")));
        let err = manager.handle().await.unwrap_err();
        assert!(matches!(err, Error::UnknownConfig(_)));
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_connection_string_with_unknown_scheme() {
        let manager = manager("redis://127.0.0.1/db");
        let err = manager.handle().await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_memory_connection_string() {
        let manager = manager("memory://127.0.0.1/connection_manager_test");
        let (handle, backend) = manager.ready().await.unwrap();
        assert_eq!(backend.name(), "memory");
        assert_eq!(
            handle.downcast_ref::<MemoryDb>().unwrap().name(),
            "memory://127.0.0.1/connection_manager_test"
        );
        assert!(manager.is_started());
    }

    #[tokio::test]
    async fn test_out_of_band_errors_are_forwarded() {
        let uri = "memory://127.0.0.1/connection_manager_oob";
        let manager = manager(uri);
        let mut errors = manager.subscribe_errors();
        manager.handle().await.unwrap();

        MemoryDb::named(uri).report_error("replica set lost primary");
        let err = errors.recv().await.unwrap();
        assert!(matches!(err, Error::Connection(_)));
        assert!(err.to_string().contains("replica set lost primary"));
    }
}
