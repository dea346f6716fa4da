//! The store facade.

use gridfs_backend::{BackendRegistry, DbHandle, FileHandle, FileOptions, OpenMode};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::{StoreConfig, StoreOptions};
use crate::connection::ConnectionManager;
use crate::encoding::Encoding;
use crate::error::{timed, Error, Operation, Result};
use crate::stream::{GridStream, StreamOptions};

/// Streaming access to the files of one database.
///
/// Cloning is cheap; clones share the connection. Nothing is dialed until
/// the first operation that needs the database.
///
/// ```no_run
/// # async fn demo() -> gridfs_stream::Result<()> {
/// use gridfs_stream::{Encoding, Store};
///
/// let store = Store::new("localhost/files");
/// store.write_str("hello.txt", "hello", Encoding::Utf8).await?;
/// assert_eq!(store.read_to_string("hello.txt", Encoding::Utf8).await?, "hello");
/// store.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    connection: ConnectionManager,
    options: StoreOptions,
}

/// Builder for a [`Store`] with a custom backend registry or options.
pub struct StoreBuilder {
    config: StoreConfig,
    registry: Option<Arc<BackendRegistry>>,
    options: StoreOptions,
}

impl StoreBuilder {
    pub fn registry(mut self, registry: impl Into<Arc<BackendRegistry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Store {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(BackendRegistry::default()));
        Store {
            inner: Arc::new(StoreInner {
                connection: ConnectionManager::new(self.config, registry, &self.options),
                options: self.options,
            }),
        }
    }
}

impl Store {
    /// A store with the default backends and options.
    pub fn new(config: impl Into<StoreConfig>) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: impl Into<StoreConfig>) -> StoreBuilder {
        StoreBuilder {
            config: config.into(),
            registry: None,
            options: StoreOptions::default(),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Connect now and return the handle.
    pub async fn open(&self) -> Result<DbHandle> {
        self.inner.connection.handle().await
    }

    /// Out-of-band connection errors, from the moment of subscription.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Error> {
        self.inner.connection.subscribe_errors()
    }

    /// Stream the contents of `name`, optionally limited to a byte range.
    ///
    /// Fails only on an inverted range; everything else is reported by the
    /// stream once it is used.
    pub fn create_read_stream(&self, name: &str, options: StreamOptions) -> Result<GridStream> {
        self.stream(name, options, OpenMode::Read)
    }

    /// Stream bytes into `name`. The mode defaults to [`OpenMode::Write`].
    pub fn create_write_stream(&self, name: &str, options: StreamOptions) -> Result<GridStream> {
        let mode = options.mode.unwrap_or(OpenMode::Write);
        self.stream(name, options, mode)
    }

    fn stream(&self, name: &str, options: StreamOptions, mode: OpenMode) -> Result<GridStream> {
        let inner = Arc::clone(&self.inner);
        let filename = name.to_string();
        let file_options = FileOptions {
            content_type: options.content_type.clone(),
        };
        GridStream::new(name, options, self.inner.options.io_timeout, move || {
            let inner = Arc::clone(&inner);
            let filename = filename.clone();
            let file_options = file_options.clone();
            async move { inner.open_file(&filename, mode, &file_options).await }
        })
    }

    /// Replace the contents of `name` with `data`.
    pub async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let io_timeout = self.inner.options.io_timeout;
        let mut file = self
            .inner
            .open_file(name, OpenMode::Write, &FileOptions::default())
            .await?;
        let written = timed(Operation::Write, io_timeout, file.write(data)).await;
        let closed = timed(Operation::Close, io_timeout, file.close()).await;
        first_error(name, written, closed)
    }

    pub async fn write_str(&self, name: &str, text: &str, encoding: Encoding) -> Result<()> {
        let data = encoding.encode(text)?;
        self.write(name, &data).await
    }

    /// The whole contents of `name`.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let io_timeout = self.inner.options.io_timeout;
        let mut file = self
            .inner
            .open_file(name, OpenMode::Read, &FileOptions::default())
            .await?;
        let data = timed(Operation::Read, io_timeout, file.read_to_end()).await;
        let closed = timed(Operation::Close, io_timeout, file.close()).await;
        first_error(name, data, closed)
    }

    pub async fn read_to_string(&self, name: &str, encoding: Encoding) -> Result<String> {
        let data = self.read(name).await?;
        Ok(encoding.decode(&data))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let (handle, backend) = self.inner.connection.ready().await?;
        timed(
            Operation::Exists,
            self.inner.options.io_timeout,
            backend.exists(&handle, name),
        )
        .await
    }

    pub async fn unlink(&self, name: &str) -> Result<()> {
        let (handle, backend) = self.inner.connection.ready().await?;
        timed(
            Operation::Unlink,
            self.inner.options.io_timeout,
            backend.unlink(&handle, name),
        )
        .await?;
        tracing::debug!("Removed '{name}'");
        Ok(())
    }

    /// Distinct file names, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let (handle, backend) = self.inner.connection.ready().await?;
        let mut names = timed(
            Operation::List,
            self.inner.options.io_timeout,
            backend.list(&handle),
        )
        .await?;
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Shut the connection down. A store that never connected has nothing
    /// to close.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.connection.is_started() {
            return Ok(());
        }
        let (handle, backend) = self.inner.connection.ready().await?;
        timed(
            Operation::Shutdown,
            self.inner.options.io_timeout,
            backend.shutdown(&handle),
        )
        .await?;
        tracing::info!("Closed {} connection", backend.name());
        Ok(())
    }
}

impl StoreInner {
    async fn open_file(
        &self,
        name: &str,
        mode: OpenMode,
        file_options: &FileOptions,
    ) -> Result<Box<dyn FileHandle>> {
        let (handle, backend) = self.connection.ready().await?;
        let mode = mode.normalized();
        tracing::debug!("Opening '{name}' ({mode}) with backend '{}'", backend.name());
        timed(
            Operation::Open,
            self.options.io_timeout,
            backend.open(&handle, name, mode, file_options),
        )
        .await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("options", &self.inner.options)
            .field("connected", &self.inner.connection.is_started())
            .finish()
    }
}

/// The operation's error if it failed, else the close error.
fn first_error<T>(name: &str, op: Result<T>, closed: Result<()>) -> Result<T> {
    match (op, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), Ok(())) => Err(err),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(err), Err(close_err)) => {
            tracing::warn!("Dropping close error for '{name}' after failed operation: {close_err}");
            Err(err)
        }
    }
}
