//! Backend trait: everything the streaming layer needs from a store driver.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{DbHandle, FileHandle, OpenMode};

/// Options applied when dialing a connection string.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    pub server_selection_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Per-file options passed to [`Backend::open`].
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    /// Content type to record when the file is written.
    pub content_type: Option<String>,
}

/// Result of dialing a connection string.
pub struct Connected {
    pub handle: DbHandle,
    /// Errors the transport reports outside of any call, if the backend
    /// surfaces them.
    pub errors: Option<mpsc::UnboundedReceiver<anyhow::Error>>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("handle", &self.handle)
            .field("errors", &self.errors.is_some())
            .finish()
    }
}

/// A store driver.
///
/// `probe` decides whether an opaque [`DbHandle`] belongs to this backend;
/// every other method may assume it returned `true` for the handle given.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name, for logs.
    fn name(&self) -> &'static str;

    /// Connection-string schemes this backend dials (without `://`).
    fn schemes(&self) -> &'static [&'static str];

    /// Whether `handle` is a connection this backend can drive.
    fn probe(&self, handle: &DbHandle) -> bool;

    /// Dial a fully qualified connection string.
    async fn connect(&self, uri: &str, options: &ConnectOptions) -> Result<Connected>;

    /// Open `filename` in `mode` (already normalized).
    async fn open(
        &self,
        handle: &DbHandle,
        filename: &str,
        mode: OpenMode,
        options: &FileOptions,
    ) -> Result<Box<dyn FileHandle>>;

    /// Whether a file named `filename` exists.
    async fn exists(&self, handle: &DbHandle, filename: &str) -> Result<bool>;

    /// Remove every revision of `filename`. Missing files are not an error.
    async fn unlink(&self, handle: &DbHandle, filename: &str) -> Result<()>;

    /// Distinct file names, sorted.
    async fn list(&self, handle: &DbHandle) -> Result<Vec<String>>;

    /// Tear the connection down.
    async fn shutdown(&self, handle: &DbHandle) -> Result<()>;
}
