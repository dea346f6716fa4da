//! In-process chunked file store.
//!
//! Files are kept whole but served in GridFS-sized chunks: a read never
//! crosses a chunk boundary, so consumers see the same short reads they
//! would against a real store. Written files become visible when their
//! handle is closed.
//!
//! Databases dialed through `memory://host/name` live for the whole
//! process and are shared by every connection to the same URI;
//! [`MemoryDb::new`] creates a private one.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::mpsc;

use crate::{
    Backend, ConnectOptions, Connected, DbHandle, FileHandle, FileOptions, OpenMode,
    DEFAULT_CONTENT_TYPE,
};

/// Default chunk size, the same as GridFS.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Operation that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Open,
    Read,
    Write,
    Seek,
    Close,
}

/// Operation counters of a [`MemoryDb`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: usize,
    pub opens: usize,
    pub reads: usize,
    pub writes: usize,
    pub seeks: usize,
    pub closes: usize,
}

#[derive(Clone)]
struct StoredFile {
    data: Arc<Vec<u8>>,
    content_type: String,
}

struct MemoryInner {
    name: String,
    chunk_size: usize,
    files: Mutex<BTreeMap<String, StoredFile>>,
    stats: Mutex<MemoryStats>,
    failures: Mutex<HashSet<FailPoint>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<anyhow::Error>>>,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory database.
#[derive(Clone)]
pub struct MemoryDb {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDb {
    /// A private database with the default chunk size.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// A private database serving reads in chunks of `chunk_size` bytes.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self::build("memory".to_string(), chunk_size)
    }

    /// The process-wide database registered under `uri`.
    pub fn named(uri: &str) -> Self {
        static DATABASES: OnceLock<Mutex<HashMap<String, MemoryDb>>> = OnceLock::new();
        let databases = DATABASES.get_or_init(|| Mutex::new(HashMap::new()));
        lock(databases)
            .entry(uri.to_string())
            .or_insert_with(|| Self::build(uri.to_string(), DEFAULT_CHUNK_SIZE))
            .clone()
    }

    fn build(name: String, chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name,
                chunk_size: chunk_size.max(1),
                files: Mutex::new(BTreeMap::new()),
                stats: Mutex::new(MemoryStats::default()),
                failures: Mutex::new(HashSet::new()),
                listeners: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> MemoryStats {
        *lock(&self.inner.stats)
    }

    /// Make the next operation of kind `point` fail.
    pub fn fail_next(&self, point: FailPoint) {
        lock(&self.inner.failures).insert(point);
    }

    /// Emit an out-of-band error to every connection dialed to this database.
    pub fn report_error(&self, message: impl std::fmt::Display) {
        let message = message.to_string();
        lock(&self.inner.listeners)
            .retain(|listener| listener.send(anyhow::anyhow!("{message}")).is_ok());
    }

    /// Committed content of `filename`.
    pub fn contents(&self, filename: &str) -> Option<Vec<u8>> {
        lock(&self.inner.files)
            .get(filename)
            .map(|file| file.data.as_ref().clone())
    }

    /// Whether [`Backend::shutdown`] was called on this database.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<anyhow::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.listeners).push(tx);
        rx
    }

    fn record(&self, update: impl FnOnce(&mut MemoryStats)) {
        update(&mut lock(&self.inner.stats));
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if self.is_shut_down() {
            anyhow::bail!("Memory database '{}' is shut down", self.inner.name);
        }
        if lock(&self.inner.failures).remove(&point) {
            anyhow::bail!("Injected {point:?} failure");
        }
        Ok(())
    }

    fn load(&self, filename: &str) -> Option<StoredFile> {
        lock(&self.inner.files).get(filename).cloned()
    }

    fn commit(&self, filename: &str, data: Vec<u8>, content_type: String) {
        lock(&self.inner.files).insert(
            filename.to_string(),
            StoredFile {
                data: Arc::new(data),
                content_type,
            },
        );
    }
}

impl std::fmt::Debug for MemoryDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDb")
            .field("name", &self.inner.name)
            .field("chunk_size", &self.inner.chunk_size)
            .finish()
    }
}

enum Body {
    Reader(Arc<Vec<u8>>),
    Writer(Vec<u8>),
}

/// Open file of a [`MemoryDb`].
pub struct MemoryFile {
    db: MemoryDb,
    filename: String,
    content_type: String,
    body: Body,
    position: u64,
    closed: bool,
}

impl MemoryFile {
    fn bytes(&self) -> &[u8] {
        match &self.body {
            Body::Reader(data) => data.as_slice(),
            Body::Writer(data) => data.as_slice(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            anyhow::bail!("File '{}' is already closed", self.filename);
        }
        Ok(())
    }
}

#[async_trait]
impl FileHandle for MemoryFile {
    fn length(&self) -> u64 {
        self.bytes().len() as u64
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        self.ensure_open()?;
        self.db.check(FailPoint::Seek)?;
        self.db.record(|s| s.seeks += 1);
        if position > self.length() {
            anyhow::bail!(
                "Cannot seek to {position} in '{}' ({} bytes)",
                self.filename,
                self.length()
            );
        }
        self.position = position;
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.db.check(FailPoint::Read)?;
        self.db.record(|s| s.reads += 1);
        let Body::Reader(data) = &self.body else {
            anyhow::bail!("File '{}' is open for writing", self.filename);
        };

        let chunk = self.db.chunk_size();
        let start = usize::try_from(self.position).context("Read position overflow")?;
        let chunk_end = (start / chunk + 1) * chunk;
        let end = data.len().min(start.saturating_add(max)).min(chunk_end);
        if start >= end {
            return Ok(Vec::new());
        }

        let out = data[start..end].to_vec();
        self.position = end as u64;
        Ok(out)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.db.check(FailPoint::Write)?;
        self.db.record(|s| s.writes += 1);
        let position = usize::try_from(self.position).context("Write position overflow")?;
        let Body::Writer(buffer) = &mut self.body else {
            anyhow::bail!("File '{}' is open for reading", self.filename);
        };

        let overlap = buffer.len().saturating_sub(position).min(data.len());
        buffer[position..position + overlap].copy_from_slice(&data[..overlap]);
        buffer.extend_from_slice(&data[overlap..]);
        self.position += data.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.db.check(FailPoint::Close)?;
        self.db.record(|s| s.closes += 1);
        self.closed = true;

        if let Body::Writer(buffer) = &mut self.body {
            let data = std::mem::take(buffer);
            tracing::debug!(
                "Committed memory file '{}' ({} bytes)",
                self.filename,
                data.len()
            );
            self.db.commit(&self.filename, data, self.content_type.clone());
        }
        Ok(())
    }
}

/// Backend for [`MemoryDb`] handles and `memory://` URIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

impl MemoryBackend {
    fn db(handle: &DbHandle) -> Result<&MemoryDb> {
        handle
            .downcast_ref::<MemoryDb>()
            .with_context(|| format!("Not a memory database handle: {}", handle.type_name()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["memory"]
    }

    fn probe(&self, handle: &DbHandle) -> bool {
        handle.is::<MemoryDb>()
    }

    async fn connect(&self, uri: &str, _options: &ConnectOptions) -> Result<Connected> {
        let db = MemoryDb::named(uri);
        db.inner.shut_down.store(false, Ordering::SeqCst);
        db.record(|s| s.connects += 1);
        let errors = db.subscribe();
        tracing::debug!("Connected to memory database {uri}");
        Ok(Connected {
            handle: DbHandle::new(db),
            errors: Some(errors),
        })
    }

    async fn open(
        &self,
        handle: &DbHandle,
        filename: &str,
        mode: OpenMode,
        options: &FileOptions,
    ) -> Result<Box<dyn FileHandle>> {
        let db = Self::db(handle)?;
        db.check(FailPoint::Open)?;
        db.record(|s| s.opens += 1);

        let existing = db.load(filename);
        let content_type = options
            .content_type
            .clone()
            .or_else(|| existing.as_ref().map(|f| f.content_type.clone()))
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let (body, position) = match mode.normalized() {
            OpenMode::Read => {
                let file = existing.with_context(|| format!("File not found: {filename}"))?;
                (Body::Reader(file.data), 0)
            }
            OpenMode::Write => (Body::Writer(Vec::new()), 0),
            OpenMode::ReadWrite | OpenMode::Append => {
                let data = existing.map(|f| f.data.as_ref().clone()).unwrap_or_default();
                let end = data.len() as u64;
                (Body::Writer(data), end)
            }
        };

        Ok(Box::new(MemoryFile {
            db: db.clone(),
            filename: filename.to_string(),
            content_type,
            body,
            position,
            closed: false,
        }))
    }

    async fn exists(&self, handle: &DbHandle, filename: &str) -> Result<bool> {
        Ok(Self::db(handle)?.load(filename).is_some())
    }

    async fn unlink(&self, handle: &DbHandle, filename: &str) -> Result<()> {
        lock(&Self::db(handle)?.inner.files).remove(filename);
        Ok(())
    }

    async fn list(&self, handle: &DbHandle) -> Result<Vec<String>> {
        Ok(lock(&Self::db(handle)?.inner.files).keys().cloned().collect())
    }

    async fn shutdown(&self, handle: &DbHandle) -> Result<()> {
        let db = Self::db(handle)?;
        db.inner.shut_down.store(true, Ordering::SeqCst);
        lock(&db.inner.listeners).clear();
        Ok(())
    }
}
