//! Duplex byte stream over one lazily opened file handle.
//!
//! A [`GridStream`] owns at most one [`FileHandle`]. The handle is opened on
//! the first read, write or [`GridStream::bind`] call, shared by every
//! later operation, and closed exactly once by [`GridStream::destroy`]
//! (driven by read EOF or `poll_shutdown`).

use deferred::Deferred;
use futures::future::BoxFuture;
use futures::FutureExt;
use gridfs_backend::{FileHandle, OpenMode};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{timed, Error, Operation, Result};

/// Options for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// First byte to read (inclusive).
    pub start: Option<u64>,
    /// Last byte to read (inclusive).
    pub end: Option<u64>,
    /// Open mode for write streams; read streams always use `Read`.
    pub mode: Option<OpenMode>,
    /// Content type recorded for newly written files.
    pub content_type: Option<String>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    /// Inclusive byte range `start..=end`.
    pub fn range(self, start: u64, end: u64) -> Self {
        self.start(start).end(end)
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Reject ranges that end before they start.
    pub fn validate(&self) -> Result<()> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start > end => Err(Error::InvalidRange { start, end }),
            _ => Ok(()),
        }
    }
}

/// Published once per stream, as soon as its handle is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadata {
    #[serde(rename = "type")]
    pub content_type: String,
    /// Number of bytes the stream will produce (the requested range clipped
    /// to the file).
    pub length: u64,
    pub name: String,
}

/// Notifications emitted by a stream, in order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Metadata(FileMetadata),
    Error(Error),
    Close,
}

/// Bytes a stream over `start..=end` produces from a file of `underlying`
/// bytes.
pub fn effective_length(start: Option<u64>, end: Option<u64>, underlying: u64) -> u64 {
    let stop = match end {
        Some(end) => end.saturating_add(1),
        None => underlying,
    };
    stop.saturating_sub(start.unwrap_or(0))
}

type SharedFile = Arc<Mutex<Box<dyn FileHandle>>>;

/// State shared between the stream and the tasks it spawns.
struct Shared {
    name: String,
    io_timeout: Option<Duration>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    destroyed: AtomicBool,
    metadata: OnceLock<FileMetadata>,
    events: mpsc::UnboundedSender<StreamEvent>,
    closed: watch::Sender<Option<Result<()>>>,
}

impl Shared {
    fn emit(&self, event: StreamEvent) {
        // The receiver may have been dropped; events are best effort.
        let _ = self.events.send(event);
    }

    fn fail(&self, err: &Error) {
        tracing::debug!("Stream '{}' error: {err}", self.name);
        self.emit(StreamEvent::Error(err.clone()));
    }

    fn length(&self) -> u64 {
        self.metadata.get().map(|m| m.length).unwrap_or(0)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

enum Shutdown {
    Idle,
    Waiting(BoxFuture<'static, Result<()>>),
    Done(Result<()>),
}

/// Readable and writable stream over a named file.
///
/// Created by [`Store::create_read_stream`](crate::Store::create_read_stream)
/// and [`Store::create_write_stream`](crate::Store::create_write_stream).
/// Must be used inside a Tokio runtime.
pub struct GridStream {
    shared: Arc<Shared>,
    file: Deferred<SharedFile, Error>,
    read_op: Option<BoxFuture<'static, Result<Option<Vec<u8>>>>>,
    write_op: Option<BoxFuture<'static, Result<usize>>>,
    shutdown: Shutdown,
    leftover: Vec<u8>,
    leftover_pos: usize,
    eof: bool,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
}

impl GridStream {
    pub(crate) fn new<F, Fut>(
        name: impl Into<String>,
        options: StreamOptions,
        io_timeout: Option<Duration>,
        open: F,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn FileHandle>>> + Send + 'static,
    {
        options.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            name: name.into(),
            io_timeout,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            metadata: OnceLock::new(),
            events: events_tx,
            closed,
        });

        let file = {
            let shared = Arc::clone(&shared);
            let (start, end) = (options.start, options.end);
            Deferred::new(move || bind_file(Arc::clone(&shared), open(), start, end))
        };

        Ok(Self {
            shared,
            file,
            read_op: None,
            write_op: None,
            shutdown: Shutdown::Idle,
            leftover: Vec::new(),
            leftover_pos: 0,
            eof: false,
            events: Some(events_rx),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Metadata, once the handle is open.
    pub fn metadata(&self) -> Option<FileMetadata> {
        self.shared.metadata.get().cloned()
    }

    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.events.take()
    }

    /// Open the handle now instead of on first I/O and return the metadata.
    pub async fn bind(&self) -> Result<FileMetadata> {
        self.file.get().await?;
        self.metadata().ok_or(Error::Abandoned)
    }

    /// Close the stream. Safe to call any number of times; only the first
    /// call closes the handle.
    ///
    /// The close runs on its own task. Its outcome is reported through
    /// [`closed`](Self::closed) and as a [`StreamEvent::Close`] or
    /// [`StreamEvent::Error`].
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Destroying stream '{}'", self.shared.name);

        let file = self.file.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let outcome = match file.get().await {
                Err(err) => {
                    tracing::debug!(
                        "Stream '{}' never opened ({err}); closing without a handle",
                        shared.name
                    );
                    Ok(())
                }
                Ok(handle) => {
                    let mut handle = handle.lock().await;
                    timed(Operation::Close, shared.io_timeout, handle.close()).await
                }
            };

            match &outcome {
                Ok(()) => {
                    tracing::debug!(
                        "Stream '{}' closed ({} bytes read, {} bytes written)",
                        shared.name,
                        shared.bytes_read.load(Ordering::SeqCst),
                        shared.bytes_written.load(Ordering::SeqCst)
                    );
                    shared.emit(StreamEvent::Close);
                }
                Err(err) => shared.fail(err),
            }
            shared.closed.send_replace(Some(outcome));
        });
    }

    /// Resolves with the close outcome once the stream has been destroyed.
    pub fn closed(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut rx = self.shared.closed.subscribe();
        async move {
            if rx.wait_for(Option::is_some).await.is_err() {
                return Err(Error::Abandoned);
            }
            let outcome = rx.borrow().clone();
            outcome.unwrap_or(Err(Error::Abandoned))
        }
    }

    fn read_chunk(&self, max: usize) -> BoxFuture<'static, Result<Option<Vec<u8>>>> {
        let file = self.file.clone();
        let shared = Arc::clone(&self.shared);
        async move {
            let handle = file.get().await?;
            let mut handle = handle.lock().await;
            if shared.is_destroyed() {
                return Ok(None);
            }

            let consumed = shared.bytes_read.load(Ordering::SeqCst);
            let length = shared.length();
            if consumed >= length {
                return Ok(None);
            }
            let want = (length - consumed).min(max as u64) as usize;
            let chunk = timed(Operation::Read, shared.io_timeout, handle.read(want)).await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            shared
                .bytes_read
                .fetch_add(chunk.len() as u64, Ordering::SeqCst);
            Ok(Some(chunk))
        }
        .boxed()
    }

    fn write_chunk(&self, data: Vec<u8>) -> BoxFuture<'static, Result<usize>> {
        let file = self.file.clone();
        let shared = Arc::clone(&self.shared);
        async move {
            let handle = file.get().await?;
            let mut handle = handle.lock().await;
            if shared.is_destroyed() {
                return Err(Error::Destroyed);
            }
            timed(Operation::Write, shared.io_timeout, handle.write(&data)).await?;
            shared
                .bytes_written
                .fetch_add(data.len() as u64, Ordering::SeqCst);
            Ok(data.len())
        }
        .boxed()
    }

    fn take_leftover(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        let available = self.leftover.len() - self.leftover_pos;
        if available == 0 {
            return false;
        }
        let n = available.min(buf.remaining());
        buf.put_slice(&self.leftover[self.leftover_pos..self.leftover_pos + n]);
        self.leftover_pos += n;
        true
    }
}

/// Open the handle, publish metadata, then position it at `start`.
async fn bind_file<Fut>(
    shared: Arc<Shared>,
    opening: Fut,
    start: Option<u64>,
    end: Option<u64>,
) -> Result<SharedFile>
where
    Fut: Future<Output = Result<Box<dyn FileHandle>>>,
{
    let mut file = opening.await?;

    let metadata = FileMetadata {
        content_type: file.content_type().to_string(),
        length: effective_length(start, end, file.length()),
        name: shared.name.clone(),
    };
    tracing::debug!(
        "Opened '{}' ({}, {} of {} bytes)",
        metadata.name,
        metadata.content_type,
        metadata.length,
        file.length()
    );
    if shared.metadata.set(metadata.clone()).is_ok() {
        shared.emit(StreamEvent::Metadata(metadata));
    }

    if let Some(start) = start.filter(|start| *start > 0) {
        if let Err(err) = timed(Operation::Seek, shared.io_timeout, file.seek(start)).await {
            if let Err(close_err) = file.close().await {
                tracing::warn!("Failed to close '{}' after seek error: {close_err:#}", shared.name);
            }
            return Err(err);
        }
    }

    Ok(Arc::new(Mutex::new(file)))
}

impl std::fmt::Debug for GridStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridStream")
            .field("name", &self.shared.name)
            .field("metadata", &self.shared.metadata.get())
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl AsyncRead for GridStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 || this.take_leftover(buf) || this.eof {
            return Poll::Ready(Ok(()));
        }

        let mut op = match this.read_op.take() {
            Some(op) => op,
            None => this.read_chunk(buf.remaining()),
        };
        let outcome = match op.poll_unpin(cx) {
            Poll::Pending => {
                this.read_op = Some(op);
                return Poll::Pending;
            }
            Poll::Ready(outcome) => outcome,
        };

        match outcome {
            Ok(Some(chunk)) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                this.leftover = chunk;
                this.leftover_pos = n;
                Poll::Ready(Ok(()))
            }
            Ok(None) => {
                this.eof = true;
                this.destroy();
                Poll::Ready(Ok(()))
            }
            Err(err) => {
                this.shared.fail(&err);
                Poll::Ready(Err(err.into()))
            }
        }
    }
}

impl AsyncWrite for GridStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut op = match this.write_op.take() {
            Some(op) => op,
            None => {
                if this.shared.is_destroyed() {
                    return Poll::Ready(Err(Error::Destroyed.into()));
                }
                if buf.is_empty() {
                    return Poll::Ready(Ok(0));
                }
                this.write_chunk(buf.to_vec())
            }
        };

        match op.poll_unpin(cx) {
            Poll::Pending => {
                this.write_op = Some(op);
                Poll::Pending
            }
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(err)) => {
                this.shared.fail(&err);
                Poll::Ready(Err(err.into()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(mut op) = this.write_op.take() else {
            return Poll::Ready(Ok(()));
        };
        match op.poll_unpin(cx) {
            Poll::Pending => {
                this.write_op = Some(op);
                Poll::Pending
            }
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => {
                this.shared.fail(&err);
                Poll::Ready(Err(err.into()))
            }
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if matches!(self.shutdown, Shutdown::Idle) {
            ready!(self.as_mut().poll_flush(cx))?;
            self.destroy();
            let closed = self.closed().boxed();
            self.shutdown = Shutdown::Waiting(closed);
        }

        let this = self.get_mut();
        if let Shutdown::Waiting(op) = &mut this.shutdown {
            let outcome = ready!(op.poll_unpin(cx));
            this.shutdown = Shutdown::Done(outcome);
        }
        match &this.shutdown {
            Shutdown::Done(outcome) => Poll::Ready(outcome.clone().map_err(io::Error::from)),
            _ => Poll::Ready(Ok(())),
        }
    }
}
