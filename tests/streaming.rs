//! Store and stream behaviour against the in-memory backend.

use async_trait::async_trait;
use gridfs_backend::{FailPoint, MemoryDb};
use gridfs_stream::{
    DbHandle, Encoding, Error, OpenHandle, OpenMode, Operation, Store, StoreConfig, StoreOptions,
    StreamEvent, StreamOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Hands out a fixed handle and counts how often it was asked to.
struct CountingOpener {
    handle: DbHandle,
    opens: AtomicUsize,
    failures: usize,
}

impl CountingOpener {
    fn new(handle: DbHandle) -> Arc<Self> {
        Self::failing_first(handle, 0)
    }

    fn failing_first(handle: DbHandle, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            handle,
            opens: AtomicUsize::new(0),
            failures,
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpenHandle for CountingOpener {
    async fn open(&self) -> anyhow::Result<DbHandle> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        if attempt < self.failures {
            anyhow::bail!("server unavailable (attempt {attempt})");
        }
        Ok(self.handle.clone())
    }
}

fn memory_store(chunk_size: usize) -> (Store, MemoryDb) {
    let db = MemoryDb::with_chunk_size(chunk_size);
    (Store::new(DbHandle::new(db.clone())), db)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn upload(store: &Store, name: &str, data: &[u8], options: StreamOptions) {
    let mut stream = store.create_write_stream(name, options).unwrap();
    stream.write_all(data).await.unwrap();
    stream.shutdown().await.unwrap();
}

async fn download(store: &Store, name: &str, options: StreamOptions) -> Vec<u8> {
    let mut stream = store.create_read_stream(name, options).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    stream.closed().await.unwrap();
    out
}

#[tokio::test]
async fn test_stream_round_trip_across_chunk_sizes() {
    let (store, _db) = memory_store(16);
    for len in [0, 1, 15, 16, 17, 16 * 3 + 7, 4096] {
        let name = format!("file-{len}.bin");
        let data = pattern(len);
        upload(&store, &name, &data, StreamOptions::new()).await;
        assert_eq!(download(&store, &name, StreamOptions::new()).await, data, "len {len}");
    }
}

#[tokio::test]
async fn test_range_read_stops_at_end() {
    let (store, db) = memory_store(16);
    store.write("range.bin", &pattern(100)).await.unwrap();
    let before = db.stats();

    let out = download(&store, "range.bin", StreamOptions::new().range(10, 19)).await;
    assert_eq!(out, pattern(100)[10..20]);

    let after = db.stats();
    assert_eq!(after.seeks - before.seeks, 1);
    // [10, 16) then [16, 20); no read past the range.
    assert_eq!(after.reads - before.reads, 2);
}

#[tokio::test]
async fn test_range_clipped_to_file() {
    let (store, _db) = memory_store(16);
    store.write("short.bin", b"0123456789").await.unwrap();

    assert_eq!(
        download(&store, "short.bin", StreamOptions::new().start(7)).await,
        b"789"
    );
    assert_eq!(
        download(&store, "short.bin", StreamOptions::new().end(2)).await,
        b"012"
    );
    assert_eq!(
        download(&store, "short.bin", StreamOptions::new().range(4, 4)).await,
        b"4"
    );
}

#[tokio::test]
async fn test_inverted_range_fails_before_connecting() {
    let opener = CountingOpener::new(DbHandle::new(MemoryDb::new()));
    let store = Store::new(StoreConfig::Openable(opener.clone()));

    let err = store
        .create_read_stream("x", StreamOptions::new().range(5, 4))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRange { start: 5, end: 4 }));
    let err = store
        .create_write_stream("x", StreamOptions::new().range(9, 0))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRange { .. }));

    tokio::task::yield_now().await;
    assert_eq!(opener.opens(), 0);
}

#[tokio::test]
async fn test_concurrent_operations_share_one_connection() {
    let uri = "memory://127.0.0.1/it_concurrent_connect";
    let store = Store::new(uri);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.write(&format!("f{i}"), b"x").await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let db = MemoryDb::named(uri);
    assert_eq!(db.stats().connects, 1);
    assert_eq!(store.list().await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_openable_called_once() {
    let opener = CountingOpener::new(DbHandle::new(MemoryDb::new()));
    let store = Store::new(StoreConfig::Openable(opener.clone()));

    let handles = futures::future::join_all((0..8).map(|_| store.open())).await;
    assert!(handles.iter().all(Result::is_ok));
    store.write("a", b"1").await.unwrap();
    assert_eq!(opener.opens(), 1);
}

#[tokio::test]
async fn test_connect_failure_is_cached_by_default() {
    let opener = CountingOpener::failing_first(DbHandle::new(MemoryDb::new()), 1);
    let store = Store::new(StoreConfig::Openable(opener.clone()));

    let first = store.open().await.unwrap_err();
    let second = store.open().await.unwrap_err();
    assert_eq!(first.operation(), Some(Operation::Connect));
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(opener.opens(), 1);
}

#[tokio::test]
async fn test_connect_failure_retried_when_enabled() {
    let opener = CountingOpener::failing_first(DbHandle::new(MemoryDb::new()), 1);
    let store = Store::builder(StoreConfig::Openable(opener.clone()))
        .options(StoreOptions {
            retry_failed_connect: true,
            ..StoreOptions::default()
        })
        .build();

    assert!(store.open().await.is_err());
    store.open().await.unwrap();
    assert_eq!(opener.opens(), 2);
}

#[tokio::test]
async fn test_unresolvable_handle_reports_backend_not_found() {
    let opener = CountingOpener::new(DbHandle::new(42u32));
    let store = Store::new(StoreConfig::Openable(opener.clone()));

    for _ in 0..2 {
        assert!(matches!(
            store.exists("a").await,
            Err(Error::BackendNotFound(_))
        ));
        assert!(matches!(
            store.unlink("a").await,
            Err(Error::BackendNotFound(_))
        ));
        assert!(matches!(store.list().await, Err(Error::BackendNotFound(_))));
    }
    let err = store.read("a").await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(opener.opens(), 1);
}

#[tokio::test]
async fn test_unknown_raw_handle() {
    let store = Store::new(DbHandle::new(String::from("not a database")));
    assert!(matches!(store.open().await, Err(Error::UnknownConfig(_))));
}

#[tokio::test]
async fn test_empty_connection_string() {
    let store = Store::new("");
    assert!(matches!(store.open().await, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_out_of_band_errors_reach_subscribers() {
    let uri = "memory://127.0.0.1/it_out_of_band";
    let store = Store::new(uri);
    let mut errors = store.subscribe_errors();
    store.open().await.unwrap();

    MemoryDb::named(uri).report_error("heartbeat to 127.0.0.1 failed");
    let err = errors.recv().await.unwrap();
    assert!(matches!(err, Error::Connection(_)));
    assert!(err.to_string().contains("heartbeat"));
}

#[tokio::test]
async fn test_metadata_published_once_before_data() {
    let (store, _db) = memory_store(8);
    upload(
        &store,
        "notes.txt",
        b"hello world",
        StreamOptions::new().content_type("text/plain"),
    )
    .await;

    let mut stream = store
        .create_read_stream("notes.txt", StreamOptions::new().start(6))
        .unwrap();
    let mut events = stream.take_events().unwrap();
    assert!(stream.metadata().is_none());

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    stream.closed().await.unwrap();
    assert_eq!(out, b"world");

    let metadata = stream.metadata().unwrap();
    assert_eq!(metadata.content_type, "text/plain");
    assert_eq!(metadata.length, 5);
    assert_eq!(metadata.name, "notes.txt");

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.as_slice(), [StreamEvent::Metadata(m), StreamEvent::Close] if m.length == 5));
}

#[tokio::test]
async fn test_default_content_type() {
    let (store, _db) = memory_store(8);
    store.write("blob", b"x").await.unwrap();
    let stream = store.create_read_stream("blob", StreamOptions::new()).unwrap();
    let metadata = stream.bind().await.unwrap();
    assert_eq!(metadata.content_type, gridfs_stream::DEFAULT_CONTENT_TYPE);
    stream.destroy();
    stream.closed().await.unwrap();
}

#[tokio::test]
async fn test_append_mode() {
    let (store, _db) = memory_store(4);
    store.write("log.txt", b"abc").await.unwrap();
    upload(
        &store,
        "log.txt",
        b"def",
        StreamOptions::new().mode(OpenMode::Append),
    )
    .await;
    assert_eq!(store.read("log.txt").await.unwrap(), b"abcdef");

    upload(&store, "log.txt", b"new", StreamOptions::new()).await;
    assert_eq!(store.read("log.txt").await.unwrap(), b"new");
}

#[tokio::test]
async fn test_encodings_round_trip() {
    let (store, _db) = memory_store(8);
    let cases = [
        (Encoding::Utf8, "grüße, 世界"),
        (Encoding::Ascii, "plain text"),
        (Encoding::Latin1, "café"),
        (Encoding::Hex, "deadbeef00"),
        (Encoding::Base64, "aGVsbG8gd29ybGQ="),
    ];
    for (encoding, text) in cases {
        let name = format!("text.{encoding}");
        store.write_str(&name, text, encoding).await.unwrap();
        assert_eq!(store.read_to_string(&name, encoding).await.unwrap(), text);
    }

    store.write_str("hex.bin", "cafe", Encoding::Hex).await.unwrap();
    assert_eq!(store.read("hex.bin").await.unwrap(), vec![0xca, 0xfe]);
}

#[tokio::test]
async fn test_read_missing_file() {
    let (store, db) = memory_store(8);
    let err = store.read("missing").await.unwrap_err();
    assert_eq!(err.operation(), Some(Operation::Open));
    assert_eq!(db.stats().closes, 0);

    let mut stream = store.create_read_stream("missing", StreamOptions::new()).unwrap();
    let mut events = stream.take_events().unwrap();
    let mut out = Vec::new();
    assert!(stream.read_to_end(&mut out).await.is_err());
    assert!(matches!(events.recv().await, Some(StreamEvent::Error(_))));

    stream.destroy();
    stream.closed().await.unwrap();
}

#[tokio::test]
async fn test_read_error_is_reported() {
    let (store, db) = memory_store(8);
    store.write("a", b"0123456789").await.unwrap();
    db.fail_next(FailPoint::Read);

    let err = store.read("a").await.unwrap_err();
    assert_eq!(err.operation(), Some(Operation::Read));
    // The handle is still closed.
    assert_eq!(db.stats().closes, 2);
}

#[tokio::test]
async fn test_stream_close_error() {
    let (store, db) = memory_store(8);
    let mut stream = store.create_write_stream("c", StreamOptions::new()).unwrap();
    let mut events = stream.take_events().unwrap();
    stream.write_all(b"data").await.unwrap();
    db.fail_next(FailPoint::Close);

    let err = stream.shutdown().await.unwrap_err();
    let inner = err.get_ref().and_then(|e| e.downcast_ref::<Error>());
    assert_eq!(inner.and_then(Error::operation), Some(Operation::Close));

    let mut saw_close = false;
    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_close |= matches!(event, StreamEvent::Close);
        saw_error |= matches!(event, StreamEvent::Error(_));
    }
    assert!(saw_error);
    assert!(!saw_close);
}

#[tokio::test]
async fn test_exists_and_unlink() {
    let (store, _db) = memory_store(8);
    assert!(!store.exists("x").await.unwrap());
    store.write("x", b"1").await.unwrap();
    assert!(store.exists("x").await.unwrap());
    store.unlink("x").await.unwrap();
    assert!(!store.exists("x").await.unwrap());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_io_timeout_applies_to_handle_operations() {
    let opener = CountingOpener::new(DbHandle::new(MemoryDb::new()));
    let store = Store::builder(StoreConfig::Openable(opener))
        .options(StoreOptions {
            io_timeout: Some(std::time::Duration::from_secs(5)),
            ..StoreOptions::default()
        })
        .build();
    store.write("t", b"fast enough").await.unwrap();
    assert_eq!(store.read("t").await.unwrap(), b"fast enough");
}

#[tokio::test]
async fn test_copy_local_files_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let target = dir.path().join("target.bin");
    let data = pattern(100_000);
    tokio::fs::write(&source, &data).await.unwrap();

    let (store, _db) = memory_store(4096);
    let mut input = tokio::fs::File::open(&source).await.unwrap();
    let mut upload = store
        .create_write_stream("copy.bin", StreamOptions::new())
        .unwrap();
    let copied = tokio::io::copy(&mut input, &mut upload).await.unwrap();
    upload.shutdown().await.unwrap();
    assert_eq!(copied, data.len() as u64);

    let mut output = tokio::fs::File::create(&target).await.unwrap();
    let mut download = store
        .create_read_stream("copy.bin", StreamOptions::new())
        .unwrap();
    tokio::io::copy(&mut download, &mut output).await.unwrap();
    output.flush().await.unwrap();
    download.closed().await.unwrap();

    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
    assert_eq!(download.bytes_read(), data.len() as u64);
}
