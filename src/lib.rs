//! gridfs-stream
//!
//! Read and write files in a GridFS-style chunked store as Tokio byte
//! streams. The store connects on first use and each stream opens its file
//! handle on first use, so creating a store or a stream never blocks.
//!
//! # Overview
//!
//! - [`Store`] - the facade: stream creation, whole-file read/write helpers,
//!   `exists` / `unlink` / `list`, out-of-band connection errors
//! - [`GridStream`] - an `AsyncRead + AsyncWrite` over one named file, with
//!   optional byte ranges, a one-time [`FileMetadata`] notification and an
//!   idempotent [`destroy`](GridStream::destroy)
//! - [`StoreConfig`] - connection string, connection owner, or an open
//!   [`DbHandle`]
//!
//! Backends live in the `gridfs-backend` crate: MongoDB GridFS and an
//! in-memory store (`memory://host/db`).
//!
//! # CLI Usage
//!
//! ```bash
//! # Upload a file
//! gridfs-stream --uri mongodb://localhost:27017/files put report.pdf --file ./report.pdf
//!
//! # Download bytes 100..=199
//! gridfs-stream --uri localhost/files get report.pdf --start 100 --end 199 --output part.bin
//!
//! # Metadata as JSON
//! gridfs-stream --uri localhost/files stat report.pdf
//! ```

pub mod config;
mod connection;
pub mod encoding;
pub mod error;
pub mod store;
pub mod stream;

pub use config::{
    normalize_connection_string, parse_duration, HandleAccessor, OpenHandle, StoreConfig,
    StoreOptions,
};
pub use encoding::Encoding;
pub use error::{Error, Operation, Result};
pub use store::{Store, StoreBuilder};
pub use stream::{effective_length, FileMetadata, GridStream, StreamEvent, StreamOptions};

pub use gridfs_backend::{
    Backend, BackendRegistry, DbHandle, FileHandle, FileOptions, OpenMode, DEFAULT_CONTENT_TYPE,
};
