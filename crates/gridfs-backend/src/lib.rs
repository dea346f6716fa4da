//! File-handle backends for gridfs-stream
//!
//! This crate defines the seams between the streaming layer and a concrete
//! chunked file store:
//!
//! - [`DbHandle`] - an opaque, cloneable database connection handle
//! - [`FileHandle`] - one open file, supporting chunked read/write and seek
//! - [`Backend`] - dials connections, opens file handles, and provides the
//!   name-level operations (exists, unlink, list)
//! - [`BackendRegistry`] - the table of known backends; given a handle it
//!   finds the backend able to drive it
//!
//! # Backends
//!
//! - [`MongoBackend`] - MongoDB GridFS through the official driver
//! - [`MemoryBackend`] - in-process store, chunked like GridFS, used for
//!   tests and local experiments (`memory://host/db`)

mod backend;
mod file;
mod handle;
pub mod memory;
pub mod mongo;
mod registry;

pub use backend::{Backend, ConnectOptions, Connected, FileOptions};
pub use file::{FileHandle, OpenMode, DEFAULT_CONTENT_TYPE};
pub use handle::DbHandle;
pub use memory::{FailPoint, MemoryBackend, MemoryDb, MemoryStats};
pub use mongo::{MongoBackend, MongoConnection};
pub use registry::BackendRegistry;
