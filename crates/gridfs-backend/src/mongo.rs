//! MongoDB GridFS backend.
//!
//! Files are addressed by name. Reading opens the newest revision; writing
//! uploads a new revision and, once the upload is committed, removes the
//! older ones so a name always refers to a single file. `ReadWrite` seeds the
//! upload with the current content so that writes append.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{AsyncReadExt, AsyncWriteExt, TryStreamExt};
use mongodb::bson::{doc, Bson};
use mongodb::event::sdam::SdamEvent;
use mongodb::event::EventHandler;
use mongodb::gridfs::{
    FilesCollectionDocument, GridFsBucket, GridFsDownloadStream, GridFsUploadStream,
};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::collections::BTreeSet;
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::{
    Backend, ConnectOptions, Connected, DbHandle, FileHandle, FileOptions, OpenMode,
    DEFAULT_CONTENT_TYPE,
};

/// Largest single read issued against a download stream (1MB).
const MAX_READ_SIZE: usize = 1024 * 1024;

/// A connection dialed by [`MongoBackend::connect`].
#[derive(Clone)]
pub struct MongoConnection {
    pub client: Client,
    pub database: Database,
    pub bucket: GridFsBucket,
}

impl MongoConnection {
    /// Wrap an existing client and database.
    pub fn new(client: Client, database: Database) -> Self {
        let bucket = database.gridfs_bucket(None);
        Self {
            client,
            database,
            bucket,
        }
    }
}

impl std::fmt::Debug for MongoConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoConnection")
            .field("database", &self.database.name())
            .finish()
    }
}

/// Backend for MongoDB handles: [`MongoConnection`] or a bare
/// [`mongodb::Database`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoBackend;

impl MongoBackend {
    fn bucket(handle: &DbHandle) -> Result<GridFsBucket> {
        if let Some(connection) = handle.downcast_ref::<MongoConnection>() {
            return Ok(connection.bucket.clone());
        }
        if let Some(database) = handle.downcast_ref::<Database>() {
            return Ok(database.gridfs_bucket(None));
        }
        anyhow::bail!("Not a MongoDB handle: {}", handle.type_name())
    }
}

/// Every stored revision of `filename`, oldest first.
async fn revisions(bucket: &GridFsBucket, filename: &str) -> Result<Vec<FilesCollectionDocument>> {
    let cursor = bucket
        .find(doc! { "filename": filename })
        .await
        .with_context(|| format!("Failed to look up GridFS file '{filename}'"))?;
    let mut files: Vec<FilesCollectionDocument> = cursor.try_collect().await?;
    files.sort_by_key(|file| file.upload_date);
    Ok(files)
}

fn content_type_of(file: &FilesCollectionDocument) -> Option<String> {
    file.metadata
        .as_ref()
        .and_then(|metadata| metadata.get_str("contentType").ok())
        .map(str::to_string)
}

#[async_trait]
impl Backend for MongoBackend {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["mongodb", "mongodb+srv"]
    }

    fn probe(&self, handle: &DbHandle) -> bool {
        handle.is::<MongoConnection>() || handle.is::<Database>()
    }

    async fn connect(&self, uri: &str, options: &ConnectOptions) -> Result<Connected> {
        tracing::debug!("Parsing MongoDB connection options from URI: {uri}");
        let mut client_options = ClientOptions::parse(uri)
            .await
            .with_context(|| format!("Invalid MongoDB connection string: {uri}"))?;
        client_options.connect_timeout = options.connect_timeout;
        client_options.server_selection_timeout = options.server_selection_timeout;

        let (tx, rx) = mpsc::unbounded_channel();
        client_options.sdam_event_handler = Some(EventHandler::callback(move |event| {
            if let SdamEvent::ServerHeartbeatFailed(failed) = event {
                let message = format!("Heartbeat to {} failed", failed.server_address);
                let _ = tx.send(anyhow::Error::new(failed.failure).context(message));
            }
        }));

        let database_name = client_options
            .default_database
            .clone()
            .with_context(|| format!("MongoDB connection string must name a database: {uri}"))?;

        let client = Client::with_options(client_options)?;
        let database = client.database(&database_name);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .with_context(|| format!("Failed to reach MongoDB at {uri}"))?;
        tracing::info!("Connected to MongoDB database '{database_name}'");

        Ok(Connected {
            handle: DbHandle::new(MongoConnection::new(client, database)),
            errors: Some(rx),
        })
    }

    async fn open(
        &self,
        handle: &DbHandle,
        filename: &str,
        mode: OpenMode,
        options: &FileOptions,
    ) -> Result<Box<dyn FileHandle>> {
        let bucket = Self::bucket(handle)?;
        let existing = revisions(&bucket, filename).await?;
        let latest = existing.last();
        let content_type = options
            .content_type
            .clone()
            .or_else(|| latest.and_then(content_type_of))
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        match mode.normalized() {
            OpenMode::Read => {
                let latest = latest.with_context(|| format!("File not found: {filename}"))?;
                let stream = bucket.open_download_stream(latest.id.clone()).await?;
                Ok(Box::new(MongoFile {
                    bucket,
                    filename: filename.to_string(),
                    content_type,
                    length: latest.length,
                    position: 0,
                    transfer: Transfer::Download {
                        id: latest.id.clone(),
                        stream: Some(Box::pin(stream)),
                    },
                    closed: false,
                }))
            }
            mode => {
                let upload = bucket
                    .open_upload_stream(filename)
                    .metadata(doc! { "contentType": content_type.as_str() })
                    .await?;
                let mut file = MongoFile {
                    bucket: bucket.clone(),
                    filename: filename.to_string(),
                    content_type,
                    length: 0,
                    position: 0,
                    transfer: Transfer::Upload {
                        stream: Box::pin(upload),
                        superseded: existing.iter().map(|f| f.id.clone()).collect(),
                    },
                    closed: false,
                };

                if let (OpenMode::ReadWrite, Some(latest)) = (mode, latest) {
                    let mut download =
                        Box::pin(bucket.open_download_stream(latest.id.clone()).await?);
                    let mut current = Vec::new();
                    download.read_to_end(&mut current).await?;
                    file.write(&current).await?;
                    tracing::debug!(
                        "Seeded '{filename}' with {} existing bytes for appending",
                        current.len()
                    );
                }
                Ok(Box::new(file))
            }
        }
    }

    async fn exists(&self, handle: &DbHandle, filename: &str) -> Result<bool> {
        let bucket = Self::bucket(handle)?;
        let mut cursor = bucket.find(doc! { "filename": filename }).await?;
        Ok(cursor.try_next().await?.is_some())
    }

    async fn unlink(&self, handle: &DbHandle, filename: &str) -> Result<()> {
        let bucket = Self::bucket(handle)?;
        for file in revisions(&bucket, filename).await? {
            bucket
                .delete(file.id.clone())
                .await
                .with_context(|| format!("Failed to delete revision of '{filename}'"))?;
        }
        Ok(())
    }

    async fn list(&self, handle: &DbHandle) -> Result<Vec<String>> {
        let bucket = Self::bucket(handle)?;
        let files: Vec<FilesCollectionDocument> =
            bucket.find(doc! {}).await?.try_collect().await?;
        let names: BTreeSet<String> = files.into_iter().filter_map(|f| f.filename).collect();
        Ok(names.into_iter().collect())
    }

    async fn shutdown(&self, handle: &DbHandle) -> Result<()> {
        if let Some(connection) = handle.downcast_ref::<MongoConnection>() {
            connection.client.clone().shutdown().await;
            tracing::debug!("MongoDB client shut down");
        }
        Ok(())
    }
}

enum Transfer {
    Download {
        id: Bson,
        stream: Option<Pin<Box<GridFsDownloadStream>>>,
    },
    Upload {
        stream: Pin<Box<GridFsUploadStream>>,
        superseded: Vec<Bson>,
    },
}

/// An open GridFS file.
pub struct MongoFile {
    bucket: GridFsBucket,
    filename: String,
    content_type: String,
    length: u64,
    position: u64,
    transfer: Transfer,
    closed: bool,
}

impl MongoFile {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            anyhow::bail!("GridFS file '{}' is already closed", self.filename);
        }
        Ok(())
    }
}

#[async_trait]
impl FileHandle for MongoFile {
    fn length(&self) -> u64 {
        self.length
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        self.ensure_open()?;
        if position > self.length {
            anyhow::bail!(
                "Cannot seek to {position} in '{}' ({} bytes)",
                self.filename,
                self.length
            );
        }

        match &mut self.transfer {
            Transfer::Upload { .. } => {
                if position != self.position {
                    anyhow::bail!("GridFS uploads can only be positioned at their end");
                }
                Ok(())
            }
            Transfer::Download { id, stream } => {
                if position < self.position || stream.is_none() {
                    let reopened = self.bucket.open_download_stream(id.clone()).await?;
                    *stream = Some(Box::pin(reopened));
                    self.position = 0;
                }
                let reader = stream.as_mut().context("Download stream missing")?;

                let mut remaining = position - self.position;
                let mut scratch = vec![0u8; MAX_READ_SIZE.min(remaining as usize)];
                while remaining > 0 {
                    let want = scratch.len().min(remaining as usize);
                    let n = reader.read(&mut scratch[..want]).await?;
                    if n == 0 {
                        anyhow::bail!("Unexpected end of '{}' while seeking", self.filename);
                    }
                    remaining -= n as u64;
                    self.position += n as u64;
                }
                Ok(())
            }
        }
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let Transfer::Download { stream, .. } = &mut self.transfer else {
            anyhow::bail!("GridFS file '{}' is open for writing", self.filename);
        };
        let reader = stream.as_mut().context("Download stream missing")?;

        let mut buf = vec![0u8; max.min(MAX_READ_SIZE)];
        let n = reader.read(&mut buf).await?;
        buf.truncate(n);
        self.position += n as u64;
        Ok(buf)
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let Transfer::Download { stream, .. } = &mut self.transfer else {
            anyhow::bail!("GridFS file '{}' is open for writing", self.filename);
        };
        let reader = stream.as_mut().context("Download stream missing")?;

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        self.position += out.len() as u64;
        Ok(out)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let Transfer::Upload { stream, .. } = &mut self.transfer else {
            anyhow::bail!("GridFS file '{}' is open for reading", self.filename);
        };

        stream
            .write_all(data)
            .await
            .with_context(|| format!("Failed to write to GridFS file '{}'", self.filename))?;
        self.position += data.len() as u64;
        self.length = self.length.max(self.position);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match &mut self.transfer {
            Transfer::Download { stream, .. } => {
                stream.take();
            }
            Transfer::Upload { stream, superseded } => {
                stream
                    .close()
                    .await
                    .with_context(|| format!("Failed to commit GridFS file '{}'", self.filename))?;
                for id in superseded.drain(..) {
                    self.bucket.delete(id).await.with_context(|| {
                        format!("Failed to remove old revision of '{}'", self.filename)
                    })?;
                }
                tracing::debug!(
                    "Committed GridFS file '{}' ({} bytes)",
                    self.filename,
                    self.length
                );
            }
        }
        Ok(())
    }
}
