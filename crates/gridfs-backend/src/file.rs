//! Open-file abstraction.

use anyhow::Result;
use async_trait::async_trait;

/// Content type recorded for files written without one.
pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r` - read an existing file.
    Read,
    /// `w` - create or truncate, then write.
    Write,
    /// `r+` / `a` - append to an existing file. Normalized to
    /// [`OpenMode::ReadWrite`] before reaching a backend.
    Append,
    /// `w+` - open for writing, creating the file if needed and keeping
    /// its current content.
    ReadWrite,
}

impl OpenMode {
    /// The mode a backend actually receives.
    pub fn normalized(self) -> Self {
        match self {
            Self::Append => Self::ReadWrite,
            other => other,
        }
    }

    /// Whether this mode writes.
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Flag string for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::Append => "r+",
            Self::ReadWrite => "w+",
        }
    }
}

impl std::fmt::Display for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpenMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "r+" | "a" => Ok(Self::Append),
            "w+" => Ok(Self::ReadWrite),
            _ => Err(anyhow::anyhow!(
                "Invalid open mode: '{s}'. Expected one of 'r', 'w', 'r+', 'a', 'w+'"
            )),
        }
    }
}

/// One open file in a chunked store.
///
/// A handle is used by one owner at a time; reads and writes are issued
/// sequentially.
#[async_trait]
pub trait FileHandle: Send {
    /// Current length of the file in bytes.
    fn length(&self) -> u64;

    /// Content type recorded for the file.
    fn content_type(&self) -> &str;

    /// Current read/write cursor.
    fn position(&self) -> u64;

    /// Move the cursor to `position`.
    async fn seek(&mut self, position: u64) -> Result<()>;

    /// Read up to `max` bytes from the cursor.
    ///
    /// May return fewer bytes than requested (for instance at a chunk
    /// boundary). An empty result means no data is left.
    async fn read(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Write `data` at the cursor.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Release the handle; for writers this commits the file.
    async fn close(&mut self) -> Result<()>;

    /// Read everything from the cursor to the end of the file.
    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self.length().saturating_sub(self.position());
        let mut out = Vec::with_capacity(usize::try_from(remaining).unwrap_or(0));
        loop {
            let left = self.length().saturating_sub(self.position());
            if left == 0 {
                break;
            }
            let chunk = self
                .read(usize::try_from(left).unwrap_or(usize::MAX))
                .await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
