//! Command-line interface for gridfs-stream
//!
//! # Usage Examples
//!
//! ```bash
//! # Upload from stdin, overriding the content type
//! cat notes.txt | gridfs-stream --uri localhost/files put notes.txt --content-type text/plain
//!
//! # Append to an existing file
//! gridfs-stream --uri localhost/files put log.txt --file ./more.txt --append
//!
//! # Read a byte range to stdout
//! gridfs-stream --uri localhost/files get log.txt --start 0 --end 1023
//!
//! # Name-level operations
//! gridfs-stream --uri localhost/files ls
//! gridfs-stream --uri localhost/files exists log.txt
//! gridfs-stream --uri localhost/files rm log.txt
//! ```
//!
//! `memory://host/db` URIs use the in-process store, which lives only as
//! long as the command.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gridfs_stream::{parse_duration, OpenMode, Store, StoreOptions, StreamOptions};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(Parser)]
#[command(name = "gridfs-stream")]
#[command(about = "Stream files in and out of a GridFS store")]
#[command(long_about = None)]
struct Cli {
    /// Connection string: `db`, `host/db`, `mongodb://host/db` or `memory://host/db`
    #[arg(long, env = "GRIDFS_URI", default_value = "test", global = true)]
    uri: String,

    /// Upper bound for each store operation (e.g. "30s", "5m", "250ms")
    #[arg(long, env = "GRIDFS_IO_TIMEOUT", global = true)]
    io_timeout: Option<String>,

    /// Allow a new connection attempt after a failed one
    #[arg(long, global = true)]
    retry_connect: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file (reads stdin when --file is omitted)
    Put {
        /// Name of the stored file
        name: String,

        /// Local file to upload
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Content type recorded for the stored file
        #[arg(long)]
        content_type: Option<String>,

        /// Append to the stored file instead of replacing it
        #[arg(long)]
        append: bool,
    },

    /// Download a file (writes stdout when --output is omitted)
    Get {
        /// Name of the stored file
        name: String,

        /// First byte to read
        #[arg(long)]
        start: Option<u64>,

        /// Last byte to read (inclusive)
        #[arg(long)]
        end: Option<u64>,

        /// Local file to write
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Print file metadata as JSON
    Stat {
        /// Name of the stored file
        name: String,
    },

    /// List stored file names
    Ls,

    /// Remove a file
    Rm {
        /// Name of the stored file
        name: String,
    },

    /// Exit with status 0 if the file exists, 1 otherwise
    Exists {
        /// Name of the stored file
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match run().await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Returns `false` when the command ran but its answer is "no".
async fn run() -> anyhow::Result<bool> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut options = StoreOptions {
        retry_failed_connect: cli.retry_connect,
        ..StoreOptions::default()
    };
    if let Some(timeout) = &cli.io_timeout {
        options.io_timeout = Some(
            parse_duration(timeout).with_context(|| format!("Invalid --io-timeout '{timeout}'"))?,
        );
    }
    let store = Store::builder(cli.uri.as_str()).options(options).build();

    let mut errors = store.subscribe_errors();
    tokio::spawn(async move {
        while let Ok(err) = errors.recv().await {
            tracing::warn!("{err}");
        }
    });

    let answer = match cli.command {
        Commands::Put {
            name,
            file,
            content_type,
            append,
        } => {
            let mut stream_options = StreamOptions::new();
            if append {
                stream_options = stream_options.mode(OpenMode::Append);
            }
            if let Some(content_type) = content_type {
                stream_options = stream_options.content_type(content_type);
            }
            let mut input: Box<dyn AsyncRead + Unpin + Send> = match &file {
                Some(path) => Box::new(
                    tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdin()),
            };

            let mut stream = store.create_write_stream(&name, stream_options)?;
            let copied = tokio::io::copy(&mut input, &mut stream)
                .await
                .with_context(|| format!("Failed to upload '{name}'"))?;
            stream
                .shutdown()
                .await
                .with_context(|| format!("Failed to finish '{name}'"))?;
            tracing::info!("Uploaded {copied} bytes to '{name}'");
            true
        }
        Commands::Get {
            name,
            start,
            end,
            output,
        } => {
            let stream_options = StreamOptions {
                start,
                end,
                ..StreamOptions::default()
            };
            let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("Failed to create {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };

            let mut stream = store.create_read_stream(&name, stream_options)?;
            let copied = tokio::io::copy(&mut stream, &mut out)
                .await
                .with_context(|| format!("Failed to download '{name}'"))?;
            out.flush().await?;
            stream.closed().await?;
            tracing::info!("Downloaded {copied} bytes from '{name}'");
            true
        }
        Commands::Stat { name } => {
            let stream = store.create_read_stream(&name, StreamOptions::new())?;
            let metadata = stream.bind().await;
            stream.destroy();
            let metadata = metadata.with_context(|| format!("Failed to open '{name}'"))?;
            stream.closed().await?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            true
        }
        Commands::Ls => {
            for name in store.list().await? {
                println!("{name}");
            }
            true
        }
        Commands::Rm { name } => {
            store.unlink(&name).await?;
            true
        }
        Commands::Exists { name } => {
            let exists = store.exists(&name).await?;
            println!("{exists}");
            exists
        }
    };

    store.close().await?;
    Ok(answer)
}
