//! Compiler for aarddict (`.aar`) dictionary volumes.
//!
//! Articles arrive unsorted and in unbounded number. They are staged on disk,
//! ordered by the collation key of their title through an external sort, and
//! then packed into one or more size-bounded volumes. Each volume carries a
//! header, a compressed metadata blob, a two-level title index and the
//! compressed article data.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub mod collation;
pub mod compiler;
pub mod compress;
pub mod config;
pub mod encoding;
pub mod format;
pub mod fs;
pub mod recfile;
pub mod sort;
pub mod staging;
pub mod volume;

pub use collation::{BinaryCollator, Collator, FoldingCollator};
pub use compiler::{Article, Compiler, Stats};
pub use config::{CompilerConfig, SortConfig};
pub use format::{reader::VolumeReader, IndexFormat};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("article {title:?} needs {needed} bytes but volumes are limited to {limit}")]
    ArticleTooLarge {
        title: String,
        needed: u64,
        limit: u64,
    },
    #[error("title of {0} bytes does not fit the key length prefix")]
    TitleTooLong(usize),
    #[error("record of {0} bytes does not fit the record length prefix")]
    RecordTooLarge(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("malformed file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("undecodable record: {0}")]
    Encoding(String),
    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("compression failed: {0}")]
    Compression(#[source] io::Error),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches the offending path to an `io::Result`.
pub trait IoContext<T> {
    fn at<P: AsRef<Path>>(self, path: P) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at<P: AsRef<Path>>(self, path: P) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}

/// Shared flag used to interrupt a long sort or compile from another thread.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
