//! Chunk sources.
//!
//! A [`ChunkSource`] is one per-detector byte stream. Reads may be short or
//! empty; the reader decides what an empty read means using
//! [`ChunkSource::is_live`].

use crate::error::EbResult;
use bytes::Bytes;
use eb_pool::SlotPool;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Suffix of a file that is still being written.
pub const INPROGRESS_SUFFIX: &str = ".inprogress";

/// One per-detector stream of datagram bytes.
pub trait ChunkSource: Send {
    /// Read up to `max_bytes`. An empty result is not an error.
    fn read(&mut self, max_bytes: usize) -> EbResult<Bytes>;

    /// Whether more data may still arrive after an empty read.
    fn is_live(&self) -> bool;

    /// Short name for log records.
    fn name(&self) -> String;
}

/// A small-data file on disk.
///
/// A path ending in `.inprogress` is live until the writer renames it to its
/// final name.
pub struct FileSource {
    file: File,
    path: PathBuf,
    final_path: Option<PathBuf>,
}

impl FileSource {
    /// Open `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> EbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let final_path = path
            .to_str()
            .and_then(|p| p.strip_suffix(INPROGRESS_SUFFIX))
            .map(PathBuf::from);
        debug!(path = %path.display(), live = final_path.is_some(), "opened source file");
        Ok(Self {
            file,
            path,
            final_path,
        })
    }

    /// Path the source was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn read(&mut self, max_bytes: usize) -> EbResult<Bytes> {
        let mut buf = vec![0u8; max_bytes];
        let n = loop {
            match self.file.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        buf.truncate(n);
        trace!(path = %self.path.display(), n, "file read");
        Ok(Bytes::from(buf))
    }

    fn is_live(&self) -> bool {
        self.final_path.as_ref().is_some_and(|p| !p.exists())
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Datagrams handed over through a [`SlotPool`].
///
/// Every read takes one published datagram, copies it out and frees the slot
/// right away so a slow consumer never pins pool buffers. The source stays
/// live until the producer closes the pool.
pub struct ShmemSource {
    pool: SlotPool,
    tag: String,
}

impl ShmemSource {
    /// Consume from `pool`.
    #[must_use]
    pub fn new(pool: SlotPool, tag: impl Into<String>) -> Self {
        Self {
            pool,
            tag: tag.into(),
        }
    }
}

impl ChunkSource for ShmemSource {
    fn read(&mut self, _max_bytes: usize) -> EbResult<Bytes> {
        let Some(handle) = self.pool.get() else {
            return Ok(Bytes::new());
        };
        let bytes = self.pool.copy_out(handle);
        self.pool.free_by_index(handle.index, handle.size);
        Ok(bytes)
    }

    fn is_live(&self) -> bool {
        !self.pool.is_closed() || self.pool.pending() > 0
    }

    fn name(&self) -> String {
        format!("shmem:{}", self.tag)
    }
}

/// Scripted sources for tests and benchmarks.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Returns a fixed sequence of read results.
    ///
    /// Each scripted entry is the result of one read call (an empty entry is
    /// an empty read). Entries longer than the requested size are split over
    /// several reads. After the script runs out every read is empty.
    pub struct ScriptedSource {
        reads: VecDeque<Bytes>,
        live: bool,
        calls: Arc<AtomicUsize>,
        name: String,
    }

    impl ScriptedSource {
        /// Source that replays `reads` and is at EOF afterwards.
        pub fn new<I, B>(reads: I) -> Self
        where
            I: IntoIterator<Item = B>,
            B: Into<Bytes>,
        {
            Self {
                reads: reads.into_iter().map(Into::into).collect(),
                live: false,
                calls: Arc::new(AtomicUsize::new(0)),
                name: "scripted".to_string(),
            }
        }

        /// Source whose whole content arrives in the first read.
        pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
            Self::new([bytes.into()])
        }

        /// Mark the source live.
        #[must_use]
        pub fn live(mut self, live: bool) -> Self {
            self.live = live;
            self
        }

        /// Rename the source.
        #[must_use]
        pub fn named(mut self, name: impl Into<String>) -> Self {
            self.name = name.into();
            self
        }

        /// Shared count of read calls made so far.
        #[must_use]
        pub fn call_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    impl ChunkSource for ScriptedSource {
        fn read(&mut self, max_bytes: usize) -> EbResult<Bytes> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let Some(mut next) = self.reads.pop_front() else {
                return Ok(Bytes::new());
            };
            if next.len() > max_bytes {
                let rest = next.split_off(max_bytes);
                self.reads.push_front(rest);
            }
            Ok(next)
        }

        fn is_live(&self) -> bool {
            self.live
        }

        fn name(&self) -> String {
            self.name.clone()
        }
    }
}
