use dashmap::DashMap;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::trace;

use crate::error::ServerResult;

/// Memory-mapped view of a file too large for the in-memory cache.
#[derive(Debug)]
pub struct MappedFile {
    mmap: Mmap,
    _file: File,
}

impl MappedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: documents are assumed not to be truncated while being served.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap, _file: file })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }
}

#[derive(Debug, Clone)]
struct CachedFile {
    data: Arc<Vec<u8>>,
    modified: Option<SystemTime>,
}

/// Result of [`FileCache::load`].
#[derive(Debug)]
pub enum LoadedFile {
    Cached(Arc<Vec<u8>>),
    Mapped(MappedFile),
    /// Empty files cannot be mapped.
    Empty,
}

impl LoadedFile {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            LoadedFile::Cached(data) => data.as_slice(),
            LoadedFile::Mapped(file) => file.as_bytes(),
            LoadedFile::Empty => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, LoadedFile::Cached(_))
    }
}

/// Static file reader shared by all connections.
///
/// Files up to `threshold` bytes are kept in memory and revalidated against
/// their modification time on every hit; larger files are mapped per request.
#[derive(Debug)]
pub struct FileCache {
    entries: DashMap<PathBuf, CachedFile>,
    threshold: usize,
    max_entries: usize,
}

impl FileCache {
    pub fn new(threshold: usize, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            threshold,
            max_entries,
        }
    }

    pub fn load<P: AsRef<Path>>(&self, path: P) -> ServerResult<LoadedFile> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        let size = metadata.len() as usize;
        let modified = metadata.modified().ok();

        if size == 0 {
            return Ok(LoadedFile::Empty);
        }
        if size > self.threshold {
            trace!(?path, size, "mapping large file");
            return Ok(LoadedFile::Mapped(MappedFile::open(path)?));
        }

        if let Some(entry) = self.entries.get(path) {
            if modified.is_some() && entry.modified == modified {
                trace!(?path, "file cache hit");
                return Ok(LoadedFile::Cached(entry.data.clone()));
            }
        }

        let data = Arc::new(std::fs::read(path)?);
        if self.entries.len() >= self.max_entries {
            self.entries.clear();
        }
        self.entries.insert(
            path.to_path_buf(),
            CachedFile {
                data: data.clone(),
                modified,
            },
        );
        Ok(LoadedFile::Cached(data))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
