//! The session-wide map from paths to cached entries.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::fs::directory::{DirHandle, DirectoryEntry};
use crate::fs::entry::{CacheEntry, Entry};

/// Age threshold for [`Cache::garbage_collect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAge {
    /// Evict everything that is not on an active path.
    Unconditional,
    /// Evict entries unused for longer than this.
    Older(Duration),
}

/// Path-keyed store of [`Entry`] values.
///
/// Keys are absolute, lexically normalised paths; symlinks are not
/// resolved, so a link and its target are cached separately.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<PathBuf, Entry>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached entry for `path`, creating it on first use.
    ///
    /// New entries are stat'ed to decide between a plain entry and a
    /// directory. Paths that cannot be stat'ed are returned degraded but
    /// not remembered.
    pub fn get(&mut self, path: &Path) -> Entry {
        let path = normalize(path);
        if let Some(entry) = self.entries.get(&path) {
            tracing::trace!("cache hit: {}", path.display());
            entry.touch();
            return entry.clone();
        }

        tracing::debug!("cache miss: {}", path.display());
        let meta = CacheEntry::loaded(path.clone());
        if !meta.accessible() {
            return Entry::file(meta);
        }
        let entry = if meta.is_directory() {
            Entry::Directory(DirectoryEntry::from_entry(meta))
        } else {
            Entry::file(meta)
        };
        self.entries.insert(path, entry.clone());
        entry
    }

    /// Like [`get`](Self::get) but requires a directory.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the path cannot be stat'ed,
    /// [`CoreError::NotADirectory`] if it is something else.
    pub fn get_directory(&mut self, path: &Path) -> CoreResult<DirHandle> {
        let entry = self.get(path);
        if let Entry::Directory(dir) = entry {
            return Ok(dir);
        }
        if entry.meta().accessible() {
            Err(CoreError::NotADirectory(entry.path()))
        } else {
            Err(CoreError::NotFound(entry.path()))
        }
    }

    /// Cached entry for `path`, without creating or touching it.
    pub fn lookup(&self, path: &Path) -> Option<Entry> {
        self.entries.get(&normalize(path)).cloned()
    }

    /// Cached directory for `path`, without creating or touching it.
    pub fn directory(&self, path: &Path) -> Option<DirHandle> {
        match self.entries.get(&normalize(path)) {
            Some(Entry::Directory(dir)) => Some(Rc::clone(dir)),
            _ => None,
        }
    }

    /// Every cached directory.
    pub fn directories(&self) -> impl Iterator<Item = &DirHandle> {
        self.entries.values().filter_map(Entry::as_directory)
    }

    /// Builds the entry for one child found by a directory scan.
    ///
    /// An already cached directory is reused and only re-stat'ed if it
    /// changed; its own children are left alone.
    pub(crate) fn scanned_child(&mut self, path: PathBuf, display: Option<String>) -> Entry {
        let mut meta = CacheEntry::loaded(path);
        let display = display.unwrap_or_else(|| meta.basename().to_string());

        if !meta.is_directory() {
            if matches!(self.entries.get(meta.path()), Some(Entry::Directory(_))) {
                tracing::debug!("{} is no longer a directory", meta.path().display());
                self.entries.remove(meta.path());
            }
            meta.set_display_name(display);
            return Entry::file(meta);
        }

        if let Some(Entry::Directory(dir)) = self.entries.get(meta.path()) {
            let dir = Rc::clone(dir);
            {
                let mut cached = dir.borrow_mut();
                cached.load_if_outdated();
                cached.set_display_name(display);
            }
            return Entry::Directory(dir);
        }

        meta.set_display_name(display);
        let path = meta.path().to_path_buf();
        let dir = DirectoryEntry::from_entry(meta);
        self.entries.insert(path, Entry::Directory(Rc::clone(&dir)));
        Entry::Directory(dir)
    }

    /// Evicts entries older than `max_age`, sparing every path in `active`.
    ///
    /// Evicted directories drop their child lists and stop any running
    /// scan. Returns the number of evicted entries.
    pub fn garbage_collect(&mut self, max_age: MaxAge, active: &HashSet<PathBuf>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, entry| {
            if active.contains(path) {
                return true;
            }
            if let MaxAge::Older(age) = max_age {
                if !entry.is_older_than(age) {
                    return true;
                }
            }
            if let Entry::Directory(dir) = entry {
                dir.borrow_mut().clear_content();
            }
            tracing::debug!("evicting {}", path.display());
            false
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::info!("evicted {evicted} cached entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry, stopping running scans.
    pub fn clear(&mut self) {
        for dir in self.directories() {
            dir.borrow_mut().clear_content();
        }
        self.entries.clear();
    }
}

/// Makes `path` absolute and resolves `.` and `..` lexically.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
