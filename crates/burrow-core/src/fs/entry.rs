//! Cached metadata for a single filesystem path.
//!
//! A [`CacheEntry`] holds the raw stat snapshot of one path plus a set of
//! derived attributes (permission string, mime classification, human
//! readable size, natural sort keys). Derived attributes are computed on
//! first read and memoized against the entry's *generation*; every
//! [`CacheEntry::load`] bumps the generation, which invalidates all of them
//! at once.

use std::cell::{Cell, Ref, RefCell};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use unicode_normalization::UnicodeNormalization;

use crate::fs::directory::{DirHandle, DirectoryEntry};
use crate::nav::sort::{natural_key, NaturalKey};

/// Info string shown for entries whose stat failed.
pub const BAD_INFO: &str = "?";

const CONTAINER_EXTENSIONS: &[&str] = &[
    "7z", "ace", "ar", "arc", "bz", "bz2", "cab", "cpio", "cpt", "deb", "dgc", "dmg", "gz",
    "iso", "jar", "msi", "pkg", "rar", "shar", "tar", "tbz", "tgz", "xar", "xpi", "xz", "zip",
];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "cfg", "css", "cvs", "djvu", "doc", "docx", "gnm", "gnumeric", "htm", "html", "md", "odf",
    "odg", "odp", "ods", "odt", "pdf", "pod", "ps", "rtf", "sxc", "txt", "xls", "xlw", "xml",
    "xslx",
];
const DOCUMENT_BASENAMES: &[&str] = &[
    "bugs", "changelog", "copying", "credits", "hacking", "help", "install", "license", "readme",
    "todo",
];

/// What kind of filesystem object a path refers to.
///
/// Symlinks are classified by their target; a link whose target cannot be
/// resolved is [`Kind::Link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Directory,
    Link,
    Fifo,
    Socket,
    Device,
    /// Never loaded, or the stat failed.
    Unknown,
}

impl Kind {
    fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_dir() {
            return Kind::Directory;
        }
        if ft.is_symlink() {
            return Kind::Link;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_fifo() {
                return Kind::Fifo;
            }
            if ft.is_socket() {
                return Kind::Socket;
            }
            if ft.is_block_device() || ft.is_char_device() {
                return Kind::Device;
            }
        }
        Kind::File
    }
}

/// Modification and change time of a path, used for staleness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    modified: Option<SystemTime>,
    changed: Option<(i64, i64)>,
}

impl Stamp {
    pub fn of(meta: &Metadata) -> Self {
        #[cfg(unix)]
        let changed = {
            use std::os::unix::fs::MetadataExt;
            Some((meta.ctime(), meta.ctime_nsec()))
        };
        #[cfg(not(unix))]
        let changed = None;

        Self {
            modified: meta.modified().ok(),
            changed,
        }
    }

    /// Reads a fresh stamp without following symlinks.
    pub fn read(path: &Path) -> Option<Self> {
        std::fs::symlink_metadata(path).ok().map(|m| Self::of(&m))
    }

    /// Reads a fresh stamp, following symlinks.
    pub fn read_followed(path: &Path) -> Option<Self> {
        std::fs::metadata(path).ok().map(|m| Self::of(&m))
    }

    /// Combines two stamps into one that moves whenever either of them does.
    pub fn latest(self, other: Self) -> Self {
        Self {
            modified: self.modified.max(other.modified),
            changed: self.changed.max(other.changed),
        }
    }
}

/// Mime type plus the coarse classes derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeInfo {
    pub mimetype: Option<String>,
    pub video: bool,
    pub audio: bool,
    pub image: bool,
    pub document: bool,
    pub container: bool,
}

impl MimeInfo {
    pub fn media(&self) -> bool {
        self.video || self.audio || self.image
    }
}

/// A lazily computed value tagged with the generation it was computed for.
#[derive(Debug)]
pub(crate) struct Memo<T> {
    slot: RefCell<Option<(u64, T)>>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            slot: RefCell::new(None),
        }
    }
}

impl<T: Clone> Memo<T> {
    pub(crate) fn get_or_init(&self, generation: u64, init: impl FnOnce() -> T) -> T {
        if let Some((g, value)) = self.slot.borrow().as_ref() {
            if *g == generation {
                return value.clone();
            }
        }
        let value = init();
        *self.slot.borrow_mut() = Some((generation, value.clone()));
        value
    }

    pub(crate) fn set(&self, generation: u64, value: T) {
        *self.slot.borrow_mut() = Some((generation, value));
    }
}

/// One filesystem path's cached metadata.
#[derive(Debug)]
pub struct CacheEntry {
    path: PathBuf,
    basename: String,
    basename_lower: String,
    extension: Option<String>,
    display_name: String,
    kind: Kind,
    is_link: bool,
    exists: bool,
    accessible: bool,
    loaded: bool,
    stat: Option<Metadata>,
    stamp: Option<Stamp>,
    generation: u64,
    last_used: Cell<Instant>,
    permissions: Memo<String>,
    mime: Memo<MimeInfo>,
    infostring: Memo<String>,
    natural: Memo<NaturalKey>,
    natural_lower: Memo<NaturalKey>,
}

impl CacheEntry {
    /// Creates an unloaded entry for `path`. Nothing is read from disk.
    pub fn new(path: PathBuf) -> Self {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().nfc().collect::<String>())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let extension = basename
            .rfind('.')
            .map(|i| basename[i + 1..].to_lowercase());

        Self {
            basename_lower: basename.to_lowercase(),
            display_name: basename.clone(),
            basename,
            extension,
            path,
            kind: Kind::Unknown,
            is_link: false,
            exists: false,
            accessible: false,
            loaded: false,
            stat: None,
            stamp: None,
            generation: 0,
            last_used: Cell::new(Instant::now()),
            permissions: Memo::default(),
            mime: Memo::default(),
            infostring: Memo::default(),
            natural: Memo::default(),
            natural_lower: Memo::default(),
        }
    }

    /// Creates and immediately loads an entry.
    pub fn loaded(path: PathBuf) -> Self {
        let mut entry = Self::new(path);
        entry.load();
        entry
    }

    /// Stats the path and refreshes every cached field.
    ///
    /// Symlinks are followed; when the target cannot be stat'ed the link's
    /// own metadata is kept. A failed stat marks the entry inaccessible
    /// instead of returning an error.
    pub fn load(&mut self) {
        self.loaded = true;
        self.generation += 1;

        match std::fs::symlink_metadata(&self.path) {
            Ok(lmeta) => {
                self.stamp = Some(Stamp::of(&lmeta));
                self.is_link = lmeta.file_type().is_symlink();
                let meta = if self.is_link {
                    match std::fs::metadata(&self.path) {
                        Ok(target) => {
                            self.exists = true;
                            target
                        }
                        Err(e) => {
                            tracing::debug!("dangling link {}: {e}", self.path.display());
                            self.exists = false;
                            lmeta
                        }
                    }
                } else {
                    self.exists = true;
                    lmeta
                };
                self.kind = Kind::from_metadata(&meta);
                self.accessible = true;
                self.stat = Some(meta);
            }
            Err(e) => {
                tracing::debug!("stat failed for {}: {e}", self.path.display());
                self.stamp = None;
                self.is_link = false;
                self.exists = false;
                self.accessible = false;
                self.kind = Kind::Unknown;
                self.stat = None;
            }
        }
    }

    /// Reloads if the path's change time differs from the cached one.
    ///
    /// Returns `true` if a load happened.
    pub fn load_if_outdated(&mut self) -> bool {
        if !self.loaded {
            self.load();
            return true;
        }
        let fresh = Stamp::read(&self.path);
        if self.stamp.is_none() || self.stamp != fresh {
            self.load();
            return true;
        }
        false
    }

    /// Marks the entry as inaccessible without touching the disk.
    pub(crate) fn degrade(&mut self) {
        self.generation += 1;
        self.accessible = false;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn basename_lower(&self) -> &str {
        &self.basename_lower
    }

    /// Lowercased text after the last `.`, if any.
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// Name shown in listings; a relative path in flat mode.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub(crate) fn set_display_name(&mut self, name: String) {
        self.display_name = name;
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == Kind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == Kind::File
    }

    pub fn is_link(&self) -> bool {
        self.is_link
    }

    /// For links, whether the target resolved; otherwise whether the path exists.
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn accessible(&self) -> bool {
        self.accessible
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn stat(&self) -> Option<&Metadata> {
        self.stat.as_ref()
    }

    pub fn stamp(&self) -> Option<Stamp> {
        self.stamp
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Byte size for regular files; `0` for everything else.
    pub fn size(&self) -> u64 {
        match (&self.stat, self.kind) {
            (Some(meta), Kind::File) => meta.len(),
            _ => 0,
        }
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.stat.as_ref().and_then(|m| m.modified().ok())
    }

    pub fn accessed(&self) -> Option<SystemTime> {
        self.stat.as_ref().and_then(|m| m.accessed().ok())
    }

    /// Change time as `(seconds, nanoseconds)`; `None` off unix.
    pub fn changed(&self) -> Option<(i64, i64)> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            self.stat.as_ref().map(|m| (m.ctime(), m.ctime_nsec()))
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    /// `ls -l` style permission string, e.g. `drwxr-xr-x`.
    pub fn permissions(&self) -> String {
        self.permissions
            .get_or_init(self.generation, || self.compute_permissions())
    }

    fn compute_permissions(&self) -> String {
        let Some(meta) = &self.stat else {
            return BAD_INFO.to_string();
        };
        let mut perms = String::with_capacity(10);
        perms.push(if self.is_directory() {
            'd'
        } else if self.is_link {
            'l'
        } else {
            '-'
        });

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode: u32 = if meta.permissions().readonly() { 0o444 } else { 0o644 };

        let mut bit = 0o400;
        while bit != 0 {
            for what in ['r', 'w', 'x'] {
                perms.push(if mode & bit != 0 { what } else { '-' });
                bit >>= 1;
            }
        }
        perms
    }

    /// Mime type guessed from the name, with classification flags.
    pub fn mime(&self) -> MimeInfo {
        self.mime.get_or_init(self.generation, || self.compute_mime())
    }

    pub fn mimetype(&self) -> Option<String> {
        self.mime().mimetype
    }

    fn compute_mime(&self) -> MimeInfo {
        let name = if self.extension.as_deref() == Some("part") {
            &self.basename[..self.basename.len() - 5]
        } else {
            self.basename.as_str()
        };
        let mimetype = mime_guess::from_path(name).first().map(|m| m.to_string());
        let essence = mimetype.as_deref().unwrap_or("");
        let ext = self.extension.as_deref().unwrap_or("");

        MimeInfo {
            video: essence.starts_with("video"),
            audio: essence.starts_with("audio"),
            image: essence.starts_with("image"),
            document: essence.starts_with("text")
                || DOCUMENT_EXTENSIONS.contains(&ext)
                || DOCUMENT_BASENAMES.contains(&self.basename_lower.as_str()),
            container: CONTAINER_EXTENSIONS.contains(&ext),
            mimetype,
        }
    }

    /// Short info column: human size for files, a type tag for special files.
    ///
    /// Directories override this with their entry count, see
    /// [`DirectoryEntry::infostring`].
    pub fn infostring(&self) -> String {
        self.infostring
            .get_or_init(self.generation, || self.compute_infostring())
    }

    fn compute_infostring(&self) -> String {
        if !self.accessible {
            return BAD_INFO.to_string();
        }
        let info = match self.kind {
            Kind::Device => "dev".to_string(),
            Kind::Fifo => "fifo".to_string(),
            Kind::Socket => "sock".to_string(),
            Kind::File => format!(" {}", human_readable(self.size())),
            Kind::Directory | Kind::Link | Kind::Unknown => BAD_INFO.to_string(),
        };
        if self.is_link && !self.is_directory() {
            format!("->{info}")
        } else {
            info
        }
    }

    /// Digit-aware sort key of the basename.
    pub fn natural_key(&self, case_insensitive: bool) -> NaturalKey {
        if case_insensitive {
            self.natural_lower
                .get_or_init(self.generation, || natural_key(&self.basename_lower))
        } else {
            self.natural
                .get_or_init(self.generation, || natural_key(&self.basename))
        }
    }

    /// Marks the entry as used now, for age-based eviction.
    pub fn touch(&self) {
        self.last_used.set(Instant::now());
    }

    pub fn last_used(&self) -> Instant {
        self.last_used.get()
    }

    /// Whether the entry has gone unused for longer than `age`.
    pub fn is_older_than(&self, age: Duration) -> bool {
        self.last_used.get().elapsed() > age
    }
}

/// Formats a byte count the way listings show it.
pub fn human_readable(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// A cached path: either a plain entry or a directory with children.
#[derive(Debug, Clone)]
pub enum Entry {
    File(Rc<RefCell<CacheEntry>>),
    Directory(DirHandle),
}

impl Entry {
    pub fn file(entry: CacheEntry) -> Self {
        Entry::File(Rc::new(RefCell::new(entry)))
    }

    /// Borrows the underlying metadata.
    pub fn meta(&self) -> Ref<'_, CacheEntry> {
        match self {
            Entry::File(file) => file.borrow(),
            Entry::Directory(dir) => Ref::map(dir.borrow(), DirectoryEntry::entry),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.meta().path().to_path_buf()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }

    pub fn as_directory(&self) -> Option<&DirHandle> {
        match self {
            Entry::Directory(dir) => Some(dir),
            Entry::File(_) => None,
        }
    }

    /// Size used for display and sorting; entry count for directories.
    pub fn size(&self) -> u64 {
        match self {
            Entry::File(file) => file.borrow().size(),
            Entry::Directory(dir) => dir.borrow().size(),
        }
    }

    pub fn infostring(&self) -> String {
        match self {
            Entry::File(file) => file.borrow().infostring(),
            Entry::Directory(dir) => dir.borrow().infostring(),
        }
    }

    pub fn touch(&self) {
        self.meta().touch();
    }

    pub fn is_older_than(&self, age: Duration) -> bool {
        self.meta().is_older_than(age)
    }

    /// Re-stats the entry if its change time moved.
    pub fn load_if_outdated(&self) -> bool {
        match self {
            Entry::File(file) => file.borrow_mut().load_if_outdated(),
            Entry::Directory(dir) => dir.borrow_mut().load_if_outdated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_regular_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.txt");
        fs::write(&path, "hello").unwrap();

        let entry = CacheEntry::loaded(path.clone());

        assert_eq!(entry.basename(), "test.txt");
        assert_eq!(entry.extension(), Some("txt"));
        assert_eq!(entry.kind(), Kind::File);
        assert_eq!(entry.size(), 5);
        assert!(entry.accessible());
        assert!(entry.exists());
        assert!(!entry.is_link());
        assert_eq!(entry.path(), path);
        assert!(entry.modified().is_some());
    }

    #[test]
    fn load_directory() {
        let tmp = TempDir::new().unwrap();
        let entry = CacheEntry::loaded(tmp.path().to_path_buf());

        assert_eq!(entry.kind(), Kind::Directory);
        assert_eq!(entry.size(), 0);
        assert!(entry.permissions().starts_with('d'));
    }

    #[test]
    fn new_entry_is_not_loaded() {
        let entry = CacheEntry::new(PathBuf::from("/does/not/matter"));
        assert!(!entry.is_loaded());
        assert_eq!(entry.kind(), Kind::Unknown);
        assert_eq!(entry.generation(), 0);
    }

    #[test]
    fn missing_path_degrades_without_error() {
        let tmp = TempDir::new().unwrap();
        let entry = CacheEntry::loaded(tmp.path().join("ghost"));

        assert!(entry.is_loaded());
        assert!(!entry.accessible());
        assert!(!entry.exists());
        assert_eq!(entry.kind(), Kind::Unknown);
        assert_eq!(entry.infostring(), BAD_INFO);
        assert_eq!(entry.permissions(), BAD_INFO);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_is_followed() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target.txt");
        fs::write(&target, "data").unwrap();
        let link = tmp.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let entry = CacheEntry::loaded(link);

        assert!(entry.is_link());
        assert!(entry.exists());
        assert_eq!(entry.kind(), Kind::File);
        assert_eq!(entry.size(), 4);
        assert!(entry.infostring().starts_with("->"));
        assert!(entry.permissions().starts_with('l'));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_falls_back_to_link_stat() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("broken");
        std::os::unix::fs::symlink(tmp.path().join("nowhere"), &link).unwrap();

        let entry = CacheEntry::loaded(link);

        assert!(entry.is_link());
        assert!(entry.accessible());
        assert!(!entry.exists());
        assert_eq!(entry.kind(), Kind::Link);
    }

    #[cfg(unix)]
    #[test]
    fn fifo_is_classified() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pipe");
        let c_path = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
        assert_eq!(rc, 0);

        let entry = CacheEntry::loaded(path);

        assert_eq!(entry.kind(), Kind::Fifo);
        assert_eq!(entry.infostring(), "fifo");
        assert_eq!(entry.size(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn permission_string_reflects_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("script.sh");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o754)).unwrap();

        let entry = CacheEntry::loaded(path);

        assert_eq!(entry.permissions(), "-rwxr-xr--");
    }

    #[cfg(unix)]
    #[test]
    fn reload_recomputes_memoized_fields() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file");
        fs::write(&path, "x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let mut entry = CacheEntry::loaded(path.clone());
        assert_eq!(entry.permissions(), "-rw-r--r--");
        let before = entry.generation();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        // memo still holds the old value until a reload
        assert_eq!(entry.permissions(), "-rw-r--r--");

        assert!(entry.load_if_outdated());
        assert_eq!(entry.generation(), before + 1);
        assert_eq!(entry.permissions(), "-rw-------");
    }

    #[test]
    fn load_if_outdated_is_noop_without_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("still.txt");
        fs::write(&path, "same").unwrap();

        let mut entry = CacheEntry::new(path);
        assert!(entry.load_if_outdated());
        let generation = entry.generation();

        assert!(!entry.load_if_outdated());
        assert_eq!(entry.generation(), generation);
    }

    #[test]
    fn mime_classification() {
        let video = CacheEntry::new(PathBuf::from("/x/movie.mkv"));
        assert!(video.mime().video);
        assert!(video.mime().media());

        let image = CacheEntry::new(PathBuf::from("/x/photo.png"));
        assert_eq!(image.mimetype().as_deref(), Some("image/png"));
        assert!(image.mime().image);

        let archive = CacheEntry::new(PathBuf::from("/x/backup.tar"));
        assert!(archive.mime().container);

        let readme = CacheEntry::new(PathBuf::from("/x/README"));
        assert!(readme.mime().document);
        assert!(!readme.mime().media());
    }

    #[test]
    fn part_suffix_is_ignored_for_mime() {
        let partial = CacheEntry::new(PathBuf::from("/x/song.mp3.part"));
        assert!(partial.mime().audio);
    }

    #[test]
    fn unicode_name_is_nfc_normalised() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("한글파일.txt");
        fs::write(&path, "내용").unwrap();

        let entry = CacheEntry::loaded(path);

        assert_eq!(entry.basename(), "한글파일.txt");
    }

    #[test]
    fn file_infostring_is_human_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        fs::write(&path, vec![0u8; 2048]).unwrap();

        let entry = CacheEntry::loaded(path);

        assert!(entry.infostring().starts_with(' '));
        assert!(entry.infostring().contains("KiB"));
    }

    #[test]
    fn touch_resets_age() {
        let entry = CacheEntry::new(PathBuf::from("/x"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(entry.is_older_than(Duration::from_millis(1)));

        entry.touch();
        assert!(!entry.is_older_than(Duration::from_secs(60)));
    }

    #[test]
    fn memo_recomputes_on_new_generation() {
        let memo: Memo<u32> = Memo::default();
        let mut calls = 0;

        assert_eq!(memo.get_or_init(1, || { calls += 1; 10 }), 10);
        assert_eq!(memo.get_or_init(1, || { calls += 1; 20 }), 10);
        assert_eq!(memo.get_or_init(2, || { calls += 1; 30 }), 30);
        assert_eq!(calls, 2);
    }
}
