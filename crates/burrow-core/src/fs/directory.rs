//! Cached directories and their incremental scan.
//!
//! A [`DirectoryEntry`] keeps the full child list of one directory
//! (`all_children`) and the visible list derived from it by filtering and
//! sorting (`children`), together with the view state: selection, scroll
//! offset and marks.
//!
//! Reading the children happens in phases so that a huge directory never
//! blocks the caller for long:
//!
//! 1. re-stat the directory itself,
//! 2. list the child names (or walk a few levels deep in flat mode),
//! 3. stat one child per step, reusing cached sub-directories,
//! 4. restore marks and selection, then filter and sort.
//!
//! Each phase returns [`Step::Yield`], so the scan can run under the
//! scheduler as a [`ScanTask`] or be driven to the end synchronously.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use regex::Regex;
use walkdir::WalkDir;

use crate::config::settings::BrowseConfig;
use crate::error::CoreResult;
use crate::event::Event;
use crate::fs::entry::{CacheEntry, Entry, Memo, Stamp, BAD_INFO};
use crate::nav::filter::{apply_filters, FilterState, InodeFilter};
use crate::nav::sort::sort_entries;
use crate::task::{Spawner, Step, Task, TaskContext, TaskId};

/// Shared handle to a cached directory.
pub type DirHandle = Rc<RefCell<DirectoryEntry>>;

/// One name produced by the listing phase.
#[derive(Debug)]
struct Listed {
    path: PathBuf,
    /// Relative path shown in flat mode.
    display: Option<String>,
}

#[derive(Debug)]
enum ScanPhase {
    Start,
    List,
    Stat {
        listed: Vec<Listed>,
        next: usize,
        built: Vec<Entry>,
    },
    Finish {
        built: Vec<Entry>,
    },
}

#[derive(Debug)]
struct ScanState {
    phase: ScanPhase,
    /// Settings the scan finishes with.
    browse: BrowseConfig,
    /// Flat depth the listing used, once it ran.
    listed_depth: Option<usize>,
    percent: u8,
}

/// A cached directory with its children and view state.
#[derive(Debug)]
pub struct DirectoryEntry {
    entry: CacheEntry,
    this: Weak<RefCell<DirectoryEntry>>,
    all_children: Option<Vec<Entry>>,
    children: Vec<Entry>,
    filter: FilterState,
    browse: BrowseConfig,
    hidden: Option<Regex>,
    content_loaded: bool,
    content_outdated: bool,
    order_outdated: bool,
    content_stamp: Option<Stamp>,
    count: Memo<Option<u64>>,
    pointer: Option<usize>,
    pointed_path: Option<PathBuf>,
    scroll_begin: usize,
    marked: HashSet<PathBuf>,
    scan: Option<ScanState>,
    scan_task: Option<TaskId>,
}

impl DirectoryEntry {
    /// Creates an unloaded directory for `path`.
    pub fn handle(path: PathBuf) -> DirHandle {
        Self::from_entry(CacheEntry::new(path))
    }

    /// Wraps already loaded metadata into a directory.
    pub fn from_entry(entry: CacheEntry) -> DirHandle {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                entry,
                this: this.clone(),
                all_children: None,
                children: Vec::new(),
                filter: FilterState::default(),
                browse: BrowseConfig::default(),
                hidden: None,
                content_loaded: false,
                content_outdated: false,
                order_outdated: false,
                content_stamp: None,
                count: Memo::default(),
                pointer: None,
                pointed_path: None,
                scroll_begin: 0,
                marked: HashSet::new(),
                scan: None,
                scan_task: None,
            })
        })
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn path(&self) -> &Path {
        self.entry.path()
    }

    pub fn load(&mut self) {
        self.entry.load();
    }

    pub fn load_if_outdated(&mut self) -> bool {
        self.entry.load_if_outdated()
    }

    pub(crate) fn set_display_name(&mut self, name: String) {
        self.entry.set_display_name(name);
    }

    /// Number of entries in the directory.
    ///
    /// Known after a scan; before that the directory is listed once on
    /// demand. Unreadable directories count as empty.
    pub fn size(&self) -> u64 {
        self.count().unwrap_or(0)
    }

    fn count(&self) -> Option<u64> {
        self.count.get_or_init(self.entry.generation(), || {
            std::fs::read_dir(self.entry.path())
                .ok()
                .map(|listing| listing.count() as u64)
        })
    }

    /// `" N"` with the entry count, `->` prefixed for links, `?` if unreadable.
    pub fn infostring(&self) -> String {
        if !self.entry.accessible() {
            return BAD_INFO.to_string();
        }
        let info = match self.count() {
            Some(n) => format!(" {n}"),
            None => BAD_INFO.to_string(),
        };
        if self.entry.is_link() {
            format!("->{info}")
        } else {
            info
        }
    }

    // Content

    /// Every child found by the last scan, unfiltered. `None` until scanned.
    pub fn all_children(&self) -> Option<&[Entry]> {
        self.all_children.as_deref()
    }

    /// Visible children, filtered and sorted.
    pub fn children(&self) -> &[Entry] {
        &self.children
    }

    pub fn is_content_loaded(&self) -> bool {
        self.content_loaded
    }

    pub fn is_loading(&self) -> bool {
        self.scan.is_some()
    }

    /// Progress of the running scan.
    pub fn scan_percent(&self) -> Option<u8> {
        self.scan.as_ref().map(|s| s.percent)
    }

    /// Starts (or joins) a scan of the directory.
    ///
    /// With `schedule` the scan is queued as a [`ScanTask`]; a scan that is
    /// already running keeps its progress and is only moved to the front
    /// of the queue. Without `schedule` the scan runs to completion before
    /// returning.
    pub fn load_content(&mut self, ctx: &mut TaskContext<'_>, schedule: bool) {
        self.content_outdated = false;
        if self.scan.is_none() {
            if !self.entry.is_loaded() {
                self.entry.load();
            }
            self.scan = Some(ScanState {
                phase: ScanPhase::Start,
                browse: ctx.browse.clone(),
                listed_depth: None,
                percent: 0,
            });
        }

        if schedule {
            let id = *self.scan_task.get_or_insert_with(TaskId::next);
            tracing::debug!("scheduling scan {id} of {}", self.path().display());
            ctx.spawn(
                Box::new(ScanTask {
                    id,
                    dir: self.this.clone(),
                    path: self.path().to_path_buf(),
                    paused: false,
                }),
                false,
            );
        } else {
            while self.scan_step(ctx) == Step::Yield {}
        }
    }

    /// Loads the content unless it has been loaded before.
    ///
    /// Returns `true` if a load was started.
    pub fn load_content_once(&mut self, ctx: &mut TaskContext<'_>, schedule: bool) -> bool {
        if self.content_loaded {
            return false;
        }
        self.load_content(ctx, schedule);
        true
    }

    /// Rescans if the directory changed on disk since the last scan.
    ///
    /// Returns `true` if a scan was started.
    pub fn load_content_if_outdated(&mut self, ctx: &mut TaskContext<'_>, schedule: bool) -> bool {
        if self.load_content_once(ctx, schedule) {
            return true;
        }
        if self.all_children.is_none() || self.content_outdated {
            self.load_content(ctx, schedule);
            return true;
        }
        let Some(fresh) = listing_stamp(self.path(), self.browse.flat_depth) else {
            return false;
        };
        if self.content_stamp != Some(fresh) {
            tracing::debug!("{} changed on disk, rescanning", self.path().display());
            self.load_content(ctx, schedule);
            return true;
        }
        false
    }

    /// Forces the next [`load_content_if_outdated`](Self::load_content_if_outdated) to rescan.
    pub fn request_reload(&mut self) {
        self.content_outdated = true;
    }

    /// Forces the next [`sort_if_outdated`](Self::sort_if_outdated) to re-sort.
    pub fn request_resort(&mut self) {
        self.order_outdated = true;
    }

    /// Re-runs the filter and sort pipeline if ordering settings changed.
    pub fn sort_if_outdated(&mut self) -> bool {
        if !self.order_outdated || self.all_children.is_none() {
            return false;
        }
        self.refilter();
        true
    }

    /// Drops the child list and stops any running scan.
    pub(crate) fn clear_content(&mut self) {
        self.cancel_scan();
        self.all_children = None;
        self.children.clear();
        self.pointer = None;
        self.pointed_path = None;
        self.content_loaded = false;
        self.content_stamp = None;
    }

    pub(crate) fn cancel_scan(&mut self) {
        if self.scan.take().is_some() {
            tracing::debug!("scan of {} cancelled", self.path().display());
        }
        self.scan_task = None;
    }

    // Scan

    fn scan_step(&mut self, ctx: &mut TaskContext<'_>) -> Step {
        let Some(mut scan) = self.scan.take() else {
            return Step::Done;
        };

        match std::mem::replace(&mut scan.phase, ScanPhase::Start) {
            ScanPhase::Start => {
                self.entry.load_if_outdated();
                if !self.entry.accessible() || !self.entry.is_directory() {
                    tracing::debug!("{} is not a readable directory", self.path().display());
                    self.abort_scan(ctx);
                    return Step::Done;
                }
                scan.phase = ScanPhase::List;
            }
            ScanPhase::List => match list_children(self.entry.path(), scan.browse.flat_depth) {
                Ok(listed) => {
                    self.count
                        .set(self.entry.generation(), Some(listed.len() as u64));
                    self.content_stamp = listing_stamp(self.entry.path(), scan.browse.flat_depth);
                    scan.listed_depth = Some(scan.browse.flat_depth);
                    tracing::debug!(
                        "listed {} entries in {}",
                        listed.len(),
                        self.path().display()
                    );
                    scan.phase = if listed.is_empty() {
                        ScanPhase::Finish { built: Vec::new() }
                    } else {
                        let built = Vec::with_capacity(listed.len());
                        ScanPhase::Stat {
                            listed,
                            next: 0,
                            built,
                        }
                    };
                }
                Err(e) => {
                    tracing::debug!("cannot list {}: {e}", self.path().display());
                    self.entry.degrade();
                    self.abort_scan(ctx);
                    return Step::Done;
                }
            },
            ScanPhase::Stat {
                listed,
                mut next,
                mut built,
            } => {
                let item = &listed[next];
                built.push(
                    ctx.cache
                        .scanned_child(item.path.clone(), item.display.clone()),
                );
                next += 1;
                scan.percent = (next * 100 / listed.len()) as u8;
                scan.phase = if next == listed.len() {
                    ScanPhase::Finish { built }
                } else {
                    ScanPhase::Stat {
                        listed,
                        next,
                        built,
                    }
                };
            }
            ScanPhase::Finish { built } => {
                self.finish_scan(built, scan.browse, ctx);
                return Step::Done;
            }
        }

        self.scan = Some(scan);
        Step::Yield
    }

    fn finish_scan(&mut self, built: Vec<Entry>, browse: BrowseConfig, ctx: &mut TaskContext<'_>) {
        let present: HashSet<PathBuf> = built.iter().map(Entry::path).collect();
        self.marked.retain(|p| present.contains(p));
        self.all_children = Some(built);

        let outdated = self.content_outdated;
        if let Err(e) = self.set_browse(browse) {
            ctx.notifier
                .notify(&format!("{}: {e}", self.path().display()));
        }
        // The listing just ran with these settings.
        self.content_outdated = outdated;
        self.refilter();

        self.content_loaded = true;
        self.scan_task = None;
        tracing::debug!("scan of {} finished", self.path().display());
        ctx.events.emit(Event::ScanFinished {
            path: self.path().to_path_buf(),
        });
    }

    fn abort_scan(&mut self, ctx: &mut TaskContext<'_>) {
        self.all_children = None;
        self.marked.clear();
        self.set_children(Vec::new());
        self.content_loaded = true;
        self.scan_task = None;
        ctx.events.emit(Event::ScanFinished {
            path: self.path().to_path_buf(),
        });
    }

    // Filtering and sorting

    /// Adopts new browse settings.
    ///
    /// Ordering is marked outdated and applied by the next
    /// [`sort_if_outdated`](Self::sort_if_outdated); a change to the
    /// hidden-file settings re-filters immediately.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidPattern`](crate::CoreError::InvalidPattern) if the
    /// hidden-file pattern does not compile. Hidden files are shown then.
    pub fn set_browse(&mut self, browse: BrowseConfig) -> CoreResult<()> {
        let hidden_changed = browse.show_hidden != self.browse.show_hidden
            || browse.hidden_filter != self.browse.hidden_filter;
        let relist = match &self.scan {
            Some(scan) => scan.listed_depth.is_some_and(|d| d != browse.flat_depth),
            None => self.content_loaded && browse.flat_depth != self.browse.flat_depth,
        };
        if relist {
            self.content_outdated = true;
        }
        if let Some(scan) = self.scan.as_mut() {
            // A running scan finishes with the newest settings.
            scan.browse = browse.clone();
        }
        let compiled = browse.hidden_regex();
        self.browse = browse;
        self.order_outdated = true;

        let result = match compiled {
            Ok(hidden) => {
                self.hidden = hidden;
                Ok(())
            }
            Err(e) => {
                self.hidden = None;
                Err(e)
            }
        };
        if hidden_changed {
            self.refilter();
        }
        result
    }

    pub fn browse(&self) -> &BrowseConfig {
        &self.browse
    }

    pub fn filter(&self) -> &FilterState {
        &self.filter
    }

    /// Sets the persistent name filter; an empty pattern clears it.
    pub fn set_name_filter(&mut self, pattern: &str) -> CoreResult<()> {
        self.filter.set_name_filter(pattern)?;
        self.refilter();
        Ok(())
    }

    /// Narrows the view to names fuzzily matching `query`.
    pub fn set_narrow(&mut self, query: &str) {
        self.filter.set_narrow(query);
        self.refilter();
    }

    pub fn set_inode_filter(&mut self, inode: InodeFilter) {
        self.filter.inode = inode;
        self.refilter();
    }

    /// Rebuilds `children` from `all_children`.
    pub fn refilter(&mut self) {
        let visible = match &self.all_children {
            Some(all) => {
                let mut visible = apply_filters(all, self.hidden.as_ref(), &self.filter);
                sort_entries(&mut visible, &self.browse);
                visible
            }
            None => Vec::new(),
        };
        self.order_outdated = false;
        self.set_children(visible);
    }

    fn set_children(&mut self, visible: Vec<Entry>) {
        let was_empty = self.children.is_empty();
        self.children = visible;

        self.pointer = if self.children.is_empty() {
            None
        } else if was_empty {
            Some(0)
        } else {
            self.pointed_path
                .as_deref()
                .and_then(|p| self.index_of(p))
                .or(Some(0))
        };
        self.pointed_path = self.pointed().map(Entry::path);
        self.scroll_begin = self
            .scroll_begin
            .min(self.children.len().saturating_sub(1));
    }

    fn index_of(&self, path: &Path) -> Option<usize> {
        self.children.iter().position(|e| e.meta().path() == path)
    }

    // Selection

    pub fn pointer(&self) -> Option<usize> {
        self.pointer
    }

    /// The child under the cursor.
    pub fn pointed(&self) -> Option<&Entry> {
        self.pointer.and_then(|i| self.children.get(i))
    }

    /// Moves the cursor, clamping to the visible range.
    pub fn move_to(&mut self, index: usize) {
        if self.children.is_empty() {
            self.pointer = None;
            self.pointed_path = None;
            return;
        }
        self.pointer = Some(index.min(self.children.len() - 1));
        self.pointed_path = self.pointed().map(Entry::path);
    }

    /// Moves the cursor onto the child at `path`. Returns `false` if it is not visible.
    pub fn move_to_path(&mut self, path: &Path) -> bool {
        match self.index_of(path) {
            Some(i) => {
                self.pointer = Some(i);
                self.pointed_path = Some(path.to_path_buf());
                true
            }
            None => false,
        }
    }

    pub fn scroll_begin(&self) -> usize {
        self.scroll_begin
    }

    pub fn set_scroll_begin(&mut self, begin: usize) {
        self.scroll_begin = begin;
    }

    // Marks

    /// Marks or unmarks the visible child at `path`.
    ///
    /// Returns `false` if no such child is visible.
    pub fn mark(&mut self, path: &Path, value: bool) -> bool {
        if self.index_of(path).is_none() {
            return false;
        }
        if value {
            self.marked.insert(path.to_path_buf());
        } else {
            self.marked.remove(path);
        }
        true
    }

    pub fn toggle_mark(&mut self, path: &Path) -> bool {
        let value = !self.marked.contains(path);
        self.mark(path, value)
    }

    /// Marks or unmarks every visible child.
    pub fn mark_all(&mut self, value: bool) {
        for child in &self.children {
            let path = child.path();
            if value {
                self.marked.insert(path);
            } else {
                self.marked.remove(&path);
            }
        }
    }

    /// Inverts the mark of every visible child.
    pub fn toggle_all_marks(&mut self) {
        for child in &self.children {
            let path = child.path();
            if !self.marked.remove(&path) {
                self.marked.insert(path);
            }
        }
    }

    pub fn is_marked(&self, path: &Path) -> bool {
        self.marked.contains(path)
    }

    pub fn mark_count(&self) -> usize {
        self.marked.len()
    }

    /// Marked visible children, in display order.
    pub fn marked_paths(&self) -> Vec<PathBuf> {
        self.children
            .iter()
            .map(Entry::path)
            .filter(|p| self.marked.contains(p))
            .collect()
    }

    /// The marked visible children, or the pointed child if nothing is marked.
    pub fn selection(&self) -> Vec<Entry> {
        let marked: Vec<Entry> = self
            .children
            .iter()
            .filter(|e| self.marked.contains(e.meta().path()))
            .cloned()
            .collect();
        if !marked.is_empty() {
            return marked;
        }
        self.pointed().cloned().into_iter().collect()
    }
}

/// Staleness stamp of a listing: the directory itself, and in flat mode
/// also every nested directory whose entries are listed.
fn listing_stamp(dir: &Path, flat_depth: usize) -> Option<Stamp> {
    let top = Stamp::read_followed(dir)?;
    if flat_depth <= 1 {
        return Some(top);
    }
    let stamp = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(flat_depth - 1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| e.metadata().ok())
        .map(|m| Stamp::of(&m))
        .fold(top, Stamp::latest);
    Some(stamp)
}

fn list_children(dir: &Path, flat_depth: usize) -> std::io::Result<Vec<Listed>> {
    let listing = std::fs::read_dir(dir)?;
    if flat_depth == 0 {
        return Ok(listing
            .filter_map(Result::ok)
            .map(|e| Listed {
                path: e.path(),
                display: None,
            })
            .collect());
    }

    Ok(WalkDir::new(dir)
        .min_depth(1)
        .max_depth(flat_depth)
        .into_iter()
        .filter_map(Result::ok)
        .map(|e| {
            let display = e
                .path()
                .strip_prefix(dir)
                .ok()
                .map(|rel| rel.to_string_lossy().into_owned());
            Listed {
                path: e.into_path(),
                display,
            }
        })
        .collect())
}

/// The scheduler-facing side of a directory scan.
///
/// Holds the directory weakly: evicting the directory ends the task.
pub struct ScanTask {
    id: TaskId,
    dir: Weak<RefCell<DirectoryEntry>>,
    path: PathBuf,
    paused: bool,
}

impl Task for ScanTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn description(&self) -> String {
        format!("Loading {}", self.path.display())
    }

    fn percent(&self) -> Option<u8> {
        let dir = self.dir.upgrade()?;
        let dir = dir.try_borrow().ok()?;
        dir.scan_percent()
    }

    fn reports_progress(&self) -> bool {
        true
    }

    fn step(&mut self, ctx: &mut TaskContext<'_>) -> CoreResult<Step> {
        if self.paused {
            return Ok(Step::Yield);
        }
        let Some(dir) = self.dir.upgrade() else {
            return Ok(Step::Done);
        };
        let step = dir.borrow_mut().scan_step(ctx);
        Ok(step)
    }

    fn is_exhausted(&self) -> bool {
        self.dir
            .upgrade()
            .map_or(true, |d| d.try_borrow().map_or(false, |d| !d.is_loading()))
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn unpause(&mut self) {
        self.paused = false;
    }

    fn destroy(&mut self) {
        if let Some(dir) = self.dir.upgrade() {
            if let Ok(mut dir) = dir.try_borrow_mut() {
                dir.cancel_scan();
            }
        }
    }
}
