//! Filtering of directory children.
//!
//! The visible list of a directory is derived from its full child list by
//! applying, in order: the hidden-file pattern, the persistent name filter,
//! the fuzzy narrow query, and the inode-type filter.

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use regex::Regex;

use crate::error::{CoreError, CoreResult};
use crate::fs::entry::Entry;

/// Restricts the listing to certain kinds of entries.
///
/// When no flag is set every kind passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeFilter {
    pub files: bool,
    pub dirs: bool,
    pub links: bool,
}

impl InodeFilter {
    /// Parses a flag string such as `"fd"`: `f` files, `d` directories, `l` links.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidPattern`] on any other character.
    pub fn parse(flags: &str) -> CoreResult<Self> {
        let mut filter = Self::default();
        for c in flags.chars() {
            match c {
                'f' => filter.files = true,
                'd' => filter.dirs = true,
                'l' => filter.links = true,
                other => {
                    return Err(CoreError::InvalidPattern(format!(
                        "unknown inode type '{other}'"
                    )))
                }
            }
        }
        Ok(filter)
    }

    pub fn is_active(&self) -> bool {
        self.files || self.dirs || self.links
    }

    fn accepts(&self, entry: &Entry) -> bool {
        if !self.is_active() {
            return true;
        }
        let meta = entry.meta();
        (self.links && meta.is_link())
            || (self.dirs && entry.is_directory())
            || (self.files && !entry.is_directory())
    }
}

/// Per-directory filter configuration.
#[derive(Debug, Clone, Default)]
pub struct FilterState {
    /// Persistent regex a basename must match.
    pub name_filter: Option<Regex>,
    /// Temporary type-to-narrow query, matched fuzzily.
    pub narrow: Option<String>,
    pub inode: InodeFilter,
}

impl FilterState {
    /// Sets the persistent name filter from a pattern; an empty pattern clears it.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidPattern`] if the pattern is not a valid regex.
    pub fn set_name_filter(&mut self, pattern: &str) -> CoreResult<()> {
        self.name_filter = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern).map_err(|e| CoreError::InvalidPattern(e.to_string()))?)
        };
        Ok(())
    }

    pub fn set_narrow(&mut self, query: &str) {
        self.narrow = if query.is_empty() {
            None
        } else {
            Some(query.to_string())
        };
    }

    pub fn is_active(&self) -> bool {
        self.name_filter.is_some() || self.narrow.is_some() || self.inode.is_active()
    }
}

/// Returns the entries of `all` that pass every filter stage, in order.
pub fn apply_filters(all: &[Entry], hidden: Option<&Regex>, state: &FilterState) -> Vec<Entry> {
    let matcher = state.narrow.as_ref().map(|_| SkimMatcherV2::default());

    all.iter()
        .filter(|e| {
            let meta = e.meta();
            let name = meta.basename();
            if hidden.is_some_and(|re| re.is_match(name)) {
                return false;
            }
            if state.name_filter.as_ref().is_some_and(|re| !re.is_match(name)) {
                return false;
            }
            if let (Some(matcher), Some(query)) = (&matcher, &state.narrow) {
                if matcher.fuzzy_match(meta.display_name(), query).is_none() {
                    return false;
                }
            }
            true
        })
        .filter(|e| state.inode.accepts(e))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::directory::DirectoryEntry;
    use crate::fs::entry::CacheEntry;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn create_test_entries(tmp: &TempDir) -> Vec<Entry> {
        fs::write(tmp.path().join("banana.txt"), "12345").unwrap();
        fs::write(tmp.path().join("apple.rs"), "ab").unwrap();
        fs::write(tmp.path().join(".hidden"), "").unwrap();
        fs::create_dir(tmp.path().join("docs")).unwrap();

        let mut entries: Vec<Entry> = ["banana.txt", "apple.rs", ".hidden"]
            .iter()
            .map(|n| Entry::file(CacheEntry::loaded(tmp.path().join(n))))
            .collect();
        entries.push(Entry::Directory(DirectoryEntry::handle(
            tmp.path().join("docs"),
        )));
        entries
    }

    fn names(entries: &[Entry]) -> Vec<String> {
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.meta().basename().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn no_filters_keep_everything() {
        let tmp = TempDir::new().unwrap();
        let entries = create_test_entries(&tmp);

        let visible = apply_filters(&entries, None, &FilterState::default());

        assert_eq!(visible.len(), 4);
    }

    #[test]
    fn hidden_pattern_removes_dotfiles() {
        let tmp = TempDir::new().unwrap();
        let entries = create_test_entries(&tmp);
        let hidden = Regex::new(r"^\.").unwrap();

        let visible = apply_filters(&entries, Some(&hidden), &FilterState::default());

        assert_eq!(names(&visible), vec!["apple.rs", "banana.txt", "docs"]);
    }

    #[test]
    fn name_filter_keeps_matches_only() {
        let tmp = TempDir::new().unwrap();
        let entries = create_test_entries(&tmp);
        let mut state = FilterState::default();
        state.set_name_filter(r"\.rs$").unwrap();

        let visible = apply_filters(&entries, None, &state);

        assert_eq!(names(&visible), vec!["apple.rs"]);
    }

    #[test]
    fn empty_name_filter_clears() {
        let mut state = FilterState::default();
        state.set_name_filter("x").unwrap();
        state.set_name_filter("").unwrap();
        assert!(state.name_filter.is_none());
        assert!(!state.is_active());
    }

    #[test]
    fn invalid_name_filter_is_rejected() {
        let mut state = FilterState::default();
        assert!(matches!(
            state.set_name_filter("(("),
            Err(CoreError::InvalidPattern(_))
        ));
    }

    #[test]
    fn fuzzy_narrow_matches_subsequence() {
        let tmp = TempDir::new().unwrap();
        let entries = create_test_entries(&tmp);
        let mut state = FilterState::default();
        state.set_narrow("bnn");

        let visible = apply_filters(&entries, None, &state);

        assert_eq!(names(&visible), vec!["banana.txt"]);
    }

    #[test]
    fn inode_filter_directories_only() {
        let tmp = TempDir::new().unwrap();
        let entries = create_test_entries(&tmp);
        let state = FilterState {
            inode: InodeFilter::parse("d").unwrap(),
            ..FilterState::default()
        };

        let visible = apply_filters(&entries, None, &state);

        assert_eq!(names(&visible), vec!["docs"]);
    }

    #[test]
    fn stages_compose() {
        let tmp = TempDir::new().unwrap();
        let entries = create_test_entries(&tmp);
        let hidden = Regex::new(r"^\.").unwrap();
        let mut state = FilterState {
            inode: InodeFilter::parse("f").unwrap(),
            ..FilterState::default()
        };
        state.set_name_filter("a").unwrap();

        let visible = apply_filters(&entries, Some(&hidden), &state);

        assert_eq!(names(&visible), vec!["apple.rs", "banana.txt"]);
    }

    #[test]
    fn inode_filter_parse_rejects_unknown_flag() {
        assert!(InodeFilter::parse("fx").is_err());
        assert!(InodeFilter::parse("").unwrap() == InodeFilter::default());
    }

    #[test]
    fn filter_does_not_touch_input() {
        let entries = vec![Entry::file(CacheEntry::new(Path::new("/v/a").to_path_buf()))];
        let hidden = Regex::new("a").unwrap();

        let visible = apply_filters(&entries, Some(&hidden), &FilterState::default());

        assert!(visible.is_empty());
        assert_eq!(entries.len(), 1);
    }
}
