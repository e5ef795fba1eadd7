//! Ordering of directory children.
//!
//! Sorting runs as a pipeline: order by the active [`SortKey`], reverse if
//! requested, then (optionally) a stable pass that moves directories ahead
//! of everything else.

use std::cmp::Reverse;
use std::time::SystemTime;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::config::settings::BrowseConfig;
use crate::fs::entry::{CacheEntry, Entry};

/// The attribute children are ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// Digit-aware name order: `a2` before `a10`.
    #[default]
    Natural,
    /// Plain name order.
    Basename,
    /// Largest first.
    Size,
    /// Newest modification first.
    Mtime,
    /// Newest status change first.
    Ctime,
    /// Most recently accessed first.
    Atime,
    /// Grouped by mime type.
    Type,
    /// Grouped by extension.
    Extension,
    /// Shuffled.
    Random,
}

/// A run of digits compared by numeric value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Number {
    len: usize,
    digits: String,
}

impl Number {
    fn parse(digits: &str) -> Self {
        let trimmed = digits.trim_start_matches('0');
        Self {
            len: trimmed.len(),
            digits: trimmed.to_string(),
        }
    }
}

/// One character followed by the number written right after it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NaturalChunk {
    lead: Option<char>,
    number: Number,
}

/// Sort key that compares embedded numbers by value.
///
/// The name is split into (character, following number) pairs, where a
/// missing number counts as zero, so `a.txt` < `a2.txt` < `a10.txt`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NaturalKey(Vec<NaturalChunk>);

/// Builds the [`NaturalKey`] for `name`.
pub fn natural_key(name: &str) -> NaturalKey {
    let mut chunks = Vec::new();
    let mut chars = name.chars().peekable();
    let mut lead: Option<char> = None;

    loop {
        let mut digits = String::new();
        while let Some(&c) = chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            chars.next();
        }
        if lead.is_some() || !digits.is_empty() {
            chunks.push(NaturalChunk {
                lead,
                number: Number::parse(&digits),
            });
        }
        match chars.next() {
            Some(c) => lead = Some(c),
            None => break,
        }
    }

    NaturalKey(chunks)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Text(String),
    Natural(NaturalKey),
    Size(Reverse<u64>),
    Time(Reverse<Option<SystemTime>>),
    Changed(Reverse<Option<(i64, i64)>>),
}

fn name_for_sort(meta: &CacheEntry, browse: &BrowseConfig) -> String {
    let name = if browse.sort_case_insensitive {
        meta.basename_lower()
    } else {
        meta.basename()
    };
    if browse.sort_unicode {
        name.nfkd().collect()
    } else {
        name.to_string()
    }
}

fn sort_value(entry: &Entry, browse: &BrowseConfig) -> SortValue {
    let meta = entry.meta();
    match browse.sort {
        SortKey::Natural if browse.sort_unicode => {
            SortValue::Natural(natural_key(&name_for_sort(&meta, browse)))
        }
        SortKey::Natural => SortValue::Natural(meta.natural_key(browse.sort_case_insensitive)),
        SortKey::Basename | SortKey::Random => SortValue::Text(name_for_sort(&meta, browse)),
        SortKey::Size => SortValue::Size(Reverse(entry.size())),
        SortKey::Mtime => SortValue::Time(Reverse(meta.modified())),
        SortKey::Atime => SortValue::Time(Reverse(meta.accessed())),
        SortKey::Ctime => SortValue::Changed(Reverse(meta.changed())),
        SortKey::Type => SortValue::Text(meta.mimetype().unwrap_or_default()),
        SortKey::Extension => SortValue::Text(meta.extension().unwrap_or_default().to_string()),
    }
}

/// Sorts `entries` in place according to `browse`.
pub fn sort_entries(entries: &mut [Entry], browse: &BrowseConfig) {
    if browse.sort == SortKey::Random {
        entries.shuffle(&mut rand::rng());
    } else {
        entries.sort_by_cached_key(|e| sort_value(e, browse));
    }

    if browse.sort_reverse {
        entries.reverse();
    }

    if browse.sort_directories_first {
        entries.sort_by_key(|e| !e.is_directory());
    }
}
