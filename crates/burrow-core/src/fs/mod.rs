//! File system abstractions for burrow.
//!
//! This module provides the cached entry types ([`entry::CacheEntry`],
//! [`directory::DirectoryEntry`]) and the block-wise copy primitives used by
//! background tasks ([`ops`]).

pub mod directory;
pub mod entry;
pub mod ops;
