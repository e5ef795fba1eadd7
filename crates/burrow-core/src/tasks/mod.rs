//! Concrete background tasks.
//!
//! Directory scans live next to the directory they fill
//! ([`crate::fs::directory::ScanTask`]); this module holds the rest.

#[cfg(unix)]
pub mod command;
pub mod copy;
