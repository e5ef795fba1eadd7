//! Configuration management for burrow.
//!
//! Browsing, scheduling and cache preferences ([`settings::Config`]) are
//! stored as a TOML file and loaded at startup.

pub mod settings;
