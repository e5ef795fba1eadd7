//! Navigation logic for burrow.
//!
//! This module contains the filter pipeline ([`filter`]), the sort
//! comparators ([`sort`]) and open views with their history ([`tab::Tab`]).

pub mod filter;
pub mod sort;
pub mod tab;
