//! Test utilities for the upload benchmark.
//!
//! This crate is a dev-dependency of the other workspace crates. See the modules for all
//! available utilities.

pub mod tracing;
