//! The storage-facing half of the upload benchmark.
//!
//! This crate knows how to move a single object into an object store: it defines the [`Backend`]
//! contract the benchmark talks to, generates object payloads on the fly, and provides the
//! [`TransferEngine`] which uploads one object either with a single request or as a multipart
//! upload with bounded part concurrency.
//!
//! Scheduling many objects, rendering progress and aggregating statistics is left to the
//! `uploadbench` crate, which builds on top of this one.
//!
//! [`Backend`]: backend::Backend
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod concurrency;
pub mod error;
pub mod payload;
pub mod progress;
pub mod task;
pub mod transfer;

pub use crate::error::{BackendError, BackendResult, TransferError};
pub use crate::task::{Outcome, UploadResult, UploadTask};
pub use crate::transfer::{TransferConfig, TransferEngine};

/// Number of bytes in one mebibyte.
pub const MIB: u64 = 1024 * 1024;
