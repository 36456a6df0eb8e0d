//! Storage backends the benchmark uploads to.

mod common;
mod in_memory;
mod s3;

pub use common::*;
pub use in_memory::InMemoryBackend;
pub use s3::{S3Backend, S3Config};
