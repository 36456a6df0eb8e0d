//! Uploads objects of growing size to an object store and reports the transfer rates.
//!
//! See [`uploadbench::config`] for all options.

use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    uploadbench::cli::execute()
}
