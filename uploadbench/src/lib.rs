//! A benchmark for object storage uploads.
//!
//! This builds on top of [`uploadbench_service`] and uploads a sequence of objects with
//! geometrically growing sizes, running many uploads concurrently. While the objects are uploaded,
//! the progress of every object is shown on its own terminal row. Afterwards, the transfer rate of
//! every object and the aggregate throughput of the run are printed.
//!
//! Two limits bound the load on the object store: at most `workers` objects are uploaded at the
//! same time, and every object larger than the multipart threshold is uploaded with at most
//! `part_concurrency` concurrent parts. In the worst case, `workers * part_concurrency` requests
//! are in flight at once.
#![warn(missing_debug_implementations)]

pub mod bench;
pub mod cli;
pub mod config;
pub mod metrics;
pub mod observability;
pub mod plot;
pub mod reporter;
pub mod scheduler;
pub mod sizes;
