//! Planned uploads and their results.

use std::fmt;
use std::time::Duration;

/// One object to upload.
///
/// Tasks are immutable once created. The index is unique within a benchmark run and doubles as
/// the payload seed and the display row of the task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadTask {
    index: usize,
    key: String,
    size: u64,
}

impl UploadTask {
    /// Creates a new task for the object `key` of `size` bytes.
    pub fn new(index: usize, key: impl Into<String>, size: u64) -> Self {
        Self {
            index,
            key: key.into(),
            size,
        }
    }

    /// The position of this task in submission order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The key of the object in the bucket.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The planned size of the object in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Terminal state of an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The object was fully committed by the backend.
    Success,
    /// The upload did not complete. No partial object is considered committed.
    Failure(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failure(reason) => write!(f, "failure: {reason}"),
        }
    }
}

/// The result of exactly one [`UploadTask`].
#[derive(Clone, Debug, PartialEq)]
pub struct UploadResult {
    /// Index of the task this result belongs to.
    pub index: usize,
    /// Key of the uploaded object.
    pub key: String,
    /// Size of the object in bytes.
    pub size: u64,
    /// Wall-clock time spent on the transfer.
    pub duration: Duration,
    /// Whether the object was committed.
    pub outcome: Outcome,
}

impl UploadResult {
    /// Creates a successful result for `task`.
    pub fn success(task: &UploadTask, duration: Duration) -> Self {
        Self::new(task, duration, Outcome::Success)
    }

    /// Creates a failed result for `task`.
    pub fn failure(task: &UploadTask, duration: Duration, reason: impl Into<String>) -> Self {
        Self::new(task, duration, Outcome::Failure(reason.into()))
    }

    fn new(task: &UploadTask, duration: Duration, outcome: Outcome) -> Self {
        Self {
            index: task.index,
            key: task.key.clone(),
            size: task.size,
            duration,
            outcome,
        }
    }

    /// Returns `true` if the object was committed.
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
