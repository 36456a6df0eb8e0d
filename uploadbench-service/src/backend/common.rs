use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::error::BackendResult;
use crate::payload::Payload;
use crate::progress::ProgressFn;

/// A shared, type-erased [`Backend`] instance.
pub type SharedBackend = Arc<dyn Backend>;

/// Identifier of a multipart upload, assigned by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UploadId(String);

impl UploadId {
    /// Wraps a backend-assigned upload identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location of one part within an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSpec {
    /// The 1-based part number.
    pub number: u32,
    /// Byte offset of the part within the object.
    pub offset: u64,
    /// Length of the part in bytes.
    pub len: u64,
}

/// A part acknowledged by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// The 1-based part number.
    pub number: u32,
    /// The entity tag the backend returned for the part, if any.
    pub etag: Option<String>,
}

/// The contract between the benchmark and an object store.
///
/// All request bodies are given as a [`Payload`]. Implementations must call the accompanying
/// [`ProgressFn`] repeatedly with the cumulative number of bytes of the body sent so far.
///
/// A multipart upload is started with [`create_multipart`](Self::create_multipart), filled with
/// [`upload_part`](Self::upload_part) (possibly concurrently) and committed with
/// [`complete_multipart`](Self::complete_multipart). Until it is completed, no object is visible
/// under the key; [`abort_multipart`](Self::abort_multipart) discards the uploaded parts.
#[async_trait::async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Stores an object at the given key with a single request.
    async fn put_object(&self, key: &str, payload: Payload, progress: ProgressFn)
    -> BackendResult<()>;

    /// Starts a multipart upload for the given key.
    async fn create_multipart(&self, key: &str) -> BackendResult<UploadId>;

    /// Uploads one part of a multipart upload.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part: PartSpec,
        payload: Payload,
        progress: ProgressFn,
    ) -> BackendResult<CompletedPart>;

    /// Commits a multipart upload from its parts, given in ascending part order.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> BackendResult<()>;

    /// Discards a multipart upload and all of its uploaded parts.
    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> BackendResult<()>;
}
