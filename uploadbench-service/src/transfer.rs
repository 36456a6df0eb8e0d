//! Uploading a single object.
//!
//! [`TransferEngine::upload`] sends objects up to the multipart threshold with a single request.
//! Larger objects are split into parts by [`plan_parts`], and up to `part_concurrency` parts are
//! uploaded at the same time. Together with the bound on concurrent tasks in the scheduler this
//! gives a worst case of `workers × part_concurrency` requests in flight.
//!
//! A transfer either commits the whole object or nothing: if any part fails, the multipart upload
//! is aborted on the backend. Failed transfers are not retried.

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::MIB;
use crate::backend::{PartSpec, SharedBackend, UploadId};
use crate::error::{TransferError, error_chain};
use crate::payload::Payload;
use crate::progress::{ProgressSink, TaskProgress};
use crate::task::{UploadResult, UploadTask};

/// Objects larger than this are uploaded in parts.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16 * MIB;
/// Size of each part, except for the last one.
pub const DEFAULT_PART_SIZE: u64 = 8 * MIB;
/// Number of parts of one object uploaded concurrently.
pub const DEFAULT_PART_CONCURRENCY: usize = 5;
/// The maximum number of parts of one multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// Tuning of a single object transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    /// Objects larger than this many bytes are uploaded in parts.
    pub multipart_threshold: u64,
    /// The maximum size of a part in bytes.
    ///
    /// This grows for objects that would otherwise need more than [`MAX_PARTS`] parts.
    pub part_size: u64,
    /// Number of parts of one object uploaded concurrently.
    pub part_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
        }
    }
}

/// Splits an object of `size` bytes into contiguous parts.
///
/// All parts are `part_size` bytes long except for the last one, which holds the remainder. An
/// empty object has no parts.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartSpec> {
    if size == 0 {
        return Vec::new();
    }

    let part_size = part_size.max(size.div_ceil(MAX_PARTS)).max(1);
    let count = size.div_ceil(part_size);

    (0..count)
        .map(|i| {
            let offset = i * part_size;
            PartSpec {
                number: (i + 1) as u32,
                offset,
                len: part_size.min(size - offset),
            }
        })
        .collect()
}

/// Uploads single objects to a backend.
#[derive(Debug)]
pub struct TransferEngine {
    backend: SharedBackend,
    config: TransferConfig,
    sink: Arc<dyn ProgressSink>,
}

impl TransferEngine {
    /// Creates an engine uploading to `backend`, reporting progress to `sink`.
    pub fn new(backend: SharedBackend, config: TransferConfig, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            backend,
            config,
            sink,
        }
    }

    /// Uploads the object described by `task`.
    ///
    /// This never fails: errors and cancellation are captured in the returned result. The
    /// duration covers the time from the first request until the backend confirmed the object.
    #[tracing::instrument(level = "debug", skip_all, fields(key = task.key(), size = task.size()))]
    pub async fn upload(&self, task: &UploadTask, cancel: &CancellationToken) -> UploadResult {
        let progress = TaskProgress::new(task, Arc::clone(&self.sink));
        progress.publish();

        let start = Instant::now();
        let result = if task.size() <= self.config.multipart_threshold {
            self.put_single(task, &progress, cancel).await
        } else {
            self.put_multipart(task, &progress, cancel).await
        };
        let duration = start.elapsed();

        match result {
            Ok(()) => {
                progress.complete();
                tracing::debug!(?duration, "Upload complete");
                UploadResult::success(task, duration)
            }
            Err(error) => {
                let reason = error_chain(&error);
                tracing::debug!(?duration, reason, "Upload failed");
                UploadResult::failure(task, duration, reason)
            }
        }
    }

    async fn put_single(
        &self,
        task: &UploadTask,
        progress: &Arc<TaskProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let payload = Payload::new(task.index() as u64, task.size());
        let put = self
            .backend
            .put_object(task.key(), payload, progress.tracker());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = put => Ok(result?),
        }
    }

    async fn put_multipart(
        &self,
        task: &UploadTask,
        progress: &Arc<TaskProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let key = task.key();
        let upload_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            result = self.backend.create_multipart(key) => result?,
        };

        let result = self.upload_parts(task, &upload_id, progress, cancel).await;
        if let Err(error) = &result {
            tracing::debug!(%upload_id, error = error as &dyn std::error::Error, "Aborting multipart upload");
            if let Err(abort_error) = self.backend.abort_multipart(key, &upload_id).await {
                tracing::warn!(
                    key,
                    %upload_id,
                    error = &abort_error as &dyn std::error::Error,
                    "Failed to abort multipart upload"
                );
            }
        }

        result
    }

    async fn upload_parts(
        &self,
        task: &UploadTask,
        upload_id: &UploadId,
        progress: &Arc<TaskProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let key = task.key();
        let seed = task.index() as u64;
        let parts = plan_parts(task.size(), self.config.part_size);
        tracing::debug!(parts = parts.len(), "Uploading parts");

        let backend = &self.backend;
        let uploads = stream::iter(parts)
            .map(move |part| {
                let payload = Payload::for_part(seed, part.number, part.len);
                backend.upload_part(key, upload_id, part, payload, progress.tracker())
            })
            .buffer_unordered(self.config.part_concurrency.max(1))
            .try_collect::<Vec<_>>();

        let mut completed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            result = uploads => result?,
        };

        completed.sort_by_key(|part| part.number);
        self.backend
            .complete_multipart(key, upload_id, completed)
            .await?;

        Ok(())
    }
}
