//! In-memory backend for tests and dry runs.
//!
//! This provides a [`Backend`] that drains every payload and records the size of the stored
//! objects, but not their contents. Failures can be injected per object key or per part, an
//! artificial latency can be added to every request, and the backend counts how many requests are
//! in flight at the same time. The backend is [`Clone`] so tests can hold a handle for direct
//! inspection while the benchmark owns a shared copy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::TryStreamExt;

use super::common::{Backend, CompletedPart, PartSpec, UploadId};
use crate::error::{BackendError, BackendResult};
use crate::payload::Payload;
use crate::progress::ProgressFn;

#[derive(Debug, Default)]
struct Store {
    objects: HashMap<String, u64>,
    /// Parts of pending multipart uploads, keyed by upload and part number.
    uploads: HashMap<UploadId, (String, BTreeMap<u32, u64>)>,
}

#[derive(Debug, Default)]
struct Failures {
    keys: HashSet<String>,
    parts: HashSet<(String, u32)>,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
    requests: AtomicUsize,
    aborted: AtomicUsize,
    next_upload: AtomicU64,
}

/// Tracks one in-flight request, also when the request future is dropped.
struct ActiveGuard<'a>(&'a Counters);

impl<'a> ActiveGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let active = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak.fetch_max(active, Ordering::AcqRel);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A [`Backend`] keeping object sizes in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    latency: Duration,
    store: Arc<Mutex<Store>>,
    failures: Arc<Mutex<Failures>>,
    counters: Arc<Counters>,
}

impl InMemoryBackend {
    /// Creates an empty backend without latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every request by the given duration before its body is consumed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every request for the given object key fail.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failures.lock().unwrap().keys.insert(key.into());
    }

    /// Makes the upload of one part of the given object fail.
    pub fn fail_part(&self, key: impl Into<String>, part_number: u32) {
        self.failures
            .lock()
            .unwrap()
            .parts
            .insert((key.into(), part_number));
    }

    /// Returns the size of a committed object.
    pub fn object_size(&self, key: &str) -> Option<u64> {
        self.store.lock().unwrap().objects.get(key).copied()
    }

    /// Returns the number of committed objects.
    pub fn object_count(&self) -> usize {
        self.store.lock().unwrap().objects.len()
    }

    /// Returns the number of multipart uploads that were neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.store.lock().unwrap().uploads.len()
    }

    /// Returns the number of aborted multipart uploads.
    pub fn aborted_uploads(&self) -> usize {
        self.counters.aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of requests currently in flight.
    pub fn active_requests(&self) -> usize {
        self.counters.active.load(Ordering::Acquire)
    }

    /// Returns the highest number of requests that were in flight at the same time.
    pub fn peak_requests(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    /// Returns the total number of requests received.
    pub fn total_requests(&self) -> usize {
        self.counters.requests.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn check_key(&self, key: &str) -> BackendResult<()> {
        if self.failures.lock().unwrap().keys.contains(key) {
            return Err(BackendError::rejected(format!(
                "injected failure for object {key}"
            )));
        }
        Ok(())
    }

    async fn drain(payload: Payload, progress: ProgressFn) -> BackendResult<u64> {
        let len = payload
            .into_stream(progress)
            .try_fold(0u64, |len, chunk| async move { Ok(len + chunk.len() as u64) })
            .await?;
        Ok(len)
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn put_object(
        &self,
        key: &str,
        payload: Payload,
        progress: ProgressFn,
    ) -> BackendResult<()> {
        let _active = ActiveGuard::enter(&self.counters);
        self.delay().await;
        self.check_key(key)?;

        let len = Self::drain(payload, progress).await?;
        self.store
            .lock()
            .unwrap()
            .objects
            .insert(key.to_owned(), len);
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> BackendResult<UploadId> {
        let _active = ActiveGuard::enter(&self.counters);
        self.check_key(key)?;

        let id = self.counters.next_upload.fetch_add(1, Ordering::Relaxed);
        let upload_id = UploadId::new(format!("upload-{id}"));
        self.store
            .lock()
            .unwrap()
            .uploads
            .insert(upload_id.clone(), (key.to_owned(), BTreeMap::new()));
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part: PartSpec,
        payload: Payload,
        progress: ProgressFn,
    ) -> BackendResult<CompletedPart> {
        let _active = ActiveGuard::enter(&self.counters);
        self.delay().await;

        let injected = self
            .failures
            .lock()
            .unwrap()
            .parts
            .contains(&(key.to_owned(), part.number));
        if injected {
            return Err(BackendError::rejected(format!(
                "injected failure for part {} of object {key}",
                part.number
            )));
        }

        if !self.store.lock().unwrap().uploads.contains_key(upload_id) {
            return Err(BackendError::rejected(format!("no such upload: {upload_id}")));
        }

        let len = Self::drain(payload, progress).await?;

        let mut store = self.store.lock().unwrap();
        let (_, parts) = store
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::rejected(format!("upload {upload_id} was aborted")))?;
        parts.insert(part.number, len);

        Ok(CompletedPart {
            number: part.number,
            etag: Some(format!("\"{upload_id}-{}\"", part.number)),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> BackendResult<()> {
        let _active = ActiveGuard::enter(&self.counters);

        let mut store = self.store.lock().unwrap();
        let Some((upload_key, uploaded)) = store.uploads.get(upload_id) else {
            return Err(BackendError::rejected(format!("no such upload: {upload_id}")));
        };
        if upload_key != key {
            return Err(BackendError::rejected(format!(
                "upload {upload_id} belongs to {upload_key}, not {key}"
            )));
        }

        let mut size = 0;
        for (expected, part) in (1..).zip(&parts) {
            if part.number != expected {
                return Err(BackendError::rejected(format!(
                    "parts of {key} are not contiguous: expected part {expected}, got {}",
                    part.number
                )));
            }
            let Some(len) = uploaded.get(&part.number) else {
                return Err(BackendError::rejected(format!(
                    "part {} of {key} was never uploaded",
                    part.number
                )));
            };
            size += len;
        }

        store.uploads.remove(upload_id);
        store.objects.insert(key.to_owned(), size);
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &UploadId) -> BackendResult<()> {
        let _active = ActiveGuard::enter(&self.counters);

        self.store.lock().unwrap().uploads.remove(upload_id);
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn no_progress() -> ProgressFn {
        Arc::new(|_| {})
    }

    fn part(number: u32, len: u64) -> PartSpec {
        PartSpec {
            number,
            offset: u64::from(number - 1) * len,
            len,
        }
    }

    #[tokio::test]
    async fn put_records_size() {
        let backend = InMemoryBackend::new();
        backend
            .put_object("a", Payload::new(0, 1234), no_progress())
            .await
            .unwrap();

        assert_eq!(backend.object_size("a"), Some(1234));
        assert_eq!(backend.object_count(), 1);
        assert_eq!(backend.active_requests(), 0);
    }

    #[tokio::test]
    async fn injected_key_failure() {
        let backend = InMemoryBackend::new();
        backend.fail_key("broken");

        let result = backend
            .put_object("broken", Payload::new(0, 10), no_progress())
            .await;

        assert!(matches!(result, Err(BackendError::Rejected { .. })));
        assert_eq!(backend.object_size("broken"), None);
    }

    #[tokio::test]
    async fn multipart_roundtrip() {
        let backend = InMemoryBackend::new();
        let id = backend.create_multipart("big").await.unwrap();

        let mut parts = Vec::new();
        for number in [2, 1] {
            let spec = part(number, 100);
            parts.push(
                backend
                    .upload_part("big", &id, spec, Payload::new(0, 100), no_progress())
                    .await
                    .unwrap(),
            );
        }

        // Not visible before completion.
        assert_eq!(backend.object_size("big"), None);

        parts.sort_by_key(|p| p.number);
        backend.complete_multipart("big", &id, parts).await.unwrap();

        assert_eq!(backend.object_size("big"), Some(200));
        assert_eq!(backend.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn complete_rejects_gaps() {
        let backend = InMemoryBackend::new();
        let id = backend.create_multipart("big").await.unwrap();
        let completed = backend
            .upload_part("big", &id, part(2, 10), Payload::new(0, 10), no_progress())
            .await
            .unwrap();

        let result = backend.complete_multipart("big", &id, vec![completed]).await;
        assert!(result.is_err());
        assert_eq!(backend.object_size("big"), None);
    }

    #[tokio::test]
    async fn abort_discards_parts() {
        let backend = InMemoryBackend::new();
        backend.fail_part("big", 2);

        let id = backend.create_multipart("big").await.unwrap();
        backend
            .upload_part("big", &id, part(1, 10), Payload::new(0, 10), no_progress())
            .await
            .unwrap();
        let failed = backend
            .upload_part("big", &id, part(2, 10), Payload::new(0, 10), no_progress())
            .await;
        assert!(failed.is_err());

        backend.abort_multipart("big", &id).await.unwrap();
        assert_eq!(backend.pending_uploads(), 0);
        assert_eq!(backend.aborted_uploads(), 1);
        assert_eq!(backend.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_concurrent_requests() {
        let backend = InMemoryBackend::new().with_latency(Duration::from_millis(100));

        let puts = (0..4).map(|i| {
            let backend = backend.clone();
            async move {
                backend
                    .put_object(&format!("obj-{i}"), Payload::new(i, 10), no_progress())
                    .await
            }
        });
        futures::future::try_join_all(puts).await.unwrap();

        assert_eq!(backend.peak_requests(), 4);
        assert_eq!(backend.active_requests(), 0);
        assert_eq!(backend.total_requests(), 4);
    }
}
