use std::fmt;

use rusoto_core::{ByteStream, HttpClient, Region};
use rusoto_credential::{DefaultCredentialsProvider, ProfileProvider};
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CreateMultipartUploadRequest, PutObjectRequest, S3, S3Client, UploadPartRequest,
};

use super::common::{Backend, CompletedPart, PartSpec, UploadId};
use crate::error::{BackendError, BackendResult};
use crate::payload::Payload;
use crate::progress::ProgressFn;

/// Settings for an [`S3Backend`].
#[derive(Clone, Debug, Default)]
pub struct S3Config {
    /// The bucket objects are uploaded to. It must exist.
    pub bucket: String,
    /// The region of the bucket, e.g. `us-east-1`.
    pub region: String,
    /// Endpoint of an S3-compatible service. Uses AWS when not set.
    pub endpoint: Option<String>,
    /// Named profile in the shared credentials file. Uses the default provider chain when not set.
    pub profile: Option<String>,
}

/// Amazon S3 or any S3-compatible object store.
pub struct S3Backend {
    client: S3Client,
    bucket: String,
    region: Region,
}

impl S3Backend {
    /// Creates a new backend bound to the configured bucket.
    pub fn new(config: &S3Config) -> BackendResult<Self> {
        if config.bucket.is_empty() {
            return Err(BackendError::Configuration("bucket name is empty".into()));
        }

        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                name: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config.region.parse().map_err(|_| {
                BackendError::Configuration(format!("unknown region `{}`", config.region))
            })?,
        };

        let dispatcher =
            HttpClient::new().map_err(BackendError::request("failed to create HTTP client"))?;

        let client = match &config.profile {
            Some(profile) => {
                let mut provider = ProfileProvider::new()
                    .map_err(BackendError::request("failed to load credentials profile"))?;
                provider.set_profile(profile.as_str());
                S3Client::new_with(dispatcher, provider, region.clone())
            }
            None => {
                let provider = DefaultCredentialsProvider::new()
                    .map_err(BackendError::request("failed to set up credentials"))?;
                S3Client::new_with(dispatcher, provider, region.clone())
            }
        };

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region,
        })
    }

    fn body(payload: Payload, progress: ProgressFn) -> (ByteStream, i64) {
        let len = payload.len();
        let stream = ByteStream::new_with_size(payload.into_stream(progress), len as usize);
        (stream, len as i64)
    }
}

impl fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[tracing::instrument(level = "trace", skip_all, fields(%key))]
    async fn put_object(
        &self,
        key: &str,
        payload: Payload,
        progress: ProgressFn,
    ) -> BackendResult<()> {
        tracing::trace!("Putting object to s3 backend");
        let (body, len) = Self::body(payload, progress);

        self.client
            .put_object(PutObjectRequest {
                bucket: self.bucket.clone(),
                key: key.to_owned(),
                body: Some(body),
                content_length: Some(len),
                ..Default::default()
            })
            .await
            .map_err(BackendError::request(format!("failed to put object {key}")))?;

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all, fields(%key))]
    async fn create_multipart(&self, key: &str) -> BackendResult<UploadId> {
        let output = self
            .client
            .create_multipart_upload(CreateMultipartUploadRequest {
                bucket: self.bucket.clone(),
                key: key.to_owned(),
                ..Default::default()
            })
            .await
            .map_err(BackendError::request(format!(
                "failed to start multipart upload of {key}"
            )))?;

        let upload_id = output.upload_id.ok_or_else(|| {
            BackendError::rejected(format!("no upload id returned for {key}"))
        })?;
        tracing::trace!(%upload_id, "Started multipart upload");

        Ok(UploadId::new(upload_id))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(%key, part = part.number))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part: PartSpec,
        payload: Payload,
        progress: ProgressFn,
    ) -> BackendResult<CompletedPart> {
        let (body, len) = Self::body(payload, progress);

        let output = self
            .client
            .upload_part(UploadPartRequest {
                bucket: self.bucket.clone(),
                key: key.to_owned(),
                upload_id: upload_id.as_str().to_owned(),
                part_number: i64::from(part.number),
                body: Some(body),
                content_length: Some(len),
                ..Default::default()
            })
            .await
            .map_err(BackendError::request(format!(
                "failed to upload part {} of {key}",
                part.number
            )))?;

        Ok(CompletedPart {
            number: part.number,
            etag: output.e_tag,
        })
    }

    #[tracing::instrument(level = "trace", skip_all, fields(%key))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> BackendResult<()> {
        let parts = parts
            .into_iter()
            .map(|part| rusoto_s3::CompletedPart {
                e_tag: part.etag,
                part_number: Some(i64::from(part.number)),
                ..Default::default()
            })
            .collect();

        self.client
            .complete_multipart_upload(CompleteMultipartUploadRequest {
                bucket: self.bucket.clone(),
                key: key.to_owned(),
                upload_id: upload_id.as_str().to_owned(),
                multipart_upload: Some(CompletedMultipartUpload {
                    parts: Some(parts),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .map_err(BackendError::request(format!(
                "failed to complete multipart upload of {key}"
            )))?;

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all, fields(%key))]
    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> BackendResult<()> {
        self.client
            .abort_multipart_upload(AbortMultipartUploadRequest {
                bucket: self.bucket.clone(),
                key: key.to_owned(),
                upload_id: upload_id.as_str().to_owned(),
                ..Default::default()
            })
            .await
            .map_err(BackendError::request(format!(
                "failed to abort multipart upload of {key}"
            )))?;

        Ok(())
    }
}
