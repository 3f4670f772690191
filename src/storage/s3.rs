use std::{fmt, time::Duration};

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{http::HttpResponse, Builder as S3ConfigBuilder, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream as S3Body,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart, Delete, ObjectIdentifier},
    Client,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use super::{
    encode_key, key_segments, ByteStream, CompletedPart, MultipartUpload, ProviderInfo,
    StorageBackend, StorageStats, UploadedPart,
};
use crate::{
    config::{BackendDescriptor, ProviderKind},
    error::{ConfigError, StorageError},
};

/// Streams up to this size are sent with a single `PutObject`.
pub const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;
/// Part size used when `upload_stream` switches to a multipart upload.
pub const STREAM_PART_SIZE: usize = 8 * 1024 * 1024;
const DELETE_BATCH: usize = 1000;
const DEFAULT_REGION: &str = "us-east-1";

fn sdk_part_number(upload_id: &str, part_number: u32) -> Result<i32, StorageError> {
    i32::try_from(part_number)
        .ok()
        .filter(|number| *number >= 1)
        .ok_or_else(|| StorageError::InvalidPartNumber {
            upload_id: upload_id.to_owned(),
            part_number,
        })
}

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// Backend name reported in errors.
    pub name: String,
    /// Bucket holding the objects.
    pub bucket: String,
    /// Signing region.
    pub region: String,
    /// Custom endpoint, for non-AWS providers.
    pub endpoint: Option<String>,
    /// Prefix prepended to every key.
    pub prefix: Option<String>,
    /// Use `endpoint/bucket/key` addressing instead of virtual hosts.
    pub force_path_style: bool,
    /// Largest object accepted through presigned uploads.
    pub max_file_size: Option<u64>,
}

impl S3Settings {
    /// Extracts settings from an object-store descriptor.
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            bucket: descriptor.bucket.clone().unwrap_or_default(),
            region: descriptor
                .region
                .clone()
                .unwrap_or_else(|| DEFAULT_REGION.to_owned()),
            endpoint: descriptor
                .endpoint
                .as_ref()
                .map(|endpoint| endpoint.trim_end_matches('/').to_owned()),
            prefix: descriptor
                .setting("prefix")
                .map(|prefix| prefix.trim_matches('/').to_owned())
                .filter(|prefix| !prefix.is_empty()),
            force_path_style: descriptor.flag("force_path_style"),
            max_file_size: descriptor.max_file_size,
        }
    }

    /// Builds a client configuration with static credentials.
    pub fn client_config(&self, access_key: &str, secret_key: &str) -> aws_sdk_s3::Config {
        let credentials = Credentials::new(access_key, secret_key, None, None, "stowage-static");
        let mut builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(self.force_path_style);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder.build()
    }
}

/// Storage backend for any S3-compatible object store.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    settings: S3Settings,
}

impl fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Storage")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    /// Wraps an existing client.
    pub fn from_client(client: Client, settings: S3Settings) -> Self {
        Self { client, settings }
    }

    /// Connects using the descriptor's static credentials, or the default AWS
    /// credential chain when none are configured.
    pub async fn connect(descriptor: &BackendDescriptor) -> Result<Self, ConfigError> {
        descriptor.validate()?;
        let settings = S3Settings::from_descriptor(descriptor);

        let config = match (&descriptor.access_key, &descriptor.secret_key) {
            (Some(access_key), Some(secret_key)) => settings.client_config(access_key, secret_key),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(settings.region.clone()))
                    .load()
                    .await;
                let mut builder = S3ConfigBuilder::from(&shared).force_path_style(settings.force_path_style);
                if let Some(endpoint) = &settings.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }
                builder.build()
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            backend = settings.name.as_str(),
            bucket = settings.bucket.as_str(),
            region = settings.region.as_str(),
            endpoint = settings.endpoint.as_deref().unwrap_or("<aws>"),
            "s3 storage: client configured"
        );

        Ok(Self::from_client(Client::from_conf(config), settings))
    }

    /// Returns the connection settings.
    pub fn settings(&self) -> &S3Settings {
        &self.settings
    }

    /// Returns the object URL without CDN rewriting.
    pub fn direct_url(&self, key: &str) -> String {
        let object = encode_key(&self.object_key(key));
        match &self.settings.endpoint {
            Some(endpoint) => format!("{endpoint}/{}/{object}", self.settings.bucket),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{object}",
                self.settings.bucket, self.settings.region
            ),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.settings.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_owned(),
        }
    }

    fn checked_key(&self, key: &str) -> Result<String, StorageError> {
        key_segments(key)?;
        Ok(self.object_key(key))
    }

    fn sdk_error<E>(&self, key: &str, err: SdkError<E, HttpResponse>) -> StorageError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let status = err.raw_response().map(|response| response.status().as_u16());
        let code = err
            .as_service_error()
            .and_then(ProvideErrorMetadata::code)
            .map(ToOwned::to_owned);

        match (code.as_deref(), status) {
            (Some("NoSuchKey" | "NotFound"), _) | (None, Some(404)) => StorageError::not_found(key),
            (Some("NoSuchUpload"), _) => StorageError::UploadNotFound {
                upload_id: key.to_owned(),
            },
            (Some(code @ ("InvalidPart" | "InvalidPartOrder")), _) => {
                StorageError::conflict(key, format!("{code}: {}", DisplayErrorContext(&err)))
            }
            (code, status) => StorageError::provider(
                &self.settings.name,
                code.map(ToOwned::to_owned)
                    .or_else(|| status.map(|status| format!("Http{status}")))
                    .unwrap_or_else(|| "Unknown".to_owned()),
                key,
                DisplayErrorContext(&err).to_string(),
            ),
        }
    }

    fn presigning(&self, key: &str, ttl: Duration) -> Result<PresigningConfig, StorageError> {
        PresigningConfig::expires_in(ttl).map_err(|err| {
            StorageError::provider(&self.settings.name, "InvalidPresignTtl", key, err.to_string())
        })
    }

    async fn put_buffered(&self, key: &str, object_key: &str, body: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(object_key)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|err| self.sdk_error(key, err))?;
        Ok(())
    }

    /// Streams a large body as an internal multipart upload.
    async fn put_multipart(
        &self,
        key: &str,
        mut stream: ByteStream<'_>,
        size: u64,
    ) -> Result<(), StorageError> {
        let upload = self.initiate_multipart(key).await?;

        let result = async {
            let mut parts = Vec::new();
            let mut buffer = BytesMut::with_capacity(STREAM_PART_SIZE);
            let mut received = 0u64;

            loop {
                let next = stream.next().await.transpose()?;
                let finished = next.is_none();
                if let Some(chunk) = next {
                    received += chunk.len() as u64;
                    if received > size {
                        return Err(StorageError::SizeMismatch {
                            key: key.to_owned(),
                            expected: size,
                            actual: received,
                        });
                    }
                    buffer.extend_from_slice(&chunk);
                }

                while buffer.len() >= STREAM_PART_SIZE || (finished && !buffer.is_empty()) {
                    let take = buffer.len().min(STREAM_PART_SIZE);
                    let body = buffer.split_to(take).freeze();
                    let number = u32::try_from(parts.len() + 1).unwrap_or(u32::MAX);
                    let part = self.upload_part(&upload.upload_id, key, number, body).await?;
                    parts.push(CompletedPart::from(&part));
                }

                if finished {
                    break;
                }
            }

            if received != size {
                return Err(StorageError::SizeMismatch {
                    key: key.to_owned(),
                    expected: size,
                    actual: received,
                });
            }
            self.complete_multipart(&upload.upload_id, key, &parts).await
        }
        .await;

        if result.is_err() {
            if let Err(_err) = self.abort_multipart(&upload.upload_id, key).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    key,
                    upload_id = upload.upload_id.as_str(),
                    error = %_err,
                    "s3 storage: failed to abort streamed multipart upload"
                );
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl StorageBackend for S3Storage {
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let object_key = self.checked_key(key)?;
        self.put_buffered(key, &object_key, data).await
    }

    async fn upload_stream(
        &self,
        key: &str,
        mut stream: ByteStream<'_>,
        size: u64,
    ) -> Result<(), StorageError> {
        let object_key = self.checked_key(key)?;
        if size > MULTIPART_THRESHOLD {
            return self.put_multipart(key, stream, size).await;
        }

        let mut buffer = BytesMut::with_capacity(size as usize);
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            if buffer.len() as u64 > size {
                break;
            }
        }
        if buffer.len() as u64 != size {
            return Err(StorageError::SizeMismatch {
                key: key.to_owned(),
                expected: size,
                actual: buffer.len() as u64,
            });
        }
        self.put_buffered(key, &object_key, buffer.freeze()).await
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let object_key = self.checked_key(key)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| self.sdk_error(key, err))?;

        let data = response.body.collect().await.map_err(|err| {
            StorageError::provider(&self.settings.name, "BodyRead", key, err.to_string())
        })?;
        Ok(data.into_bytes())
    }

    async fn download_stream(&self, key: &str) -> Result<ByteStream<'static>, StorageError> {
        let object_key = self.checked_key(key)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| self.sdk_error(key, err))?;

        let provider = self.settings.name.clone();
        let key = key.to_owned();
        Ok(Box::pin(
            ReaderStream::new(response.body.into_async_read()).map(move |chunk| {
                chunk.map_err(|err| StorageError::from_io(&provider, &key, err))
            }),
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let object_key = self.checked_key(key)?;
        match self
            .client
            .delete_object()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match self.sdk_error(key, err) {
                StorageError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.size(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let object_key = self.checked_key(key)?;
        let head = self
            .client
            .head_object()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| self.sdk_error(key, err))?;
        Ok(head.content_length().unwrap_or(0).max(0) as u64)
    }

    async fn url(&self, key: &str) -> Result<String, StorageError> {
        key_segments(key)?;
        Ok(self.direct_url(key))
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let object_key = self.checked_key(key)?;
        let request = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .presigned(self.presigning(key, ttl)?)
            .await
            .map_err(|err| self.sdk_error(key, err))?;
        Ok(request.uri().to_string())
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        ttl: Duration,
        max_size: u64,
    ) -> Result<String, StorageError> {
        if let Some(limit) = self.settings.max_file_size {
            if max_size > limit {
                return Err(StorageError::provider(
                    &self.settings.name,
                    "EntityTooLarge",
                    key,
                    format!("requested {max_size} bytes, backend accepts at most {limit}"),
                ));
            }
        }

        let object_key = self.checked_key(key)?;
        let request = self
            .client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .presigned(self.presigning(key, ttl)?)
            .await
            .map_err(|err| self.sdk_error(key, err))?;
        Ok(request.uri().to_string())
    }

    async fn initiate_multipart(&self, key: &str) -> Result<MultipartUpload, StorageError> {
        let object_key = self.checked_key(key)?;
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| self.sdk_error(key, err))?;

        let upload_id = response.upload_id().ok_or_else(|| {
            StorageError::provider(
                &self.settings.name,
                "MissingUploadId",
                key,
                "CreateMultipartUpload returned no upload id",
            )
        })?;

        Ok(MultipartUpload {
            upload_id: upload_id.to_owned(),
            key: key.to_owned(),
            provider: self.settings.name.clone(),
        })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<UploadedPart, StorageError> {
        let object_key = self.checked_key(key)?;
        let number = sdk_part_number(upload_id, part_number)?;
        let size = data.len() as u64;

        let response = self
            .client
            .upload_part()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .upload_id(upload_id)
            .part_number(number)
            .body(S3Body::from(data))
            .send()
            .await
            .map_err(|err| match self.sdk_error(key, err) {
                StorageError::UploadNotFound { .. } => StorageError::UploadNotFound {
                    upload_id: upload_id.to_owned(),
                },
                other => other,
            })?;

        Ok(UploadedPart {
            part_number,
            etag: response.e_tag().unwrap_or_default().to_owned(),
            size,
        })
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let object_key = self.checked_key(key)?;
        if parts.is_empty() {
            return Err(StorageError::conflict(upload_id, "manifest lists no parts"));
        }

        let mut manifest = parts.to_vec();
        manifest.sort_by_key(|part| part.part_number);
        if let Some(pair) = manifest
            .windows(2)
            .find(|pair| pair[0].part_number == pair[1].part_number)
        {
            return Err(StorageError::conflict(
                upload_id,
                format!("part {} listed more than once", pair[0].part_number),
            ));
        }

        let mut completed = Vec::with_capacity(manifest.len());
        for part in &manifest {
            completed.push(
                S3CompletedPart::builder()
                    .part_number(sdk_part_number(upload_id, part.part_number)?)
                    .e_tag(&part.etag)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| match self.sdk_error(key, err) {
                StorageError::UploadNotFound { .. } => StorageError::UploadNotFound {
                    upload_id: upload_id.to_owned(),
                },
                StorageError::Conflict { reason, .. } => StorageError::conflict(upload_id, reason),
                other => other,
            })?;
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str, key: &str) -> Result<(), StorageError> {
        let object_key = self.checked_key(key)?;
        self.client
            .abort_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(&object_key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| match self.sdk_error(key, err) {
                StorageError::UploadNotFound { .. } => StorageError::UploadNotFound {
                    upload_id: upload_id.to_owned(),
                },
                other => other,
            })?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for batch in keys.chunks(DELETE_BATCH) {
            let mut objects = Vec::with_capacity(batch.len());
            for key in batch {
                let object_key = self.checked_key(key)?;
                objects.push(ObjectIdentifier::builder().key(object_key).build().map_err(|err| {
                    StorageError::provider(&self.settings.name, "InvalidRequest", key, err.to_string())
                })?);
            }
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|err| {
                    StorageError::provider(&self.settings.name, "InvalidRequest", "", err.to_string())
                })?;

            let response = self
                .client
                .delete_objects()
                .bucket(&self.settings.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| self.sdk_error(&batch[0], err))?;

            if let Some(failure) = response
                .errors()
                .iter()
                .find(|failure| failure.code() != Some("NoSuchKey"))
            {
                return Err(StorageError::provider(
                    &self.settings.name,
                    failure.code().unwrap_or("Unknown"),
                    failure.key().unwrap_or_default(),
                    failure.message().unwrap_or_default(),
                ));
            }
        }
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let source = self.checked_key(src)?;
        let target = self.checked_key(dst)?;
        self.client
            .copy_object()
            .bucket(&self.settings.bucket)
            .key(&target)
            .copy_source(format!("{}/{}", self.settings.bucket, encode_key(&source)))
            .send()
            .await
            .map_err(|err| self.sdk_error(src, err))?;
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        self.copy(src, dst).await?;
        self.delete(src).await
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::S3,
            name: self.settings.name.clone(),
            region: Some(self.settings.region.clone()),
            endpoint: self.settings.endpoint.clone(),
            bucket: Some(self.settings.bucket.clone()),
            features: ["multipart", "presigned_urls", "streaming", "batch_delete"]
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.settings.bucket)
            .send()
            .await
            .map_err(|err| self.sdk_error(&self.settings.bucket, err))?;
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.settings.bucket)
            .set_prefix(self.settings.prefix.as_ref().map(|prefix| format!("{prefix}/")))
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| self.sdk_error(&self.settings.bucket, err))?;
            for object in page.contents() {
                stats.object_count += 1;
                stats.total_size += object.size().unwrap_or(0).max(0) as u64;
            }
        }
        Ok(stats)
    }
}
