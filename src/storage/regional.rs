use std::{collections::HashMap, time::Duration};

use bytes::Bytes;

use super::{
    encode_key, key_segments, s3::S3Storage, ByteStream, CompletedPart, MultipartUpload,
    ProviderInfo, StorageBackend, StorageStats, UploadedPart,
};
use crate::{
    config::{BackendDescriptor, ProviderKind},
    error::{ConfigError, StorageError},
};

/// Region to endpoint lookup for a provider with per-region hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTable {
    kind: ProviderKind,
    endpoints: HashMap<String, String>,
    default: String,
    features: Vec<String>,
}

impl EndpointTable {
    /// Creates a table for `kind` with `default` used for unknown regions.
    pub fn new<I, R, E>(kind: ProviderKind, entries: I, default: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (R, E)>,
        R: Into<String>,
        E: Into<String>,
    {
        Self {
            kind,
            endpoints: entries
                .into_iter()
                .map(|(region, endpoint)| (region.into(), endpoint.into()))
                .collect(),
            default: default.into(),
            features: Vec::new(),
        }
    }

    /// Adds feature flags reported by `provider_info`.
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    /// Wasabi hot storage endpoints.
    pub fn wasabi() -> Self {
        Self::new(
            ProviderKind::Wasabi,
            [
                ("us-east-1", "https://s3.wasabisys.com"),
                ("us-east-2", "https://s3.us-east-2.wasabisys.com"),
                ("us-central-1", "https://s3.us-central-1.wasabisys.com"),
                ("us-west-1", "https://s3.us-west-1.wasabisys.com"),
                ("ca-central-1", "https://s3.ca-central-1.wasabisys.com"),
                ("eu-central-1", "https://s3.eu-central-1.wasabisys.com"),
                ("eu-central-2", "https://s3.eu-central-2.wasabisys.com"),
                ("eu-west-1", "https://s3.eu-west-1.wasabisys.com"),
                ("eu-west-2", "https://s3.eu-west-2.wasabisys.com"),
                ("ap-northeast-1", "https://s3.ap-northeast-1.wasabisys.com"),
                ("ap-northeast-2", "https://s3.ap-northeast-2.wasabisys.com"),
                ("ap-southeast-1", "https://s3.ap-southeast-1.wasabisys.com"),
                ("ap-southeast-2", "https://s3.ap-southeast-2.wasabisys.com"),
            ],
            "https://s3.wasabisys.com",
        )
        .with_features(["no_egress_fees", "immutable_buckets"])
    }

    /// Returns the endpoint for `region`, falling back to the default entry.
    pub fn resolve(&self, region: Option<&str>) -> &str {
        region
            .and_then(|region| self.endpoints.get(region))
            .map_or(self.default.as_str(), String::as_str)
    }

    /// Provider kind the table belongs to.
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }
}

/// S3-compatible backend bound to a provider's regional endpoints.
///
/// Object operations go through the wrapped [`S3Storage`]; only URL
/// construction and provider metadata differ.
#[derive(Debug, Clone)]
pub struct RegionalS3Storage {
    inner: S3Storage,
    endpoint: String,
    cdn_url: Option<String>,
    table: EndpointTable,
}

impl RegionalS3Storage {
    /// Wraps an already configured client.
    pub fn new(inner: S3Storage, table: EndpointTable, cdn_url: Option<String>) -> Self {
        let endpoint = inner
            .settings()
            .endpoint
            .clone()
            .unwrap_or_else(|| table.resolve(Some(inner.settings().region.as_str())).to_owned());
        Self {
            inner,
            endpoint,
            cdn_url: cdn_url.map(|url| url.trim_end_matches('/').to_owned()),
            table,
        }
    }

    /// Resolves the endpoint for the descriptor's region and connects.
    pub async fn connect(
        descriptor: &BackendDescriptor,
        table: EndpointTable,
    ) -> Result<Self, ConfigError> {
        let mut resolved = descriptor.clone();
        if resolved.endpoint.is_none() {
            resolved.endpoint = Some(table.resolve(descriptor.region.as_deref()).to_owned());
        }
        resolved
            .settings
            .entry("force_path_style".to_owned())
            .or_insert_with(|| "true".to_owned());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            backend = descriptor.name.as_str(),
            provider = table.kind().as_str(),
            endpoint = resolved.endpoint.as_deref().unwrap_or_default(),
            "regional storage: endpoint resolved"
        );

        let inner = S3Storage::connect(&resolved).await?;
        Ok(Self::new(inner, table, descriptor.public_url.clone()))
    }

    /// Returns the resolved endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl StorageBackend for RegionalS3Storage {
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.inner.upload(key, data).await
    }

    async fn upload_stream(
        &self,
        key: &str,
        stream: ByteStream<'_>,
        size: u64,
    ) -> Result<(), StorageError> {
        self.inner.upload_stream(key, stream, size).await
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        self.inner.download(key).await
    }

    async fn download_stream(&self, key: &str) -> Result<ByteStream<'static>, StorageError> {
        self.inner.download_stream(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        self.inner.size(key).await
    }

    async fn url(&self, key: &str) -> Result<String, StorageError> {
        key_segments(key)?;
        let object = match &self.inner.settings().prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_owned(),
        };
        let object = encode_key(&object);
        Ok(match &self.cdn_url {
            Some(cdn) => format!("{cdn}/{object}"),
            None => format!("{}/{}/{object}", self.endpoint, self.inner.settings().bucket),
        })
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.inner.presigned_url(key, ttl).await
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        ttl: Duration,
        max_size: u64,
    ) -> Result<String, StorageError> {
        self.inner.presigned_upload_url(key, ttl, max_size).await
    }

    async fn initiate_multipart(&self, key: &str) -> Result<MultipartUpload, StorageError> {
        self.inner.initiate_multipart(key).await
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<UploadedPart, StorageError> {
        self.inner.upload_part(upload_id, key, part_number, data).await
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        self.inner.complete_multipart(upload_id, key, parts).await
    }

    async fn abort_multipart(&self, upload_id: &str, key: &str) -> Result<(), StorageError> {
        self.inner.abort_multipart(upload_id, key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        self.inner.delete_many(keys).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        self.inner.copy(src, dst).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        self.inner.rename(src, dst).await
    }

    fn provider_info(&self) -> ProviderInfo {
        let mut info = self.inner.provider_info();
        info.kind = self.table.kind();
        info.endpoint = Some(self.endpoint.clone());
        info.features.extend(self.table.features.iter().cloned());
        if self.cdn_url.is_some() {
            info.features.push("cdn".to_owned());
        }
        info
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.inner.health_check().await
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        self.inner.stats().await
    }
}
