//! Storage backend contract and built-in implementations.

use std::{pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::Stream;

use crate::{
    config::{BackendDescriptor, ProviderKind},
    error::{ConfigError, StorageError},
};

/// Local filesystem backend.
pub mod local;
/// Generic S3-compatible backend.
#[cfg(feature = "s3")]
pub mod s3;
/// Region-aware S3 provider variants.
#[cfg(feature = "s3")]
pub mod regional;
/// Named backend set built from configuration.
pub mod registry;
/// Expiring URL signatures for backends without native presigning.
pub mod signing;

pub use local::{LocalStorage, LocalStorageBuilder};
#[cfg(feature = "s3")]
pub use regional::{EndpointTable, RegionalS3Storage};
pub use registry::Backends;
#[cfg(feature = "s3")]
pub use s3::S3Storage;
pub use signing::UrlSigner;

/// Boxed stream type used by storage backends.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Chunked object body flowing into or out of a backend.
pub type ByteStream<'a> = BoxStream<'a, Result<Bytes, StorageError>>;

/// Handle to an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    /// Backend-issued upload id.
    pub upload_id: String,
    /// Final object key.
    pub key: String,
    /// Name of the backend that owns the upload.
    pub provider: String,
}

/// Part recorded by a backend after `upload_part`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// Caller-supplied part number, starting at 1.
    pub part_number: u32,
    /// Integrity tag verified at completion time.
    pub etag: String,
    /// Part size in bytes.
    pub size: u64,
}

/// Manifest entry passed to `complete_multipart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number as uploaded.
    pub part_number: u32,
    /// Tag returned by `upload_part`.
    pub etag: String,
}

impl CompletedPart {
    /// Creates a manifest entry.
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

impl From<&UploadedPart> for CompletedPart {
    fn from(part: &UploadedPart) -> Self {
        Self::new(part.part_number, part.etag.clone())
    }
}

/// Static description of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Provider family.
    pub kind: ProviderKind,
    /// Configured backend name.
    pub name: String,
    /// Region, when the provider has one.
    pub region: Option<String>,
    /// Endpoint URL or root path.
    pub endpoint: Option<String>,
    /// Bucket, for object stores.
    pub bucket: Option<String>,
    /// Capability flags such as `multipart` or `presigned_urls`.
    pub features: Vec<String>,
}

/// Object count and byte usage reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStats {
    /// Number of stored objects.
    pub object_count: u64,
    /// Sum of object sizes in bytes.
    pub total_size: u64,
}

/// Async contract implemented by every physical storage backend.
///
/// Keys are relative, `/`-separated object names. Implementations must
/// treat `delete` of a missing key as success, and report missing keys on
/// reads as [`StorageError::NotFound`].
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Stores `data` under `key`, replacing any existing object.
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Stores a chunked body of exactly `size` bytes under `key`.
    async fn upload_stream(
        &self,
        key: &str,
        stream: ByteStream<'_>,
        size: u64,
    ) -> Result<(), StorageError>;

    /// Reads the full object.
    async fn download(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Opens the object as a chunked stream.
    async fn download_stream(&self, key: &str) -> Result<ByteStream<'static>, StorageError>;

    /// Deletes the object. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Returns `true` when the object exists.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Returns the object size in bytes.
    async fn size(&self, key: &str) -> Result<u64, StorageError>;

    /// Returns the public URL for the object.
    async fn url(&self, key: &str) -> Result<String, StorageError>;

    /// Returns a download URL valid for `ttl`.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Returns an upload URL valid for `ttl` that accepts at most `max_size` bytes.
    async fn presigned_upload_url(
        &self,
        key: &str,
        ttl: Duration,
        max_size: u64,
    ) -> Result<String, StorageError>;

    /// Starts a multipart upload targeting `key`.
    async fn initiate_multipart(&self, key: &str) -> Result<MultipartUpload, StorageError>;

    /// Stores one part. Re-uploading a part number replaces the earlier part.
    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<UploadedPart, StorageError>;

    /// Assembles the parts named in `parts` into the final object.
    ///
    /// Fails with [`StorageError::Conflict`] when the manifest references an
    /// unknown part or a stale tag; the upload stays open in that case.
    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError>;

    /// Discards an upload and its parts.
    async fn abort_multipart(&self, upload_id: &str, key: &str) -> Result<(), StorageError>;

    /// Deletes several objects. Missing keys are skipped.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Copies `src` to `dst`.
    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    /// Moves `src` to `dst`.
    async fn rename(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    /// Describes the backend.
    fn provider_info(&self) -> ProviderInfo;

    /// Verifies the backend is reachable and writable.
    async fn health_check(&self) -> Result<(), StorageError>;

    /// Returns object count and byte usage.
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Shared, dynamically dispatched backend handle.
pub type DynBackend = Arc<dyn StorageBackend>;

/// Builds the backend described by `descriptor`.
///
/// The provider kind selects the implementation; region-aware providers wrap
/// the generic S3 client.
pub async fn open(descriptor: &BackendDescriptor) -> Result<DynBackend, ConfigError> {
    descriptor.validate()?;

    #[cfg(feature = "tracing")]
    tracing::debug!(
        backend = descriptor.name.as_str(),
        provider = descriptor.provider.as_str(),
        "storage: opening backend"
    );

    match descriptor.provider {
        ProviderKind::Local => Ok(Arc::new(LocalStorage::from_descriptor(descriptor)?)),
        #[cfg(feature = "s3")]
        ProviderKind::S3 => Ok(Arc::new(S3Storage::connect(descriptor).await?)),
        #[cfg(feature = "s3")]
        ProviderKind::Wasabi => Ok(Arc::new(
            RegionalS3Storage::connect(descriptor, EndpointTable::wasabi()).await?,
        )),
        #[cfg(not(feature = "s3"))]
        kind => Err(ConfigError::ProviderUnavailable {
            provider: kind.as_str(),
            feature: "s3",
        }),
    }
}

/// Splits `key` into validated `/`-separated segments.
///
/// Rejects empty keys, absolute keys and `.`/`..` segments.
pub(crate) fn key_segments(key: &str) -> Result<Vec<&str>, StorageError> {
    let invalid = || StorageError::InvalidKey {
        key: key.to_owned(),
    };

    if key.is_empty() || key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(invalid());
    }

    let segments: Vec<&str> = key.split('/').collect();
    if segments
        .iter()
        .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
    {
        return Err(invalid());
    }

    Ok(segments)
}

/// Percent-encodes each key segment for use in a URL path.
pub(crate) fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_segments_rejects_traversal() {
        assert_eq!(key_segments("a/b.txt").expect("valid"), vec!["a", "b.txt"]);
        for key in ["", "/abs", "a/../b", "a//b", "./a", "a\\b", "a/"] {
            assert!(
                matches!(key_segments(key), Err(StorageError::InvalidKey { .. })),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn encode_key_preserves_separators() {
        assert_eq!(encode_key("2024/01/02/my file.txt"), "2024/01/02/my%20file.txt");
    }
}
