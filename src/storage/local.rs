use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::{
    encode_key, key_segments,
    signing::{SignedMethod, SignedParams, UrlSigner},
    ByteStream, CompletedPart, MultipartUpload, ProviderInfo, StorageBackend, StorageStats,
    UploadedPart,
};
use crate::{
    config::{BackendDescriptor, ProviderKind},
    error::{ConfigError, StorageError},
};

const MULTIPART_DIR: &str = ".multipart";
const STAGING_DIR: &str = ".staging";
const PART_SUFFIX: &str = ".part";

/// Builder for [`LocalStorage`].
#[derive(Clone)]
pub struct LocalStorageBuilder {
    name: String,
    root: PathBuf,
    public_url: String,
    signer: Option<UrlSigner>,
}

impl fmt::Debug for LocalStorageBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorageBuilder")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("public_url", &self.public_url)
            .field("signer", &self.signer.as_ref().map(|_| "<signer>"))
            .finish()
    }
}

impl LocalStorageBuilder {
    /// Sets the backend name reported in errors and provider info.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the directory objects are stored under.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the base URL that `url` and presigned URLs are built on.
    pub fn public_url(mut self, public_url: impl Into<String>) -> Self {
        self.public_url = public_url.into();
        self
    }

    /// Sets the secret used to sign presigned URLs.
    pub fn signing_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.signer = Some(UrlSigner::new(secret));
        self
    }

    /// Builds a validated local storage backend.
    pub fn build(self) -> Result<LocalStorage, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyBackendName);
        }
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::MissingSetting {
                backend: self.name,
                field: "root_path",
            });
        }

        Ok(LocalStorage {
            name: self.name,
            root: self.root,
            public_url: self.public_url.trim_end_matches('/').to_owned(),
            signer: self.signer.unwrap_or_else(UrlSigner::random),
        })
    }
}

impl Default for LocalStorageBuilder {
    fn default() -> Self {
        Self {
            name: "local".to_owned(),
            root: PathBuf::new(),
            public_url: "/files".to_owned(),
            signer: None,
        }
    }
}

/// Storage backend mapping keys to files under a root directory.
///
/// Multipart uploads keep one file per part under `.multipart/<upload id>/`
/// and are assembled in part-number order on completion. The final rename
/// is the commit point, so readers never observe a partially written object.
#[derive(Clone)]
pub struct LocalStorage {
    name: String,
    root: PathBuf,
    public_url: String,
    signer: UrlSigner,
}

impl fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorage")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("public_url", &self.public_url)
            .finish()
    }
}

impl LocalStorage {
    /// Creates a local storage builder.
    pub fn builder() -> LocalStorageBuilder {
        LocalStorageBuilder::default()
    }

    /// Builds a backend from a `local` descriptor.
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> Result<Self, ConfigError> {
        let mut builder = Self::builder()
            .name(descriptor.name.clone())
            .root(descriptor.root_path.clone().unwrap_or_default());
        if let Some(public_url) = &descriptor.public_url {
            builder = builder.public_url(public_url.clone());
        }
        if let Some(secret) = descriptor.setting("signing_secret") {
            builder = builder.signing_secret(secret);
        }
        builder.build()
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks a presigned URL's query parameters for `key`.
    pub fn verify_presigned(&self, method: SignedMethod, key: &str, params: &SignedParams) -> bool {
        self.signer
            .verify(method, key, params, chrono::Utc::now().timestamp())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let segments = key_segments(key)?;
        if matches!(segments[0], MULTIPART_DIR | STAGING_DIR) {
            return Err(StorageError::InvalidKey {
                key: key.to_owned(),
            });
        }

        let mut path = self.root.clone();
        path.extend(segments);
        Ok(path)
    }

    fn session_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        let id = Uuid::try_parse(upload_id).map_err(|_| StorageError::UploadNotFound {
            upload_id: upload_id.to_owned(),
        })?;
        Ok(self
            .root
            .join(MULTIPART_DIR)
            .join(id.simple().to_string()))
    }

    async fn existing_session(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.session_dir(upload_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StorageError::UploadNotFound {
                upload_id: upload_id.to_owned(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::UploadNotFound {
                    upload_id: upload_id.to_owned(),
                })
            }
            Err(err) => Err(self.io_error(upload_id, err)),
        }
    }

    fn io_error(&self, key: &str, err: std::io::Error) -> StorageError {
        StorageError::from_io(&self.name, key, err)
    }

    async fn staging_file(&self, key: &str) -> Result<(PathBuf, tokio::fs::File), StorageError> {
        let dir = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| self.io_error(key, err))?;
        let path = dir.join(format!("{}.tmp", Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|err| self.io_error(key, err))?;
        Ok((path, file))
    }

    /// Moves a fully written file onto `target`, creating parents first.
    async fn commit(&self, key: &str, staged: &Path, target: &Path) -> Result<(), StorageError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(key, err))?;
        }
        tokio::fs::rename(staged, target)
            .await
            .map_err(|err| self.io_error(key, err))
    }

    async fn write_stream(
        &self,
        key: &str,
        mut stream: ByteStream<'_>,
        expected: Option<u64>,
    ) -> Result<u64, StorageError> {
        let target = self.path_for(key)?;
        let (staged, mut file) = self.staging_file(key).await?;

        let result = async {
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let bytes = chunk?;
                written = written.saturating_add(bytes.len() as u64);
                if let Some(expected) = expected {
                    if written > expected {
                        return Err(StorageError::SizeMismatch {
                            key: key.to_owned(),
                            expected,
                            actual: written,
                        });
                    }
                }
                file.write_all(&bytes)
                    .await
                    .map_err(|err| self.io_error(key, err))?;
            }
            file.flush().await.map_err(|err| self.io_error(key, err))?;

            if let Some(expected) = expected {
                if written != expected {
                    return Err(StorageError::SizeMismatch {
                        key: key.to_owned(),
                        expected,
                        actual: written,
                    });
                }
            }
            Ok(written)
        }
        .await;
        drop(file);

        match result {
            Ok(written) => {
                if let Err(err) = self.commit(key, &staged, &target).await {
                    let _ = tokio::fs::remove_file(&staged).await;
                    return Err(err);
                }
                Ok(written)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&staged).await;
                Err(err)
            }
        }
    }

    async fn file_len(&self, key: &str, path: &Path) -> Result<u64, StorageError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| self.io_error(key, err))?;
        if !meta.is_file() {
            return Err(StorageError::not_found(key));
        }
        Ok(meta.len())
    }

    fn signed_url(&self, key: &str, params: &SignedParams) -> String {
        format!("{}/{}?{}", self.public_url, encode_key(key), params.to_query())
    }
}

fn part_tag(part_number: u32, size: u64) -> String {
    format!("{part_number}_{size}")
}

fn part_file(dir: &Path, part_number: u32) -> PathBuf {
    dir.join(format!("{part_number}{PART_SUFFIX}"))
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let size = data.len() as u64;
        let stream: ByteStream<'_> = Box::pin(futures::stream::once(async move { Ok(data) }));
        self.write_stream(key, stream, Some(size)).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(backend = self.name.as_str(), key, size, "local storage: stored object");
        Ok(())
    }

    async fn upload_stream(
        &self,
        key: &str,
        stream: ByteStream<'_>,
        size: u64,
    ) -> Result<(), StorageError> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            backend = self.name.as_str(),
            key,
            size,
            "local storage: begin streaming store"
        );

        let _written = self.write_stream(key, stream, Some(size)).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            backend = self.name.as_str(),
            key,
            size = _written,
            "local storage: completed streaming store"
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        self.file_len(key, &path).await?;
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|err| self.io_error(key, err))
    }

    async fn download_stream(&self, key: &str) -> Result<ByteStream<'static>, StorageError> {
        let path = self.path_for(key)?;
        self.file_len(key, &path).await?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| self.io_error(key, err))?;

        let provider = self.name.clone();
        let key = key.to_owned();
        Ok(Box::pin(ReaderStream::new(file).map(move |chunk| {
            chunk.map_err(|err| StorageError::from_io(&provider, &key, err))
        })))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                #[cfg(feature = "tracing")]
                tracing::trace!(key, "local storage: delete of missing object ignored");
                Ok(())
            }
            Err(err) => Err(self.io_error(key, err)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.io_error(key, err)),
        }
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.path_for(key)?;
        self.file_len(key, &path).await
    }

    async fn url(&self, key: &str) -> Result<String, StorageError> {
        key_segments(key)?;
        Ok(format!("{}/{}", self.public_url, encode_key(key)))
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.path_for(key)?;
        let params = self.signer.sign(
            SignedMethod::Get,
            key,
            ttl,
            None,
            chrono::Utc::now().timestamp(),
        );
        Ok(self.signed_url(key, &params))
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        ttl: Duration,
        max_size: u64,
    ) -> Result<String, StorageError> {
        self.path_for(key)?;
        let params = self.signer.sign(
            SignedMethod::Put,
            key,
            ttl,
            Some(max_size),
            chrono::Utc::now().timestamp(),
        );
        Ok(self.signed_url(key, &params))
    }

    async fn initiate_multipart(&self, key: &str) -> Result<MultipartUpload, StorageError> {
        self.path_for(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.session_dir(&upload_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| self.io_error(key, err))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(key, upload_id = upload_id.as_str(), "local storage: multipart initiated");

        Ok(MultipartUpload {
            upload_id,
            key: key.to_owned(),
            provider: self.name.clone(),
        })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<UploadedPart, StorageError> {
        if part_number == 0 {
            return Err(StorageError::InvalidPartNumber {
                upload_id: upload_id.to_owned(),
                part_number,
            });
        }
        let dir = self.existing_session(upload_id).await?;
        let size = data.len() as u64;

        let staged = dir.join(format!("{part_number}{PART_SUFFIX}.{}", Uuid::new_v4().simple()));
        let written = async {
            tokio::fs::write(&staged, &data).await?;
            tokio::fs::rename(&staged, part_file(&dir, part_number)).await
        }
        .await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(self.io_error(key, err));
        }

        Ok(UploadedPart {
            part_number,
            etag: part_tag(part_number, size),
            size,
        })
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let target = self.path_for(key)?;
        let dir = self.existing_session(upload_id).await?;

        if parts.is_empty() {
            return Err(StorageError::conflict(upload_id, "manifest lists no parts"));
        }

        let mut manifest: Vec<&CompletedPart> = parts.iter().collect();
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

        let mut sources = Vec::with_capacity(manifest.len());
        for part in &manifest {
            let path = part_file(&dir, part.part_number);
            let size = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::conflict(
                        upload_id,
                        format!("part {} was never uploaded", part.part_number),
                    ));
                }
                Err(err) => return Err(self.io_error(key, err)),
            };
            if part_tag(part.part_number, size) != part.etag {
                return Err(StorageError::conflict(
                    upload_id,
                    format!("etag mismatch for part {}", part.part_number),
                ));
            }
            sources.push(path);
        }

        let assembled = dir.join("assembled.tmp");
        let result = async {
            let mut out = tokio::fs::File::create(&assembled)
                .await
                .map_err(|err| self.io_error(key, err))?;
            let mut total = 0u64;
            for source in &sources {
                let mut input = tokio::fs::File::open(source)
                    .await
                    .map_err(|err| self.io_error(key, err))?;
                total += tokio::io::copy(&mut input, &mut out)
                    .await
                    .map_err(|err| self.io_error(key, err))?;
            }
            out.flush().await.map_err(|err| self.io_error(key, err))?;
            drop(out);
            self.commit(key, &assembled, &target).await?;
            Ok::<_, StorageError>(total)
        }
        .await;
        let _total = match result {
            Ok(total) => total,
            Err(err) => {
                let _ = tokio::fs::remove_file(&assembled).await;
                return Err(err);
            }
        };
        if let Err(_err) = tokio::fs::remove_dir_all(&dir).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(upload_id, error = %_err, "local storage: failed to remove multipart session");
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            key,
            upload_id,
            size = _total,
            parts = sources.len(),
            "local storage: multipart completed"
        );
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str, key: &str) -> Result<(), StorageError> {
        let dir = self.existing_session(upload_id).await?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|err| self.io_error(key, err))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(key, upload_id, "local storage: multipart aborted");
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let source = self.path_for(src)?;
        let target = self.path_for(dst)?;
        self.file_len(src, &source).await?;

        let (staged, file) = self.staging_file(dst).await?;
        drop(file);
        if let Err(err) = tokio::fs::copy(&source, &staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(self.io_error(src, err));
        }
        self.commit(dst, &staged, &target).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let source = self.path_for(src)?;
        let target = self.path_for(dst)?;
        self.file_len(src, &source).await?;
        self.commit(dst, &source, &target).await
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::Local,
            name: self.name.clone(),
            region: None,
            endpoint: Some(self.root.display().to_string()),
            bucket: None,
            features: ["multipart", "presigned_urls", "streaming"]
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let marker_name = format!("health-{}", Uuid::new_v4().simple());
        let failed = |step: &str, detail: String| {
            StorageError::provider(
                &self.name,
                "HealthCheckFailed",
                &marker_name,
                format!("{step}: {detail}"),
            )
        };

        let dir = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| failed("create directory", err.to_string()))?;

        let marker = dir.join(&marker_name);
        let payload = marker_name.as_bytes();
        tokio::fs::write(&marker, payload)
            .await
            .map_err(|err| failed("write", err.to_string()))?;

        let read = tokio::fs::read(&marker).await;
        let removed = tokio::fs::remove_file(&marker).await;

        let read = read.map_err(|err| failed("read", err.to_string()))?;
        if read != payload {
            return Err(failed("read", "marker content mismatch".to_owned()));
        }
        removed.map_err(|err| failed("delete", err.to_string()))?;
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(self.io_error(&dir.display().to_string(), err)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| self.io_error(&dir.display().to_string(), err))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| self.io_error(&entry.path().display().to_string(), err))?;
                if file_type.is_dir() {
                    let reserved = dir == self.root
                        && matches!(entry.file_name().to_str(), Some(MULTIPART_DIR | STAGING_DIR));
                    if !reserved {
                        pending.push(entry.path());
                    }
                } else if file_type.is_file() {
                    let meta = entry
                        .metadata()
                        .await
                        .map_err(|err| self.io_error(&entry.path().display().to_string(), err))?;
                    stats.object_count += 1;
                    stats.total_size += meta.len();
                }
            }
        }

        Ok(stats)
    }
}
