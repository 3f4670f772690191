//! Upload validation, naming and hashing in front of a storage backend.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use mime::Mime;

use crate::{
    error::{IngestError, StorageError},
    limits::UploadLimits,
    storage::{ByteStream, DynBackend},
};

/// Streaming SHA-256 adapter.
pub mod hash;
/// Unique names and date-sharded storage paths.
pub mod naming;

pub use hash::{HashHandle, HashingStream};

/// Coarse file kind derived from the MIME type, for display.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileCategory {
    /// `image/*`.
    Image,
    /// `video/*`.
    Video,
    /// `audio/*`.
    Audio,
    /// PDFs, office and OpenDocument formats.
    Document,
    /// `text/*`, JSON and XML.
    Text,
    /// Compressed archives.
    Archive,
    /// Anything else.
    Other,
}

impl FileCategory {
    /// Classifies `mime`.
    pub fn from_mime(mime: &Mime) -> Self {
        let top = mime.type_();
        if top == mime::IMAGE {
            return Self::Image;
        } else if top == mime::VIDEO {
            return Self::Video;
        } else if top == mime::AUDIO {
            return Self::Audio;
        } else if top == mime::TEXT {
            return Self::Text;
        } else if top != mime::APPLICATION {
            return Self::Other;
        }

        let subtype = mime.subtype().as_str();
        match subtype {
            "pdf" | "msword" | "rtf" | "vnd.ms-excel" | "vnd.ms-powerpoint" => Self::Document,
            _ if subtype.starts_with("vnd.openxmlformats-officedocument")
                || subtype.starts_with("vnd.oasis.opendocument") =>
            {
                Self::Document
            }
            "zip" | "gzip" | "x-gzip" | "x-tar" | "x-7z-compressed" | "x-rar-compressed"
            | "vnd.rar" | "x-bzip2" | "x-xz" => Self::Archive,
            "json" | "xml" => Self::Text,
            _ => Self::Other,
        }
    }

    /// Lowercase category name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Text => "text",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for a stored upload, handed back to the caller for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Generated collision-resistant name.
    pub unique_name: String,
    /// Name supplied by the client.
    pub original_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase extension without the dot.
    pub extension: String,
    /// MIME type guessed from the extension.
    pub mime: Mime,
    /// Hex SHA-256 of the content.
    pub hash: String,
    /// Backend key the bytes were written to.
    pub storage_path: String,
    /// Display category.
    pub category: FileCategory,
    /// Name of the backend holding the object.
    pub backend: String,
    /// Ingest time.
    pub uploaded_at: DateTime<Utc>,
}

/// Names and metadata assigned to an accepted upload before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpload {
    /// Generated collision-resistant name.
    pub unique_name: String,
    /// Backend key.
    pub storage_path: String,
    /// Lowercase extension without the dot.
    pub extension: String,
    /// MIME type guessed from the extension.
    pub mime: Mime,
    /// Time used for naming.
    pub prepared_at: DateTime<Utc>,
}

/// Validates uploads and writes them to one backend.
pub struct Ingest {
    backend: DynBackend,
    backend_limits: UploadLimits,
}

impl fmt::Debug for Ingest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingest")
            .field("backend", &self.backend.provider_info().name)
            .field("backend_limits", &self.backend_limits)
            .finish()
    }
}

impl Ingest {
    /// Creates a pipeline writing to `backend`.
    pub fn new(backend: DynBackend) -> Self {
        Self {
            backend,
            backend_limits: UploadLimits::default(),
        }
    }

    /// Adds limits declared by the backend itself; uploads must satisfy both
    /// these and the caller's plan limits.
    pub fn with_backend_limits(mut self, limits: UploadLimits) -> Self {
        self.backend_limits = limits;
        self
    }

    /// Returns the target backend.
    pub fn backend(&self) -> &DynBackend {
        &self.backend
    }

    /// Validates `file_name`/`size` and assigns names, without touching the backend.
    pub fn prepare(
        &self,
        limits: &UploadLimits,
        file_name: &str,
        size: u64,
    ) -> Result<PreparedUpload, IngestError> {
        let extension = limits.check(file_name, size)?;
        self.backend_limits.check(file_name, size)?;
        let mime = mime_guess::from_ext(&extension).first_or_octet_stream();
        let now = Utc::now();
        let unique_name = naming::unique_name(file_name, &extension, now);
        let storage_path = naming::storage_path(&unique_name, now);

        Ok(PreparedUpload {
            unique_name,
            storage_path,
            extension,
            mime,
            prepared_at: now,
        })
    }

    /// Validates, hashes and stores a streamed upload of `size` bytes.
    pub async fn ingest(
        &self,
        limits: &UploadLimits,
        file_name: &str,
        size: u64,
        body: ByteStream<'_>,
    ) -> Result<FileInfo, IngestError> {
        let prepared = self.prepare(limits, file_name, size)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            file_name,
            size,
            key = prepared.storage_path.as_str(),
            mime = %prepared.mime,
            "ingest: upload accepted"
        );

        let (hashing, handle) = HashingStream::new(body, prepared.storage_path.clone(), size);
        let result = self
            .backend
            .upload_stream(&prepared.storage_path, Box::pin(hashing), size)
            .await;

        match result {
            Ok(()) => {}
            Err(StorageError::SizeMismatch { actual, .. }) => {
                return Err(IngestError::SizeMismatch {
                    file_name: file_name.to_owned(),
                    declared: size,
                    streamed: actual.max(handle.bytes()),
                });
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    key = prepared.storage_path.as_str(),
                    error = %err,
                    "ingest: backend rejected upload"
                );
                return Err(err.into());
            }
        }

        Ok(self.file_info(file_name, size, handle.hex_digest(), prepared))
    }

    /// Validates, hashes and stores an in-memory payload.
    pub async fn ingest_bytes(
        &self,
        limits: &UploadLimits,
        file_name: &str,
        data: Bytes,
    ) -> Result<FileInfo, IngestError> {
        let size = data.len() as u64;
        let body = stream::once(async move { Ok::<_, StorageError>(data) });
        self.ingest(limits, file_name, size, Box::pin(body)).await
    }

    fn file_info(
        &self,
        file_name: &str,
        size: u64,
        hash: String,
        prepared: PreparedUpload,
    ) -> FileInfo {
        FileInfo {
            category: FileCategory::from_mime(&prepared.mime),
            unique_name: prepared.unique_name,
            original_name: file_name.to_owned(),
            size,
            extension: prepared.extension,
            mime: prepared.mime,
            hash,
            storage_path: prepared.storage_path,
            backend: self.backend.provider_info().name,
            uploaded_at: prepared.prepared_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_mime_types() {
        let cases = [
            ("png", FileCategory::Image),
            ("mp4", FileCategory::Video),
            ("mp3", FileCategory::Audio),
            ("pdf", FileCategory::Document),
            ("docx", FileCategory::Document),
            ("odt", FileCategory::Document),
            ("txt", FileCategory::Text),
            ("json", FileCategory::Text),
            ("zip", FileCategory::Archive),
            ("7z", FileCategory::Archive),
            ("bin", FileCategory::Other),
        ];
        for (extension, category) in cases {
            let mime = mime_guess::from_ext(extension).first_or_octet_stream();
            assert_eq!(FileCategory::from_mime(&mime), category, "{extension} -> {mime}");
        }
    }
}
