use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateLimitInfo;

/// Configuration-time validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A backend descriptor name was empty.
    #[error("backend name cannot be empty")]
    EmptyBackendName,
    /// Two descriptors share the same name.
    #[error("duplicate backend `{name}`")]
    DuplicateBackendName {
        /// Duplicated backend name.
        name: String,
    },
    /// A required descriptor field was missing for the provider kind.
    #[error("backend `{backend}` is missing required setting `{field}`")]
    MissingSetting {
        /// Backend name.
        backend: String,
        /// Name of the missing setting.
        field: &'static str,
    },
    /// More than one active descriptor was flagged as default.
    #[error("more than one default backend configured: `{first}` and `{second}`")]
    MultipleDefaults {
        /// First default backend encountered.
        first: String,
        /// Second default backend encountered.
        second: String,
    },
    /// No active backend was configured.
    #[error("no active storage backend configured")]
    NoActiveBackend,
    /// The requested provider kind is not compiled into this build.
    #[error("provider `{provider}` requires the `{feature}` feature")]
    ProviderUnavailable {
        /// Provider kind name.
        provider: &'static str,
        /// Cargo feature that enables the provider.
        feature: &'static str,
    },
    /// A configured numeric limit must be strictly greater than zero.
    #[error("limit `{limit}` must be greater than 0")]
    InvalidLimitValue {
        /// Name of the limit.
        limit: &'static str,
    },
    /// A rate-limit policy name was empty or duplicated.
    #[error("invalid rate-limit policy `{name}`")]
    InvalidPolicy {
        /// Offending policy name.
        name: String,
    },
    /// The rate-limit registry has no `global` fallback policy.
    #[error("rate-limit registry requires a `global` policy")]
    MissingGlobalPolicy,
}

/// Storage backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The object does not exist.
    #[error("object `{key}` not found")]
    NotFound {
        /// Missing object key.
        key: String,
    },
    /// The multipart upload id is unknown or already finished.
    #[error("multipart upload `{upload_id}` not found")]
    UploadNotFound {
        /// Unknown upload id.
        upload_id: String,
    },
    /// A multipart completion manifest did not match the recorded parts.
    #[error("multipart upload `{upload_id}` conflict: {reason}")]
    Conflict {
        /// Upload id whose manifest was rejected.
        upload_id: String,
        /// Human readable mismatch description.
        reason: String,
    },
    /// Multipart part numbers start at 1.
    #[error("multipart upload `{upload_id}` has invalid part number {part_number}")]
    InvalidPartNumber {
        /// Upload id the part was sent to.
        upload_id: String,
        /// Rejected part number.
        part_number: u32,
    },
    /// The key cannot be mapped to a storage location.
    #[error("invalid storage key `{key}`")]
    InvalidKey {
        /// Rejected key.
        key: String,
    },
    /// A streamed upload produced a different number of bytes than declared.
    #[error("object `{key}` expected {expected} bytes but received {actual}")]
    SizeMismatch {
        /// Target key.
        key: String,
        /// Declared size in bytes.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },
    /// Backend-specific failure.
    #[error("{provider} error {code} on `{key}`: {message}")]
    Provider {
        /// Provider name reporting the failure.
        provider: String,
        /// Backend error code (S3 error code or I/O error kind).
        code: String,
        /// Key the operation targeted.
        key: String,
        /// Failure message.
        message: String,
    },
}

impl StorageError {
    /// Creates a not-found error for `key`.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a multipart conflict error.
    pub fn conflict(upload_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            upload_id: upload_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a provider error.
    pub fn provider(
        provider: impl Into<String>,
        code: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            code: code.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Wraps an I/O error, mapping `NotFound` to [`StorageError::NotFound`].
    pub fn from_io(provider: &str, key: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::not_found(key);
        }
        Self::provider(provider, format!("{:?}", err.kind()), key, err.to_string())
    }

    /// Returns `true` for missing objects and unknown uploads.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::UploadNotFound { .. })
    }

    /// Returns `true` for multipart manifest conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Upload ingest failures.
///
/// Every variant except [`IngestError::Storage`] is raised before the backend
/// is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum IngestError {
    /// The upload is larger than the plan allows.
    #[error("file `{file_name}` is {size} bytes, exceeding the limit of {max_file_size} bytes")]
    FileTooLarge {
        /// Original filename.
        file_name: String,
        /// Declared or observed size in bytes.
        size: u64,
        /// Configured maximum in bytes.
        max_file_size: u64,
    },
    /// The filename has no extension.
    #[error("file `{file_name}` has no extension")]
    MissingExtension {
        /// Original filename.
        file_name: String,
    },
    /// The extension contains characters other than ASCII letters and digits.
    #[error("extension `.{extension}` contains unsupported characters")]
    InvalidExtension {
        /// Rejected extension, lowercase without the dot.
        extension: String,
    },
    /// The extension is not in the allow-list.
    #[error("extension `.{extension}` is not allowed")]
    ExtensionNotAllowed {
        /// Rejected extension, lowercase without the dot.
        extension: String,
    },
    /// The body stream length disagreed with the declared size.
    #[error("file `{file_name}` declared {declared} bytes but streamed at least {streamed}")]
    SizeMismatch {
        /// Original filename.
        file_name: String,
        /// Declared size in bytes.
        declared: u64,
        /// Bytes streamed before the mismatch was detected.
        streamed: u64,
    },
    /// The backend rejected the write.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Admission-control rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RateLimitError {
    /// The client's budget for the policy is exhausted.
    #[error("too many requests for policy `{policy}`")]
    TooManyRequests {
        /// Policy that rejected the request.
        policy: String,
        /// Limit, remaining and reset hints for the caller.
        info: RateLimitInfo,
    },
}

impl RateLimitError {
    /// Returns the wait before the next token becomes available.
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::TooManyRequests { info, .. } => info.reset_after,
        }
    }
}

/// Runtime error type used by `stowage`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration error surfaced at runtime.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Upload validation or ingest failure.
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// Admission control rejection.
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
}
