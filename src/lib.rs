#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Storage core for multi-tenant file hosting: pluggable backends,
//! multipart uploads, upload ingest and per-client rate limiting.

/// Backend descriptors and storage configuration.
pub mod config;
/// Error types exposed by this crate.
pub mod error;
/// Upload validation, naming and hashing.
pub mod ingest;
/// Plan-level upload limits.
pub mod limits;
/// Multipart session coordination.
pub mod multipart;
/// Token-bucket admission control.
pub mod ratelimit;
/// Storage backend contract and implementations.
pub mod storage;

pub use config::{BackendDescriptor, ProviderKind, StorageConfig};
pub use error::{ConfigError, Error, IngestError, RateLimitError, StorageError};
pub use ingest::{FileCategory, FileInfo, Ingest, PreparedUpload};
pub use limits::UploadLimits;
pub use multipart::{MultipartCoordinator, SessionSnapshot, SessionState};
pub use ratelimit::{ClientKey, Policy, RateLimitInfo, RateLimiters, TokenBucket};
pub use storage::{
    open, Backends, ByteStream, CompletedPart, DynBackend, LocalStorage, MultipartUpload,
    ProviderInfo, StorageBackend, StorageStats, UploadedPart,
};
