use crate::error::IngestError;

/// Plan-level limits applied to a single upload before any storage I/O.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadLimits {
    /// Maximum accepted file size in bytes.
    pub max_file_size: Option<u64>,
    /// Allowed extensions (for example `.jpg`, `png`). Matching ignores case
    /// and the leading dot.
    ///
    /// An empty list means every extension is allowed.
    pub allowed_extensions: Vec<String>,
}

impl UploadLimits {
    /// Creates a permissive limits configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum file size.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }

    /// Sets the extension allow-list.
    pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` when `extension` is allowed by the configured list.
    pub fn is_extension_allowed(&self, extension: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }

        let wanted = normalize_extension(extension);
        let allowed = self
            .allowed_extensions
            .iter()
            .any(|pattern| normalize_extension(pattern) == wanted);

        #[cfg(feature = "tracing")]
        if !allowed {
            tracing::debug!(
                extension = wanted.as_str(),
                allowed = ?self.allowed_extensions,
                "limits: extension rejected by allow-list"
            );
        }

        allowed
    }

    /// Validates a candidate upload and returns its normalized extension.
    pub fn check(&self, file_name: &str, size: u64) -> Result<String, IngestError> {
        if let Some(max_file_size) = self.max_file_size {
            if size > max_file_size {
                return Err(IngestError::FileTooLarge {
                    file_name: file_name.to_owned(),
                    size,
                    max_file_size,
                });
            }
        }

        let extension = extension_of(file_name).ok_or_else(|| IngestError::MissingExtension {
            file_name: file_name.to_owned(),
        })?;

        if !extension.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(IngestError::InvalidExtension { extension });
        }

        if !self.is_extension_allowed(&extension) {
            return Err(IngestError::ExtensionNotAllowed { extension });
        }

        Ok(extension)
    }
}

/// Returns the lowercase extension of `file_name` without the dot.
///
/// Hidden files such as `.env` and names ending in a dot have no extension.
pub fn extension_of(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}
