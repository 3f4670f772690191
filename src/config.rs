use std::{collections::BTreeMap, fmt, path::PathBuf};

use crate::error::ConfigError;

/// Physical storage provider family.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ProviderKind {
    /// Local filesystem under a root directory.
    #[default]
    Local,
    /// Generic S3-compatible object store.
    S3,
    /// Wasabi hot storage, an S3-compatible provider with regional endpoints.
    Wasabi,
}

impl ProviderKind {
    /// Returns the lowercase provider identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Wasabi => "wasabi",
        }
    }

    /// Returns `true` for providers backed by an S3-compatible API.
    pub fn is_object_store(self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static configuration of one storage backend.
///
/// Descriptors are owned by configuration and shared read-only by the
/// backends built from them.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Unique backend name.
    pub name: String,
    /// Provider family.
    pub provider: ProviderKind,
    /// Provider region, when applicable.
    pub region: Option<String>,
    /// Explicit endpoint URL. Regional providers resolve one from the region
    /// when this is unset.
    pub endpoint: Option<String>,
    /// Object-store bucket.
    pub bucket: Option<String>,
    /// Root directory for the local provider.
    pub root_path: Option<PathBuf>,
    /// Public base URL (local) or CDN base URL (object stores).
    pub public_url: Option<String>,
    /// Access key id for object stores.
    pub access_key: Option<String>,
    /// Secret access key for object stores.
    pub secret_key: Option<String>,
    /// Maximum object size this backend accepts, in bytes.
    pub max_file_size: Option<u64>,
    /// Extensions this backend accepts; empty means all.
    pub allowed_extensions: Vec<String>,
    /// Provider-specific settings (for example `force_path_style`, `prefix`,
    /// `signing_secret`).
    pub settings: BTreeMap<String, String>,
    /// Whether the backend should be opened at all.
    pub active: bool,
    /// Whether this backend is the default target for new uploads.
    pub default: bool,
}

impl Default for BackendDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: ProviderKind::Local,
            region: None,
            endpoint: None,
            bucket: None,
            root_path: None,
            public_url: None,
            access_key: None,
            secret_key: None,
            max_file_size: None,
            allowed_extensions: Vec::new(),
            settings: BTreeMap::new(),
            active: true,
            default: false,
        }
    }
}

impl BackendDescriptor {
    /// Creates a local filesystem descriptor.
    pub fn local(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            provider: ProviderKind::Local,
            root_path: Some(root.into()),
            ..Self::default()
        }
    }

    /// Creates an object-store descriptor for `provider`.
    pub fn object_store(
        name: impl Into<String>,
        provider: ProviderKind,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            bucket: Some(bucket.into()),
            ..Self::default()
        }
    }

    /// Marks this descriptor as the default backend.
    pub fn with_default(mut self, default: bool) -> Self {
        self.default = default;
        self
    }

    /// Adds a provider-specific setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Returns a provider setting by name.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Returns a boolean provider setting, accepting `true`/`1`/`yes`.
    pub fn flag(&self, key: &str) -> bool {
        self.setting(key)
            .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
    }

    /// Validates the fields required by the provider kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyBackendName);
        }

        if self.max_file_size == Some(0) {
            return Err(ConfigError::InvalidLimitValue {
                limit: "max_file_size",
            });
        }

        match self.provider {
            ProviderKind::Local => {
                let empty = self
                    .root_path
                    .as_ref()
                    .map_or(true, |root| root.as_os_str().is_empty());
                if empty {
                    return Err(self.missing("root_path"));
                }
            }
            ProviderKind::S3 | ProviderKind::Wasabi => {
                if self.bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(self.missing("bucket"));
                }
                if self.access_key.is_some() != self.secret_key.is_some() {
                    let field = if self.access_key.is_none() {
                        "access_key"
                    } else {
                        "secret_key"
                    };
                    return Err(self.missing(field));
                }
                if self.provider == ProviderKind::Wasabi
                    && self.region.is_none()
                    && self.endpoint.is_none()
                {
                    return Err(self.missing("region"));
                }
            }
        }

        Ok(())
    }

    fn missing(&self, field: &'static str) -> ConfigError {
        ConfigError::MissingSetting {
            backend: self.name.clone(),
            field,
        }
    }
}

/// Top-level storage configuration: the set of known backends.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageConfig {
    /// Backend descriptors, active or not.
    pub backends: Vec<BackendDescriptor>,
}

impl StorageConfig {
    /// Creates a configuration from descriptors.
    pub fn new(backends: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        Self {
            backends: backends.into_iter().collect(),
        }
    }

    /// Returns the active descriptors in declaration order.
    pub fn active(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter().filter(|backend| backend.active)
    }

    /// Returns the default backend: the active one flagged `default`, or the
    /// first active backend when none is flagged.
    pub fn default_backend(&self) -> Option<&BackendDescriptor> {
        self.active()
            .find(|backend| backend.default)
            .or_else(|| self.active().next())
    }

    /// Validates every descriptor plus cross-descriptor invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        let mut default: Option<&str> = None;

        for backend in &self.backends {
            backend.validate()?;
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackendName {
                    name: backend.name.clone(),
                });
            }
            if backend.active && backend.default {
                if let Some(first) = default {
                    return Err(ConfigError::MultipleDefaults {
                        first: first.to_owned(),
                        second: backend.name.clone(),
                    });
                }
                default = Some(backend.name.as_str());
            }
        }

        if self.active().next().is_none() {
            return Err(ConfigError::NoActiveBackend);
        }

        Ok(())
    }
}
